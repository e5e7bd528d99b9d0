//! Zarr storage ([stores](store)).
//!
//! A [store](store) is a system that can be used to retrieve data from a Zarr
//! hierarchy: a filesystem directory, an HTTP server, or an Amazon S3 bucket.
//! Stores are read-only; this crate never writes to a hierarchy.
//!
//! Keys are `/`-separated paths relative to the hierarchy root. A missing key
//! is not an error: Zarr chunk blobs are optional, and a missing chunk
//! represents the array fill value. Store implementations therefore
//! distinguish "not found" ([`None`]) from genuine retrieval failures
//! ([`StorageError`]).

mod store_key;
pub mod store;
pub mod uri;

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

pub use store_key::{StoreKey, StoreKeyError};

/// [`Arc`] wrapped readable storage.
pub type ReadableStorage = Arc<dyn ReadableStorageTraits>;

/// An alias for bytes which may or may not be available.
///
/// When a value is read from a store, it returns `MaybeBytes` which is
/// [`None`] if the key is not available. The chunk reader converts missing
/// chunks to zero-filled output rather than surfacing an error.
pub type MaybeBytes = Option<Bytes>;

/// Readable storage traits.
#[async_trait::async_trait]
pub trait ReadableStorageTraits: Send + Sync + std::fmt::Debug {
    /// Retrieve the value (bytes) associated with a given [`StoreKey`].
    ///
    /// Returns [`None`] if the key is not found.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if there is an error with the underlying
    /// store. Not-found conditions (including unreadable filesystem entries,
    /// HTTP 404, and S3 `NoSuchKey`) are **not** errors.
    async fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError>;
}

/// A storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// An error serializing or deserializing JSON.
    #[error(transparent)]
    InvalidJSON(#[from] serde_json::Error),
    /// Metadata at a key failed to parse.
    #[error("error parsing metadata for {0}: {1}")]
    InvalidMetadata(StoreKey, String),
    /// An invalid store key.
    #[error(transparent)]
    InvalidStoreKey(#[from] StoreKeyError),
    /// An HTTP transport error.
    #[error(transparent)]
    HTTPError(#[from] reqwest::Error),
    /// An HTTP response with an unexpected status code.
    #[error("unexpected HTTP status {status} retrieving key {key}")]
    UnexpectedStatusCode {
        /// The requested key.
        key: StoreKey,
        /// The response status code.
        status: u16,
    },
    /// An S3 service error other than a missing object.
    #[error("S3 error retrieving key {key}: {message}")]
    S3Error {
        /// The requested key.
        key: StoreKey,
        /// The service error description.
        message: String,
    },
    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl From<&str> for StorageError {
    fn from(err: &str) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        Self::Other(err)
    }
}

/// Return the attributes (`.zattrs`) key for a node path.
///
/// An empty path addresses the hierarchy root.
#[must_use]
pub fn attrs_key(path: &str) -> StoreKey {
    node_meta_key(path, ".zattrs")
}

/// Return the group metadata (`.zgroup`) key for a node path.
#[must_use]
pub fn group_meta_key(path: &str) -> StoreKey {
    node_meta_key(path, ".zgroup")
}

/// Return the array metadata (`.zarray`) key for a node path.
#[must_use]
pub fn array_meta_key(path: &str) -> StoreKey {
    node_meta_key(path, ".zarray")
}

fn node_meta_key(path: &str, file_name: &str) -> StoreKey {
    let path = path.trim_matches('/');
    if path.is_empty() {
        unsafe { StoreKey::new_unchecked(file_name.to_string()) }
    } else {
        unsafe { StoreKey::new_unchecked(format!("{path}/{file_name}")) }
    }
}

/// Return the chunk data key given an array path, chunk grid coordinates, and
/// a dimension separator (`.` or `/`).
#[must_use]
pub fn chunk_key(array_path: &str, chunk_grid_indices: &[u64], separator: char) -> StoreKey {
    let chunk_name = chunk_grid_indices
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(&separator.to_string());
    let path = array_path.trim_matches('/');
    if path.is_empty() {
        unsafe { StoreKey::new_unchecked(chunk_name) }
    } else {
        unsafe { StoreKey::new_unchecked(format!("{path}/{chunk_name}")) }
    }
}

/// Retrieve and parse a JSON document at `key`.
///
/// Returns [`None`] if the key is not found.
///
/// # Errors
///
/// Returns a [`StorageError`] if there is an underlying error with the store
/// or the document is not valid JSON.
pub async fn retrieve_json(
    storage: &dyn ReadableStorageTraits,
    key: &StoreKey,
) -> Result<Option<serde_json::Value>, StorageError> {
    match storage.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| StorageError::InvalidMetadata(key.clone(), err.to_string())),
        None => Ok(None),
    }
}

/// Retrieve a chunk blob.
///
/// Returns [`None`] if the chunk is not stored, which represents the array
/// fill value.
///
/// # Errors
///
/// Returns a [`StorageError`] if there is an underlying error with the store.
pub async fn retrieve_chunk(
    storage: &dyn ReadableStorageTraits,
    array_path: &str,
    chunk_grid_indices: &[u64],
    separator: char,
) -> Result<MaybeBytes, StorageError> {
    storage
        .get(&chunk_key(array_path, chunk_grid_indices, separator))
        .await
}
