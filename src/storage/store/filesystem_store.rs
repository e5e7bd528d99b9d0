//! A filesystem store.

use std::path::PathBuf;

use bytes::Bytes;
use tracing::trace;

use crate::storage::{MaybeBytes, ReadableStorageTraits, StorageError, StoreKey};

/// A filesystem store.
///
/// Keys resolve beneath a base path, with key segments joined using the
/// platform path separator. Unreadable entries (missing files, permission
/// failures, directories in place of files) read as not found rather than
/// erroring, since absent chunk files are the common case for sparse arrays.
#[derive(Debug)]
pub struct FilesystemStore {
    base_path: PathBuf,
}

impl FilesystemStore {
    /// Create a new filesystem store at `base_path`.
    ///
    /// The base path does not need to exist at creation; reads against a
    /// non-existent base simply find nothing.
    #[must_use]
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// The base path of the store.
    #[must_use]
    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn key_to_fspath(&self, key: &StoreKey) -> PathBuf {
        let mut path = self.base_path.clone();
        for segment in key.as_str().split('/') {
            path.push(segment);
        }
        path
    }
}

#[async_trait::async_trait]
impl ReadableStorageTraits for FilesystemStore {
    async fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        let path = self.key_to_fspath(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) => match err.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    trace!(key = key.as_str(), "filesystem key not readable");
                    Ok(None)
                }
                // Reading a directory path surfaces differently per platform
                std::io::ErrorKind::InvalidInput => Ok(None),
                _ => Err(err.into()),
            },
        }
    }
}
