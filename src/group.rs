//! Zarr groups.
//!
//! A group is a node in a Zarr v2 hierarchy, marked by a `.zgroup` document
//! and optionally carrying free-form attributes in an accompanying
//! `.zattrs` document. For NGFF data the root group attributes hold the
//! [`multiscales`](crate::multiscale) metadata.

use serde_json::{Map, Value};

use crate::array::{ArrayError, ZarrArray};
use crate::storage::{attrs_key, group_meta_key, retrieve_json, ReadableStorage, StorageError};

/// A group opened for reading.
#[derive(Clone, Debug)]
pub struct Group {
    /// The storage of the hierarchy.
    storage: ReadableStorage,
    /// The path of the group below the hierarchy root.
    path: String,
    /// The group attributes (`.zattrs` content).
    attributes: Map<String, Value>,
}

impl Group {
    /// Open the group at `path` in `storage`. The metadata is read from the
    /// store; an absent `.zattrs` document yields empty attributes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if there is an underlying store error, the
    /// `.zgroup` document (when present) does not declare format 2, or the
    /// `.zattrs` document is not a JSON object.
    pub async fn open(storage: ReadableStorage, path: &str) -> Result<Self, StorageError> {
        let meta_key = group_meta_key(path);
        if let Some(metadata) = retrieve_json(storage.as_ref(), &meta_key).await? {
            let zarr_format = metadata.get("zarr_format").and_then(Value::as_u64);
            if zarr_format != Some(2) {
                return Err(StorageError::InvalidMetadata(
                    meta_key,
                    format!("invalid zarr format {zarr_format:?}, expected 2"),
                ));
            }
        }

        let key = attrs_key(path);
        let attributes = match retrieve_json(storage.as_ref(), &key).await? {
            Some(Value::Object(attributes)) => attributes,
            Some(_) => {
                return Err(StorageError::InvalidMetadata(
                    key,
                    "expected a JSON object".to_string(),
                ))
            }
            None => Map::new(),
        };

        Ok(Self {
            storage,
            path: path.trim_matches('/').to_string(),
            attributes,
        })
    }

    /// Get the path of the group below the hierarchy root.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the group attributes.
    #[must_use]
    pub const fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    /// Get the storage of the hierarchy.
    #[must_use]
    pub fn storage(&self) -> ReadableStorage {
        self.storage.clone()
    }

    /// The path of a child node.
    #[must_use]
    pub fn child_path(&self, relative_path: &str) -> String {
        let relative_path = relative_path.trim_matches('/');
        if self.path.is_empty() {
            relative_path.to_string()
        } else {
            format!("{}/{relative_path}", self.path)
        }
    }

    /// Open the array at `relative_path` below this group.
    ///
    /// # Errors
    ///
    /// Returns [`ArrayError`] if the array cannot be opened.
    pub async fn open_array(&self, relative_path: &str) -> Result<ZarrArray, ArrayError> {
        ZarrArray::open(self.storage.clone(), &self.child_path(relative_path)).await
    }
}
