use derive_more::Display;
use thiserror::Error;

/// A Zarr storage key.
///
/// A key is a `/`-separated path relative to the store root, with no leading
/// or trailing `/` and no empty segments.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display(fmt = "{}", _0)]
pub struct StoreKey(String);

/// An invalid store key.
#[derive(Clone, Debug, Error)]
#[error("invalid store key {0}")]
pub struct StoreKeyError(String);

impl StoreKey {
    /// Create a new Zarr storage key from `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreKeyError`] if `key` is not valid.
    pub fn new(key: impl Into<String>) -> Result<Self, StoreKeyError> {
        let key = key.into();
        if Self::validate(&key) {
            Ok(Self(key))
        } else {
            Err(StoreKeyError(key))
        }
    }

    /// Create a new Zarr storage key from `key` without validation.
    ///
    /// # Safety
    ///
    /// `key` must be a valid storage key.
    #[must_use]
    pub unsafe fn new_unchecked(key: String) -> Self {
        debug_assert!(Self::validate(&key));
        Self(key)
    }

    /// Validates a key according to the following rules:
    /// - it is non-empty,
    /// - it does not begin or end with `/`, and
    /// - it has no empty segments.
    #[must_use]
    pub fn validate(key: &str) -> bool {
        !key.is_empty() && !key.starts_with('/') && !key.ends_with('/') && !key.contains("//")
    }

    /// Extracts a string slice of the underlying key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for StoreKey {
    type Error = StoreKeyError;

    fn try_from(key: &str) -> Result<Self, Self::Error> {
        Self::new(key)
    }
}
