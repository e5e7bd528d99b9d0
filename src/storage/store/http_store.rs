//! An HTTP store.

use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tracing::trace;

use crate::storage::{MaybeBytes, ReadableStorageTraits, StorageError, StoreKey};

/// An HTTP store.
///
/// Keys resolve to `GET <base_url>/<key>`. A 404 response reads as not found;
/// any other non-success status is a [`StorageError`].
#[derive(Debug)]
pub struct HttpStore {
    base_url: Url,
    client: Client,
}

/// An HTTP store creation error.
#[derive(Debug, Error)]
pub enum HttpStoreCreateError {
    /// The base URL could not be parsed.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),
    /// The URL scheme is not `http` or `https`.
    #[error("unsupported URL scheme {0}")]
    UnsupportedScheme(String),
}

impl HttpStore {
    /// Create a new HTTP store for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`HttpStoreCreateError`] if `base_url` is not a valid HTTP or
    /// HTTPS URL.
    pub fn new(base_url: &str) -> Result<Self, HttpStoreCreateError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))?;
        match base_url.scheme() {
            "http" | "https" => Ok(Self {
                base_url,
                client: Client::new(),
            }),
            scheme => Err(HttpStoreCreateError::UnsupportedScheme(scheme.to_string())),
        }
    }

    /// The base URL of the store.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn key_to_url(&self, key: &StoreKey) -> String {
        format!("{}/{}", self.base_url, key.as_str())
    }
}

#[async_trait::async_trait]
impl ReadableStorageTraits for HttpStore {
    async fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        let response = self.client.get(self.key_to_url(key)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                trace!(key = key.as_str(), "HTTP key not found");
                Ok(None)
            }
            status if status.is_success() => Ok(Some(response.bytes().await?)),
            status => Err(StorageError::UnexpectedStatusCode {
                key: key.clone(),
                status: status.as_u16(),
            }),
        }
    }
}
