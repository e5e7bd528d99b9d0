//! An Amazon S3 store.

use std::collections::HashMap;
use std::sync::OnceLock;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::SdkError;
use thiserror::Error;
use tracing::{debug, trace};

use crate::storage::{MaybeBytes, ReadableStorageTraits, StorageError, StoreKey};

/// Environment variables which, when present, are rejected outright.
///
/// Silent pickup of ambient credentials has caused cross-tenant reads on
/// shared hosts; callers must select credentials explicitly through the URI
/// (`anonymous`, `accessKeyId`/`secretAccessKey`, `profile`) or rely on the
/// profile/instance-profile chains.
const AMBIENT_CREDENTIAL_VARS: [&str; 3] = [
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
];

/// The region assumed when a URI does not carry a `region` option.
pub const DEFAULT_REGION: &str = "us-east-1";

/// S3 credential selection.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum S3Credentials {
    /// Profile chain, then instance-profile chain.
    Default,
    /// Anonymous (unsigned) requests, for public buckets.
    Anonymous,
    /// Static credentials supplied by the caller.
    Static {
        /// The access key id.
        access_key_id: String,
        /// The secret access key.
        secret_access_key: String,
    },
    /// A named profile from the shared AWS configuration files.
    Profile(String),
}

/// An S3 store creation error.
#[derive(Debug, Error)]
pub enum S3StoreCreateError {
    /// Ambient credentials were detected in the process environment.
    #[error(
        "ambient AWS credentials present in the environment ({0}); \
         select credentials explicitly with anonymous=true, \
         accessKeyId/secretAccessKey, or profile"
    )]
    AmbientCredentials(&'static str),
    /// The bucket name is empty.
    #[error("an S3 URI must name a bucket")]
    MissingBucket,
}

/// A key identifying one S3 client configuration.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
struct ClientKey {
    endpoint: Option<String>,
    region: String,
    credentials: S3Credentials,
}

/// Process-wide S3 clients, one per distinct configuration.
///
/// A client holds a connection pool and is itself thread-safe; buffers over
/// the same bucket share it.
static CLIENTS: OnceLock<tokio::sync::Mutex<HashMap<ClientKey, aws_sdk_s3::Client>>> =
    OnceLock::new();

async fn client_for(key: &ClientKey) -> aws_sdk_s3::Client {
    let clients = CLIENTS.get_or_init(|| tokio::sync::Mutex::new(HashMap::new()));
    let mut clients = clients.lock().await;
    if let Some(client) = clients.get(key) {
        return client.clone();
    }

    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(key.region.clone()));
    match &key.credentials {
        S3Credentials::Default => {}
        S3Credentials::Anonymous => {
            loader = loader.no_credentials();
        }
        S3Credentials::Static {
            access_key_id,
            secret_access_key,
        } => {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key_id.clone(),
                secret_access_key.clone(),
                None,
                None,
                "uri",
            ));
        }
        S3Credentials::Profile(name) => {
            loader = loader.credentials_provider(
                aws_config::profile::ProfileFileCredentialsProvider::builder()
                    .profile_name(name)
                    .build(),
            );
        }
    }
    let sdk_config = loader.load().await;

    let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(true);
    if let Some(endpoint) = &key.endpoint {
        builder = builder.endpoint_url(endpoint.clone());
    }
    let client = aws_sdk_s3::Client::from_conf(builder.build());
    debug!(
        region = %key.region,
        endpoint = key.endpoint.as_deref().unwrap_or(""),
        "created S3 client"
    );
    clients.insert(key.clone(), client.clone());
    client
}

/// An Amazon S3 store.
///
/// Keys resolve beneath a key prefix within one bucket. Requests use
/// path-style addressing so that non-AWS endpoints work unchanged.
/// `NoSuchKey` and HTTP 404 read as not found; other service errors
/// propagate as [`StorageError`]. No existence probe is issued before a
/// read: missing chunk objects are the common case for sparse arrays and a
/// probe would turn them into spurious failures.
#[derive(Debug)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    key_prefix: String,
}

impl S3Store {
    /// Create a new S3 store.
    ///
    /// `endpoint` overrides the service endpoint (as `https://host[:port]`);
    /// [`None`] targets AWS. `region` defaults to [`DEFAULT_REGION`].
    ///
    /// # Errors
    ///
    /// Returns [`S3StoreCreateError`] if ambient credential environment
    /// variables are present or the bucket name is empty.
    pub async fn new(
        endpoint: Option<String>,
        region: Option<String>,
        credentials: S3Credentials,
        bucket: impl Into<String>,
        key_prefix: impl Into<String>,
    ) -> Result<Self, S3StoreCreateError> {
        if let Some(var) = ambient_credentials_present() {
            return Err(S3StoreCreateError::AmbientCredentials(var));
        }
        let bucket = bucket.into();
        if bucket.is_empty() {
            return Err(S3StoreCreateError::MissingBucket);
        }
        let client_key = ClientKey {
            endpoint,
            region: region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
            credentials,
        };
        let client = client_for(&client_key).await;
        Ok(Self {
            client,
            bucket,
            key_prefix: key_prefix.into().trim_matches('/').to_string(),
        })
    }

    /// The bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The key prefix within the bucket.
    #[must_use]
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn object_key(&self, key: &StoreKey) -> String {
        object_key(&self.key_prefix, key)
    }
}

fn object_key(key_prefix: &str, key: &StoreKey) -> String {
    if key_prefix.is_empty() {
        key.as_str().to_string()
    } else {
        format!("{key_prefix}/{}", key.as_str())
    }
}

fn ambient_credentials_present() -> Option<&'static str> {
    AMBIENT_CREDENTIAL_VARS
        .into_iter()
        .find(|var| std::env::var_os(var).is_some_and(|value| !value.is_empty()))
}

#[async_trait::async_trait]
impl ReadableStorageTraits for S3Store {
    async fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key));
        match request.send().await {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|err| StorageError::S3Error {
                        key: key.clone(),
                        message: err.to_string(),
                    })?;
                Ok(Some(data.into_bytes()))
            }
            Err(SdkError::ServiceError(service_err)) => {
                if service_err.err().is_no_such_key()
                    || service_err.raw().status().as_u16() == 404
                {
                    trace!(key = key.as_str(), "S3 key not found");
                    Ok(None)
                } else {
                    Err(StorageError::S3Error {
                        key: key.clone(),
                        message: service_err.err().to_string(),
                    })
                }
            }
            Err(err) => Err(StorageError::S3Error {
                key: key.clone(),
                message: err.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys() {
        let key = StoreKey::new("0/.zarray").unwrap();
        assert_eq!(object_key("img.zarr", &key), "img.zarr/0/.zarray");
        assert_eq!(object_key("", &key), "0/.zarray");
    }

    #[tokio::test]
    async fn create_validation() {
        // One test covers both rejections so the process environment is not
        // mutated concurrently.
        for var in AMBIENT_CREDENTIAL_VARS {
            std::env::remove_var(var);
        }
        let result = S3Store::new(None, None, S3Credentials::Anonymous, "", "img.zarr").await;
        assert!(matches!(result, Err(S3StoreCreateError::MissingBucket)));

        for var in AMBIENT_CREDENTIAL_VARS {
            std::env::set_var(var, "hunter2");
            let result = S3Store::new(
                None,
                None,
                S3Credentials::Anonymous,
                "bucket",
                "img.zarr",
            )
            .await;
            std::env::remove_var(var);
            assert!(matches!(
                result,
                Err(S3StoreCreateError::AmbientCredentials(v)) if v == var
            ));
        }
    }
}
