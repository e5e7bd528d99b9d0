//! NGFF root URI parsing and store dispatch.
//!
//! A root URI selects a store variant and the path of the multiscale group
//! within it:
//!
//! ```text
//! root-uri  := file-uri | http-uri | s3-uri
//! file-uri  := ["file://"] absolute-or-relative-fs-path
//! http-uri  := ("http" | "https") "://" host [":" port] "/" path
//! s3-uri    := "s3://" host [":" port] "/" bucket "/" key-prefix ["?" opts]
//! opts      := opt ("&" opt)*
//! ```
//!
//! The path must contain a directory segment ending in `.zarr`; the store is
//! rooted at the full given path, so trailing segments (e.g. a series index
//! below the `.zarr` directory) resolve as a sub-path of the hierarchy.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use url::Url;

use super::store::{
    FilesystemStore, HttpStore, HttpStoreCreateError, S3Credentials, S3Store, S3StoreCreateError,
};
use super::ReadableStorage;

/// A parsed NGFF root URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RootUri {
    /// A local filesystem root.
    Filesystem {
        /// The root directory of the multiscale group.
        path: PathBuf,
    },
    /// An HTTP or HTTPS root.
    Http {
        /// The base URL of the multiscale group.
        url: String,
    },
    /// An S3 root.
    S3 {
        /// The service endpoint, `https://host[:port]`.
        endpoint: String,
        /// The bucket name.
        bucket: String,
        /// The key prefix of the multiscale group within the bucket.
        key_prefix: String,
        /// Credential and region options from the query string.
        options: S3Options,
    },
}

/// Options recognised in the query string of an S3 root URI.
///
/// Unrecognised keys are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct S3Options {
    /// `anonymous=true`: unsigned requests.
    pub anonymous: bool,
    /// `accessKeyId=`: static credentials, paired with `secret_access_key`.
    pub access_key_id: Option<String>,
    /// `secretAccessKey=`: static credentials, paired with `access_key_id`.
    pub secret_access_key: Option<String>,
    /// `profile=`: a named profile from the shared AWS configuration files.
    pub profile: Option<String>,
    /// `region=`: region override.
    pub region: Option<String>,
}

impl S3Options {
    /// The credential selection these options describe.
    ///
    /// Precedence: anonymous, then static credentials, then a named profile,
    /// then the default profile/instance-profile chains.
    #[must_use]
    pub fn credentials(&self) -> S3Credentials {
        if self.anonymous {
            S3Credentials::Anonymous
        } else if let (Some(access_key_id), Some(secret_access_key)) =
            (&self.access_key_id, &self.secret_access_key)
        {
            S3Credentials::Static {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
            }
        } else if let Some(profile) = &self.profile {
            S3Credentials::Profile(profile.clone())
        } else {
            S3Credentials::Default
        }
    }
}

/// An invalid NGFF root URI.
#[derive(Debug, Error)]
pub enum InvalidUriError {
    /// The URI scheme is not `file`, `http`, `https`, or `s3`.
    #[error("unsupported URI scheme {0}")]
    UnsupportedScheme(String),
    /// The URI path has no `.zarr` directory segment.
    #[error("no .zarr segment in URI {0}")]
    MissingZarrSegment(String),
    /// The S3 URI carries user-info credentials.
    #[error("user-info credentials are not allowed in S3 URIs; use profile= or accessKeyId=/secretAccessKey=")]
    UserInfoNotAllowed,
    /// The S3 URI names no bucket.
    #[error("no bucket in S3 URI {0}")]
    MissingBucket(String),
    /// Only one of `accessKeyId` and `secretAccessKey` was supplied.
    #[error("accessKeyId and secretAccessKey must be supplied together")]
    IncompleteStaticCredentials,
    /// The URI could not be parsed at all.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),
}

/// A store creation error.
#[derive(Debug, Error)]
pub enum StoreCreateError {
    /// The root URI is invalid.
    #[error(transparent)]
    InvalidUri(#[from] InvalidUriError),
    /// The HTTP store could not be created.
    #[error(transparent)]
    HttpStore(#[from] HttpStoreCreateError),
    /// The S3 store could not be created.
    #[error(transparent)]
    S3Store(#[from] S3StoreCreateError),
}

/// Parse an NGFF root URI.
///
/// # Errors
///
/// Returns [`InvalidUriError`] if the scheme is unknown, the path has no
/// `.zarr` segment, an S3 URI carries user-info or no bucket, or static
/// credentials are incomplete.
pub fn parse_root_uri(uri: &str) -> Result<RootUri, InvalidUriError> {
    let Some((scheme, _)) = uri.split_once("://") else {
        return parse_fs_path(uri, uri);
    };
    match scheme {
        "file" => {
            let path = &uri["file://".len()..];
            parse_fs_path(path, uri)
        }
        "http" | "https" => {
            let url = Url::parse(uri)?;
            require_zarr_segment(url.path_segments().into_iter().flatten(), uri)?;
            // The base URL is everything up to the query string.
            Ok(RootUri::Http {
                url: url[..url::Position::AfterPath].to_string(),
            })
        }
        "s3" => parse_s3_uri(uri),
        scheme => Err(InvalidUriError::UnsupportedScheme(scheme.to_string())),
    }
}

/// Create the store a root URI addresses.
///
/// # Errors
///
/// Returns [`StoreCreateError`] if the URI is invalid or the selected store
/// variant cannot be constructed.
pub async fn store_from_uri(uri: &str) -> Result<ReadableStorage, StoreCreateError> {
    match parse_root_uri(uri)? {
        RootUri::Filesystem { path } => Ok(Arc::new(FilesystemStore::new(path))),
        RootUri::Http { url } => Ok(Arc::new(HttpStore::new(&url)?)),
        RootUri::S3 {
            endpoint,
            bucket,
            key_prefix,
            options,
        } => Ok(Arc::new(
            S3Store::new(
                Some(endpoint),
                options.region.clone(),
                options.credentials(),
                bucket,
                key_prefix,
            )
            .await?,
        )),
    }
}

fn parse_fs_path(path: &str, uri: &str) -> Result<RootUri, InvalidUriError> {
    let path = PathBuf::from(path);
    if !path
        .components()
        .any(|c| c.as_os_str().to_string_lossy().ends_with(".zarr"))
    {
        return Err(InvalidUriError::MissingZarrSegment(uri.to_string()));
    }
    Ok(RootUri::Filesystem { path })
}

fn parse_s3_uri(uri: &str) -> Result<RootUri, InvalidUriError> {
    let url = Url::parse(uri)?;
    if !url.username().is_empty() || url.password().is_some() {
        return Err(InvalidUriError::UserInfoNotAllowed);
    }
    let Some(host) = url.host_str() else {
        return Err(InvalidUriError::MissingBucket(uri.to_string()));
    };
    let endpoint = match url.port() {
        Some(port) => format!("https://{host}:{port}"),
        None => format!("https://{host}"),
    };

    let mut segments = url
        .path_segments()
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty());
    let Some(bucket) = segments.next() else {
        return Err(InvalidUriError::MissingBucket(uri.to_string()));
    };
    let key_prefix = segments.collect::<Vec<_>>().join("/");
    require_zarr_segment(url.path_segments().into_iter().flatten(), uri)?;

    let options = parse_s3_options(url.query().unwrap_or(""))?;
    Ok(RootUri::S3 {
        endpoint,
        bucket: bucket.to_string(),
        key_prefix,
        options,
    })
}

fn require_zarr_segment<'a>(
    mut segments: impl Iterator<Item = &'a str>,
    uri: &str,
) -> Result<(), InvalidUriError> {
    if segments.any(|s| s.ends_with(".zarr")) {
        Ok(())
    } else {
        Err(InvalidUriError::MissingZarrSegment(uri.to_string()))
    }
}

fn parse_s3_options(query: &str) -> Result<S3Options, InvalidUriError> {
    let mut options = S3Options::default();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "anonymous" => options.anonymous = value == "true",
            "accessKeyId" => options.access_key_id = Some(value.to_string()),
            "secretAccessKey" => options.secret_access_key = Some(value.to_string()),
            "profile" => options.profile = Some(value.to_string()),
            "region" => options.region = Some(value.to_string()),
            _ => {}
        }
    }
    if options.access_key_id.is_some() != options.secret_access_key.is_some() {
        return Err(InvalidUriError::IncompleteStaticCredentials);
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_filesystem_uris() {
        assert_eq!(
            parse_root_uri("/data/img.zarr/0").unwrap(),
            RootUri::Filesystem {
                path: PathBuf::from("/data/img.zarr/0")
            }
        );
        assert_eq!(
            parse_root_uri("file:///data/img.zarr").unwrap(),
            RootUri::Filesystem {
                path: PathBuf::from("/data/img.zarr")
            }
        );
        assert!(matches!(
            parse_root_uri("/data/plain-directory"),
            Err(InvalidUriError::MissingZarrSegment(_))
        ));
    }

    #[test]
    fn parse_http_uris() {
        assert_eq!(
            parse_root_uri("https://example.org/data/img.zarr/0").unwrap(),
            RootUri::Http {
                url: "https://example.org/data/img.zarr/0".to_string()
            }
        );
        assert!(matches!(
            parse_root_uri("https://example.org/data/img"),
            Err(InvalidUriError::MissingZarrSegment(_))
        ));
    }

    #[test]
    fn parse_s3_uris() {
        let uri = "s3://minio.example.org:9000/images/data/img.zarr/0\
                   ?anonymous=true&region=eu-west-1";
        let RootUri::S3 {
            endpoint,
            bucket,
            key_prefix,
            options,
        } = parse_root_uri(uri).unwrap()
        else {
            panic!("expected an S3 root");
        };
        assert_eq!(endpoint, "https://minio.example.org:9000");
        assert_eq!(bucket, "images");
        assert_eq!(key_prefix, "data/img.zarr/0");
        assert!(options.anonymous);
        assert_eq!(options.region.as_deref(), Some("eu-west-1"));
        assert_eq!(options.credentials(), S3Credentials::Anonymous);
    }

    #[test]
    fn parse_s3_static_credentials() {
        let uri = "s3://s3.amazonaws.com/bucket/img.zarr\
                   ?accessKeyId=AKID&secretAccessKey=SECRET";
        let RootUri::S3 { options, .. } = parse_root_uri(uri).unwrap() else {
            panic!("expected an S3 root");
        };
        assert_eq!(
            options.credentials(),
            S3Credentials::Static {
                access_key_id: "AKID".to_string(),
                secret_access_key: "SECRET".to_string(),
            }
        );

        assert!(matches!(
            parse_root_uri("s3://s3.amazonaws.com/bucket/img.zarr?accessKeyId=AKID"),
            Err(InvalidUriError::IncompleteStaticCredentials)
        ));
    }

    #[test]
    fn parse_s3_profile_and_default() {
        let RootUri::S3 { options, .. } =
            parse_root_uri("s3://host/bucket/img.zarr?profile=research").unwrap()
        else {
            panic!("expected an S3 root");
        };
        assert_eq!(
            options.credentials(),
            S3Credentials::Profile("research".to_string())
        );

        let RootUri::S3 { options, .. } =
            parse_root_uri("s3://host/bucket/img.zarr?ignored=value").unwrap()
        else {
            panic!("expected an S3 root");
        };
        assert_eq!(options.credentials(), S3Credentials::Default);
    }

    #[test]
    fn reject_s3_user_info() {
        assert!(matches!(
            parse_root_uri("s3://user:pass@host/bucket/img.zarr"),
            Err(InvalidUriError::UserInfoNotAllowed)
        ));
    }

    #[test]
    fn reject_unknown_scheme() {
        assert!(matches!(
            parse_root_uri("ftp://example.org/img.zarr"),
            Err(InvalidUriError::UnsupportedScheme(_))
        ));
    }
}
