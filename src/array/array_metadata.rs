//! Zarr array metadata (storage specification v2).
//!
//! See <https://zarr-specs.readthedocs.io/en/latest/v2/v2.0.html#arrays>.

use serde::Deserialize;

use super::codec::CompressorMetadata;

/// Zarr array metadata (storage specification v2), the content of a
/// `.zarray` document.
///
/// An example document:
/// ```json
/// {
///     "zarr_format": 2,
///     "shape": [1, 3, 16, 1024, 1024],
///     "chunks": [1, 1, 1, 256, 256],
///     "dtype": "<u2",
///     "compressor": {"id": "blosc", "cname": "lz4", "clevel": 5, "shuffle": 1},
///     "fill_value": 0,
///     "order": "C",
///     "filters": null,
///     "dimension_separator": "/"
/// }
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct ArrayMetadataV2 {
    /// An integer defining the version of the storage specification. Must be
    /// `2`.
    pub zarr_format: usize,
    /// An array of integers providing the length of each dimension.
    pub shape: Vec<u64>,
    /// An array of integers providing the length of each chunk dimension.
    pub chunks: Vec<u64>,
    /// The NumPy-style data type string, e.g. `<u2`.
    pub dtype: String,
    /// The chunk compression layer; `null` for uncompressed chunks.
    pub compressor: Option<CompressorMetadata>,
    /// Chunk filter codecs. This engine supports none.
    #[serde(default)]
    pub filters: Option<serde_json::Value>,
    /// The chunk memory layout, `C` or `F`. This engine supports `C` only.
    pub order: String,
    /// The separator between chunk grid coordinates in chunk keys; `.` when
    /// absent.
    #[serde(default)]
    pub dimension_separator: Option<String>,
    /// The value of unwritten chunks. This engine always materialises
    /// missing chunks as zero, per its contract.
    #[serde(default)]
    pub fill_value: serde_json::Value,
}

impl ArrayMetadataV2 {
    /// Validates that the `zarr_format` field is `2`.
    #[must_use]
    pub const fn validate_format(&self) -> bool {
        self.zarr_format == 2
    }

    /// Whether any filter codecs are configured.
    #[must_use]
    pub fn has_filters(&self) -> bool {
        match &self.filters {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::Array(filters)) => !filters.is_empty(),
            Some(_) => true,
        }
    }

    /// The chunk key dimension separator, or [`None`] if the configured
    /// separator is not `.` or `/`.
    #[must_use]
    pub fn separator(&self) -> Option<char> {
        match self.dimension_separator.as_deref() {
            None | Some(".") => Some('.'),
            Some("/") => Some('/'),
            Some(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_VALID: &str = r#"{
        "zarr_format": 2,
        "shape": [2, 3, 4, 5, 6],
        "chunks": [1, 1, 1, 5, 6],
        "dtype": "<u2",
        "compressor": {"id": "blosc", "cname": "lz4", "clevel": 5, "shuffle": 1},
        "fill_value": 0,
        "order": "C",
        "filters": null
    }"#;

    #[test]
    fn array_metadata_parse() {
        let metadata: ArrayMetadataV2 = serde_json::from_str(JSON_VALID).unwrap();
        assert!(metadata.validate_format());
        assert_eq!(metadata.shape, vec![2, 3, 4, 5, 6]);
        assert_eq!(metadata.chunks, vec![1, 1, 1, 5, 6]);
        assert_eq!(metadata.dtype, "<u2");
        assert_eq!(metadata.compressor.as_ref().unwrap().id, "blosc");
        assert!(!metadata.has_filters());
        assert_eq!(metadata.separator(), Some('.'));
    }

    #[test]
    fn array_metadata_separator() {
        let mut metadata: ArrayMetadataV2 = serde_json::from_str(JSON_VALID).unwrap();
        metadata.dimension_separator = Some("/".to_string());
        assert_eq!(metadata.separator(), Some('/'));
        metadata.dimension_separator = Some(":".to_string());
        assert_eq!(metadata.separator(), None);
    }

    #[test]
    fn array_metadata_filters() {
        let mut metadata: ArrayMetadataV2 = serde_json::from_str(JSON_VALID).unwrap();
        metadata.filters = Some(serde_json::json!([{"id": "delta"}]));
        assert!(metadata.has_filters());
        metadata.filters = Some(serde_json::json!([]));
        assert!(!metadata.has_filters());
    }
}
