//! Zarr arrays (read path).
//!
//! An array is a node in a Zarr hierarchy holding chunked multidimensional
//! data. An array is defined by its `.zarray` metadata:
//!  - **shape**: the length of the array dimensions,
//!  - **chunks**: the length of each chunk dimension (edge chunks are stored
//!    at full size, padded),
//!  - **dtype**: the numerical representation of array elements,
//!  - **compressor**: the [codec](codec) used to decode chunk blobs,
//!  - **dimension_separator**: how chunk grid coordinates map to store keys.
//!
//! [`ZarrArray::read_region`] reads an axis-aligned hyperslab. Chunk blobs
//! absent from the store are materialised as zero, and multi-byte elements
//! are always emitted in big-endian byte order regardless of the on-disk
//! order.

mod array_metadata;
pub mod codec;
pub mod data_type;

use itertools::Itertools;
use thiserror::Error;
use tracing::trace;

use crate::storage::{array_meta_key, retrieve_chunk, ReadableStorage, StorageError, StoreKey};

pub use self::{
    array_metadata::ArrayMetadataV2,
    codec::{CodecError, Compressor, CompressorMetadata},
    data_type::{DataType, Endianness, UnsupportedDataTypeError},
};

/// An ND index to an element in an array.
pub type ArrayIndices = Vec<u64>;

/// The shape of an array.
pub type ArrayShape = Vec<u64>;

/// An array error.
#[derive(Debug, Error)]
pub enum ArrayError {
    /// No `.zarray` document at the array path.
    #[error("array metadata not found at {0}")]
    MissingMetadata(StoreKey),
    /// An invalid Zarr format.
    #[error("invalid zarr format {0}, expected 2")]
    InvalidZarrFormat(usize),
    /// Shape and chunk shape disagree, or a zero extent.
    #[error("invalid chunk grid {chunks:?} for array shape {shape:?}")]
    InvalidChunkGrid {
        /// The array shape.
        shape: ArrayShape,
        /// The chunk shape.
        chunks: ArrayShape,
    },
    /// A chunk memory layout other than `C`.
    #[error("unsupported chunk memory layout {0}, expected C")]
    UnsupportedMemoryOrder(String),
    /// A dimension separator other than `.` or `/`.
    #[error("unsupported dimension separator {0}")]
    UnsupportedDimensionSeparator(String),
    /// Filter codecs are configured; this engine supports none.
    #[error("filter codecs are not supported")]
    UnsupportedFilters,
    /// An unsupported element data type.
    #[error(transparent)]
    UnsupportedDataType(#[from] UnsupportedDataTypeError),
    /// A chunk failed to decode.
    #[error(transparent)]
    CodecError(#[from] CodecError),
    /// An underlying storage error.
    #[error(transparent)]
    StorageError(#[from] StorageError),
    /// A region with the wrong rank or extending past the array shape.
    #[error("invalid region shape {shape:?} at offset {offset:?} for array shape {array_shape:?}")]
    InvalidShape {
        /// The requested offset.
        offset: Vec<u64>,
        /// The requested shape.
        shape: Vec<u64>,
        /// The array shape.
        array_shape: ArrayShape,
    },
}

/// A Zarr v2 array opened for reading.
#[derive(Debug)]
pub struct ZarrArray {
    /// The storage of the hierarchy.
    storage: ReadableStorage,
    /// The path of the array below the hierarchy root.
    path: String,
    /// The length of each array dimension.
    shape: ArrayShape,
    /// The length of each chunk dimension.
    chunk_shape: ArrayShape,
    /// The element data type.
    data_type: DataType,
    /// The stored byte order of multi-byte elements.
    endianness: Endianness,
    /// The chunk compression layer.
    compressor: Compressor,
    /// The chunk key dimension separator.
    dimension_separator: char,
}

impl ZarrArray {
    /// Open the array at `path` in `storage`. The metadata is read from the
    /// store.
    ///
    /// # Errors
    ///
    /// Returns [`ArrayError`] if there is a storage error or any metadata is
    /// invalid or unsupported.
    pub async fn open(storage: ReadableStorage, path: &str) -> Result<Self, ArrayError> {
        let key = array_meta_key(path);
        let Some(bytes) = storage.get(&key).await? else {
            return Err(ArrayError::MissingMetadata(key));
        };
        let metadata: ArrayMetadataV2 = serde_json::from_slice(&bytes)
            .map_err(|err| StorageError::InvalidMetadata(key, err.to_string()))?;
        Self::new_with_metadata(storage, path, &metadata)
    }

    /// Create an array at `path` in `storage` with `metadata`.
    ///
    /// # Errors
    ///
    /// Returns [`ArrayError`] if any metadata is invalid or unsupported.
    pub fn new_with_metadata(
        storage: ReadableStorage,
        path: &str,
        metadata: &ArrayMetadataV2,
    ) -> Result<Self, ArrayError> {
        if !metadata.validate_format() {
            return Err(ArrayError::InvalidZarrFormat(metadata.zarr_format));
        }
        if metadata.order != "C" {
            return Err(ArrayError::UnsupportedMemoryOrder(metadata.order.clone()));
        }
        if metadata.has_filters() {
            return Err(ArrayError::UnsupportedFilters);
        }
        if metadata.shape.is_empty()
            || metadata.chunks.len() != metadata.shape.len()
            || metadata.chunks.iter().any(|&c| c == 0)
            || metadata.shape.iter().any(|&s| s == 0)
        {
            return Err(ArrayError::InvalidChunkGrid {
                shape: metadata.shape.clone(),
                chunks: metadata.chunks.clone(),
            });
        }
        let (data_type, endianness) = DataType::from_dtype(&metadata.dtype)?;
        let compressor = Compressor::from_metadata(metadata.compressor.as_ref())?;
        let dimension_separator = metadata.separator().ok_or_else(|| {
            ArrayError::UnsupportedDimensionSeparator(
                metadata.dimension_separator.clone().unwrap_or_default(),
            )
        })?;
        Ok(Self {
            storage,
            path: path.trim_matches('/').to_string(),
            shape: metadata.shape.clone(),
            chunk_shape: metadata.chunks.clone(),
            data_type,
            endianness,
            compressor,
            dimension_separator,
        })
    }

    /// Get the path of the array below the hierarchy root.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the array shape.
    #[must_use]
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Get the chunk shape.
    #[must_use]
    pub fn chunk_shape(&self) -> &[u64] {
        &self.chunk_shape
    }

    /// Get the element data type.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Get the stored byte order.
    #[must_use]
    pub const fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Read the axis-aligned hyperslab `[offset, offset + shape)`.
    ///
    /// The result is in row-major order over the array's dimension order,
    /// with multi-byte elements in big-endian byte order. Chunks absent from
    /// the store read as zero.
    ///
    /// # Errors
    ///
    /// Returns [`ArrayError::InvalidShape`] if `offset`/`shape` do not match
    /// the array rank or extend past the array shape, and [`ArrayError`] on
    /// storage or decode failures.
    pub async fn read_region(&self, offset: &[u64], shape: &[u64]) -> Result<Vec<u8>, ArrayError> {
        let rank = self.shape.len();
        let invalid_shape = || ArrayError::InvalidShape {
            offset: offset.to_vec(),
            shape: shape.to_vec(),
            array_shape: self.shape.clone(),
        };
        if offset.len() != rank || shape.len() != rank {
            return Err(invalid_shape());
        }
        for d in 0..rank {
            if shape[d] == 0 || offset[d] + shape[d] > self.shape[d] {
                return Err(invalid_shape());
            }
        }

        let width = self.data_type.byte_width();
        let element_count = shape.iter().product::<u64>() as usize;
        let mut region = vec![0u8; element_count * width];

        // All chunks intersecting the region, fetched concurrently.
        let fetches = (0..rank)
            .map(|d| offset[d] / self.chunk_shape[d]..=(offset[d] + shape[d] - 1) / self.chunk_shape[d])
            .multi_cartesian_product()
            .map(|chunk_indices| async move {
                let bytes = retrieve_chunk(
                    self.storage.as_ref(),
                    &self.path,
                    &chunk_indices,
                    self.dimension_separator,
                )
                .await?;
                Ok::<_, ArrayError>((chunk_indices, bytes))
            });
        let chunks = futures::future::try_join_all(fetches).await?;

        let chunk_element_count = self.chunk_shape.iter().product::<u64>() as usize;
        for (chunk_indices, bytes) in chunks {
            let Some(bytes) = bytes else {
                // Missing chunk blob: the region stays zero-filled there.
                trace!(path = %self.path, ?chunk_indices, "chunk not stored");
                continue;
            };
            let decoded = self.compressor.decode(&bytes)?;
            if decoded.len() != chunk_element_count * width {
                return Err(CodecError::UnexpectedChunkLength {
                    expected: chunk_element_count * width,
                    actual: decoded.len(),
                }
                .into());
            }
            self.copy_chunk_overlap(&decoded, &chunk_indices, offset, shape, width, &mut region);
        }

        if width > 1 && self.endianness == Endianness::Little {
            for element in region.chunks_exact_mut(width) {
                element.reverse();
            }
        }
        Ok(region)
    }

    /// Copy the part of a decoded chunk that overlaps the region into the
    /// region buffer. Both buffers are row-major; the overlap along the last
    /// dimension is contiguous in both and copied one run at a time.
    fn copy_chunk_overlap(
        &self,
        decoded: &[u8],
        chunk_indices: &[u64],
        offset: &[u64],
        shape: &[u64],
        width: usize,
        region: &mut [u8],
    ) {
        let rank = shape.len();
        let origin: Vec<u64> = chunk_indices
            .iter()
            .zip(&self.chunk_shape)
            .map(|(i, c)| i * c)
            .collect();
        let lo: Vec<u64> = (0..rank).map(|d| origin[d].max(offset[d])).collect();
        let hi: Vec<u64> = (0..rank)
            .map(|d| (origin[d] + self.chunk_shape[d]).min(offset[d] + shape[d]))
            .collect();

        let mut chunk_strides = vec![1u64; rank];
        let mut region_strides = vec![1u64; rank];
        for d in (0..rank - 1).rev() {
            chunk_strides[d] = chunk_strides[d + 1] * self.chunk_shape[d + 1];
            region_strides[d] = region_strides[d + 1] * shape[d + 1];
        }

        let last = rank - 1;
        let run = (hi[last] - lo[last]) as usize * width;
        let mut copy_run = |position: &[u64]| {
            let mut src = lo[last] - origin[last];
            let mut dst = lo[last] - offset[last];
            for d in 0..rank - 1 {
                src += (position[d] - origin[d]) * chunk_strides[d];
                dst += (position[d] - offset[d]) * region_strides[d];
            }
            let src = src as usize * width;
            let dst = dst as usize * width;
            region[dst..dst + run].copy_from_slice(&decoded[src..src + run]);
        };

        if rank == 1 {
            copy_run(&[]);
        } else {
            for position in (0..rank - 1).map(|d| lo[d]..hi[d]).multi_cartesian_product() {
                copy_run(&position);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::storage::{chunk_key, store::MemoryStore};

    use super::*;

    /// A 4x6 uint16 array with 2x3 chunks, values y * 6 + x, little-endian,
    /// uncompressed. `skip_chunks` names chunk keys to leave unstored.
    fn u16_fixture(separator: char, skip_chunks: &[&str]) -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        let metadata = format!(
            r#"{{
                "zarr_format": 2,
                "shape": [4, 6],
                "chunks": [2, 3],
                "dtype": "<u2",
                "compressor": null,
                "fill_value": 0,
                "order": "C",
                "dimension_separator": "{separator}"
            }}"#
        );
        store.set(&array_meta_key("0"), metadata.into_bytes());
        for cy in 0..2u64 {
            for cx in 0..2u64 {
                let key = chunk_key("0", &[cy, cx], separator);
                if skip_chunks.contains(&key.as_str()) {
                    continue;
                }
                let mut chunk = Vec::with_capacity(2 * 3 * 2);
                for y in cy * 2..cy * 2 + 2 {
                    for x in cx * 3..cx * 3 + 3 {
                        chunk.extend_from_slice(&u16::try_from(y * 6 + x).unwrap().to_le_bytes());
                    }
                }
                store.set(&key, chunk);
            }
        }
        Arc::new(store)
    }

    fn to_u16_be(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .collect()
    }

    #[tokio::test]
    async fn open_and_describe() {
        let store = u16_fixture('.', &[]);
        let array = ZarrArray::open(store, "0").await.unwrap();
        assert_eq!(array.shape(), &[4, 6]);
        assert_eq!(array.chunk_shape(), &[2, 3]);
        assert_eq!(array.data_type(), DataType::UInt16);
        assert_eq!(array.endianness(), Endianness::Little);
    }

    #[tokio::test]
    async fn read_region_spanning_chunks() {
        let store = u16_fixture('.', &[]);
        let array = ZarrArray::open(store, "0").await.unwrap();

        // The full array.
        let full = array.read_region(&[0, 0], &[4, 6]).await.unwrap();
        assert_eq!(to_u16_be(&full), (0..24).collect::<Vec<_>>());

        // A window crossing all four chunks.
        let window = array.read_region(&[1, 2], &[2, 2]).await.unwrap();
        assert_eq!(to_u16_be(&window), vec![8, 9, 14, 15]);
    }

    #[tokio::test]
    async fn read_region_slash_separator() {
        let store = u16_fixture('/', &[]);
        let array = ZarrArray::open(store, "0").await.unwrap();
        let window = array.read_region(&[2, 3], &[2, 3]).await.unwrap();
        assert_eq!(to_u16_be(&window), vec![15, 16, 17, 21, 22, 23]);
    }

    #[tokio::test]
    async fn missing_chunk_reads_as_zero() {
        let store = u16_fixture('.', &["0/1.1"]);
        let array = ZarrArray::open(store, "0").await.unwrap();
        let full = array.read_region(&[0, 0], &[4, 6]).await.unwrap();
        let expected: Vec<u16> = (0..24u16)
            .map(|v| {
                let (y, x) = (v / 6, v % 6);
                if y >= 2 && x >= 3 {
                    0
                } else {
                    v
                }
            })
            .collect();
        assert_eq!(to_u16_be(&full), expected);
    }

    #[tokio::test]
    async fn read_region_validation() {
        let store = u16_fixture('.', &[]);
        let array = ZarrArray::open(store, "0").await.unwrap();
        assert!(matches!(
            array.read_region(&[0, 0, 0], &[1, 1, 1]).await,
            Err(ArrayError::InvalidShape { .. })
        ));
        assert!(matches!(
            array.read_region(&[0, 0], &[4, 7]).await,
            Err(ArrayError::InvalidShape { .. })
        ));
        assert!(matches!(
            array.read_region(&[3, 0], &[2, 1]).await,
            Err(ArrayError::InvalidShape { .. })
        ));
        assert!(matches!(
            array.read_region(&[0, 0], &[0, 1]).await,
            Err(ArrayError::InvalidShape { .. })
        ));
    }

    #[tokio::test]
    async fn read_region_zlib_chunks() {
        use std::io::Write;

        let store = MemoryStore::new();
        store.set(
            &array_meta_key("0"),
            r#"{
                "zarr_format": 2,
                "shape": [4, 4],
                "chunks": [4, 4],
                "dtype": "|u1",
                "compressor": {"id": "zlib", "level": 1},
                "fill_value": 0,
                "order": "C"
            }"#
            .as_bytes()
            .to_vec(),
        );
        let raw: Vec<u8> = (0..16).collect();
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&raw).unwrap();
        store.set(&chunk_key("0", &[0, 0], '.'), encoder.finish().unwrap());

        let array = ZarrArray::open(Arc::new(store), "0").await.unwrap();
        let region = array.read_region(&[1, 1], &[2, 2]).await.unwrap();
        assert_eq!(region, vec![5, 6, 9, 10]);
    }

    #[tokio::test]
    async fn open_rejects_unsupported_metadata() {
        let store = MemoryStore::new();
        let base = |dtype: &str, order: &str, filters: &str| {
            format!(
                r#"{{
                    "zarr_format": 2,
                    "shape": [4, 4],
                    "chunks": [2, 2],
                    "dtype": "{dtype}",
                    "compressor": null,
                    "fill_value": 0,
                    "order": "{order}",
                    "filters": {filters}
                }}"#
            )
        };

        store.set(&array_meta_key("f_order"), base("<u2", "F", "null").into_bytes());
        store.set(&array_meta_key("i8"), base("<i8", "C", "null").into_bytes());
        store.set(
            &array_meta_key("filtered"),
            base("<u2", "C", r#"[{"id": "delta"}]"#).into_bytes(),
        );
        let store = Arc::new(store);

        assert!(matches!(
            ZarrArray::open(store.clone(), "f_order").await,
            Err(ArrayError::UnsupportedMemoryOrder(_))
        ));
        assert!(matches!(
            ZarrArray::open(store.clone(), "i8").await,
            Err(ArrayError::UnsupportedDataType(_))
        ));
        assert!(matches!(
            ZarrArray::open(store.clone(), "filtered").await,
            Err(ArrayError::UnsupportedFilters)
        ));
        assert!(matches!(
            ZarrArray::open(store, "absent").await,
            Err(ArrayError::MissingMetadata(_))
        ));
    }
}
