//! Chunk decompression.
//!
//! Zarr v2 names the compression layer in the `compressor` object of
//! `.zarray` metadata. This engine decodes the compressors found in NGFF
//! data in the wild: `blosc` (the numcodecs default family), `zlib`, `gzip`,
//! and `zstd`, plus uncompressed chunks (`compressor: null`). Encoding is
//! out of scope; the engine never writes chunks.

mod blosc;

use std::io::Read;

use serde::Deserialize;
use thiserror::Error;

/// The `compressor` object of `.zarray` metadata.
///
/// Only the `id` selects behaviour on the decode path; numcodecs
/// configuration fields (level, shuffle, blocksize) are encode-side and the
/// blosc frame header carries everything its decoder needs.
#[derive(Clone, Debug, Deserialize)]
pub struct CompressorMetadata {
    /// The numcodecs codec identifier.
    pub id: String,
}

/// A chunk compressor.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Compressor {
    /// No compression.
    None,
    /// Blosc framed compression (lz4/zstd/zlib inside the frame).
    Blosc,
    /// Raw zlib (RFC 1950).
    Zlib,
    /// Gzip (RFC 1952).
    Gzip,
    /// A raw zstd frame.
    Zstd,
}

/// A codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// An IO error decoding a chunk.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// A blosc frame failed validation or decompression.
    #[error("blosc error: {0}")]
    Blosc(String),
    /// The compressor id is not in the supported set.
    #[error("unsupported compressor {0}")]
    UnsupportedCompressor(String),
    /// A decoded chunk had an unexpected length.
    #[error("decoded chunk is {actual} bytes, expected {expected}")]
    UnexpectedChunkLength {
        /// The length implied by the chunk shape and data type.
        expected: usize,
        /// The decoded length.
        actual: usize,
    },
}

impl Compressor {
    /// Select the compressor for `.zarray` `compressor` metadata.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedCompressor`] for ids outside the
    /// supported set.
    pub fn from_metadata(metadata: Option<&CompressorMetadata>) -> Result<Self, CodecError> {
        match metadata {
            None => Ok(Self::None),
            Some(metadata) => match metadata.id.as_str() {
                "blosc" => Ok(Self::Blosc),
                "zlib" => Ok(Self::Zlib),
                "gzip" => Ok(Self::Gzip),
                "zstd" => Ok(Self::Zstd),
                id => Err(CodecError::UnsupportedCompressor(id.to_string())),
            },
        }
    }

    /// Decode one chunk blob.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the blob is not a valid stream for this
    /// compressor.
    pub fn decode(&self, encoded_value: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::None => Ok(encoded_value.to_vec()),
            Self::Blosc => blosc::validate(encoded_value).map_or_else(
                || Err(CodecError::Blosc("invalid blosc frame".to_string())),
                |destsize| blosc::decompress(encoded_value, destsize),
            ),
            Self::Zlib => {
                let mut decoded_value = Vec::new();
                flate2::read::ZlibDecoder::new(encoded_value).read_to_end(&mut decoded_value)?;
                Ok(decoded_value)
            }
            Self::Gzip => {
                let mut decoded_value = Vec::new();
                flate2::read::GzDecoder::new(encoded_value).read_to_end(&mut decoded_value)?;
                Ok(decoded_value)
            }
            Self::Zstd => zstd::decode_all(encoded_value).map_err(CodecError::IOError),
        }
    }
}
