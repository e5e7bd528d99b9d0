//! Zarr array data types.
//!
//! The supported set matches the pixel types this engine serves. 64-bit
//! integer dtypes exist in Zarr but have no pixel-type counterpart and are
//! rejected.

use derive_more::Display;
use thiserror::Error;

/// A Zarr v2 data type, named by its pixel-type counterpart.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Display)]
pub enum DataType {
    /// `i1`
    #[display(fmt = "int8")]
    Int8,
    /// `u1`
    #[display(fmt = "uint8")]
    UInt8,
    /// `i2`
    #[display(fmt = "int16")]
    Int16,
    /// `u2`
    #[display(fmt = "uint16")]
    UInt16,
    /// `i4`
    #[display(fmt = "int32")]
    Int32,
    /// `u4`
    #[display(fmt = "uint32")]
    UInt32,
    /// `f4`
    #[display(fmt = "float")]
    Float32,
    /// `f8`
    #[display(fmt = "double")]
    Float64,
}

/// The byte order of stored array elements.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Endianness {
    /// Least-significant byte first.
    Little,
    /// Most-significant byte first.
    Big,
}

/// An unsupported data type error.
#[derive(Clone, Debug, Error)]
#[error("unsupported data type {0}")]
pub struct UnsupportedDataTypeError(String);

impl UnsupportedDataTypeError {
    /// Create an unsupported data type error for `dtype`.
    #[must_use]
    pub fn new(dtype: impl Into<String>) -> Self {
        Self(dtype.into())
    }
}

impl DataType {
    /// Parse a Zarr v2 `dtype` string such as `<u2` or `|u1`.
    ///
    /// The leading character gives the byte order (`<` little, `>` big, `|`
    /// not applicable); the remainder selects the type.
    ///
    /// # Errors
    ///
    /// Returns [`UnsupportedDataTypeError`] for 64-bit integers and any
    /// other discriminant outside the supported set.
    pub fn from_dtype(dtype: &str) -> Result<(Self, Endianness), UnsupportedDataTypeError> {
        let err = || UnsupportedDataTypeError::new(dtype);
        let mut chars = dtype.chars();
        let endianness = match chars.next() {
            Some('<') => Endianness::Little,
            // Single-byte types carry "|"; order is irrelevant for them.
            Some('>' | '|') => Endianness::Big,
            _ => return Err(err()),
        };
        let data_type = match chars.as_str() {
            "i1" => Self::Int8,
            "u1" => Self::UInt8,
            "i2" => Self::Int16,
            "u2" => Self::UInt16,
            "i4" => Self::Int32,
            "u4" => Self::UInt32,
            "f4" => Self::Float32,
            "f8" => Self::Float64,
            _ => return Err(err()),
        };
        Ok((data_type, endianness))
    }

    /// The size in bytes of one element.
    #[must_use]
    pub const fn byte_width(&self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    /// Whether the type is signed.
    #[must_use]
    pub const fn is_signed(&self) -> bool {
        matches!(
            self,
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Float32 | Self::Float64
        )
    }

    /// Whether the type is floating point.
    #[must_use]
    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}
