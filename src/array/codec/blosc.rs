//! Thin wrappers over the c-blosc 1.x context API.
//!
//! The `_ctx` variants are used so that decompression needs no global
//! library initialisation and is safe to call from any thread.

use std::ffi::c_void;

use blosc_sys::{blosc_cbuffer_validate, blosc_decompress_ctx};

use super::CodecError;

/// Validate a blosc frame, returning its decompressed size.
///
/// Returns [`None`] if `src` is not a valid blosc frame.
#[must_use]
pub(crate) fn validate(src: &[u8]) -> Option<usize> {
    let mut destsize: usize = 0;
    let valid = unsafe {
        blosc_cbuffer_validate(
            src.as_ptr().cast::<c_void>(),
            src.len(),
            std::ptr::addr_of_mut!(destsize),
        )
    };
    (valid >= 0).then_some(destsize)
}

/// Decompress a validated blosc frame of known decompressed size.
///
/// # Errors
///
/// Returns [`CodecError::Blosc`] if decompression fails or produces more
/// than `destsize` bytes.
pub(crate) fn decompress(src: &[u8], destsize: usize) -> Result<Vec<u8>, CodecError> {
    let mut dest: Vec<u8> = Vec::with_capacity(destsize);
    let decompressed_size = unsafe {
        blosc_decompress_ctx(
            src.as_ptr().cast::<c_void>(),
            dest.as_mut_ptr().cast::<c_void>(),
            destsize,
            1,
        )
    };
    if decompressed_size >= 0 && decompressed_size as usize <= destsize {
        unsafe { dest.set_len(decompressed_size as usize) };
        Ok(dest)
    } else {
        Err(CodecError::Blosc(format!(
            "blosc_decompress_ctx returned {decompressed_size}"
        )))
    }
}
