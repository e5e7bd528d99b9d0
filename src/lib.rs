//! A read-only pixel buffer engine for multiscale OME-NGFF (Zarr) images.
//!
//! Consumers ask for tiles, rows, columns, planes, stacks, or timepoints in
//! a canonical (X,Y,Z,C,T) coordinate system; the engine locates the
//! correct chunked array at the requested resolution level, reads the
//! underlying bytes from a [storage](crate::storage) backend (local
//! filesystem, HTTP, S3), and returns them in big-endian byte order.
//!
//! - [`ZarrPixelBuffer`] is the entry point: one buffer per image request.
//! - [`storage`] provides the byte-addressable store backends and the
//!   [URI dispatcher](storage::uri).
//! - [`array`] reads rectangular hyperslabs out of chunked Zarr v2 arrays.
//! - [`group`] and [`multiscale`] resolve the NGFF resolution pyramid and
//!   its axis ordering.
//! - [`cache`] holds the shared metadata and open-array caches.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ngff_pixel_buffer::cache::{ArrayCache, Cache, MetadataCache};
//! use ngff_pixel_buffer::{PixelsDimensions, ZarrPixelBuffer};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! // The caches are shared across buffers, typically process-wide.
//! let metadata_cache: Arc<MetadataCache> = Arc::new(Cache::new(64));
//! let array_cache: Arc<ArrayCache> = Arc::new(Cache::new(64));
//!
//! let pixels = PixelsDimensions::new(4096, 4096, 16, 3, 1);
//! let mut buffer = ZarrPixelBuffer::open(
//!     pixels,
//!     "s3://s3.example.org/images/1.zarr/0?anonymous=true",
//!     3192,
//!     3192,
//!     metadata_cache,
//!     array_cache,
//! )
//! .await?;
//!
//! buffer.set_resolution_level(0).await?;
//! let tile = buffer.get_tile(0, 0, 0, 0, 0, 512, 512).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Licence
//!
//! `ngff-pixel-buffer` is licensed under either of
//!  - the Apache License, Version 2.0 or
//!  - the MIT license
//!
//! at your option.

pub mod array;
pub mod cache;
pub mod group;
pub mod multiscale;
pub mod pixel_buffer;
pub mod storage;

pub use pixel_buffer::{PixelBufferError, PixelsDimensions, ZarrPixelBuffer};
