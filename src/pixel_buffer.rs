//! The pixel buffer over an NGFF multiscale image.
//!
//! [`ZarrPixelBuffer`] serves bounded rectangular regions of one multiscale
//! image in a canonical (X,Y,Z,C,T) coordinate system, independent of the
//! dimension order of the underlying arrays. All reads return big-endian
//! byte buffers.
//!
//! A buffer belongs to one request: it is cheap to create (metadata and
//! open arrays are shared through process-wide caches) and is dropped when
//! the request completes. [`set_resolution_level`](ZarrPixelBuffer::set_resolution_level)
//! takes `&mut self`; region reads take `&self` and may be issued
//! concurrently on one buffer.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::array::{ArrayError, DataType, ZarrArray};
use crate::cache::{ArrayCache, Cache, MetadataCache};
use crate::group::Group;
use crate::multiscale::{Axis, AxisMap, InvalidMultiscalesError, Multiscales};
use crate::storage::uri::{store_from_uri, StoreCreateError};
use crate::storage::{ReadableStorage, StorageError};

/// The canonical dimensions of an image, as declared by the image metadata
/// (not measured from the on-disk arrays).
///
/// Each extent is positive, and `size_x * size_y * byte_width` of the pixel
/// type must fit in a signed 32-bit integer for plane-sized reads; the
/// buffer enforces the latter per request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PixelsDimensions {
    /// Columns.
    pub size_x: u32,
    /// Rows.
    pub size_y: u32,
    /// Depth.
    pub size_z: u32,
    /// Channels.
    pub size_c: u32,
    /// Timepoints.
    pub size_t: u32,
}

impl PixelsDimensions {
    /// Create image dimensions.
    #[must_use]
    pub const fn new(size_x: u32, size_y: u32, size_z: u32, size_c: u32, size_t: u32) -> Self {
        Self {
            size_x,
            size_y,
            size_z,
            size_c,
            size_t,
        }
    }
}

/// A pixel buffer error.
#[derive(Debug, Error)]
pub enum PixelBufferError {
    /// The root store could not be created.
    #[error(transparent)]
    StoreCreateError(#[from] StoreCreateError),
    /// The root group does not describe a usable multiscale image.
    #[error(transparent)]
    InvalidMultiscales(#[from] InvalidMultiscalesError),
    /// An underlying storage error.
    #[error(transparent)]
    StorageError(#[from] StorageError),
    /// An underlying array error.
    #[error(transparent)]
    ArrayError(#[from] ArrayError),
    /// A resolution level outside `[0, resolution_levels)`.
    #[error("resolution level {level} out of range, image has {levels} levels")]
    OutOfRange {
        /// The requested level.
        level: u32,
        /// The number of levels.
        levels: u32,
    },
    /// A request coordinate or corner outside the image.
    #[error("dimensions out of bounds: {0}")]
    DimensionsOutOfBounds(String),
    /// A request larger than the configured plane limit.
    #[error(
        "requested region {width}x{height} exceeds the plane limit \
         {max_width}x{max_height}"
    )]
    RequestTooLarge {
        /// The requested region width.
        width: u32,
        /// The requested region height.
        height: u32,
        /// The configured plane width limit.
        max_width: u32,
        /// The configured plane height limit.
        max_height: u32,
    },
    /// An operation this read-only buffer does not provide.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

/// The key of one cached tile.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
struct TileKey {
    level: u32,
    z: u32,
    c: u32,
    t: u32,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// A read-only pixel buffer over one NGFF multiscale image.
#[derive(Debug)]
pub struct ZarrPixelBuffer {
    /// The declared image dimensions.
    pixels: PixelsDimensions,
    /// The storage of the hierarchy.
    storage: ReadableStorage,
    /// The cache identity of the hierarchy root.
    root_id: String,
    /// The resolved multiscale description.
    multiscales: Multiscales,
    /// The widest plane region a single read may request.
    max_plane_width: u32,
    /// The tallest plane region a single read may request.
    max_plane_height: u32,
    /// The shared open-array cache.
    array_cache: Arc<ArrayCache>,
    /// The selected resolution level; 0 is full resolution.
    level: u32,
    /// The open array at the selected level.
    array: Arc<ZarrArray>,
    /// Full-resolution Z index to the selected level's Z index. Empty when
    /// the arrays have no Z axis.
    z_map: Vec<u64>,
    /// Recently read tiles of the working channel triplet.
    tile_cache: Cache<TileKey, Bytes>,
}

impl ZarrPixelBuffer {
    /// Open the multiscale image at `root_uri`.
    ///
    /// `max_plane_width * max_plane_height` bounds the element count of any
    /// single region read. The metadata and array caches are shared across
    /// buffers so that buffers over one image share parsing and open
    /// arrays.
    ///
    /// The buffer starts at the smallest resolution level, matching the
    /// legacy convention.
    ///
    /// # Errors
    ///
    /// Returns [`PixelBufferError`] if the URI or store is invalid, the root
    /// metadata is not a usable multiscale description, or the smallest
    /// level's array cannot be opened.
    pub async fn open(
        pixels: PixelsDimensions,
        root_uri: &str,
        max_plane_width: u32,
        max_plane_height: u32,
        metadata_cache: Arc<MetadataCache>,
        array_cache: Arc<ArrayCache>,
    ) -> Result<Self, PixelBufferError> {
        let storage = store_from_uri(root_uri).await?;
        Self::with_storage(
            pixels,
            storage,
            root_uri,
            max_plane_width,
            max_plane_height,
            metadata_cache,
            array_cache,
        )
        .await
    }

    /// Open the multiscale image at the root of `storage`.
    ///
    /// `root_id` scopes cache entries; buffers sharing a hierarchy must pass
    /// the same id.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub async fn with_storage(
        pixels: PixelsDimensions,
        storage: ReadableStorage,
        root_id: &str,
        max_plane_width: u32,
        max_plane_height: u32,
        metadata_cache: Arc<MetadataCache>,
        array_cache: Arc<ArrayCache>,
    ) -> Result<Self, PixelBufferError> {
        let attributes = {
            let storage = storage.clone();
            metadata_cache
                .get_or_try_load((root_id.to_string(), String::new()), || async move {
                    let group = Group::open(storage, "").await?;
                    Ok::<_, StorageError>(Arc::new(group.attributes().clone()))
                })
                .await?
        };
        let multiscales = Multiscales::from_attributes(&attributes)?;
        let levels = multiscales.levels() as u32;

        let level = levels - 1;
        let (array, z_map) =
            open_level(&storage, root_id, &multiscales, &array_cache, level).await?;

        let size_c = multiscales
            .axes
            .index(Axis::C)
            .map_or(1, |d| array.shape()[d]);
        let tile_cache = Cache::new(size_c as usize);

        debug!(root_id, levels, level, "opened pixel buffer");
        Ok(Self {
            pixels,
            storage,
            root_id: root_id.to_string(),
            multiscales,
            max_plane_width,
            max_plane_height,
            array_cache,
            level,
            array,
            z_map,
            tile_cache,
        })
    }

    /// Select a resolution level. Level 0 is the full-resolution dataset;
    /// level `resolution_levels() - 1` is the smallest.
    ///
    /// Selecting a level rebuilds the Z remap table: on levels whose Z
    /// extent is downsampled, a full-resolution plane index `z` reads the
    /// underlying plane `z * level_z / full_z` (floor division).
    ///
    /// # Errors
    ///
    /// Returns [`PixelBufferError::OutOfRange`] if `level` is not a level of
    /// this image, and [`PixelBufferError`] if the level's array cannot be
    /// opened.
    pub async fn set_resolution_level(&mut self, level: u32) -> Result<(), PixelBufferError> {
        if level >= self.resolution_levels() {
            return Err(PixelBufferError::OutOfRange {
                level,
                levels: self.resolution_levels(),
            });
        }
        let (array, z_map) = open_level(
            &self.storage,
            &self.root_id,
            &self.multiscales,
            &self.array_cache,
            level,
        )
        .await?;
        self.level = level;
        self.array = array;
        self.z_map = z_map;
        Ok(())
    }

    /// The selected resolution level.
    #[must_use]
    pub const fn resolution_level(&self) -> u32 {
        self.level
    }

    /// The number of resolution levels.
    #[must_use]
    pub fn resolution_levels(&self) -> u32 {
        self.multiscales.levels() as u32
    }

    /// Synthetic `(width, height)` descriptions of the resolution pyramid:
    /// entry `i` is the declared image size halved `i` times.
    ///
    /// This is a legacy contract. The descriptions derive from the declared
    /// [`PixelsDimensions`], never from the on-disk array shapes.
    #[must_use]
    pub fn resolution_descriptions(&self) -> Vec<(u32, u32)> {
        (0..self.resolution_levels())
            .map(|i| (self.pixels.size_x >> i, self.pixels.size_y >> i))
            .collect()
    }

    /// The `(width, height)` chunk extents of the selected level's array.
    #[must_use]
    pub fn tile_size(&self) -> (u32, u32) {
        let chunks = self.array.chunk_shape();
        (
            chunks[self.axes().x()] as u32,
            chunks[self.axes().y()] as u32,
        )
    }

    /// Columns at the selected level.
    #[must_use]
    pub fn size_x(&self) -> u32 {
        self.axis_extent(Axis::X)
    }

    /// Rows at the selected level.
    #[must_use]
    pub fn size_y(&self) -> u32 {
        self.axis_extent(Axis::Y)
    }

    /// Depth of the **full-resolution** dataset, at every level.
    #[must_use]
    pub fn size_z(&self) -> u32 {
        if self.z_map.is_empty() {
            1
        } else {
            self.z_map.len() as u32
        }
    }

    /// Channels at the selected level.
    #[must_use]
    pub fn size_c(&self) -> u32 {
        self.axis_extent(Axis::C)
    }

    /// Timepoints at the selected level.
    #[must_use]
    pub fn size_t(&self) -> u32 {
        self.axis_extent(Axis::T)
    }

    /// The pixel type of the image.
    #[must_use]
    pub fn pixels_type(&self) -> DataType {
        self.array.data_type()
    }

    /// The size in bytes of one pixel.
    #[must_use]
    pub fn byte_width(&self) -> usize {
        self.array.data_type().byte_width()
    }

    /// Whether the pixel type is signed.
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.array.data_type().is_signed()
    }

    /// Whether the pixel type is floating point.
    #[must_use]
    pub fn is_float(&self) -> bool {
        self.array.data_type().is_float()
    }

    /// Read a `width` x `height` tile at `(x, y)` of plane `(z, c, t)`.
    ///
    /// Tiles pass through a per-buffer cache. On three-channel images the
    /// buffer assumes the caller renders RGB and reads all three channel
    /// tiles in quick succession: a request whose tile is not cached clears
    /// the cache and loads the whole triplet in one batch. This policy is
    /// fixed; it keys on the channel count alone.
    ///
    /// # Errors
    ///
    /// Returns [`PixelBufferError::DimensionsOutOfBounds`] if the origin or
    /// far corner is outside the image,
    /// [`PixelBufferError::RequestTooLarge`] if `width * height` exceeds the
    /// plane limit, and [`PixelBufferError`] on storage or decode failures.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_tile(
        &self,
        z: u32,
        c: u32,
        t: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<Bytes, PixelBufferError> {
        self.check_bounds(x, y, z, c, t)?;
        if width == 0 || height == 0 {
            return Err(PixelBufferError::DimensionsOutOfBounds(format!(
                "empty tile {width}x{height}"
            )));
        }
        self.check_bounds(x + width - 1, y + height - 1, z, c, t)?;
        self.check_read_size(width, height)?;

        let key = TileKey {
            level: self.level,
            z,
            c,
            t,
            x,
            y,
            width,
            height,
        };
        if self.size_c() == 3 {
            if !self.tile_cache.contains_loaded(&key).await {
                // A cold channel means the triplet moved; LRU rotation is
                // unreliable for this access pattern, so start clean.
                self.tile_cache.invalidate_all().await;
            }
            let mut tiles = try_join_all((0..3u32).map(|channel| {
                let key = TileKey { c: channel, ..key };
                async move {
                    self.tile_cache
                        .get_or_try_load(key, || self.read_tile(key))
                        .await
                }
            }))
            .await?;
            Ok(tiles.swap_remove(c as usize))
        } else {
            self.tile_cache
                .get_or_try_load(key, || self.read_tile(key))
                .await
        }
    }

    /// Read row `y` of plane `(z, c, t)`.
    ///
    /// # Errors
    ///
    /// See [`get_tile`](Self::get_tile).
    pub async fn get_row(&self, y: u32, z: u32, c: u32, t: u32) -> Result<Bytes, PixelBufferError> {
        self.get_tile(z, c, t, 0, y, self.size_x(), 1).await
    }

    /// Read column `x` of plane `(z, c, t)`.
    ///
    /// # Errors
    ///
    /// See [`get_tile`](Self::get_tile).
    pub async fn get_col(&self, x: u32, z: u32, c: u32, t: u32) -> Result<Bytes, PixelBufferError> {
        self.get_tile(z, c, t, x, 0, 1, self.size_y()).await
    }

    /// Read the whole plane `(z, c, t)`.
    ///
    /// # Errors
    ///
    /// See [`get_tile`](Self::get_tile).
    pub async fn get_plane(&self, z: u32, c: u32, t: u32) -> Result<Bytes, PixelBufferError> {
        self.get_tile(z, c, t, 0, 0, self.size_x(), self.size_y())
            .await
    }

    /// Read the whole Z stack of channel `c` at timepoint `t`, planes in Z
    /// order. The stack always holds [`size_z`](Self::size_z) planes; on
    /// Z-downsampled levels the planes are remapped.
    ///
    /// # Errors
    ///
    /// See [`get_tile`](Self::get_tile).
    #[instrument(skip(self), level = "debug")]
    pub async fn get_stack(&self, c: u32, t: u32) -> Result<Bytes, PixelBufferError> {
        self.check_bounds(0, 0, 0, c, t)?;
        let shape = [self.size_x(), self.size_y(), self.size_z(), 1, 1];
        let offset = [0, 0, 0, c, t];
        Ok(Bytes::from(self.read(offset, shape).await?))
    }

    /// Read every channel stack at timepoint `t`, stacks in C order.
    ///
    /// # Errors
    ///
    /// See [`get_tile`](Self::get_tile).
    #[instrument(skip(self), level = "debug")]
    pub async fn get_timepoint(&self, t: u32) -> Result<Bytes, PixelBufferError> {
        self.check_bounds(0, 0, 0, 0, t)?;
        let shape = [
            self.size_x(),
            self.size_y(),
            self.size_z(),
            self.size_c(),
            1,
        ];
        let offset = [0, 0, 0, 0, t];
        Ok(Bytes::from(self.read(offset, shape).await?))
    }

    /// Writing is not supported; the buffer is read-only.
    ///
    /// # Errors
    ///
    /// Always returns [`PixelBufferError::Unsupported`].
    pub fn set_tile(
        &mut self,
        _buffer: &[u8],
        _z: u32,
        _c: u32,
        _t: u32,
        _x: u32,
        _y: u32,
        _width: u32,
        _height: u32,
    ) -> Result<(), PixelBufferError> {
        Err(PixelBufferError::Unsupported("set_tile"))
    }

    /// Writing is not supported; the buffer is read-only.
    ///
    /// # Errors
    ///
    /// Always returns [`PixelBufferError::Unsupported`].
    pub fn set_plane(
        &mut self,
        _buffer: &[u8],
        _z: u32,
        _c: u32,
        _t: u32,
    ) -> Result<(), PixelBufferError> {
        Err(PixelBufferError::Unsupported("set_plane"))
    }

    /// Strided hypercube reads are not supported.
    ///
    /// # Errors
    ///
    /// Always returns [`PixelBufferError::Unsupported`].
    pub fn get_hypercube(
        &self,
        _offset: &[u32],
        _size: &[u32],
        _step: &[u32],
    ) -> Result<Bytes, PixelBufferError> {
        Err(PixelBufferError::Unsupported("get_hypercube"))
    }

    fn axes(&self) -> &AxisMap {
        &self.multiscales.axes
    }

    /// The selected level's extent along `axis`, 1 when the arrays lack it.
    /// Image dimensions are bounded by the i32 Pixels model; the cast is
    /// lossless.
    fn axis_extent(&self, axis: Axis) -> u32 {
        self.axes()
            .index(axis)
            .map_or(1, |d| self.array.shape()[d] as u32)
    }

    /// Reject any coordinate outside the current sizes.
    fn check_bounds(&self, x: u32, y: u32, z: u32, c: u32, t: u32) -> Result<(), PixelBufferError> {
        let checks = [
            ("x", x, self.size_x()),
            ("y", y, self.size_y()),
            ("z", z, self.size_z()),
            ("c", c, self.size_c()),
            ("t", t, self.size_t()),
        ];
        for (name, value, size) in checks {
            if value >= size {
                return Err(PixelBufferError::DimensionsOutOfBounds(format!(
                    "{name}={value} outside [0, {size})"
                )));
            }
        }
        Ok(())
    }

    /// Reject oversized requests before any allocation proportional to them.
    fn check_read_size(&self, width: u32, height: u32) -> Result<(), PixelBufferError> {
        let too_large = || PixelBufferError::RequestTooLarge {
            width,
            height,
            max_width: self.max_plane_width,
            max_height: self.max_plane_height,
        };
        let elements = u64::from(width) * u64::from(height);
        if elements > u64::from(self.max_plane_width) * u64::from(self.max_plane_height) {
            return Err(too_large());
        }
        // Plane-sized operations must fit a signed 32-bit byte count.
        if elements * self.byte_width() as u64 > i32::MAX as u64 {
            return Err(too_large());
        }
        Ok(())
    }

    async fn read_tile(&self, key: TileKey) -> Result<Bytes, PixelBufferError> {
        let shape = [key.width, key.height, 1, 1, 1];
        let offset = [key.x, key.y, key.z, key.c, key.t];
        Ok(Bytes::from(self.read(offset, shape).await?))
    }

    /// Read a canonical region: `offset`/`shape` are in (X,Y,Z,C,T) order,
    /// and the output is row-major in canonical order (X fastest, then Y,
    /// Z, C, T) in big-endian bytes.
    async fn read(&self, offset: [u32; 5], shape: [u32; 5]) -> Result<Vec<u8>, PixelBufferError> {
        self.check_read_size(shape[0], shape[1])?;

        let axes = self.axes();
        let rank = axes.rank();
        let mut native_offset = vec![0u64; rank];
        let mut native_shape = vec![1u64; rank];
        for (canonical, axis) in [Axis::X, Axis::Y, Axis::Z, Axis::C, Axis::T]
            .into_iter()
            .enumerate()
        {
            match axes.index(axis) {
                Some(d) => {
                    native_offset[d] = u64::from(offset[canonical]);
                    native_shape[d] = u64::from(shape[canonical]);
                }
                // Axes the arrays lack are omitted; only the degenerate
                // extent can be requested along them.
                None if offset[canonical] == 0 && shape[canonical] <= 1 => {}
                None => {
                    return Err(PixelBufferError::DimensionsOutOfBounds(format!(
                        "{axis}={} outside [0, 1)",
                        offset[canonical].max(shape[canonical].saturating_sub(1))
                    )))
                }
            }
        }

        match axes.index(Axis::Z) {
            // A Z-downsampled level: split into single-plane reads looped
            // t -> c -> z so the concatenation is in canonical order, with
            // each plane's Z offset remapped to the underlying array.
            Some(z_dim) if self.z_map.len() as u64 != self.array.shape()[z_dim] => {
                let width = self.byte_width();
                let plane_len = shape[0] as usize * shape[1] as usize * width;
                let plane_count = (shape[2] as usize) * (shape[3] as usize) * (shape[4] as usize);
                let mut out = Vec::with_capacity(plane_len * plane_count);
                for t in offset[4]..offset[4] + shape[4] {
                    for c in offset[3]..offset[3] + shape[3] {
                        for z in offset[2]..offset[2] + shape[2] {
                            let mut plane_offset = native_offset.clone();
                            let mut plane_shape = native_shape.clone();
                            plane_offset[z_dim] = self.z_map[z as usize];
                            plane_shape[z_dim] = 1;
                            if let Some(t_dim) = axes.index(Axis::T) {
                                plane_offset[t_dim] = u64::from(t);
                                plane_shape[t_dim] = 1;
                            }
                            if let Some(c_dim) = axes.index(Axis::C) {
                                plane_offset[c_dim] = u64::from(c);
                                plane_shape[c_dim] = 1;
                            }
                            out.extend_from_slice(
                                &self.array.read_region(&plane_offset, &plane_shape).await?,
                            );
                        }
                    }
                }
                Ok(out)
            }
            // One native read. NGFF axis order keeps T, C, and Z ahead of
            // Y and X with Z innermost of the three, so row-major native
            // output already matches the canonical layout.
            _ => Ok(self.array.read_region(&native_offset, &native_shape).await?),
        }
    }
}

/// Open the array of one resolution level through the array cache and build
/// its Z remap table from the full-resolution array.
async fn open_level(
    storage: &ReadableStorage,
    root_id: &str,
    multiscales: &Multiscales,
    array_cache: &ArrayCache,
    level: u32,
) -> Result<(Arc<ZarrArray>, Vec<u64>), PixelBufferError> {
    let load = |path: String| {
        let storage = storage.clone();
        let key = (root_id.to_string(), path.clone());
        async move {
            array_cache
                .get_or_try_load(key, || async move {
                    Ok::<_, ArrayError>(Arc::new(ZarrArray::open(storage, &path).await?))
                })
                .await
        }
    };

    let axes = &multiscales.axes;
    let array = load(multiscales.datasets[level as usize].path.clone()).await?;
    if array.shape().len() != axes.rank() {
        return Err(InvalidMultiscalesError::ShapeRankMismatch {
            array_rank: array.shape().len(),
            axes_rank: axes.rank(),
        }
        .into());
    }

    let z_map = match axes.index(Axis::Z) {
        Some(z_dim) => {
            let full = load(multiscales.datasets[0].path.clone()).await?;
            if full.shape().len() != axes.rank() {
                return Err(InvalidMultiscalesError::ShapeRankMismatch {
                    array_rank: full.shape().len(),
                    axes_rank: axes.rank(),
                }
                .into());
            }
            let full_z = full.shape()[z_dim];
            let array_z = array.shape()[z_dim];
            (0..full_z).map(|z| z * array_z / full_z).collect()
        }
        None => Vec::new(),
    };
    Ok((array, z_map))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use itertools::Itertools;

    use crate::storage::{
        array_meta_key, attrs_key, chunk_key, group_meta_key, store::MemoryStore, MaybeBytes,
        ReadableStorageTraits, StoreKey,
    };

    use super::*;

    fn write_attrs(store: &MemoryStore, axes: &[&str], levels: usize) {
        let axes_value: Vec<_> = axes
            .iter()
            .map(|name| serde_json::json!({"name": name, "type": "space"}))
            .collect();
        let datasets: Vec<_> = (0..levels)
            .map(|i| serde_json::json!({"path": i.to_string()}))
            .collect();
        let attrs = serde_json::json!({
            "multiscales": [{"version": "0.4", "axes": axes_value, "datasets": datasets}]
        });
        store.set(&group_meta_key(""), br#"{"zarr_format": 2}"#.to_vec());
        store.set(&attrs_key(""), serde_json::to_vec(&attrs).unwrap());
    }

    /// Write one uint16 little-endian level as a single chunk. `value`
    /// receives canonical (t, c, z, y, x) coordinates.
    fn write_u16_level(
        store: &MemoryStore,
        path: &str,
        axes: &[&str],
        native_shape: &[u64],
        value: impl Fn(u64, u64, u64, u64, u64) -> u16,
    ) {
        let metadata = serde_json::json!({
            "zarr_format": 2,
            "shape": native_shape,
            "chunks": native_shape,
            "dtype": "<u2",
            "compressor": null,
            "fill_value": 0,
            "order": "C"
        });
        store.set(&array_meta_key(path), serde_json::to_vec(&metadata).unwrap());

        let mut chunk = Vec::new();
        for position in native_shape
            .iter()
            .map(|&extent| 0..extent)
            .multi_cartesian_product()
        {
            let (mut t, mut c, mut z, mut y, mut x) = (0, 0, 0, 0, 0);
            for (d, &index) in position.iter().enumerate() {
                match axes[d] {
                    "t" => t = index,
                    "c" => c = index,
                    "z" => z = index,
                    "y" => y = index,
                    "x" => x = index,
                    _ => unreachable!(),
                }
            }
            chunk.extend_from_slice(&value(t, c, z, y, x).to_le_bytes());
        }
        store.set(&chunk_key(path, &vec![0; native_shape.len()], '.'), chunk);
    }

    async fn open_buffer(
        store: Arc<dyn ReadableStorageTraits>,
        pixels: PixelsDimensions,
        max_plane_width: u32,
        max_plane_height: u32,
    ) -> ZarrPixelBuffer {
        ZarrPixelBuffer::with_storage(
            pixels,
            store,
            "test",
            max_plane_width,
            max_plane_height,
            Arc::new(Cache::new(16)),
            Arc::new(Cache::new(16)),
        )
        .await
        .unwrap()
    }

    fn u16s(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .collect()
    }

    fn s1_value(t: u64, c: u64, z: u64, y: u64, x: u64) -> u16 {
        (t * 360 + c * 120 + z * 30 + y * 6 + x) as u16
    }

    /// T=2, C=3, Z=4, Y=5, X=6 in native TCZYX order.
    async fn s1_buffer() -> ZarrPixelBuffer {
        let store = MemoryStore::new();
        write_attrs(&store, &["t", "c", "z", "y", "x"], 1);
        write_u16_level(&store, "0", &["t", "c", "z", "y", "x"], &[2, 3, 4, 5, 6], s1_value);
        open_buffer(
            Arc::new(store),
            PixelsDimensions::new(6, 5, 4, 3, 2),
            64,
            64,
        )
        .await
    }

    #[tokio::test]
    async fn five_d_round_trip() {
        let buffer = s1_buffer().await;

        assert_eq!(buffer.resolution_levels(), 1);
        assert_eq!(buffer.resolution_level(), 0);
        assert_eq!(buffer.size_x(), 6);
        assert_eq!(buffer.size_y(), 5);
        assert_eq!(buffer.size_z(), 4);
        assert_eq!(buffer.size_c(), 3);
        assert_eq!(buffer.size_t(), 2);
        assert_eq!(buffer.pixels_type(), DataType::UInt16);
        assert_eq!(buffer.byte_width(), 2);
        assert!(!buffer.is_signed());
        assert!(!buffer.is_float());
        assert_eq!(buffer.tile_size(), (6, 5));

        let tile = buffer.get_tile(0, 0, 0, 0, 0, 2, 2).await.unwrap();
        assert_eq!(u16s(&tile), vec![0, 1, 6, 7]);
        let tile = buffer.get_tile(1, 1, 1, 1, 1, 2, 2).await.unwrap();
        assert_eq!(u16s(&tile), vec![517, 518, 523, 524]);
    }

    #[tokio::test]
    async fn region_decompositions_agree() {
        let buffer = s1_buffer().await;
        let row_len = 6 * 2;
        let plane_len = 6 * 5 * 2;
        let stack_len = plane_len * 4;

        let plane = buffer.get_plane(2, 1, 1).await.unwrap();
        assert_eq!(plane.len(), plane_len);

        for y in 0..5u32 {
            let row = buffer.get_row(y, 2, 1, 1).await.unwrap();
            let offset = y as usize * row_len;
            assert_eq!(&row[..], &plane[offset..offset + row_len]);
        }

        for x in 0..6u32 {
            let col = buffer.get_col(x, 2, 1, 1).await.unwrap();
            assert_eq!(col.len(), 5 * 2);
            for y in 0..5usize {
                let offset = y * row_len + x as usize * 2;
                assert_eq!(&col[y * 2..y * 2 + 2], &plane[offset..offset + 2]);
            }
        }

        let stack = buffer.get_stack(1, 1).await.unwrap();
        assert_eq!(stack.len(), stack_len);
        for z in 0..4u32 {
            let plane = buffer.get_plane(z, 1, 1).await.unwrap();
            let offset = z as usize * plane_len;
            assert_eq!(&stack[offset..offset + plane_len], &plane[..]);
        }

        let timepoint = buffer.get_timepoint(1).await.unwrap();
        assert_eq!(timepoint.len(), stack_len * 3);
        for c in 0..3u32 {
            let stack = buffer.get_stack(c, 1).await.unwrap();
            let offset = c as usize * stack_len;
            assert_eq!(&timepoint[offset..offset + stack_len], &stack[..]);
        }
    }

    #[tokio::test]
    async fn permuted_axes_transparent() {
        let store = MemoryStore::new();
        write_attrs(&store, &["c", "t", "z", "y", "x"], 1);
        write_u16_level(&store, "0", &["c", "t", "z", "y", "x"], &[3, 2, 4, 5, 6], s1_value);
        let buffer = open_buffer(
            Arc::new(store),
            PixelsDimensions::new(6, 5, 4, 3, 2),
            64,
            64,
        )
        .await;

        assert_eq!(buffer.size_x(), 6);
        assert_eq!(buffer.size_c(), 3);
        assert_eq!(buffer.size_t(), 2);

        let plane = buffer.get_plane(2, 1, 1).await.unwrap();
        let expected: Vec<u16> = (0..5u64)
            .flat_map(|y| (0..6u64).map(move |x| s1_value(1, 1, 2, y, x)))
            .collect();
        assert_eq!(u16s(&plane), expected);

        let timepoint = buffer.get_timepoint(0).await.unwrap();
        let expected: Vec<u16> = (0..3u64)
            .flat_map(|c| {
                (0..4u64).flat_map(move |z| {
                    (0..5u64).flat_map(move |y| (0..6u64).map(move |x| s1_value(0, c, z, y, x)))
                })
            })
            .collect();
        assert_eq!(u16s(&timepoint), expected);
    }

    /// Full-resolution Z=16 with Z-downsampled levels 8 and 4. Plane values
    /// mark the level's native Z index.
    async fn z_pyramid_buffer() -> ZarrPixelBuffer {
        let store = MemoryStore::new();
        write_attrs(&store, &["z", "y", "x"], 3);
        for (path, shape) in [("0", [16u64, 8, 8]), ("1", [8, 4, 4]), ("2", [4, 2, 2])] {
            write_u16_level(&store, path, &["z", "y", "x"], &shape, |_, _, z, _, _| z as u16);
        }
        open_buffer(
            Arc::new(store),
            PixelsDimensions::new(8, 8, 16, 1, 1),
            64,
            64,
        )
        .await
    }

    #[tokio::test]
    async fn z_downsampled_pyramid() {
        let mut buffer = z_pyramid_buffer().await;

        // Construction selects the smallest level.
        assert_eq!(buffer.resolution_level(), 2);
        assert_eq!(buffer.size_x(), 2);
        assert_eq!(buffer.size_y(), 2);

        // Z is always reported at full resolution.
        for level in 0..3 {
            buffer.set_resolution_level(level).await.unwrap();
            assert_eq!(buffer.size_z(), 16);
        }

        buffer.set_resolution_level(2).await.unwrap();
        let plane = buffer.get_plane(15, 0, 0).await.unwrap();
        assert_eq!(plane.len(), 2 * 2 * 2);
        assert_eq!(u16s(&plane), vec![3; 4]);

        buffer.set_resolution_level(1).await.unwrap();
        assert_eq!(u16s(&buffer.get_plane(15, 0, 0).await.unwrap()), vec![7; 16]);

        buffer.set_resolution_level(0).await.unwrap();
        assert_eq!(u16s(&buffer.get_plane(9, 0, 0).await.unwrap()), vec![9; 64]);

        // A stack at the smallest level still emits 16 remapped planes.
        buffer.set_resolution_level(2).await.unwrap();
        let stack = buffer.get_stack(0, 0).await.unwrap();
        assert_eq!(stack.len(), 16 * 2 * 2 * 2);
        let values = u16s(&stack);
        for z in 0..16usize {
            for value in &values[z * 4..(z + 1) * 4] {
                assert_eq!(*value, (z * 4 / 16) as u16);
            }
        }
    }

    #[tokio::test]
    async fn synthetic_resolution_descriptions() {
        let mut buffer = z_pyramid_buffer().await;
        assert_eq!(
            buffer.resolution_descriptions(),
            vec![(8, 8), (4, 4), (2, 2)]
        );

        buffer.set_resolution_level(0).await.unwrap();
        assert_eq!((buffer.size_x(), buffer.size_y()), (8, 8));
        buffer.set_resolution_level(2).await.unwrap();
        assert_eq!((buffer.size_x(), buffer.size_y()), (8 >> 2, 8 >> 2));

        assert!(matches!(
            buffer.set_resolution_level(3).await,
            Err(PixelBufferError::OutOfRange {
                level: 3,
                levels: 3
            })
        ));
        // The failed transition leaves the buffer usable.
        assert_eq!(buffer.resolution_level(), 2);
        buffer.get_plane(0, 0, 0).await.unwrap();
    }

    #[tokio::test]
    async fn oversize_request_rejected() {
        let store = MemoryStore::new();
        write_attrs(&store, &["y", "x"], 1);
        // A shape declared far larger than anything stored: no chunk blobs
        // exist, so any read that got past the size check would fabricate
        // gigabytes of zeroes.
        let metadata = serde_json::json!({
            "zarr_format": 2,
            "shape": [50000, 50000],
            "chunks": [512, 512],
            "dtype": "|u1",
            "compressor": null,
            "fill_value": 0,
            "order": "C"
        });
        store.set(&array_meta_key("0"), serde_json::to_vec(&metadata).unwrap());
        let buffer = open_buffer(
            Arc::new(store),
            PixelsDimensions::new(50000, 50000, 1, 1, 1),
            32,
            32,
        )
        .await;

        assert!(matches!(
            buffer.get_tile(0, 0, 0, 0, 0, 50000, 50000).await,
            Err(PixelBufferError::RequestTooLarge {
                width: 50000,
                height: 50000,
                max_width: 32,
                max_height: 32,
            })
        ));
        assert!(matches!(
            buffer.get_plane(0, 0, 0).await,
            Err(PixelBufferError::RequestTooLarge { .. })
        ));

        // Within the limit, absent chunks read as zero.
        let tile = buffer.get_tile(0, 0, 0, 100, 200, 16, 2).await.unwrap();
        assert_eq!(tile.as_ref(), &[0u8; 32][..]);
    }

    #[tokio::test]
    async fn sparse_chunks_read_as_zero() {
        let store = MemoryStore::new();
        write_attrs(&store, &["y", "x"], 1);
        let metadata = serde_json::json!({
            "zarr_format": 2,
            "shape": [4, 6],
            "chunks": [2, 3],
            "dtype": "<u2",
            "compressor": null,
            "fill_value": 0,
            "order": "C"
        });
        store.set(&array_meta_key("0"), serde_json::to_vec(&metadata).unwrap());
        // Chunk (1, 1) is deliberately absent.
        for (cy, cx) in [(0u64, 0u64), (0, 1), (1, 0)] {
            let mut chunk = Vec::new();
            for y in cy * 2..cy * 2 + 2 {
                for x in cx * 3..cx * 3 + 3 {
                    chunk.extend_from_slice(&((y * 6 + x) as u16).to_le_bytes());
                }
            }
            store.set(&chunk_key("0", &[cy, cx], '.'), chunk);
        }
        let buffer = open_buffer(
            Arc::new(store),
            PixelsDimensions::new(6, 4, 1, 1, 1),
            64,
            64,
        )
        .await;

        let plane = buffer.get_plane(0, 0, 0).await.unwrap();
        let expected: Vec<u16> = (0..4u16)
            .flat_map(|y| {
                (0..6u16).map(move |x| if y >= 2 && x >= 3 { 0 } else { y * 6 + x })
            })
            .collect();
        assert_eq!(u16s(&plane), expected);
    }

    /// A store counting chunk retrievals (metadata keys excluded).
    #[derive(Debug)]
    struct CountingStore {
        inner: MemoryStore,
        chunk_gets: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ReadableStorageTraits for CountingStore {
        async fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
            let name = key.as_str();
            if !name.ends_with(".zattrs") && !name.ends_with(".zgroup") && !name.ends_with(".zarray")
            {
                self.chunk_gets.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.get(key).await
        }
    }

    #[tokio::test]
    async fn rgb_tiles_coalesce_reads() {
        let inner = MemoryStore::new();
        write_attrs(&inner, &["c", "y", "x"], 1);
        write_u16_level(&inner, "0", &["c", "y", "x"], &[3, 4, 6], |_, c, _, y, x| {
            (c * 100 + y * 6 + x) as u16
        });
        let store = Arc::new(CountingStore {
            inner,
            chunk_gets: AtomicUsize::new(0),
        });
        let buffer = open_buffer(
            store.clone(),
            PixelsDimensions::new(6, 4, 1, 3, 1),
            64,
            64,
        )
        .await;

        // Three calls varying only the channel: one underlying read per
        // channel, issued as a batch on the first call.
        for c in 0..3u32 {
            let tile = buffer.get_tile(0, c, 0, 0, 0, 6, 4).await.unwrap();
            let expected: Vec<u16> = (0..4u64)
                .flat_map(|y| (0..6u64).map(move |x| (u64::from(c) * 100 + y * 6 + x) as u16))
                .collect();
            assert_eq!(u16s(&tile), expected);
        }
        assert_eq!(store.chunk_gets.load(Ordering::SeqCst), 3);

        // An identical call answers from the tile cache.
        buffer.get_tile(0, 0, 0, 0, 0, 6, 4).await.unwrap();
        assert_eq!(store.chunk_gets.load(Ordering::SeqCst), 3);

        // A different tile rolls the triplet and loads a fresh batch.
        buffer.get_tile(0, 1, 0, 1, 1, 2, 2).await.unwrap();
        assert_eq!(store.chunk_gets.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn bounds_and_unsupported() {
        let mut buffer = s1_buffer().await;

        for (z, c, t, x, y) in [
            (4, 0, 0, 0, 0),
            (0, 3, 0, 0, 0),
            (0, 0, 2, 0, 0),
            (0, 0, 0, 6, 0),
            (0, 0, 0, 0, 5),
        ] {
            assert!(matches!(
                buffer.get_tile(z, c, t, x, y, 1, 1).await,
                Err(PixelBufferError::DimensionsOutOfBounds(_))
            ));
        }
        // The far corner is checked too.
        assert!(matches!(
            buffer.get_tile(0, 0, 0, 5, 4, 2, 2).await,
            Err(PixelBufferError::DimensionsOutOfBounds(_))
        ));
        assert!(matches!(
            buffer.get_tile(0, 0, 0, 0, 0, 0, 1).await,
            Err(PixelBufferError::DimensionsOutOfBounds(_))
        ));
        assert!(matches!(
            buffer.get_row(5, 0, 0, 0).await,
            Err(PixelBufferError::DimensionsOutOfBounds(_))
        ));
        assert!(matches!(
            buffer.get_stack(3, 0).await,
            Err(PixelBufferError::DimensionsOutOfBounds(_))
        ));

        assert!(matches!(
            buffer.set_tile(&[], 0, 0, 0, 0, 0, 1, 1),
            Err(PixelBufferError::Unsupported("set_tile"))
        ));
        assert!(matches!(
            buffer.set_plane(&[], 0, 0, 0),
            Err(PixelBufferError::Unsupported("set_plane"))
        ));
        assert!(matches!(
            buffer.get_hypercube(&[], &[], &[]),
            Err(PixelBufferError::Unsupported("get_hypercube"))
        ));
    }

    #[tokio::test]
    async fn missing_z_axis_reports_one_plane() {
        let store = MemoryStore::new();
        write_attrs(&store, &["y", "x"], 1);
        write_u16_level(&store, "0", &["y", "x"], &[4, 6], |_, _, _, y, x| (y * 6 + x) as u16);
        // The declared Pixels claim Z=4, but the arrays have no Z axis: the
        // safe contract is a single plane.
        let buffer = open_buffer(
            Arc::new(store),
            PixelsDimensions::new(6, 4, 4, 1, 1),
            64,
            64,
        )
        .await;

        assert_eq!(buffer.size_z(), 1);
        buffer.get_plane(0, 0, 0).await.unwrap();
        assert!(matches!(
            buffer.get_plane(1, 0, 0).await,
            Err(PixelBufferError::DimensionsOutOfBounds(_))
        ));
    }

    #[tokio::test]
    async fn construction_failures() {
        // No multiscales attribute at all.
        let store = MemoryStore::new();
        store.set(&attrs_key(""), br#"{"other": 1}"#.to_vec());
        let result = ZarrPixelBuffer::with_storage(
            PixelsDimensions::new(1, 1, 1, 1, 1),
            Arc::new(store),
            "test",
            64,
            64,
            Arc::new(Cache::new(16)),
            Arc::new(Cache::new(16)),
        )
        .await;
        assert!(matches!(
            result,
            Err(PixelBufferError::InvalidMultiscales(
                InvalidMultiscalesError::MissingMultiscales
            ))
        ));

        // Axes disagreeing with the array rank.
        let store = MemoryStore::new();
        write_attrs(&store, &["z", "y", "x"], 1);
        write_u16_level(&store, "0", &["y", "x"], &[4, 6], |_, _, _, y, x| (y * 6 + x) as u16);
        let result = ZarrPixelBuffer::with_storage(
            PixelsDimensions::new(6, 4, 1, 1, 1),
            Arc::new(store),
            "test",
            64,
            64,
            Arc::new(Cache::new(16)),
            Arc::new(Cache::new(16)),
        )
        .await;
        assert!(matches!(
            result,
            Err(PixelBufferError::InvalidMultiscales(
                InvalidMultiscalesError::ShapeRankMismatch { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn buffers_share_cached_arrays() {
        let store = MemoryStore::new();
        write_attrs(&store, &["y", "x"], 1);
        write_u16_level(&store, "0", &["y", "x"], &[4, 6], |_, _, _, y, x| (y * 6 + x) as u16);
        let store: Arc<dyn ReadableStorageTraits> = Arc::new(store);
        let metadata_cache: Arc<MetadataCache> = Arc::new(Cache::new(16));
        let array_cache: Arc<ArrayCache> = Arc::new(Cache::new(16));
        let pixels = PixelsDimensions::new(6, 4, 1, 1, 1);

        let first = ZarrPixelBuffer::with_storage(
            pixels,
            store.clone(),
            "shared",
            64,
            64,
            metadata_cache.clone(),
            array_cache.clone(),
        )
        .await
        .unwrap();
        let second = ZarrPixelBuffer::with_storage(
            pixels,
            store,
            "shared",
            64,
            64,
            metadata_cache.clone(),
            array_cache.clone(),
        )
        .await
        .unwrap();

        assert!(Arc::ptr_eq(&first.array, &second.array));
        assert_eq!(metadata_cache.len().await, 1);
        assert_eq!(array_cache.len().await, 1);
    }
}
