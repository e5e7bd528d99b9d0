//! NGFF multiscale metadata.
//!
//! An NGFF multiscale image is a Zarr group whose attributes carry a
//! `multiscales` list describing a pyramid of progressively downsampled
//! arrays. Entry 0 is authoritative: its `datasets` list names one array
//! path per resolution (full resolution first, per the NGFF convention) and
//! its optional `axes` list names the dimension order of those arrays.
//!
//! See <https://ngff.openmicroscopy.org/0.4/#multiscale-md>.

use derive_more::Display;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// The root group attribute key holding multiscale metadata.
pub const MULTISCALES_KEY: &str = "multiscales";

/// A logical image axis.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Display)]
pub enum Axis {
    /// Time.
    #[display(fmt = "T")]
    T,
    /// Channel.
    #[display(fmt = "C")]
    C,
    /// Depth.
    #[display(fmt = "Z")]
    Z,
    /// Row.
    #[display(fmt = "Y")]
    Y,
    /// Column.
    #[display(fmt = "X")]
    X,
}

/// An invalid multiscales attribute.
#[derive(Debug, Error)]
pub enum InvalidMultiscalesError {
    /// The root group attributes have no `multiscales` key.
    #[error("no multiscales attribute in root group metadata")]
    MissingMultiscales,
    /// The `multiscales` list is empty.
    #[error("multiscales attribute is empty")]
    NoEntries,
    /// The used entry has no datasets.
    #[error("multiscales entry has no datasets")]
    NoDatasets,
    /// The metadata did not deserialize.
    #[error("malformed multiscales attribute: {0}")]
    Malformed(String),
    /// An axis name outside {t,c,z,y,x}.
    #[error("unknown axis name {0}")]
    UnknownAxisName(String),
    /// An axis name appearing twice.
    #[error("duplicate axis name {0}")]
    DuplicateAxisName(String),
    /// A mandatory axis (X or Y) is absent.
    #[error("missing {0} axis")]
    MissingAxis(Axis),
    /// An array whose rank disagrees with the axes list.
    #[error("array rank {array_rank} does not match the {axes_rank} multiscale axes")]
    ShapeRankMismatch {
        /// The rank of the opened array.
        array_rank: usize,
        /// The number of multiscale axes.
        axes_rank: usize,
    },
}

/// One entry of the `multiscales` list.
#[derive(Clone, Debug, Deserialize)]
pub struct MultiscaleMetadata {
    /// The axes of the datasets, in order. Optional in early NGFF versions.
    #[serde(default)]
    pub axes: Option<Vec<AxisMetadata>>,
    /// The pyramid datasets, in the order given.
    pub datasets: Vec<DatasetMetadata>,
    /// The NGFF metadata version.
    #[serde(default)]
    pub version: Option<String>,
    /// The multiscale name.
    #[serde(default)]
    pub name: Option<String>,
}

/// One entry of an `axes` list.
#[derive(Clone, Debug, Deserialize)]
pub struct AxisMetadata {
    /// The axis name; matched case-insensitively against {t,c,z,y,x}.
    pub name: String,
    /// The axis type (`time`, `channel`, `space`).
    #[serde(default, rename = "type")]
    pub axis_type: Option<String>,
    /// The axis unit.
    #[serde(default)]
    pub unit: Option<String>,
}

/// One entry of a `datasets` list.
#[derive(Clone, Debug, Deserialize)]
pub struct DatasetMetadata {
    /// The array path relative to the multiscale group.
    pub path: String,
}

/// The mapping from logical axes to array dimension indices.
///
/// X and Y are always present; T, C, and Z are optional, and an absent axis
/// means extent 1 along that dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AxisMap {
    t: Option<usize>,
    c: Option<usize>,
    z: Option<usize>,
    y: usize,
    x: usize,
    rank: usize,
}

impl Default for AxisMap {
    /// The `TCZYX` mapping assumed when an `axes` list is absent.
    fn default() -> Self {
        Self {
            t: Some(0),
            c: Some(1),
            z: Some(2),
            y: 3,
            x: 4,
            rank: 5,
        }
    }
}

impl AxisMap {
    /// Build the mapping from an `axes` list.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidMultiscalesError`] on unknown or duplicate axis
    /// names, or if X or Y is absent.
    pub fn from_axes(axes: &[AxisMetadata]) -> Result<Self, InvalidMultiscalesError> {
        let mut indices: [Option<usize>; 5] = [None; 5];
        for (index, axis) in axes.iter().enumerate() {
            let slot = match axis.name.to_lowercase().as_str() {
                "t" => 0,
                "c" => 1,
                "z" => 2,
                "y" => 3,
                "x" => 4,
                _ => return Err(InvalidMultiscalesError::UnknownAxisName(axis.name.clone())),
            };
            if indices[slot].is_some() {
                return Err(InvalidMultiscalesError::DuplicateAxisName(
                    axis.name.clone(),
                ));
            }
            indices[slot] = Some(index);
        }
        let y = indices[3].ok_or(InvalidMultiscalesError::MissingAxis(Axis::Y))?;
        let x = indices[4].ok_or(InvalidMultiscalesError::MissingAxis(Axis::X))?;
        Ok(Self {
            t: indices[0],
            c: indices[1],
            z: indices[2],
            y,
            x,
            rank: axes.len(),
        })
    }

    /// The dimension index of `axis`, or [`None`] if the arrays lack it.
    #[must_use]
    pub const fn index(&self, axis: Axis) -> Option<usize> {
        match axis {
            Axis::T => self.t,
            Axis::C => self.c,
            Axis::Z => self.z,
            Axis::Y => Some(self.y),
            Axis::X => Some(self.x),
        }
    }

    /// Whether the arrays have `axis`.
    #[must_use]
    pub const fn has(&self, axis: Axis) -> bool {
        self.index(axis).is_some()
    }

    /// The dimension index of the X axis.
    #[must_use]
    pub const fn x(&self) -> usize {
        self.x
    }

    /// The dimension index of the Y axis.
    #[must_use]
    pub const fn y(&self) -> usize {
        self.y
    }

    /// The number of array dimensions the mapping describes.
    #[must_use]
    pub const fn rank(&self) -> usize {
        self.rank
    }
}

/// The resolved multiscale description of an NGFF group.
#[derive(Clone, Debug)]
pub struct Multiscales {
    /// The pyramid datasets, in the order given (full resolution first).
    pub datasets: Vec<DatasetMetadata>,
    /// The axis mapping shared by all datasets.
    pub axes: AxisMap,
}

impl Multiscales {
    /// Resolve multiscale metadata from root group attributes.
    ///
    /// A top-level `"ome"` object is unwrapped first, tolerating hierarchies
    /// that nest the NGFF block (as the NGFF challenge layouts do).
    ///
    /// # Errors
    ///
    /// Returns [`InvalidMultiscalesError`] if the `multiscales` key is
    /// absent or empty, the metadata is malformed, or the axes are invalid.
    pub fn from_attributes(
        attributes: &Map<String, Value>,
    ) -> Result<Self, InvalidMultiscalesError> {
        let attributes = match attributes.get("ome") {
            Some(Value::Object(nested)) => nested,
            _ => attributes,
        };
        let multiscales = attributes
            .get(MULTISCALES_KEY)
            .ok_or(InvalidMultiscalesError::MissingMultiscales)?;
        let multiscales: Vec<MultiscaleMetadata> = serde_json::from_value(multiscales.clone())
            .map_err(|err| InvalidMultiscalesError::Malformed(err.to_string()))?;
        let entry = multiscales
            .into_iter()
            .next()
            .ok_or(InvalidMultiscalesError::NoEntries)?;
        if entry.datasets.is_empty() {
            return Err(InvalidMultiscalesError::NoDatasets);
        }
        let axes = match &entry.axes {
            Some(axes) => AxisMap::from_axes(axes)?,
            None => AxisMap::default(),
        };
        Ok(Self {
            datasets: entry.datasets,
            axes,
        })
    }

    /// The number of resolution levels.
    #[must_use]
    pub fn levels(&self) -> usize {
        self.datasets.len()
    }
}
