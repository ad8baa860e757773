//! Crate-wide error type.
//!
//! Only structural failures surface as errors: everything else in the
//! pipeline degrades to a logged fallback and keeps going.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TileError {
    /// A point was inserted outside the declared tile bounds. The mesh
    /// shares structure across the whole tile, so this is unrecoverable.
    #[error("point ({lon}, {lat}) lies outside tile bounds [{west}, {south}] - [{east}, {north}]")]
    OutOfBounds {
        lon: f64,
        lat: f64,
        west: f64,
        south: f64,
        east: f64,
        north: f64,
    },

    /// A constraint endpoint could not be located in the mesh after
    /// insertion. Indicates upstream data corruption.
    #[error("constraint endpoint ({lon}, {lat}) not locatable in mesh")]
    LostConstraint { lon: f64, lat: f64 },

    /// A rule file line did not parse.
    #[error("rule file {file}, line {line}: {reason}")]
    RuleParse {
        file: String,
        line: usize,
        reason: String,
    },

    /// A border descriptor file was present but malformed.
    #[error("border descriptor {file}, line {line}: {reason}")]
    BorderParse {
        file: String,
        line: usize,
        reason: String,
    },

    /// A pipeline stage needs a raster layer the bundle does not carry.
    #[error("missing raster layer {0:?}")]
    MissingLayer(crate::raster::Layer),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TileError>;
