//! Scenery tile generation library
//!
//! Turns raster elevation/climate layers plus a vector map into a
//! classified, border-blended triangulated terrain tile.

pub mod beaches;
pub mod border;
pub mod cdt;
pub mod classify;
pub mod constraints;
pub mod error;
pub mod export;
pub mod fans;
pub mod hydro;
pub mod pipeline;
pub mod raster;
pub mod rules;
pub mod scanline;
pub mod select;
pub mod synthetic;
pub mod tile;
pub mod vector_map;
