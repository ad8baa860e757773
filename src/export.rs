//! Debug PNG export for raster layers and drainage state.
//!
//! These dumps are for eyeballing intermediate pipeline state; nothing
//! here feeds back into tile generation.

use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};

use crate::hydro::{CellState, FlowGrid};
use crate::raster::{Dem, NO_DATA};

/// Export an elevation layer normalized to its own min/max. NO_DATA
/// posts come out black.
pub fn export_dem(dem: &Dem, path: &str) -> Result<(), image::ImageError> {
    let w = dem.width();
    let h = dem.height();
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for y in 0..h as i32 {
        for x in 0..w as i32 {
            let v = dem.get(x, y);
            if v != NO_DATA {
                lo = lo.min(v);
                hi = hi.max(v);
            }
        }
    }
    let span = (hi - lo).max(1e-6);

    let mut img: GrayImage = ImageBuffer::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let v = dem.get(x as i32, y as i32);
            let px = if v == NO_DATA {
                0
            } else {
                (((v - lo) / span) * 255.0) as u8
            };
            // Row 0 is south; images count rows from the top.
            img.put_pixel(x as u32, (h - 1 - y) as u32, Luma([px]));
        }
    }
    img.save(path)
}

/// Export drainage state: blue lakes, cyan sinks, red invalid regions,
/// flow accumulation as green intensity elsewhere.
pub fn export_flow(flow: &FlowGrid, path: &str) -> Result<(), image::ImageError> {
    let w = flow.state.width;
    let h = flow.state.height;
    let mut max_flow = 1.0f32;
    for y in 0..h {
        for x in 0..w {
            max_flow = max_flow.max(*flow.flow.get(x, y));
        }
    }

    let mut img: RgbImage = ImageBuffer::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let color = match flow.state.get(x, y) {
                CellState::Lake => [40, 80, 220],
                CellState::KnownSink => [60, 200, 220],
                CellState::Invalid => [220, 50, 50],
                CellState::Draining(_) | CellState::Unresolved => {
                    // Log scale keeps small tributaries visible.
                    let f = (flow.flow.get(x, y).ln() / max_flow.ln().max(1e-6)).clamp(0.0, 1.0);
                    [20, 40 + (f * 215.0) as u8, 20]
                }
            };
            img.put_pixel(x as u32, (h - 1 - y) as u32, Rgb(color));
        }
    }
    img.save(path)
}
