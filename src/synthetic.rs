//! Synthetic tile inputs for tests and debug runs.
//!
//! Real tiles come from external raster/vector providers; everything here
//! fabricates small deterministic stand-ins so the pipeline can run
//! without any data on disk.

use noise::{NoiseFn, Perlin, Seedable};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::raster::{Dem, Layer, RasterBundle};
use crate::vector_map::{VectorMap, OUTER_FACE};

/// Uniform tile at one elevation, water surface matching.
pub fn flat_bundle(size: usize, west: f64, south: f64, elevation: f32) -> RasterBundle {
    let mut elev = Dem::new(size, size, west, south, west + 1.0, south + 1.0);
    let mut surface = Dem::new(size, size, west, south, west + 1.0, south + 1.0);
    for y in 0..size as i32 {
        for x in 0..size as i32 {
            elev.set(x, y, elevation);
            surface.set(x, y, elevation);
        }
    }
    let mut rasters = RasterBundle::new();
    rasters.insert(Layer::Elevation, elev);
    rasters.insert(Layer::WaterSurface, surface);
    rasters
}

/// Multi-octave Perlin terrain. Same seed, same tile: identical output.
pub fn noise_bundle(size: usize, west: f64, south: f64, seed: u64, relief_m: f32) -> RasterBundle {
    let terrain = Perlin::new(1).set_seed(seed as u32);
    let detail = Perlin::new(1).set_seed(seed as u32 + 1111);

    let mut elev = Dem::new(size, size, west, south, west + 1.0, south + 1.0);
    let mut surface = Dem::new(size, size, west, south, west + 1.0, south + 1.0);
    for y in 0..size as i32 {
        for x in 0..size as i32 {
            let fx = x as f64 / size as f64;
            let fy = y as f64 / size as f64;
            let mut h = 0.0;
            let mut amp = 1.0;
            let mut freq = 2.0;
            for _ in 0..4 {
                h += amp * terrain.get([fx * freq, fy * freq]);
                amp *= 0.5;
                freq *= 2.0;
            }
            h += 0.1 * detail.get([fx * 16.0, fy * 16.0]);
            let meters = (h * 0.5 + 0.5) as f32 * relief_m;
            elev.set(x, y, meters);
            surface.set(x, y, meters);
        }
    }
    let mut rasters = RasterBundle::new();
    rasters.insert(Layer::Elevation, elev);
    rasters.insert(Layer::WaterSurface, surface);
    rasters
}

/// Punch a square pit into an existing elevation layer.
pub fn dig_pit(rasters: &mut RasterBundle, cx: i32, cy: i32, radius: i32, depth: f32) {
    if let Some(elev) = rasters.get_mut(Layer::Elevation) {
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let v = elev.get(cx + dx, cy + dy);
                elev.set(cx + dx, cy + dy, v - depth);
            }
        }
    }
}

/// A rectangular lake covering the given geo box, with a river running
/// from its east shore off the east tile edge.
pub fn lake_and_river_map(w: f64, s: f64, e: f64, n: f64, tile_east: f64) -> VectorMap {
    let mut map = VectorMap::new();
    map.add_polygon_face(&[(w, s), (e, s), (e, n), (w, n)], true, None);
    let mid = 0.5 * (s + n);
    map.add_river(&[(e, mid), (tile_east, mid)], OUTER_FACE);
    map
}

/// Scatter jittered placements for serializer tests; a fraction land
/// outside the tile on purpose.
pub fn scattered_placements(
    count: usize,
    seed: u64,
    west: f64,
    south: f64,
) -> Vec<crate::tile::Placement> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count)
        .map(|i| crate::tile::Placement {
            lon: west + rng.gen_range(-0.1..1.1),
            lat: south + rng.gen_range(-0.1..1.1),
            definition: format!("obj_{i}"),
            heading_deg: rng.gen_range(0.0..360.0),
        })
        .collect()
}
