//! Raster grids: the generic cell arena and the geo-referenced DEM.
//!
//! Every scalar field (elevation, climate, land use, flow quantity, ...)
//! lives in its own `Dem`; fields are never shared or aliased between
//! pipeline stages.

use std::collections::HashMap;

/// Sentinel for missing raster samples.
pub const NO_DATA: f32 = -32768.0;

/// Meters per degree of latitude.
pub const DEG_TO_MTR_LAT: f64 = 111_320.0;

/// Meters per nautical mile.
pub const NM_TO_MTR: f64 = 1852.0;

/// Direction offsets (dx, dy), N first, clockwise. Odd indices are the
/// diagonals.
pub const DIR_OFFSETS: [(i32, i32); 8] = [
    (0, 1),   // N
    (1, 1),   // NE
    (1, 0),   // E
    (1, -1),  // SE
    (0, -1),  // S
    (-1, -1), // SW
    (-1, 0),  // W
    (-1, 1),  // NW
];

/// Grid-step distance per direction, diagonals scaled by sqrt(2).
pub const DIR_DISTANCES: [f32; 8] = [
    1.0, 1.414, 1.0, 1.414, 1.0, 1.414, 1.0, 1.414,
];

// ===== GENERIC GRID =====

/// A dense 2D cell arena. Row 0 is the south edge.
#[derive(Clone)]
pub struct Grid<T> {
    pub width: usize,
    pub height: usize,
    data: Vec<T>,
}

impl<T: Clone + Default> Grid<T> {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![T::default(); width * height],
        }
    }
}

impl<T: Clone> Grid<T> {
    pub fn new_with(width: usize, height: usize, value: T) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    fn index(&self, x: usize, y: usize) -> usize {
        debug_assert!(x < self.width && y < self.height);
        y * self.width + x
    }

    pub fn get(&self, x: usize, y: usize) -> &T {
        &self.data[self.index(x, y)]
    }

    pub fn get_mut(&mut self, x: usize, y: usize) -> &mut T {
        let idx = self.index(x, y);
        &mut self.data[idx]
    }

    pub fn set(&mut self, x: usize, y: usize, value: T) {
        let idx = self.index(x, y);
        self.data[idx] = value;
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height
    }

    /// Signed-coordinate read; `None` off the grid.
    pub fn get_signed(&self, x: i32, y: i32) -> Option<&T> {
        if self.in_bounds(x, y) {
            Some(self.get(x as usize, y as usize))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &T)> {
        self.data.iter().enumerate().map(move |(idx, val)| {
            let x = idx % self.width;
            let y = idx / self.width;
            (x, y, val)
        })
    }
}

// ===== GEO-REFERENCED DEM =====

/// Point-registered raster over a lat/lon bounding box: post (0,0) sits at
/// (west, south), post (width-1, height-1) at (east, north).
#[derive(Clone)]
pub struct Dem {
    pub grid: Grid<f32>,
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Dem {
    pub fn new(width: usize, height: usize, west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            grid: Grid::new_with(width, height, NO_DATA),
            west,
            south,
            east,
            north,
        }
    }

    pub fn width(&self) -> usize {
        self.grid.width
    }

    pub fn height(&self) -> usize {
        self.grid.height
    }

    /// Raw sample; NO_DATA off the grid.
    pub fn get(&self, x: i32, y: i32) -> f32 {
        match self.grid.get_signed(x, y) {
            Some(&v) => v,
            None => NO_DATA,
        }
    }

    pub fn set(&mut self, x: i32, y: i32, v: f32) {
        if self.grid.in_bounds(x, y) {
            self.grid.set(x as usize, y as usize, v);
        }
    }

    pub fn lon_to_x(&self, lon: f64) -> f64 {
        (lon - self.west) / (self.east - self.west) * (self.width() - 1) as f64
    }

    pub fn lat_to_y(&self, lat: f64) -> f64 {
        (lat - self.south) / (self.north - self.south) * (self.height() - 1) as f64
    }

    pub fn x_to_lon(&self, x: f64) -> f64 {
        self.west + x / (self.width() - 1) as f64 * (self.east - self.west)
    }

    pub fn y_to_lat(&self, y: f64) -> f64 {
        self.south + y / (self.height() - 1) as f64 * (self.north - self.south)
    }

    /// Meters covered by one post step in x at this raster's latitude.
    pub fn x_step_meters(&self) -> f64 {
        let mid_lat = 0.5 * (self.south + self.north);
        (self.east - self.west) / (self.width() - 1) as f64
            * DEG_TO_MTR_LAT
            * mid_lat.to_radians().cos()
    }

    /// Meters covered by one post step in y.
    pub fn y_step_meters(&self) -> f64 {
        (self.north - self.south) / (self.height() - 1) as f64 * DEG_TO_MTR_LAT
    }

    /// Nearest-post sample at a geo coordinate.
    pub fn sample_nearest(&self, lon: f64, lat: f64) -> f32 {
        let x = self.lon_to_x(lon).round() as i32;
        let y = self.lat_to_y(lat).round() as i32;
        self.get(x, y)
    }

    /// Bilinear sample at a geo coordinate; NO_DATA if any corner is missing.
    pub fn sample_linear(&self, lon: f64, lat: f64) -> f32 {
        let fx = self.lon_to_x(lon);
        let fy = self.lat_to_y(lat);
        let x0 = fx.floor() as i32;
        let y0 = fy.floor() as i32;
        let tx = (fx - x0 as f64) as f32;
        let ty = (fy - y0 as f64) as f32;

        let v00 = self.get(x0, y0);
        let v10 = self.get(x0 + 1, y0);
        let v01 = self.get(x0, y0 + 1);
        let v11 = self.get(x0 + 1, y0 + 1);
        if v00 == NO_DATA || v10 == NO_DATA || v01 == NO_DATA || v11 == NO_DATA {
            // Fall back to whichever post exists.
            return self.sample_nearest(lon, lat);
        }
        let a = v00 * (1.0 - tx) + v10 * tx;
        let b = v01 * (1.0 - tx) + v11 * tx;
        a * (1.0 - ty) + b * ty
    }

    /// Majority value among the posts nearest to a set of geo coordinates.
    pub fn sample_majority(&self, pts: &[(f64, f64)]) -> f32 {
        let mut histo: HashMap<i64, usize> = HashMap::new();
        for &(lon, lat) in pts {
            let v = self.sample_nearest(lon, lat);
            if v != NO_DATA {
                *histo.entry(v as i64).or_insert(0) += 1;
            }
        }
        let mut best = NO_DATA;
        let mut best_n = 0;
        for (v, n) in histo {
            if n > best_n {
                best_n = n;
                best = v as f32;
            }
        }
        best
    }
}

// ===== DERIVED LAYERS =====

/// Per-post slope in 0..1 (1 - cos of the surface tilt), from central
/// differences in meters.
pub fn derive_slope(elev: &Dem) -> Dem {
    let mut out = elev.clone();
    let sx = elev.x_step_meters();
    let sy = elev.y_step_meters();
    for y in 0..elev.height() as i32 {
        for x in 0..elev.width() as i32 {
            let e = elev.get(x, y);
            if e == NO_DATA {
                out.set(x, y, NO_DATA);
                continue;
            }
            let ex0 = pick(elev.get(x - 1, y), e);
            let ex1 = pick(elev.get(x + 1, y), e);
            let ey0 = pick(elev.get(x, y - 1), e);
            let ey1 = pick(elev.get(x, y + 1), e);
            let gx = (ex1 - ex0) as f64 / (2.0 * sx);
            let gy = (ey1 - ey0) as f64 / (2.0 * sy);
            let cos_tilt = 1.0 / (1.0 + gx * gx + gy * gy).sqrt();
            out.set(x, y, (1.0 - cos_tilt) as f32);
        }
    }
    out
}

/// Relative elevation: position of each post within the min..max band of a
/// surrounding window, in 0..1.
pub fn derive_relative_elevation(elev: &Dem, radius: i32) -> Dem {
    let (lo, hi) = window_min_max(elev, radius);
    let mut out = elev.clone();
    for y in 0..elev.height() as i32 {
        for x in 0..elev.width() as i32 {
            let e = elev.get(x, y);
            let l = lo.get(x, y);
            let h = hi.get(x, y);
            if e == NO_DATA || l == NO_DATA || h == NO_DATA || h <= l {
                out.set(x, y, if e == NO_DATA { NO_DATA } else { 0.5 });
            } else {
                out.set(x, y, (e - l) / (h - l));
            }
        }
    }
    out
}

/// Elevation range: max - min over a surrounding window, meters.
pub fn derive_elevation_range(elev: &Dem, radius: i32) -> Dem {
    let (lo, hi) = window_min_max(elev, radius);
    let mut out = elev.clone();
    for y in 0..elev.height() as i32 {
        for x in 0..elev.width() as i32 {
            let l = lo.get(x, y);
            let h = hi.get(x, y);
            out.set(x, y, if l == NO_DATA { NO_DATA } else { h - l });
        }
    }
    out
}

/// Box-smoothed copy, `passes` iterations of a 3x3 mean. Used for the water
/// surface and the wetness layer so the mesh does not inherit raster noise.
pub fn derive_smoothed(src: &Dem, passes: usize) -> Dem {
    let mut cur = src.clone();
    for _ in 0..passes {
        let mut next = cur.clone();
        for y in 0..cur.height() as i32 {
            for x in 0..cur.width() as i32 {
                if cur.get(x, y) == NO_DATA {
                    continue;
                }
                let mut sum = 0.0f32;
                let mut n = 0;
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        let v = cur.get(x + dx, y + dy);
                        if v != NO_DATA {
                            sum += v;
                            n += 1;
                        }
                    }
                }
                next.set(x, y, sum / n as f32);
            }
        }
        cur = next;
    }
    cur
}

fn pick(v: f32, fallback: f32) -> f32 {
    if v == NO_DATA {
        fallback
    } else {
        v
    }
}

/// Two-pass separable sliding min/max over a (2r+1) square window.
fn window_min_max(elev: &Dem, radius: i32) -> (Dem, Dem) {
    let mut lo_row = elev.clone();
    let mut hi_row = elev.clone();
    for y in 0..elev.height() as i32 {
        for x in 0..elev.width() as i32 {
            let mut lo = f32::MAX;
            let mut hi = f32::MIN;
            for dx in -radius..=radius {
                let v = elev.get(x + dx, y);
                if v != NO_DATA {
                    lo = lo.min(v);
                    hi = hi.max(v);
                }
            }
            if lo == f32::MAX {
                lo_row.set(x, y, NO_DATA);
                hi_row.set(x, y, NO_DATA);
            } else {
                lo_row.set(x, y, lo);
                hi_row.set(x, y, hi);
            }
        }
    }
    let mut lo_out = elev.clone();
    let mut hi_out = elev.clone();
    for y in 0..elev.height() as i32 {
        for x in 0..elev.width() as i32 {
            let mut lo = f32::MAX;
            let mut hi = f32::MIN;
            for dy in -radius..=radius {
                let l = lo_row.get(x, y + dy);
                let h = hi_row.get(x, y + dy);
                if l != NO_DATA {
                    lo = lo.min(l);
                    hi = hi.max(h);
                }
            }
            if lo == f32::MAX {
                lo_out.set(x, y, NO_DATA);
                hi_out.set(x, y, NO_DATA);
            } else {
                lo_out.set(x, y, lo);
                hi_out.set(x, y, hi);
            }
        }
    }
    (lo_out, hi_out)
}

/// Identifiers for the named scalar layers a raster provider hands us.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Layer {
    Elevation,
    WaterSurface,
    Bathymetry,
    LandUse,
    Climate,
    Temperature,
    TemperatureRange,
    Rainfall,
    UrbanDensity,
    UrbanRadial,
    UrbanTransport,
    UrbanSquare,
    FlowDirection,
    FlowQuantity,
    Slope,
    RelativeElevation,
    ElevationRange,
    Wetness,
}

/// The layer set for one tile, keyed by `Layer`.
pub struct RasterBundle {
    layers: HashMap<Layer, Dem>,
}

impl RasterBundle {
    pub fn new() -> Self {
        Self {
            layers: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: Layer, dem: Dem) {
        self.layers.insert(id, dem);
    }

    pub fn get(&self, id: Layer) -> Option<&Dem> {
        self.layers.get(&id)
    }

    pub fn get_mut(&mut self, id: Layer) -> Option<&mut Dem> {
        self.layers.get_mut(&id)
    }

    pub fn take(&mut self, id: Layer) -> Option<Dem> {
        self.layers.remove(&id)
    }
}

impl Default for RasterBundle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_dem() -> Dem {
        let mut d = Dem::new(11, 11, 0.0, 0.0, 1.0, 1.0);
        for y in 0..11 {
            for x in 0..11 {
                d.set(x, y, (x * 10) as f32);
            }
        }
        d
    }

    #[test]
    fn geo_transforms_round_trip() {
        let d = ramp_dem();
        assert!((d.lon_to_x(0.5) - 5.0).abs() < 1e-9);
        assert!((d.x_to_lon(5.0) - 0.5).abs() < 1e-9);
        assert!((d.lat_to_y(1.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn bilinear_interpolates_ramp() {
        let d = ramp_dem();
        let v = d.sample_linear(0.45, 0.3);
        assert!((v - 45.0).abs() < 1e-3);
    }

    #[test]
    fn off_grid_reads_are_no_data() {
        let d = ramp_dem();
        assert_eq!(d.get(-1, 0), NO_DATA);
        assert_eq!(d.get(0, 99), NO_DATA);
    }

    #[test]
    fn relative_elevation_bounds() {
        let d = ramp_dem();
        let rel = derive_relative_elevation(&d, 3);
        for y in 0..11 {
            for x in 0..11 {
                let v = rel.get(x, y);
                assert!((0.0..=1.0).contains(&v), "rel {} at {},{}", v, x, y);
            }
        }
        // Left edge is the local minimum of its window.
        assert!(rel.get(0, 5) < 0.01);
    }

    #[test]
    fn slope_flat_is_zero() {
        let mut d = Dem::new(5, 5, 0.0, 0.0, 1.0, 1.0);
        for y in 0..5 {
            for x in 0..5 {
                d.set(x, y, 100.0);
            }
        }
        let s = derive_slope(&d);
        assert_eq!(s.get(2, 2), 0.0);
    }

    #[test]
    fn majority_sample_votes() {
        let mut d = Dem::new(3, 3, 0.0, 0.0, 1.0, 1.0);
        for y in 0..3 {
            for x in 0..3 {
                d.set(x, y, 7.0);
            }
        }
        d.set(0, 0, 3.0);
        let m = d.sample_majority(&[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)]);
        assert_eq!(m, 7.0);
    }
}
