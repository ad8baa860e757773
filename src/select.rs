//! Raster point selection: boil a dense elevation grid down to the sparse
//! set of posts worth triangulating.
//!
//! Several scans vote points into a selection mask; a pruning pass then
//! drops anything its neighbors can reproduce within tolerance. The result
//! is always a grid-aligned subset of the input raster.

use serde::{Deserialize, Serialize};

use crate::cdt::Mesh;
use crate::hydro::wet_posts;
use crate::raster::{Dem, Grid, NO_DATA};
use crate::rules::TerrainId;
use crate::vector_map::VectorMap;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectParams {
    /// Hard cap on mesh points per tile.
    pub max_points: usize,
    /// Mesh error tolerance, meters.
    pub max_error_m: f32,
    /// Tile-edge posts are forced every this many posts.
    pub edge_interval: i32,
    /// Wet posts are copied every this many posts.
    pub wet_skip: i32,
    /// Escalating extremum window sizes, posts.
    pub window_sizes: [i32; 4],
    /// Min spread within a window before its extrema are kept, meters.
    pub rise_threshold_m: f32,
    /// Initial angular-difference threshold, meters per post.
    pub angular_threshold: f32,
    /// Angular scan re-runs with a doubled threshold while it flags more
    /// than this many posts.
    pub angular_cap: usize,
    /// 4-neighbor delta that counts as a cliff, meters.
    pub cliff_height_m: f32,
    /// Face normal z below which a triangle is a cliff wall.
    pub cliff_normal_z: f32,
}

impl Default for SelectParams {
    fn default() -> Self {
        Self {
            max_points: 78_000,
            max_error_m: 5.0,
            edge_interval: 20,
            wet_skip: 40,
            window_sizes: [10, 20, 30, 40],
            rise_threshold_m: 15.0,
            angular_threshold: 1.0,
            angular_cap: 20_000,
            cliff_height_m: 50.0,
            cliff_normal_z: 0.7,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SelectStats {
    pub extremum: usize,
    pub angular: usize,
    pub cliff: usize,
    pub wet: usize,
    pub edge: usize,
    pub pruned: usize,
}

/// Run every scan and return the selection mask.
pub fn select_points(
    elev: &Dem,
    map: &VectorMap,
    params: &SelectParams,
) -> (Grid<u8>, SelectStats) {
    let mut mask: Grid<u8> = Grid::new(elev.width(), elev.height());
    let mut stats = SelectStats::default();

    stats.extremum = select_extrema(elev, params, &mut mask);
    stats.angular = select_angular(elev, params, &mut mask);
    stats.cliff = select_cliffs(elev, params.cliff_height_m, &mut mask);

    for (x, y) in wet_posts(elev, map, params.wet_skip) {
        if mark(&mut mask, x, y) {
            stats.wet += 1;
        }
    }

    stats.edge = force_edge_posts(elev, params.edge_interval, &mut mask);
    stats.pruned = prune_reproducible(elev, params.max_error_m, &mut mask);

    log::info!(
        "point selection: {} extremum, {} angular, {} cliff, {} wet, {} edge, {} pruned",
        stats.extremum,
        stats.angular,
        stats.cliff,
        stats.wet,
        stats.edge,
        stats.pruned
    );
    (mask, stats)
}

/// Selected posts as grid coordinates, edge posts first so boundary
/// structure exists before interior insertions.
pub fn mask_to_points(mask: &Grid<u8>) -> Vec<(i32, i32)> {
    let mut edge = Vec::new();
    let mut interior = Vec::new();
    for (x, y, &v) in mask.iter() {
        if v == 0 {
            continue;
        }
        let on_edge = x == 0 || y == 0 || x == mask.width - 1 || y == mask.height - 1;
        if on_edge {
            edge.push((x as i32, y as i32));
        } else {
            interior.push((x as i32, y as i32));
        }
    }
    edge.extend(interior);
    edge
}

fn mark(mask: &mut Grid<u8>, x: i32, y: i32) -> bool {
    if !mask.in_bounds(x, y) {
        return false;
    }
    let was = *mask.get(x as usize, y as usize);
    mask.set(x as usize, y as usize, 1);
    was == 0
}

/// Sliding min/max windows at escalating sizes. The largest window also
/// keeps its window-edge extrema, which guarantees coverage on a uniform
/// slope where (max - min) never beats the rise threshold locally.
fn select_extrema(elev: &Dem, params: &SelectParams, mask: &mut Grid<u8>) -> usize {
    let mut n = 0;
    let largest = *params.window_sizes.iter().max().unwrap_or(&40);
    for &win in params.window_sizes.iter() {
        let win = win.max(2);
        let mut y0 = 0i32;
        while y0 < elev.height() as i32 {
            let mut x0 = 0i32;
            while x0 < elev.width() as i32 {
                let mut lo = f32::MAX;
                let mut hi = f32::MIN;
                let mut lo_at = (x0, y0);
                let mut hi_at = (x0, y0);
                for y in y0..(y0 + win).min(elev.height() as i32) {
                    for x in x0..(x0 + win).min(elev.width() as i32) {
                        let e = elev.get(x, y);
                        if e == NO_DATA {
                            continue;
                        }
                        if e < lo {
                            lo = e;
                            lo_at = (x, y);
                        }
                        if e > hi {
                            hi = e;
                            hi_at = (x, y);
                        }
                    }
                }
                if lo != f32::MAX {
                    if hi - lo > params.rise_threshold_m {
                        if mark(mask, lo_at.0, lo_at.1) {
                            n += 1;
                        }
                        if mark(mask, hi_at.0, hi_at.1) {
                            n += 1;
                        }
                    } else if win == largest {
                        // Saturated window on gentle terrain: keep its
                        // extrema anyway.
                        if mark(mask, lo_at.0, lo_at.1) {
                            n += 1;
                        }
                        if mark(mask, hi_at.0, hi_at.1) {
                            n += 1;
                        }
                    }
                }
                x0 += win;
            }
            y0 += win;
        }
    }
    n
}

/// Flag posts where short-baseline gradients disagree across the post.
/// Doubles the threshold and rescans while too many posts fire.
fn select_angular(elev: &Dem, params: &SelectParams, mask: &mut Grid<u8>) -> usize {
    let mut threshold = params.angular_threshold;
    loop {
        let mut flagged = Vec::new();
        for y in 0..elev.height() as i32 {
            for x in 0..elev.width() as i32 {
                let e = elev.get(x, y);
                if e == NO_DATA {
                    continue;
                }
                let mut worst = 0.0f32;
                for reach in 1..=2i32 {
                    let gw = grad(e, elev.get(x - reach, y), reach);
                    let ge = grad(elev.get(x + reach, y), e, reach);
                    let gs = grad(e, elev.get(x, y - reach), reach);
                    let gn = grad(elev.get(x, y + reach), e, reach);
                    worst = worst.max((ge - gw).abs()).max((gn - gs).abs());
                }
                if worst > threshold {
                    flagged.push((x, y));
                }
            }
        }
        if flagged.len() > params.angular_cap {
            threshold *= 2.0;
            continue;
        }
        let mut n = 0;
        for (x, y) in flagged {
            if mark(mask, x, y) {
                n += 1;
            }
        }
        return n;
    }
}

fn grad(hi: f32, lo: f32, reach: i32) -> f32 {
    if hi == NO_DATA || lo == NO_DATA {
        0.0
    } else {
        (hi - lo) / reach as f32
    }
}

/// Flag posts with a near-vertical drop to a 4-neighbor.
fn select_cliffs(elev: &Dem, cliff_height: f32, mask: &mut Grid<u8>) -> usize {
    let mut n = 0;
    for y in 0..elev.height() as i32 {
        for x in 0..elev.width() as i32 {
            let e = elev.get(x, y);
            if e == NO_DATA {
                continue;
            }
            for (dx, dy) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
                let ne = elev.get(x + dx, y + dy);
                if ne != NO_DATA && (e - ne).abs() > cliff_height {
                    if mark(mask, x, y) {
                        n += 1;
                    }
                    break;
                }
            }
        }
    }
    n
}

/// Force the four corners and regularly spaced posts along each tile edge.
fn force_edge_posts(elev: &Dem, interval: i32, mask: &mut Grid<u8>) -> usize {
    let w = elev.width() as i32;
    let h = elev.height() as i32;
    let mut n = 0;
    let interval = interval.max(1);
    let mut x = 0;
    while x < w {
        if mark(mask, x, 0) {
            n += 1;
        }
        if mark(mask, x, h - 1) {
            n += 1;
        }
        x += interval;
    }
    let mut y = 0;
    while y < h {
        if mark(mask, 0, y) {
            n += 1;
        }
        if mark(mask, w - 1, y) {
            n += 1;
        }
        y += interval;
    }
    for (cx, cy) in [(0, 0), (w - 1, 0), (w - 1, h - 1), (0, h - 1)] {
        if elev.get(cx, cy) == NO_DATA {
            log::warn!("tile corner ({}, {}) has no elevation data", cx, cy);
        }
        if mark(mask, cx, cy) {
            n += 1;
        }
    }
    n
}

/// Drop interior selections that the surrounding raster reproduces within
/// tolerance. Edge posts are never pruned.
fn prune_reproducible(elev: &Dem, tolerance: f32, mask: &mut Grid<u8>) -> usize {
    let w = elev.width() as i32;
    let h = elev.height() as i32;
    let mut n = 0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            if *mask.get(x as usize, y as usize) == 0 {
                continue;
            }
            let e = elev.get(x, y);
            let ew = elev.get(x - 1, y);
            let ee = elev.get(x + 1, y);
            let es = elev.get(x, y - 1);
            let en = elev.get(x, y + 1);
            if e == NO_DATA || ew == NO_DATA || ee == NO_DATA || es == NO_DATA || en == NO_DATA
            {
                continue;
            }
            let est_x = 0.5 * (ew + ee);
            let est_y = 0.5 * (es + en);
            if (est_x - e).abs() < tolerance * 0.2 && (est_y - e).abs() < tolerance * 0.2 {
                mask.set(x as usize, y as usize, 0);
                n += 1;
            }
        }
    }
    n
}

// ===== POST-TRIANGULATION REFINEMENT =====

/// Greedy error-driven densification: insert the raster posts the mesh
/// reproduces worst, until the error tolerance or the point budget is hit.
/// Returns the number of points added.
pub fn densify_to_error(mesh: &mut Mesh, elev: &Dem, params: &SelectParams) -> usize {
    let mut added = 0usize;
    // Passes converge quickly; each insertion only changes interpolation
    // nearby.
    for _ in 0..4 {
        if mesh.vertices.len() >= params.max_points {
            break;
        }
        let mut worst: Vec<(f32, i32, i32)> = Vec::new();
        for y in 0..elev.height() as i32 {
            for x in 0..elev.width() as i32 {
                let e = elev.get(x, y);
                if e == NO_DATA {
                    continue;
                }
                let lon = elev.x_to_lon(x as f64);
                let lat = elev.y_to_lat(y as f64);
                if let Some(hm) = mesh.height_at(lon, lat) {
                    let err = (hm as f32 - e).abs();
                    if err > params.max_error_m {
                        worst.push((err, x, y));
                    }
                }
            }
        }
        if worst.is_empty() {
            break;
        }
        worst.sort_by(|a, b| b.0.total_cmp(&a.0));
        let budget = params.max_points.saturating_sub(mesh.vertices.len());
        let mut inserted_this_pass = 0;
        for &(_, x, y) in worst.iter().take(budget) {
            let lon = elev.x_to_lon(x as f64);
            let lat = elev.y_to_lat(y as f64);
            if mesh.insert(lon, lat, elev.get(x, y) as f64).is_ok() {
                added += 1;
                inserted_this_pass += 1;
            }
        }
        if inserted_this_pass == 0 {
            break;
        }
    }
    added
}

/// Split cliff-wall triangles (face normal leaning past the threshold) at
/// their centroid's nearest raster post.
pub fn split_cliff_faces(mesh: &mut Mesh, elev: &Dem, params: &SelectParams) -> usize {
    mesh.compute_normals();
    let mut targets = Vec::new();
    for f in mesh.face_ids() {
        if mesh.face(f).normal[2] < params.cliff_normal_z as f32 {
            let (lon, lat) = mesh.face_centroid(f);
            let x = elev.lon_to_x(lon).round();
            let y = elev.lat_to_y(lat).round();
            let e = elev.get(x as i32, y as i32);
            if e != NO_DATA {
                targets.push((elev.x_to_lon(x), elev.y_to_lat(y), e as f64));
            }
        }
    }
    let mut n = 0;
    for (lon, lat, h) in targets {
        if mesh.insert(lon, lat, h).is_ok() {
            n += 1;
        }
    }
    if n > 0 {
        mesh.compute_normals();
    }
    n
}

/// Split water triangles whose three corners all touch the shoreline:
/// without an interior vertex they render as beached slivers. The centroid
/// gets the average corner height.
pub fn split_beached_water(mesh: &mut Mesh, water: TerrainId) -> usize {
    let mut targets = Vec::new();
    for f in mesh.face_ids() {
        if mesh.face(f).terrain != water {
            continue;
        }
        let mut coastal = 0;
        for i in 0..3 {
            let v = mesh.face(f).v[i];
            if vertex_on_constraint(mesh, v) {
                coastal += 1;
            }
        }
        if coastal == 3 {
            let (lon, lat) = mesh.face_centroid(f);
            let h = mesh
                .face(f)
                .v
                .iter()
                .map(|&v| mesh.vertex(v).height)
                .sum::<f64>()
                / 3.0;
            targets.push((f, lon, lat, h));
        }
    }
    let mut n = 0;
    for (f, lon, lat, h) in targets {
        let terrain = mesh.face(f).terrain;
        if let Ok(v) = mesh.insert(lon, lat, h) {
            // New faces around the centroid inherit the water terrain.
            for nf in mesh.faces_around(v) {
                mesh.face_mut(nf).terrain = terrain;
            }
            n += 1;
        }
    }
    n
}

fn vertex_on_constraint(mesh: &Mesh, v: crate::cdt::VertId) -> bool {
    for f in mesh.faces_around(v) {
        for i in 0..3 {
            if !mesh.face(f).constrained[i] {
                continue;
            }
            let (a, b) = mesh.edge_verts(f, i);
            if a == v || b == v {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_dem(n: usize, h: f32) -> Dem {
        let mut d = Dem::new(n, n, 0.0, 0.0, 1.0, 1.0);
        for y in 0..n as i32 {
            for x in 0..n as i32 {
                d.set(x, y, h);
            }
        }
        d
    }

    #[test]
    fn flat_tile_selects_corners_and_edges_only() {
        // Scenario: a 10x10 flat tile with edge interval 20 (larger than
        // the tile) keeps the 4 corners plus the largest-window extrema,
        // and pruning strips reproducible interior posts.
        let d = flat_dem(10, 100.0);
        let map = VectorMap::new();
        let params = SelectParams::default();
        let (mask, _) = select_points(&d, &map, &params);
        for (cx, cy) in [(0, 0), (9, 0), (9, 9), (0, 9)] {
            assert_eq!(*mask.get(cx, cy), 1, "corner {},{} missing", cx, cy);
        }
        // Flat interior must not survive pruning.
        for y in 1..9 {
            for x in 1..9 {
                assert_eq!(*mask.get(x, y), 0, "interior {},{} selected", x, y);
            }
        }
    }

    #[test]
    fn edge_interval_posts_are_forced() {
        let d = flat_dem(50, 100.0);
        let map = VectorMap::new();
        let params = SelectParams::default();
        let (mask, _) = select_points(&d, &map, &params);
        for x in (0..50).step_by(20) {
            assert_eq!(*mask.get(x, 0), 1);
            assert_eq!(*mask.get(x, 49), 1);
        }
    }

    #[test]
    fn cliff_posts_selected() {
        let mut d = flat_dem(20, 100.0);
        for y in 0..20i32 {
            for x in 10..20i32 {
                d.set(x, y, 400.0);
            }
        }
        let mut mask: Grid<u8> = Grid::new(20, 20);
        let n = select_cliffs(&d, 50.0, &mut mask);
        assert!(n > 0);
        assert_eq!(*mask.get(10, 10), 1);
        assert_eq!(*mask.get(9, 10), 1);
    }

    #[test]
    fn angular_cap_doubles_threshold() {
        // Noisy terrain would flag everything at the base threshold; the
        // cap keeps the count bounded.
        let mut d = flat_dem(30, 0.0);
        for y in 0..30i32 {
            for x in 0..30i32 {
                d.set(x, y, if (x + y) % 2 == 0 { 0.0 } else { 40.0 });
            }
        }
        let params = SelectParams {
            angular_cap: 50,
            ..SelectParams::default()
        };
        let mut mask: Grid<u8> = Grid::new(30, 30);
        let n = select_angular(&d, &params, &mut mask);
        assert!(n <= 50);
    }

    #[test]
    fn ridge_extrema_selected() {
        let mut d = flat_dem(40, 0.0);
        for y in 0..40i32 {
            d.set(20, y, 500.0);
        }
        let params = SelectParams::default();
        let mut mask: Grid<u8> = Grid::new(40, 40);
        select_extrema(&d, &params, &mut mask);
        let mut ridge_hits = 0;
        for y in 0..40 {
            if *mask.get(20, y) != 0 {
                ridge_hits += 1;
            }
        }
        assert!(ridge_hits > 0);
    }

    #[test]
    fn densify_meets_tolerance() {
        // A dome the corner-only mesh cannot represent.
        let mut d = Dem::new(21, 21, 0.0, 0.0, 1.0, 1.0);
        for y in 0..21i32 {
            for x in 0..21i32 {
                let dx = (x - 10) as f32;
                let dy = (y - 10) as f32;
                d.set(x, y, 200.0 - (dx * dx + dy * dy));
            }
        }
        let mut mesh = Mesh::new(
            0.0,
            0.0,
            1.0,
            1.0,
            [
                d.get(0, 0) as f64,
                d.get(20, 0) as f64,
                d.get(20, 20) as f64,
                d.get(0, 20) as f64,
            ],
        );
        let params = SelectParams::default();
        let added = densify_to_error(&mut mesh, &d, &params);
        assert!(added > 0);
        let mut worst = 0.0f32;
        for y in 0..21i32 {
            for x in 0..21i32 {
                let lon = d.x_to_lon(x as f64);
                let lat = d.y_to_lat(y as f64);
                if let Some(h) = mesh.height_at(lon, lat) {
                    worst = worst.max((h as f32 - d.get(x, y)).abs());
                }
            }
        }
        assert!(worst <= params.max_error_m, "worst error {}", worst);
    }

    #[test]
    fn selected_points_are_grid_subset() {
        let d = flat_dem(30, 100.0);
        let map = VectorMap::new();
        let (mask, _) = select_points(&d, &map, &SelectParams::default());
        for (x, y) in mask_to_points(&mask) {
            assert!(d.grid.in_bounds(x, y));
            assert_ne!(d.get(x, y), NO_DATA);
        }
    }
}
