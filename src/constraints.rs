//! Water-body constraint building: vector-map transitions become the
//! constrained edges of the mesh.
//!
//! Each run of contiguous, collinear edges with the same land/water
//! transition collapses into one logical polyline, subdivided against
//! length and error bounds, with elevations pulled from the water surface
//! on wet transitions. The builder is deterministic: an unchanged map and
//! raster yield bit-identical segment lists.

use serde::{Deserialize, Serialize};

use crate::cdt::Mesh;
use crate::error::Result;
use crate::raster::{Dem, Grid, DEG_TO_MTR_LAT, NO_DATA};
use crate::rules::TerrainId;
use crate::vector_map::{HalfEdgeId, VectorMap};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintParams {
    /// Constraint edges longer than this are always subdivided, meters.
    pub max_edge_m: f64,
    /// Never subdivide below this length, meters.
    pub min_edge_m: f64,
    /// Subdivide while the raster deviates from the chord by more than
    /// this, meters.
    pub max_error_m: f32,
    /// Selected raster posts within this many posts of a constraint vertex
    /// are dropped to avoid near-coincident insertions.
    pub snap_posts: i32,
}

impl Default for ConstraintParams {
    fn default() -> Self {
        Self {
            max_edge_m: 500.0,
            min_edge_m: 50.0,
            max_error_m: 5.0,
            snap_posts: 1,
        }
    }
}

/// One logical transition polyline with per-vertex elevations and the
/// terrain/water situation on each side.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstraintSegment {
    /// (lon, lat, height) per vertex.
    pub pts: Vec<(f64, f64, f64)>,
    pub left_water: bool,
    pub right_water: bool,
    pub left_terrain: Option<TerrainId>,
    pub right_terrain: Option<TerrainId>,
}

impl ConstraintSegment {
    pub fn is_wet(&self) -> bool {
        self.left_water || self.right_water
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConstraintStats {
    pub segments: usize,
    pub vertices: usize,
    pub snapped_posts: usize,
}

/// Build every constraint polyline for the tile.
pub fn build_constraints(
    map: &VectorMap,
    elev: &Dem,
    water_surface: &Dem,
    params: &ConstraintParams,
) -> Vec<ConstraintSegment> {
    let mut visited = vec![false; map.half_edges.len()];
    let mut out = Vec::new();

    for he in map.undirected_edges() {
        if visited[he.0 as usize] || !map.is_transition_edge(he) {
            continue;
        }
        let chain = extend_chain(map, he, &mut visited);
        let (left_water, right_water, left_terrain, right_terrain) = sides(map, he);

        let mut pts: Vec<(f64, f64)> = Vec::new();
        for (idx, &e) in chain.iter().enumerate() {
            let (s, t) = map.edge_points(e);
            if idx == 0 {
                pts.push(s);
            }
            pts.push(t);
        }

        let pts = subdivide(&pts, elev, params);
        let wet = left_water || right_water;
        let with_heights = pts
            .into_iter()
            .map(|(lon, lat)| {
                let h = if wet {
                    let ws = water_surface.sample_linear(lon, lat);
                    if ws == NO_DATA {
                        elev.sample_linear(lon, lat)
                    } else {
                        ws
                    }
                } else {
                    elev.sample_linear(lon, lat)
                };
                (lon, lat, h as f64)
            })
            .collect();

        out.push(ConstraintSegment {
            pts: with_heights,
            left_water,
            right_water,
            left_terrain,
            right_terrain,
        });
    }
    out
}

fn sides(
    map: &VectorMap,
    he: HalfEdgeId,
) -> (bool, bool, Option<TerrainId>, Option<TerrainId>) {
    let fa = map.face(map.half_edge(he).face);
    let fb = map.face(map.half_edge(map.twin(he)).face);
    (fa.water, fb.water, fa.terrain, fb.terrain)
}

/// Extend `start` forward through contiguous collinear edges carrying the
/// same transition.
fn extend_chain(map: &VectorMap, start: HalfEdgeId, visited: &mut [bool]) -> Vec<HalfEdgeId> {
    let mut chain = vec![start];
    visited[start.0 as usize] = true;
    visited[map.twin(start).0 as usize] = true;

    let same_sides = |a: HalfEdgeId, b: HalfEdgeId| sides(map, a) == sides(map, b);

    loop {
        let cur = *chain.last().unwrap();
        let next = map.half_edge(cur).next;
        if next.0 as usize >= map.half_edges.len() || visited[next.0 as usize] {
            break;
        }
        if !map.is_transition_edge(next) || !same_sides(cur, next) {
            break;
        }
        let ((ax, ay), (bx, by)) = map.edge_points(cur);
        let (_, (cx, cy)) = map.edge_points(next);
        let cross = (bx - ax) * (cy - ay) - (by - ay) * (cx - ax);
        if cross.abs() > 1e-12 {
            break; // direction changes: a new logical edge starts
        }
        visited[next.0 as usize] = true;
        visited[map.twin(next).0 as usize] = true;
        chain.push(next);
    }
    chain
}

/// Insert intermediate points: unconditionally below the max length, then
/// recursively wherever the raster midpoint strays from the chord, never
/// below the min length.
fn subdivide(pts: &[(f64, f64)], elev: &Dem, params: &ConstraintParams) -> Vec<(f64, f64)> {
    let mut out = Vec::new();
    for w in pts.windows(2) {
        let (a, b) = (w[0], w[1]);
        out.push(a);
        subdivide_span(a, b, elev, params, 0, &mut out);
    }
    if let Some(&last) = pts.last() {
        out.push(last);
    }
    out
}

fn subdivide_span(
    a: (f64, f64),
    b: (f64, f64),
    elev: &Dem,
    params: &ConstraintParams,
    depth: usize,
    out: &mut Vec<(f64, f64)>,
) {
    if depth > 16 {
        return;
    }
    let len = dist_m(a, b);
    if len <= params.min_edge_m {
        return;
    }
    let mid = ((a.0 + b.0) * 0.5, (a.1 + b.1) * 0.5);
    let must = len > params.max_edge_m;
    let want = if must {
        true
    } else {
        let ea = elev.sample_linear(a.0, a.1);
        let eb = elev.sample_linear(b.0, b.1);
        let em = elev.sample_linear(mid.0, mid.1);
        ea != NO_DATA
            && eb != NO_DATA
            && em != NO_DATA
            && (em - 0.5 * (ea + eb)).abs() > params.max_error_m
    };
    if !want {
        return;
    }
    subdivide_span(a, mid, elev, params, depth + 1, out);
    out.push(mid);
    subdivide_span(mid, b, elev, params, depth + 1, out);
}

fn dist_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    let lat0 = 0.5 * (a.1 + b.1);
    let dx = (b.0 - a.0) * DEG_TO_MTR_LAT * lat0.to_radians().cos();
    let dy = (b.1 - a.1) * DEG_TO_MTR_LAT;
    (dx * dx + dy * dy).sqrt()
}

/// Clear selected raster posts near constraint vertices so triangulation
/// never sees near-coincident points.
pub fn snap_away_raster_points(
    segments: &[ConstraintSegment],
    elev: &Dem,
    mask: &mut Grid<u8>,
    params: &ConstraintParams,
) -> usize {
    let mut n = 0;
    let r = params.snap_posts;
    for seg in segments {
        for &(lon, lat, _) in &seg.pts {
            let cx = elev.lon_to_x(lon).round() as i32;
            let cy = elev.lat_to_y(lat).round() as i32;
            for dy in -r..=r {
                for dx in -r..=r {
                    let x = cx + dx;
                    let y = cy + dy;
                    if mask.in_bounds(x, y) && *mask.get(x as usize, y as usize) != 0 {
                        // Tile corners and edges are structural; keep them.
                        let on_edge = x == 0
                            || y == 0
                            || x == mask.width as i32 - 1
                            || y == mask.height as i32 - 1;
                        if !on_edge {
                            mask.set(x as usize, y as usize, 0);
                            n += 1;
                        }
                    }
                }
            }
        }
    }
    n
}

/// Insert every constraint polyline into the mesh.
pub fn apply_constraints(
    mesh: &mut Mesh,
    segments: &[ConstraintSegment],
) -> Result<ConstraintStats> {
    let mut stats = ConstraintStats::default();
    for seg in segments {
        let mut ids = Vec::with_capacity(seg.pts.len());
        for &(lon, lat, h) in &seg.pts {
            ids.push(mesh.insert(lon, lat, h)?);
            stats.vertices += 1;
        }
        for w in ids.windows(2) {
            if w[0] != w[1] {
                mesh.insert_constraint(w[0], w[1])?;
            }
        }
        stats.segments += 1;
    }
    log::info!(
        "constraints: {} segments, {} vertices",
        stats.segments,
        stats.vertices
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_map::VectorMap;

    fn lake_setup() -> (VectorMap, Dem, Dem) {
        let mut map = VectorMap::new();
        map.add_polygon_face(
            &[(0.2, 0.2), (0.8, 0.2), (0.8, 0.8), (0.2, 0.8)],
            true,
            None,
        );
        let mut elev = Dem::new(50, 50, 0.0, 0.0, 1.0, 1.0);
        let mut surface = Dem::new(50, 50, 0.0, 0.0, 1.0, 1.0);
        for y in 0..50i32 {
            for x in 0..50i32 {
                elev.set(x, y, 120.0);
                surface.set(x, y, 100.0);
            }
        }
        (map, elev, surface)
    }

    #[test]
    fn builder_is_idempotent() {
        let (map, elev, surface) = lake_setup();
        let params = ConstraintParams::default();
        let a = build_constraints(&map, &elev, &surface, &params);
        let b = build_constraints(&map, &elev, &surface, &params);
        assert_eq!(a, b);
    }

    #[test]
    fn wet_segments_take_water_surface_heights() {
        let (map, elev, surface) = lake_setup();
        let segs = build_constraints(&map, &elev, &surface, &ConstraintParams::default());
        assert!(!segs.is_empty());
        for seg in &segs {
            assert!(seg.is_wet());
            for &(_, _, h) in &seg.pts {
                assert_eq!(h, 100.0);
            }
        }
    }

    #[test]
    fn long_edges_are_subdivided() {
        let (map, elev, surface) = lake_setup();
        let segs = build_constraints(&map, &elev, &surface, &ConstraintParams::default());
        // Each lake side is ~66 km at the equator; 500 m max edge means
        // plenty of intermediate points.
        for seg in &segs {
            for w in seg.pts.windows(2) {
                let d = dist_m((w[0].0, w[0].1), (w[1].0, w[1].1));
                assert!(d <= 500.0 + 1.0, "edge of {} m survived", d);
            }
        }
    }

    #[test]
    fn snapping_clears_nearby_posts() {
        let (map, elev, surface) = lake_setup();
        let params = ConstraintParams::default();
        let segs = build_constraints(&map, &elev, &surface, &params);
        let mut mask: Grid<u8> = Grid::new_with(50, 50, 1);
        let n = snap_away_raster_points(&segs, &elev, &mut mask, &params);
        assert!(n > 0);
        // The lake corner (0.2, 0.2) maps to post (10, 10) roughly.
        assert_eq!(*mask.get(10, 10), 0);
    }

    #[test]
    fn constraints_survive_in_mesh() {
        let (map, elev, surface) = lake_setup();
        let params = ConstraintParams {
            // Keep the test mesh small.
            max_edge_m: 50_000.0,
            ..ConstraintParams::default()
        };
        let segs = build_constraints(&map, &elev, &surface, &params);
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [120.0; 4]);
        apply_constraints(&mut mesh, &segs).unwrap();
        // Every polyline edge must exist as a constrained mesh edge chain.
        let mut constrained = 0;
        for f in mesh.face_ids() {
            for i in 0..3 {
                if mesh.face(f).constrained[i] {
                    constrained += 1;
                }
            }
        }
        assert!(constrained > 0);
    }
}
