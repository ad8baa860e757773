//! Beach chain and ring extraction.
//!
//! Coastline edges are mesh edges with water on exactly one side. They
//! chain into open polylines (the coast runs off the tile) and closed
//! rings (islands, lakes). Each chain carries per-vertex geometry plus a
//! beach-type code resolved against the beach rule table.

use std::collections::HashMap;

use crate::cdt::{FaceId, Mesh, VertId, NO_FACE};
use crate::rules::{RuleTable, NO_TERRAIN};

#[derive(Clone, Debug)]
pub struct BeachVertex {
    pub lon: f64,
    pub lat: f64,
    pub height: f64,
    /// Landward surface normal. Built from the land faces only, so the
    /// coastline crease does not tilt it toward the water surface.
    pub normal: [f32; 3],
    pub wave_height: f32,
}

#[derive(Clone, Debug)]
pub struct BeachChain {
    pub vertices: Vec<BeachVertex>,
    pub closed: bool,
    /// Beach type code from the rule table.
    pub kind: u16,
    pub length_m: f64,
}

/// Directed coastline edge: walking a -> b keeps land on the left.
#[derive(Clone, Copy, Debug)]
struct CoastEdge {
    a: VertId,
    b: VertId,
    land_face: FaceId,
}

/// Extract every beach chain and ring in the mesh. Chains whose shape
/// matches no beach rule are dropped.
pub fn extract_beaches(mesh: &Mesh, rules: &RuleTable) -> Vec<BeachChain> {
    let edges = coast_edges(mesh, rules);
    if edges.is_empty() {
        return Vec::new();
    }

    let mut by_start: HashMap<VertId, Vec<usize>> = HashMap::new();
    for (i, e) in edges.iter().enumerate() {
        by_start.entry(e.a).or_default().push(i);
    }

    // succ[i] = the edge continuing from edges[i].b, found by rotating
    // around that vertex through the adjacent water wedge.
    let mut succ: Vec<Option<usize>> = vec![None; edges.len()];
    let mut has_pred = vec![false; edges.len()];
    for (i, e) in edges.iter().enumerate() {
        if let Some(cands) = by_start.get(&e.b) {
            let next = wedge_successor(mesh, e, cands, &edges);
            if let Some(j) = next {
                succ[i] = Some(j);
                has_pred[j] = true;
            }
        }
    }

    let mut used = vec![false; edges.len()];
    let mut chains = Vec::new();

    // Open chains start at predecessor-less edges.
    for start in 0..edges.len() {
        if has_pred[start] || used[start] {
            continue;
        }
        let walk = walk_chain(start, &succ, &mut used);
        chains.push((walk, false));
    }
    // Whatever is left sits on closed rings; walk each circularly.
    for start in 0..edges.len() {
        if used[start] {
            continue;
        }
        let walk = walk_chain(start, &succ, &mut used);
        chains.push((walk, true));
    }

    let mut out = Vec::new();
    for (walk, closed) in chains {
        if let Some(chain) = finish_chain(mesh, rules, &edges, &walk, closed) {
            out.push(chain);
        }
    }
    log::info!(
        "beaches: {} coastline edges, {} chains kept",
        edges.len(),
        out.len()
    );
    out
}

fn coast_edges(mesh: &Mesh, rules: &RuleTable) -> Vec<CoastEdge> {
    let water = rules.water;
    let mut out = Vec::new();
    for f in mesh.face_ids() {
        if mesh.face(f).terrain == water {
            continue;
        }
        for i in 0..3 {
            let g = mesh.face(f).n[i];
            if g == NO_FACE || mesh.face(g).terrain != water {
                continue;
            }
            let (a, b) = mesh.edge_verts(f, i);
            out.push(CoastEdge { a, b, land_face: f });
        }
    }
    out
}

/// The edge continuing from `e.b`: starting at the twin of the incoming
/// edge, rotate around `e.b` face by face through the water wedge and
/// take the boundary edge where land reappears. Staying inside the wedge
/// keeps the walk from jumping to another water body where several meet
/// at one vertex.
fn wedge_successor(
    mesh: &Mesh,
    e: &CoastEdge,
    candidates: &[usize],
    edges: &[CoastEdge],
) -> Option<usize> {
    let i = (0..3).find(|&i| mesh.edge_verts(e.land_face, i) == (e.a, e.b))?;
    let (mut cur, _) = mesh.edge_twin(e.land_face, i)?;
    for _ in 0..mesh.faces.len() {
        let k = mesh.index_of_vertex(cur, e.b)?;
        // The next edge out of b in rotation order runs to the face's
        // third vertex.
        let w = mesh.face(cur).v[(k + 2) % 3];
        let Some((g, _)) = mesh.edge_twin(cur, (k + 1) % 3) else {
            return None; // the wedge runs off the hull
        };
        if let Some(&j) = candidates
            .iter()
            .find(|&&j| edges[j].b == w && edges[j].land_face == g)
        {
            return Some(j);
        }
        cur = g;
    }
    None
}

fn walk_chain(start: usize, succ: &[Option<usize>], used: &mut [bool]) -> Vec<usize> {
    let mut walk = vec![start];
    used[start] = true;
    let mut cur = start;
    while let Some(next) = succ[cur] {
        if used[next] {
            break;
        }
        used[next] = true;
        walk.push(next);
        cur = next;
    }
    walk
}

fn finish_chain(
    mesh: &Mesh,
    rules: &RuleTable,
    edges: &[CoastEdge],
    walk: &[usize],
    closed: bool,
) -> Option<BeachChain> {
    // Vertex sequence: starts of every edge, plus the final endpoint on
    // open chains.
    let mut verts: Vec<VertId> = walk.iter().map(|&i| edges[i].a).collect();
    if !closed {
        verts.push(edges[*walk.last()?].b);
    }

    let mut length_m = 0.0;
    for w in walk {
        length_m += edge_len_m(mesh, &edges[*w]);
    }
    let wave = wave_height(length_m);

    // Worst landward slope along the chain gates the rule lookup.
    let mut slope = 0.0f32;
    let mut backing = NO_TERRAIN;
    for &i in walk {
        let f = edges[i].land_face;
        slope = slope.max(1.0 - mesh.face(f).normal[2]);
        if backing == NO_TERRAIN {
            backing = mesh.face(f).terrain;
        }
    }
    let rule = rules.find_beach(slope, length_m as f32, wave, backing)?;

    let vertices = verts
        .iter()
        .enumerate()
        .map(|(k, &v)| {
            let vv = mesh.vertex(v);
            BeachVertex {
                lon: vv.lon,
                lat: vv.lat,
                height: vv.height,
                normal: landward_normal(mesh, edges, walk, k, closed),
                wave_height: wave,
            }
        })
        .collect();

    Some(BeachChain {
        vertices,
        closed,
        kind: rule.kind,
        length_m,
    })
}

fn edge_len_m(mesh: &Mesh, e: &CoastEdge) -> f64 {
    let (ax, ay) = mesh.to_meters(e.a);
    let (bx, by) = mesh.to_meters(e.b);
    ((bx - ax).powi(2) + (by - ay).powi(2)).sqrt()
}

/// Fetch approximation: longer uninterrupted shoreline faces bigger open
/// water. Clamped to the 12-30 m band the renderer expects.
fn wave_height(length_m: f64) -> f32 {
    (length_m as f32 / 500.0).clamp(12.0, 30.0)
}

/// Normal at chain vertex `k`: the normalized sum of the land faces of
/// the adjoining chain edges. Restricting to the landward side keeps the
/// coast crease from dragging the normal flat.
fn landward_normal(
    mesh: &Mesh,
    edges: &[CoastEdge],
    walk: &[usize],
    k: usize,
    closed: bool,
) -> [f32; 3] {
    let n = walk.len();
    let mut sum = [0.0f32; 3];
    let mut add = |f: FaceId| {
        let fnorm = mesh.face(f).normal;
        for i in 0..3 {
            sum[i] += fnorm[i];
        }
    };
    if closed {
        add(edges[walk[(k + n - 1) % n]].land_face);
        add(edges[walk[k % n]].land_face);
    } else {
        if k > 0 {
            add(edges[walk[k - 1]].land_face);
        }
        if k < n {
            add(edges[walk[k]].land_face);
        }
    }
    let len = (sum[0] * sum[0] + sum[1] * sum[1] + sum[2] * sum[2]).sqrt();
    if len <= f32::EPSILON {
        [0.0, 0.0, 1.0]
    } else {
        [sum[0] / len, sum[1] / len, sum[2] / len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Band, BeachRule};

    fn beach_rules() -> RuleTable {
        let mut t = RuleTable::new();
        t.intern("grass");
        t.beach_rules.push(BeachRule {
            slope: Band::any(),
            min_length_m: 0.0,
            wave_height: Band::any(),
            terrains: Vec::new(),
            kind: 7,
        });
        t
    }

    /// Rectangle split by the diagonal plus a center vertex: paint half
    /// the faces water to get a coast crossing the tile.
    fn split_mesh(rules: &RuleTable) -> Mesh {
        let grass = rules.lookup("grass").unwrap();
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [10.0; 4]);
        mesh.insert(0.5, 0.5, 10.0).unwrap();
        mesh.compute_normals();
        // Water south of the diagonal, land north of it.
        for f in mesh.face_ids().collect::<Vec<_>>() {
            let (cx, cy) = mesh.face_centroid(f);
            mesh.face_mut(f).terrain = if cy < cx { rules.water } else { grass };
        }
        mesh
    }

    /// Island: interior water ring fully surrounding a single land face
    /// is hard to build by hand, so invert it: land lake inside water.
    fn lake_mesh(rules: &RuleTable) -> Mesh {
        let grass = rules.lookup("grass").unwrap();
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [10.0; 4]);
        for &(x, y) in &[(0.4, 0.4), (0.6, 0.4), (0.6, 0.6), (0.4, 0.6), (0.5, 0.5)] {
            mesh.insert(x, y, 10.0).unwrap();
        }
        mesh.compute_normals();
        for f in mesh.face_ids().collect::<Vec<_>>() {
            let (cx, cy) = mesh.face_centroid(f);
            let inside = (0.4..0.6).contains(&cx) && (0.4..0.6).contains(&cy);
            mesh.face_mut(f).terrain = if inside { rules.water } else { grass };
        }
        mesh
    }

    #[test]
    fn open_coast_is_one_open_chain() {
        let rules = beach_rules();
        let mesh = split_mesh(&rules);
        let chains = extract_beaches(&mesh, &rules);
        assert_eq!(chains.len(), 1);
        let c = &chains[0];
        assert!(!c.closed);
        assert_eq!(c.kind, 7);
        // An open chain of k edges has k + 1 vertices.
        assert!(c.vertices.len() >= 2);
    }

    #[test]
    fn closed_ring_vertex_count_equals_edge_count() {
        let rules = beach_rules();
        let mesh = lake_mesh(&rules);
        let chains = extract_beaches(&mesh, &rules);
        let rings: Vec<_> = chains.iter().filter(|c| c.closed).collect();
        assert_eq!(rings.len(), 1);
        let ring = rings[0];
        // Count the coastline edges directly and compare.
        let edges = super::coast_edges(&mesh, &rules);
        assert_eq!(ring.vertices.len(), edges.len());
    }

    #[test]
    fn open_chain_starts_at_predecessor_less_edge() {
        let rules = beach_rules();
        let mesh = split_mesh(&rules);
        let chains = extract_beaches(&mesh, &rules);
        let c = &chains[0];
        let first = &c.vertices[0];
        // No coastline edge ends where the chain starts.
        let edges = super::coast_edges(&mesh, &rules);
        for e in &edges {
            let vb = mesh.vertex(e.b);
            assert!(
                !(vb.lon == first.lon && vb.lat == first.lat),
                "chain start has a predecessor"
            );
        }
    }

    /// Water north and south of the center vertex, land east and west:
    /// two water wedges pinch together at the center.
    fn pinch_mesh(rules: &RuleTable) -> Mesh {
        let grass = rules.lookup("grass").unwrap();
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [10.0; 4]);
        mesh.insert(0.5, 0.5, 10.0).unwrap();
        mesh.compute_normals();
        for f in mesh.face_ids().collect::<Vec<_>>() {
            let (cx, cy) = mesh.face_centroid(f);
            let water = (cy - 0.5).abs() > (cx - 0.5).abs();
            mesh.face_mut(f).terrain = if water { rules.water } else { grass };
        }
        mesh
    }

    #[test]
    fn chains_stay_on_one_side_of_a_pinch() {
        let rules = beach_rules();
        let mesh = pinch_mesh(&rules);
        let chains = extract_beaches(&mesh, &rules);
        assert_eq!(chains.len(), 2);
        for c in &chains {
            assert!(!c.closed);
            assert_eq!(c.vertices.len(), 3);
            // Each chain hugs a single wedge, so it enters and leaves on
            // the same tile edge instead of crossing the pinch.
            let first = &c.vertices[0];
            let last = &c.vertices[c.vertices.len() - 1];
            assert_eq!(first.lat, last.lat);
        }
    }

    #[test]
    fn normals_point_up_on_flat_terrain() {
        let rules = beach_rules();
        let mesh = split_mesh(&rules);
        let chains = extract_beaches(&mesh, &rules);
        for v in &chains[0].vertices {
            assert!(v.normal[2] > 0.99);
        }
    }

    #[test]
    fn no_matching_rule_drops_the_chain() {
        let mut rules = beach_rules();
        rules.beach_rules[0].min_length_m = 1e9;
        let mesh = split_mesh(&rules);
        assert!(extract_beaches(&mesh, &rules).is_empty());
    }
}
