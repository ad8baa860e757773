//! Triangle-fan assembly for tile patches.
//!
//! Renderer-facing patches carry two primitive kinds: fans around a hub
//! vertex and plain triangle lists. The builder greedily converts a group
//! of faces (one terrain within one bucket) into the fewest primitives:
//! pick the hub vertex whose contiguous run of unconsumed triangles is
//! longest, peel that run off as a fan, repeat, and sweep the stragglers
//! into capped lists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cdt::{FaceId, Mesh, VertId};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FanParams {
    /// Runs shorter than this stay in the triangle list.
    pub min_fan_tris: usize,
    /// Hard cap on indices per triangle list.
    pub max_list_indices: usize,
}

impl Default for FanParams {
    fn default() -> Self {
        Self {
            min_fan_tris: 3,
            max_list_indices: 255,
        }
    }
}

/// One render primitive over mesh vertices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Primitive {
    /// Hub first, then the rim in winding order. k triangles need k + 2
    /// entries.
    Fan(Vec<VertId>),
    /// Flat triangle list, three entries per triangle.
    List(Vec<VertId>),
}

impl Primitive {
    pub fn triangle_count(&self) -> usize {
        match self {
            Primitive::Fan(v) => v.len().saturating_sub(2),
            Primitive::List(v) => v.len() / 3,
        }
    }
}

/// Convert one face group into primitives. Every face lands in exactly
/// one primitive.
pub fn build_primitives(mesh: &Mesh, group: &[FaceId], params: &FanParams) -> Vec<Primitive> {
    let mut consumed: HashMap<FaceId, bool> = group.iter().map(|&f| (f, false)).collect();
    let mut by_vertex: HashMap<VertId, Vec<FaceId>> = HashMap::new();
    for &f in group {
        for &v in &mesh.face(f).v {
            by_vertex.entry(v).or_default().push(f);
        }
    }

    let mut out = Vec::new();
    loop {
        // Hub whose contiguous run of unconsumed triangles is longest.
        // Counting alone is not enough: a high-degree hub can be
        // fragmented while a lesser one still carries a fannable run.
        let mut hub: Option<VertId> = None;
        let mut run: Vec<FaceId> = Vec::new();
        let mut candidates: Vec<VertId> = by_vertex.keys().copied().collect();
        candidates.sort();
        for v in candidates {
            let live = by_vertex[&v].iter().filter(|&&f| !consumed[&f]).count();
            if live < params.min_fan_tris || live <= run.len() {
                continue;
            }
            let r = longest_run(mesh, v, &by_vertex[&v], &consumed);
            if r.len() > run.len() {
                hub = Some(v);
                run = r;
            }
        }
        let Some(hub) = hub else { break };
        if run.len() < params.min_fan_tris {
            break;
        }

        let mut fan = Vec::with_capacity(run.len() + 2);
        fan.push(hub);
        for (i, &f) in run.iter().enumerate() {
            let (a, b) = rim_edge(mesh, f, hub);
            if i == 0 {
                fan.push(a);
            }
            fan.push(b);
            consumed.insert(f, true);
        }
        out.push(Primitive::Fan(fan));
    }

    // Remaining faces go into capped triangle lists, in group order so
    // output is deterministic.
    let mut list: Vec<VertId> = Vec::new();
    for &f in group {
        if consumed[&f] {
            continue;
        }
        if list.len() + 3 > params.max_list_indices {
            out.push(Primitive::List(std::mem::take(&mut list)));
        }
        list.extend_from_slice(&mesh.face(f).v);
    }
    if !list.is_empty() {
        out.push(Primitive::List(list));
    }
    out
}

/// Rim edge of `f` opposite the hub, in the face's winding order.
fn rim_edge(mesh: &Mesh, f: FaceId, hub: VertId) -> (VertId, VertId) {
    let v = &mesh.face(f).v;
    let i = v.iter().position(|&x| x == hub).unwrap_or(0);
    (v[(i + 1) % 3], v[(i + 2) % 3])
}

/// Longest chain of unconsumed triangles around `hub` linked by shared
/// rim vertices.
fn longest_run(
    mesh: &Mesh,
    hub: VertId,
    incident: &[FaceId],
    consumed: &HashMap<FaceId, bool>,
) -> Vec<FaceId> {
    let live: Vec<FaceId> = incident.iter().copied().filter(|f| !consumed[f]).collect();
    // rim start vertex -> face
    let mut by_start: HashMap<VertId, FaceId> = HashMap::new();
    let mut has_pred: HashMap<FaceId, bool> = HashMap::new();
    for &f in &live {
        let (a, _) = rim_edge(mesh, f, hub);
        by_start.insert(a, f);
        has_pred.entry(f).or_insert(false);
    }
    for &f in &live {
        let (_, b) = rim_edge(mesh, f, hub);
        if let Some(&g) = by_start.get(&b) {
            if g != f {
                has_pred.insert(g, true);
            }
        }
    }

    let mut best: Vec<FaceId> = Vec::new();
    let starts: Vec<FaceId> = {
        let mut open: Vec<FaceId> = live
            .iter()
            .copied()
            .filter(|f| !has_pred[f])
            .collect();
        if open.is_empty() && !live.is_empty() {
            // Full circle around an interior hub; any start works.
            open.push(live[0]);
        }
        open
    };
    for start in starts {
        let mut run = vec![start];
        let mut cur = start;
        loop {
            let (_, b) = rim_edge(mesh, cur, hub);
            match by_start.get(&b) {
                Some(&next) if next != start && !run.contains(&next) => {
                    run.push(next);
                    cur = next;
                }
                _ => break,
            }
        }
        if run.len() > best.len() {
            best = run;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdt::Location;

    fn hub_mesh() -> (Mesh, Vec<FaceId>) {
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [0.0; 4]);
        mesh.insert(0.5, 0.5, 0.0).unwrap();
        let group: Vec<FaceId> = mesh.face_ids().collect();
        (mesh, group)
    }

    #[test]
    fn hub_faces_become_one_fan() {
        let (mesh, group) = hub_mesh();
        let prims = build_primitives(&mesh, &group, &FanParams::default());
        assert_eq!(prims.len(), 1);
        match &prims[0] {
            Primitive::Fan(v) => {
                assert_eq!(v.len(), group.len() + 2);
                let hub = match mesh.locate(0.5, 0.5) {
                    Location::OnVertex(v) => v,
                    _ => panic!("hub lost"),
                };
                assert_eq!(v[0], hub);
            }
            _ => panic!("expected a fan"),
        }
    }

    #[test]
    fn every_face_appears_exactly_once() {
        let (mesh, group) = hub_mesh();
        let prims = build_primitives(&mesh, &group, &FanParams::default());
        let total: usize = prims.iter().map(|p| p.triangle_count()).sum();
        assert_eq!(total, group.len());
    }

    #[test]
    fn short_runs_stay_in_lists() {
        let (mesh, group) = hub_mesh();
        let params = FanParams {
            min_fan_tris: 16,
            ..FanParams::default()
        };
        let prims = build_primitives(&mesh, &group, &params);
        for p in &prims {
            assert!(matches!(p, Primitive::List(_)));
        }
        let total: usize = prims.iter().map(|p| p.triangle_count()).sum();
        assert_eq!(total, group.len());
    }

    #[test]
    fn lists_respect_the_index_cap() {
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [0.0; 4]);
        for y in 1..12 {
            for x in 1..12 {
                mesh.insert(x as f64 / 12.0, y as f64 / 12.0, 0.0).unwrap();
            }
        }
        let group: Vec<FaceId> = mesh.face_ids().collect();
        let params = FanParams {
            min_fan_tris: usize::MAX,
            max_list_indices: 30,
        };
        let prims = build_primitives(&mesh, &group, &params);
        for p in &prims {
            match p {
                Primitive::List(v) => assert!(v.len() <= 30),
                _ => panic!("fans disabled"),
            }
        }
        let total: usize = prims.iter().map(|p| p.triangle_count()).sum();
        assert_eq!(total, group.len());
    }

    #[test]
    fn fan_rim_is_edge_contiguous() {
        let (mesh, group) = hub_mesh();
        let prims = build_primitives(&mesh, &group, &FanParams::default());
        let Primitive::Fan(v) = &prims[0] else {
            panic!()
        };
        // Consecutive rim vertices must be joined by actual mesh edges.
        for w in v[1..].windows(2) {
            assert!(
                mesh.find_edge(w[0], w[1]).is_some(),
                "rim {:?}-{:?} is not a mesh edge",
                w[0],
                w[1]
            );
        }
    }
}
