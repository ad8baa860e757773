//! Planar subdivision input: vertices, half-edges and faces in index
//! arenas.
//!
//! This is the read-only vector side of a tile (coastlines, rivers,
//! land-use polygons). Twin/next pointers are plain indices into the
//! arenas; faces own one boundary cycle each and carry the water flag the
//! constraint builder keys on.

use crate::rules::TerrainId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HalfEdgeId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FaceId(pub u32);

/// Index of the unbounded face; always present.
pub const OUTER_FACE: FaceId = FaceId(0);

#[derive(Clone, Debug)]
pub struct MapVertex {
    pub lon: f64,
    pub lat: f64,
}

#[derive(Clone, Debug)]
pub struct MapHalfEdge {
    pub origin: VertexId,
    pub twin: HalfEdgeId,
    pub next: HalfEdgeId,
    pub face: FaceId,
    /// River tag: this edge carries a vector river.
    pub river: bool,
    /// Road/rail tag, consulted read-only by placement collaborators.
    pub road: bool,
}

#[derive(Clone, Debug)]
pub struct MapFace {
    /// One half-edge on the outer cycle; `None` only for the unbounded face
    /// when the map is empty.
    pub boundary: Option<HalfEdgeId>,
    pub water: bool,
    /// Explicit terrain override from the land-use import, if any.
    pub terrain: Option<TerrainId>,
}

pub struct VectorMap {
    pub vertices: Vec<MapVertex>,
    pub half_edges: Vec<MapHalfEdge>,
    pub faces: Vec<MapFace>,
}

impl VectorMap {
    /// An empty map: just the unbounded dry face.
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            half_edges: Vec::new(),
            faces: vec![MapFace {
                boundary: None,
                water: false,
                terrain: None,
            }],
        }
    }

    pub fn vertex(&self, id: VertexId) -> &MapVertex {
        &self.vertices[id.0 as usize]
    }

    pub fn half_edge(&self, id: HalfEdgeId) -> &MapHalfEdge {
        &self.half_edges[id.0 as usize]
    }

    pub fn face(&self, id: FaceId) -> &MapFace {
        &self.faces[id.0 as usize]
    }

    pub fn twin(&self, id: HalfEdgeId) -> HalfEdgeId {
        self.half_edge(id).twin
    }

    /// Source and target coordinates of a half-edge.
    pub fn edge_points(&self, id: HalfEdgeId) -> ((f64, f64), (f64, f64)) {
        let he = self.half_edge(id);
        let s = self.vertex(he.origin);
        let t = self.vertex(self.half_edge(he.twin).origin);
        ((s.lon, s.lat), (t.lon, t.lat))
    }

    /// True when the faces on either side of this edge disagree on water.
    pub fn is_coast_edge(&self, id: HalfEdgeId) -> bool {
        let he = self.half_edge(id);
        let other = self.half_edge(he.twin);
        self.face(he.face).water != self.face(other.face).water
    }

    /// True when the faces disagree on terrain or water: the transitions
    /// the constraint builder turns into mesh constraints.
    pub fn is_transition_edge(&self, id: HalfEdgeId) -> bool {
        let he = self.half_edge(id);
        let other = self.half_edge(he.twin);
        let fa = self.face(he.face);
        let fb = self.face(other.face);
        fa.water != fb.water || fa.terrain != fb.terrain
    }

    /// Iterate one representative per undirected edge (the half-edge with
    /// the lower index).
    pub fn undirected_edges(&self) -> impl Iterator<Item = HalfEdgeId> + '_ {
        (0..self.half_edges.len() as u32)
            .map(HalfEdgeId)
            .filter(move |&id| id.0 < self.twin(id).0)
    }

    /// Walk a face's outer cycle.
    pub fn face_cycle(&self, face: FaceId) -> Vec<HalfEdgeId> {
        let mut out = Vec::new();
        let Some(start) = self.face(face).boundary else {
            return out;
        };
        let mut cur = start;
        loop {
            out.push(cur);
            cur = self.half_edge(cur).next;
            if cur == start || out.len() > self.half_edges.len() {
                break;
            }
        }
        out
    }

    /// Polygon ring of a face, in cycle order.
    pub fn face_ring(&self, face: FaceId) -> Vec<(f64, f64)> {
        self.face_cycle(face)
            .into_iter()
            .map(|he| {
                let v = self.vertex(self.half_edge(he).origin);
                (v.lon, v.lat)
            })
            .collect()
    }

    // ===== BUILDER =====
    //
    // Import utilities construct maps through these; the pipeline itself
    // never mutates one.

    pub fn add_vertex(&mut self, lon: f64, lat: f64) -> VertexId {
        self.vertices.push(MapVertex { lon, lat });
        VertexId(self.vertices.len() as u32 - 1)
    }

    /// Add a simple polygon face inside the unbounded face. Points must be
    /// counter-clockwise; the twins of the ring edges belong to the
    /// unbounded face.
    pub fn add_polygon_face(
        &mut self,
        pts: &[(f64, f64)],
        water: bool,
        terrain: Option<TerrainId>,
    ) -> FaceId {
        assert!(pts.len() >= 3);
        let face = FaceId(self.faces.len() as u32);
        let verts: Vec<VertexId> = pts.iter().map(|&(lon, lat)| self.add_vertex(lon, lat)).collect();
        let n = verts.len();
        let base = self.half_edges.len() as u32;
        // Inner half-edge i runs verts[i] -> verts[i+1]; its twin is the
        // outer half-edge at base + n + i.
        for i in 0..n {
            self.half_edges.push(MapHalfEdge {
                origin: verts[i],
                twin: HalfEdgeId(base + (n + i) as u32),
                next: HalfEdgeId(base + ((i + 1) % n) as u32),
                face,
                river: false,
                road: false,
            });
        }
        for i in 0..n {
            self.half_edges.push(MapHalfEdge {
                origin: verts[(i + 1) % n],
                twin: HalfEdgeId(base + i as u32),
                next: HalfEdgeId(base + (n + (i + n - 1) % n) as u32),
                face: OUTER_FACE,
                river: false,
                road: false,
            });
        }
        self.faces.push(MapFace {
            boundary: Some(HalfEdgeId(base)),
            water,
            terrain,
        });
        if self.faces[OUTER_FACE.0 as usize].boundary.is_none() {
            self.faces[OUTER_FACE.0 as usize].boundary = Some(HalfEdgeId(base + n as u32));
        }
        face
    }

    /// Add a free-standing river polyline. Each segment becomes a twin pair
    /// inside the face it crosses, tagged as river.
    pub fn add_river(&mut self, pts: &[(f64, f64)], face: FaceId) {
        for w in pts.windows(2) {
            let a = self.add_vertex(w[0].0, w[0].1);
            let b = self.add_vertex(w[1].0, w[1].1);
            let base = self.half_edges.len() as u32;
            self.half_edges.push(MapHalfEdge {
                origin: a,
                twin: HalfEdgeId(base + 1),
                next: HalfEdgeId(base + 1),
                face,
                river: true,
                road: false,
            });
            self.half_edges.push(MapHalfEdge {
                origin: b,
                twin: HalfEdgeId(base),
                next: HalfEdgeId(base),
                face,
                river: true,
                road: false,
            });
        }
    }
}

impl Default for VectorMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lake_map() -> (VectorMap, FaceId) {
        let mut m = VectorMap::new();
        let f = m.add_polygon_face(
            &[(0.2, 0.2), (0.8, 0.2), (0.8, 0.8), (0.2, 0.8)],
            true,
            None,
        );
        (m, f)
    }

    #[test]
    fn polygon_face_cycle_closes() {
        let (m, f) = lake_map();
        let cycle = m.face_cycle(f);
        assert_eq!(cycle.len(), 4);
        for &he in &cycle {
            assert_eq!(m.half_edge(he).face, f);
        }
    }

    #[test]
    fn twins_are_involutive() {
        let (m, _) = lake_map();
        for i in 0..m.half_edges.len() as u32 {
            let id = HalfEdgeId(i);
            assert_eq!(m.twin(m.twin(id)), id);
        }
    }

    #[test]
    fn coast_edges_detected() {
        let (m, f) = lake_map();
        for he in m.face_cycle(f) {
            assert!(m.is_coast_edge(he));
        }
    }

    #[test]
    fn undirected_iteration_halves_count() {
        let (m, _) = lake_map();
        assert_eq!(m.undirected_edges().count() * 2, m.half_edges.len());
    }
}
