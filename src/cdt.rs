//! Constrained Delaunay triangulation over one tile.
//!
//! The mesh is the single mutable surface of the pipeline: vertices and
//! faces live in index arenas, neighbors are index lookups, and faces are
//! never deleted (splits add, flips rewire). The triangulation starts as
//! the two triangles of the tile rectangle, so every legal insertion lands
//! inside the convex hull; anything outside is a fatal upstream bug.
//!
//! Constrained edges are marked on both incident faces and are never
//! flipped; the empty-circumcircle property holds everywhere else.

use std::collections::HashMap;

use crate::error::{Result, TileError};
use crate::raster::DEG_TO_MTR_LAT;
use crate::rules::{TerrainId, NO_TERRAIN};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FaceId(pub u32);

pub const NO_FACE: FaceId = FaceId(u32::MAX);

/// Collinearity/degeneracy threshold for orientation tests, in squared
/// degrees. Tile coordinates are O(1) degrees.
const ORIENT_EPS: f64 = 1e-13;

#[derive(Clone, Debug)]
pub struct MeshVertex {
    pub lon: f64,
    pub lat: f64,
    pub height: f64,
    pub normal: [f32; 3],
    /// Per-terrain border blend weight, 0..1.
    pub border_blend: HashMap<TerrainId, f32>,
    /// One face this vertex belongs to.
    pub incident: FaceId,
}

#[derive(Clone, Debug)]
pub struct MeshFace {
    /// Corners, counter-clockwise.
    pub v: [VertId; 3],
    /// Neighbor across the edge opposite `v[i]`; `NO_FACE` on the hull.
    pub n: [FaceId; 3],
    /// Edge opposite `v[i]` is constrained.
    pub constrained: [bool; 3],
    pub terrain: TerrainId,
    /// Texture variant index in 1..=4, set when the face is classified.
    pub variant: u8,
    /// Border terrains blended over this face, kept sorted.
    pub border_terrains: Vec<TerrainId>,
    pub normal: [f32; 3],
    /// Traversal scratch for flood fills and spreads.
    pub mark: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Location {
    OnVertex(VertId),
    OnEdge(FaceId, usize),
    InFace(FaceId),
    Outside,
}

pub struct Mesh {
    pub vertices: Vec<MeshVertex>,
    pub faces: Vec<MeshFace>,
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
    hint: FaceId,
}

fn orient(ax: f64, ay: f64, bx: f64, by: f64, px: f64, py: f64) -> f64 {
    (bx - ax) * (py - ay) - (by - ay) * (px - ax)
}

fn in_circle(
    ax: f64,
    ay: f64,
    bx: f64,
    by: f64,
    cx: f64,
    cy: f64,
    px: f64,
    py: f64,
) -> bool {
    // Positive determinant = p strictly inside the circumcircle of CCW
    // (a, b, c).
    let adx = ax - px;
    let ady = ay - py;
    let bdx = bx - px;
    let bdy = by - py;
    let cdx = cx - px;
    let cdy = cy - py;
    let ad = adx * adx + ady * ady;
    let bd = bdx * bdx + bdy * bdy;
    let cd = cdx * cdx + cdy * cdy;
    let det = adx * (bdy * cd - bd * cdy) - ady * (bdx * cd - bd * cdx)
        + ad * (bdx * cdy - bdy * cdx);
    det > ORIENT_EPS
}

impl Mesh {
    /// Seed the mesh with the tile rectangle: corners SW, SE, NE, NW and
    /// the SW-NE diagonal.
    pub fn new(
        west: f64,
        south: f64,
        east: f64,
        north: f64,
        corner_heights: [f64; 4],
    ) -> Self {
        let mk = |lon: f64, lat: f64, h: f64| MeshVertex {
            lon,
            lat,
            height: h,
            normal: [0.0, 0.0, 1.0],
            border_blend: HashMap::new(),
            incident: FaceId(0),
        };
        let vertices = vec![
            mk(west, south, corner_heights[0]),
            mk(east, south, corner_heights[1]),
            mk(east, north, corner_heights[2]),
            mk(west, north, corner_heights[3]),
        ];
        let blank = |v: [u32; 3], n: [FaceId; 3]| MeshFace {
            v: [VertId(v[0]), VertId(v[1]), VertId(v[2])],
            n,
            constrained: [false; 3],
            terrain: NO_TERRAIN,
            variant: 1,
            border_terrains: Vec::new(),
            normal: [0.0, 0.0, 1.0],
            mark: 0,
        };
        let mut mesh = Self {
            vertices,
            // f0 = (SW, SE, NE), f1 = (SW, NE, NW); shared edge SW-NE.
            faces: vec![
                blank([0, 1, 2], [NO_FACE, FaceId(1), NO_FACE]),
                blank([0, 2, 3], [NO_FACE, NO_FACE, FaceId(0)]),
            ],
            west,
            south,
            east,
            north,
            hint: FaceId(0),
        };
        mesh.vertices[2].incident = FaceId(0);
        mesh.vertices[3].incident = FaceId(1);
        mesh
    }

    pub fn vertex(&self, id: VertId) -> &MeshVertex {
        &self.vertices[id.0 as usize]
    }

    pub fn vertex_mut(&mut self, id: VertId) -> &mut MeshVertex {
        &mut self.vertices[id.0 as usize]
    }

    pub fn face(&self, id: FaceId) -> &MeshFace {
        &self.faces[id.0 as usize]
    }

    pub fn face_mut(&mut self, id: FaceId) -> &mut MeshFace {
        &mut self.faces[id.0 as usize]
    }

    pub fn face_ids(&self) -> impl Iterator<Item = FaceId> {
        (0..self.faces.len() as u32).map(FaceId)
    }

    pub fn vert_ids(&self) -> impl Iterator<Item = VertId> {
        (0..self.vertices.len() as u32).map(VertId)
    }

    /// Endpoints of the edge opposite `v[i]`, in CCW order.
    pub fn edge_verts(&self, f: FaceId, i: usize) -> (VertId, VertId) {
        let face = self.face(f);
        (face.v[(i + 1) % 3], face.v[(i + 2) % 3])
    }

    /// The same edge seen from the neighboring face, if any.
    pub fn edge_twin(&self, f: FaceId, i: usize) -> Option<(FaceId, usize)> {
        let g = self.face(f).n[i];
        if g == NO_FACE {
            return None;
        }
        let j = self.index_of_neighbor(g, f);
        Some((g, j))
    }

    fn index_of_neighbor(&self, f: FaceId, g: FaceId) -> usize {
        let face = self.face(f);
        for i in 0..3 {
            if face.n[i] == g {
                return i;
            }
        }
        unreachable!("faces not adjacent");
    }

    pub fn index_of_vertex(&self, f: FaceId, v: VertId) -> Option<usize> {
        let face = self.face(f);
        (0..3).find(|&i| face.v[i] == v)
    }

    fn replace_neighbor(&mut self, f: FaceId, old: FaceId, new: FaceId) {
        if f == NO_FACE {
            return;
        }
        let face = self.face_mut(f);
        for i in 0..3 {
            if face.n[i] == old {
                face.n[i] = new;
                return;
            }
        }
        unreachable!("neighbor link missing");
    }

    /// All faces incident to a vertex. Handles hull vertices by walking
    /// both directions from the stored incident face.
    pub fn faces_around(&self, v: VertId) -> Vec<FaceId> {
        let mut out = Vec::new();
        let start = self.vertex(v).incident;
        // Rotate counter-clockwise.
        let mut cur = start;
        loop {
            out.push(cur);
            let k = self.index_of_vertex(cur, v).unwrap_or(0);
            let next = self.face(cur).n[(k + 1) % 3];
            if next == NO_FACE || next == start {
                break;
            }
            cur = next;
            if out.len() > self.faces.len() {
                break;
            }
        }
        // If the walk hit the hull, pick up the fan on the other side.
        let mut cur = start;
        loop {
            let k = self.index_of_vertex(cur, v).unwrap_or(0);
            let next = self.face(cur).n[(k + 2) % 3];
            if next == NO_FACE || out.contains(&next) {
                break;
            }
            out.push(next);
            cur = next;
            if out.len() > self.faces.len() {
                break;
            }
        }
        out
    }

    /// Locate a point by walking from the hint face.
    pub fn locate(&self, lon: f64, lat: f64) -> Location {
        let mut cur = self.hint;
        if cur.0 as usize >= self.faces.len() {
            cur = FaceId(0);
        }
        let mut steps = 0usize;
        let max_steps = 3 * self.faces.len() + 16;
        'walk: loop {
            steps += 1;
            if steps > max_steps {
                // Degenerate walk; fall back to scanning.
                return self.locate_by_scan(lon, lat);
            }
            let face = self.face(cur);
            let mut on_edge = None;
            for i in 0..3 {
                let (a, b) = self.edge_verts(cur, i);
                let va = self.vertex(a);
                let vb = self.vertex(b);
                let o = orient(va.lon, va.lat, vb.lon, vb.lat, lon, lat);
                if o < -ORIENT_EPS {
                    let next = face.n[i];
                    if next == NO_FACE {
                        return Location::Outside;
                    }
                    cur = next;
                    continue 'walk;
                }
                if o.abs() <= ORIENT_EPS {
                    on_edge = Some(i);
                }
            }
            // Inside or on boundary of this face.
            for i in 0..3 {
                let v = self.vertex(face.v[i]);
                if (v.lon - lon).abs() <= 1e-12 && (v.lat - lat).abs() <= 1e-12 {
                    return Location::OnVertex(face.v[i]);
                }
            }
            if let Some(i) = on_edge {
                return Location::OnEdge(cur, i);
            }
            return Location::InFace(cur);
        }
    }

    fn locate_by_scan(&self, lon: f64, lat: f64) -> Location {
        for f in self.face_ids() {
            let face = self.face(f);
            let mut inside = true;
            let mut on_edge = None;
            for i in 0..3 {
                let (a, b) = self.edge_verts(f, i);
                let va = self.vertex(a);
                let vb = self.vertex(b);
                let o = orient(va.lon, va.lat, vb.lon, vb.lat, lon, lat);
                if o < -ORIENT_EPS {
                    inside = false;
                    break;
                }
                if o.abs() <= ORIENT_EPS {
                    on_edge = Some(i);
                }
            }
            if inside {
                for i in 0..3 {
                    let v = self.vertex(face.v[i]);
                    if (v.lon - lon).abs() <= 1e-12 && (v.lat - lat).abs() <= 1e-12 {
                        return Location::OnVertex(face.v[i]);
                    }
                }
                if let Some(i) = on_edge {
                    return Location::OnEdge(f, i);
                }
                return Location::InFace(f);
            }
        }
        Location::Outside
    }

    /// Insert a point, restoring the Delaunay property around it.
    /// Re-inserting an existing vertex updates its height.
    pub fn insert(&mut self, lon: f64, lat: f64, height: f64) -> Result<VertId> {
        match self.locate(lon, lat) {
            Location::Outside => {
                log::error!(
                    "insert outside tile: ({}, {}) not in [{}, {}]x[{}, {}]",
                    lon,
                    lat,
                    self.west,
                    self.east,
                    self.south,
                    self.north
                );
                Err(TileError::OutOfBounds {
                    lon,
                    lat,
                    west: self.west,
                    south: self.south,
                    east: self.east,
                    north: self.north,
                })
            }
            Location::OnVertex(v) => {
                self.vertex_mut(v).height = height;
                Ok(v)
            }
            Location::InFace(f) => Ok(self.split_face(f, lon, lat, height)),
            Location::OnEdge(f, i) => Ok(self.split_edge(f, i, lon, lat, height)),
        }
    }

    fn new_vertex(&mut self, lon: f64, lat: f64, height: f64) -> VertId {
        self.vertices.push(MeshVertex {
            lon,
            lat,
            height,
            normal: [0.0, 0.0, 1.0],
            border_blend: HashMap::new(),
            incident: FaceId(0),
        });
        VertId(self.vertices.len() as u32 - 1)
    }

    fn clone_face_shell(&mut self, v: [VertId; 3]) -> FaceId {
        self.faces.push(MeshFace {
            v,
            n: [NO_FACE; 3],
            constrained: [false; 3],
            terrain: NO_TERRAIN,
            variant: 1,
            border_terrains: Vec::new(),
            normal: [0.0, 0.0, 1.0],
            mark: 0,
        });
        FaceId(self.faces.len() as u32 - 1)
    }

    /// 1-to-3 split of a face at an interior point.
    fn split_face(&mut self, f: FaceId, lon: f64, lat: f64, height: f64) -> VertId {
        let p = self.new_vertex(lon, lat, height);
        let old = self.face(f).clone();
        let [a, b, c] = old.v;
        let [na, nb, nc] = old.n;
        let [ca, cb, cc] = old.constrained;

        let f1 = self.clone_face_shell([b, c, p]);
        let f2 = self.clone_face_shell([c, a, p]);
        {
            let face = self.face_mut(f);
            face.v = [a, b, p];
            face.n = [f1, f2, nc];
            face.constrained = [false, false, cc];
        }
        {
            let face = self.face_mut(f1);
            face.n = [f2, f, na];
            face.constrained = [false, false, ca];
        }
        {
            let face = self.face_mut(f2);
            face.n = [f, f1, nb];
            face.constrained = [false, false, cb];
        }
        self.replace_neighbor(na, f, f1);
        self.replace_neighbor(nb, f, f2);

        self.vertex_mut(a).incident = f;
        self.vertex_mut(b).incident = f;
        self.vertex_mut(c).incident = f1;
        self.vertex_mut(p).incident = f;
        self.hint = f;

        self.legalize(f, 2, p);
        self.legalize(f1, 2, p);
        self.legalize(f2, 2, p);
        p
    }

    /// 2-to-4 split of the edge opposite `f.v[i]` at a point on it. Works
    /// on hull edges (no neighbor) as a 1-to-2 split.
    fn split_edge(&mut self, f: FaceId, i: usize, lon: f64, lat: f64, height: f64) -> VertId {
        let p = self.new_vertex(lon, lat, height);
        let old = self.face(f).clone();
        let a = old.v[i];
        let b = old.v[(i + 1) % 3];
        let c = old.v[(i + 2) % 3];
        let g = old.n[i];
        let cons = old.constrained[i];
        let n_b = old.n[(i + 1) % 3];
        let c_b = old.constrained[(i + 1) % 3];
        let n_c = old.n[(i + 2) % 3];
        let c_c = old.constrained[(i + 2) % 3];

        let f1 = self.clone_face_shell([a, p, c]);
        {
            let face = self.face_mut(f);
            face.v = [a, b, p];
            face.n = [NO_FACE, f1, n_c];
            face.constrained = [cons, false, c_c];
        }
        {
            let face = self.face_mut(f1);
            face.n = [NO_FACE, n_b, f];
            face.constrained = [cons, c_b, false];
        }
        self.replace_neighbor(n_b, f, f1);

        self.vertex_mut(a).incident = f;
        self.vertex_mut(b).incident = f;
        self.vertex_mut(c).incident = f1;
        self.vertex_mut(p).incident = f;

        if g != NO_FACE {
            let j = self.index_of_neighbor(g, f);
            let oldg = self.face(g).clone();
            let d = oldg.v[j];
            debug_assert_eq!(oldg.v[(j + 1) % 3], c);
            debug_assert_eq!(oldg.v[(j + 2) % 3], b);
            let m_c = oldg.n[(j + 1) % 3];
            let d_c = oldg.constrained[(j + 1) % 3];
            let m_b = oldg.n[(j + 2) % 3];
            let d_b = oldg.constrained[(j + 2) % 3];

            let g1 = self.clone_face_shell([d, p, b]);
            {
                let face = self.face_mut(g);
                face.v = [d, c, p];
                face.n = [f1, g1, m_b];
                face.constrained = [cons, false, d_b];
            }
            {
                let face = self.face_mut(g1);
                face.n = [f, m_c, g];
                face.constrained = [cons, d_c, false];
            }
            self.replace_neighbor(m_c, g, g1);
            self.face_mut(f).n[0] = g1;
            self.face_mut(f1).n[0] = g;
            self.vertex_mut(d).incident = g;

            self.hint = f;
            self.legalize(f, 2, p);
            self.legalize(f1, 1, p);
            self.legalize(g, 2, p);
            self.legalize(g1, 1, p);
        } else {
            self.hint = f;
            self.legalize(f, 2, p);
            self.legalize(f1, 1, p);
        }
        p
    }

    /// Restore the Delaunay property across the edge opposite `f.v[k]`,
    /// where `f.v[k] == p` is the freshly inserted vertex. Iterative to
    /// bound stack depth.
    fn legalize(&mut self, f: FaceId, k: usize, p: VertId) {
        let mut stack = vec![(f, k)];
        while let Some((f, k)) = stack.pop() {
            debug_assert_eq!(self.face(f).v[k], p);
            if self.face(f).constrained[k] {
                continue;
            }
            let g = self.face(f).n[k];
            if g == NO_FACE {
                continue;
            }
            let j = self.index_of_neighbor(g, f);
            let d = self.face(g).v[j];
            let [a, b, c] = self.face(f).v;
            let (va, vb, vc, vd) = (
                self.vertex(a),
                self.vertex(b),
                self.vertex(c),
                self.vertex(d),
            );
            if in_circle(
                va.lon, va.lat, vb.lon, vb.lat, vc.lon, vc.lat, vd.lon, vd.lat,
            ) {
                self.flip(f, k);
                // Post-flip layout: f.v[0] == p, g.v[2] == p.
                stack.push((f, 0));
                stack.push((g, 2));
            }
        }
    }

    /// Flip the edge opposite `f.v[i]`. Caller guarantees the edge is not
    /// constrained and has a neighbor.
    fn flip(&mut self, f: FaceId, i: usize) {
        let g = self.face(f).n[i];
        debug_assert!(g != NO_FACE);
        let j = self.index_of_neighbor(g, f);

        let oldf = self.face(f).clone();
        let oldg = self.face(g).clone();
        let p = oldf.v[i];
        let b = oldf.v[(i + 1) % 3];
        let c = oldf.v[(i + 2) % 3];
        let d = oldg.v[j];
        let fb = oldf.n[(i + 1) % 3]; // edge (c, p)
        let fbc = oldf.constrained[(i + 1) % 3];
        let fc = oldf.n[(i + 2) % 3]; // edge (p, b)
        let fcc = oldf.constrained[(i + 2) % 3];
        let gc = oldg.n[(j + 1) % 3]; // edge (b, d)
        let gcc = oldg.constrained[(j + 1) % 3];
        let gb = oldg.n[(j + 2) % 3]; // edge (d, c)
        let gbc = oldg.constrained[(j + 2) % 3];

        {
            let face = self.face_mut(f);
            face.v = [p, b, d];
            face.n = [gc, g, fc];
            face.constrained = [gcc, false, fcc];
        }
        {
            let face = self.face_mut(g);
            face.v = [d, c, p];
            face.n = [fb, f, gb];
            face.constrained = [fbc, false, gbc];
        }
        self.replace_neighbor(gc, g, f);
        self.replace_neighbor(fb, f, g);

        self.vertex_mut(p).incident = f;
        self.vertex_mut(b).incident = f;
        self.vertex_mut(c).incident = g;
        self.vertex_mut(d).incident = f;
    }

    /// Find the half-open edge (a, b) if it exists in the mesh; returns the
    /// face holding it and the opposite index.
    pub fn find_edge(&self, a: VertId, b: VertId) -> Option<(FaceId, usize)> {
        for f in self.faces_around(a) {
            let face = self.face(f);
            for i in 0..3 {
                let (ea, eb) = self.edge_verts(f, i);
                if (ea == a && eb == b) || (ea == b && eb == a) {
                    return Some((f, i));
                }
            }
        }
        None
    }

    fn mark_constrained(&mut self, f: FaceId, i: usize) {
        self.face_mut(f).constrained[i] = true;
        if let Some((g, j)) = self.edge_twin(f, i) {
            self.face_mut(g).constrained[j] = true;
        }
    }

    /// Force the edge a-b into the triangulation and mark it constrained.
    /// Crossing unconstrained edges are flipped out of the way; collinear
    /// intermediate vertices split the constraint. A crossing constrained
    /// edge means corrupt input and is fatal.
    pub fn insert_constraint(&mut self, a: VertId, b: VertId) -> Result<()> {
        let mut a = a;
        let mut guard = 0usize;
        while a != b {
            guard += 1;
            if guard > self.vertices.len() + 16 {
                let vb = self.vertex(b);
                return Err(TileError::LostConstraint {
                    lon: vb.lon,
                    lat: vb.lat,
                });
            }
            if let Some((f, i)) = self.find_edge(a, b) {
                self.mark_constrained(f, i);
                return Ok(());
            }
            // A vertex lying exactly on the segment splits it.
            if let Some(mid) = self.vertex_on_segment(a, b) {
                if let Some((f, i)) = self.find_edge(a, mid) {
                    self.mark_constrained(f, i);
                    a = mid;
                    continue;
                }
            }
            // Flip crossing edges until a-b becomes an edge.
            if !self.clear_crossings(a, b)? {
                let vb = self.vertex(b);
                log::error!(
                    "constraint to ({}, {}) could not be recovered",
                    vb.lon,
                    vb.lat
                );
                return Err(TileError::LostConstraint {
                    lon: vb.lon,
                    lat: vb.lat,
                });
            }
        }
        Ok(())
    }

    /// A neighbor of `a` lying exactly on segment a-b, nearest to `a`.
    fn vertex_on_segment(&self, a: VertId, b: VertId) -> Option<VertId> {
        let va = self.vertex(a);
        let vb = self.vertex(b);
        let mut best: Option<(f64, VertId)> = None;
        for f in self.faces_around(a) {
            for i in 0..3 {
                let w = self.face(f).v[i];
                if w == a || w == b {
                    continue;
                }
                let vw = self.vertex(w);
                let o = orient(va.lon, va.lat, vb.lon, vb.lat, vw.lon, vw.lat);
                if o.abs() > ORIENT_EPS {
                    continue;
                }
                let t = (vw.lon - va.lon) * (vb.lon - va.lon)
                    + (vw.lat - va.lat) * (vb.lat - va.lat);
                let len2 = (vb.lon - va.lon).powi(2) + (vb.lat - va.lat).powi(2);
                if t > 0.0 && t < len2 {
                    match best {
                        Some((bt, _)) if bt <= t => {}
                        _ => best = Some((t, w)),
                    }
                }
            }
        }
        best.map(|(_, v)| v)
    }

    /// Flip edges crossing segment a-b. Returns Ok(true) on progress.
    fn clear_crossings(&mut self, a: VertId, b: VertId) -> Result<bool> {
        let (ax, ay, bx, by) = {
            let va = self.vertex(a);
            let vb = self.vertex(b);
            (va.lon, va.lat, vb.lon, vb.lat)
        };
        let mut progressed = false;
        let mut guard = 0usize;
        loop {
            guard += 1;
            if guard > 4 * self.faces.len() + 64 {
                return Ok(progressed);
            }
            let Some((f, i)) = self.first_crossing(a, ax, ay, bx, by) else {
                return Ok(true);
            };
            if self.face(f).constrained[i] {
                return Err(TileError::LostConstraint { lon: bx, lat: by });
            }
            // Only flip when the surrounding quad is convex; otherwise
            // retry after other flips reshape the cavity.
            if self.quad_convex(f, i) {
                self.flip(f, i);
                progressed = true;
            } else if !progressed {
                // Try any other crossing first.
                let mut flipped = false;
                for (g, k) in self.all_crossings(ax, ay, bx, by) {
                    if !self.face(g).constrained[k] && self.quad_convex(g, k) {
                        self.flip(g, k);
                        progressed = true;
                        flipped = true;
                        break;
                    }
                }
                if !flipped {
                    return Ok(false);
                }
            }
            if self.find_edge(a, b).is_some() || self.vertex_on_segment(a, b).is_some() {
                return Ok(true);
            }
        }
    }

    fn segment_crosses(&self, f: FaceId, i: usize, ax: f64, ay: f64, bx: f64, by: f64) -> bool {
        let (u, w) = self.edge_verts(f, i);
        let vu = self.vertex(u);
        let vw = self.vertex(w);
        let o1 = orient(ax, ay, bx, by, vu.lon, vu.lat);
        let o2 = orient(ax, ay, bx, by, vw.lon, vw.lat);
        let o3 = orient(vu.lon, vu.lat, vw.lon, vw.lat, ax, ay);
        let o4 = orient(vu.lon, vu.lat, vw.lon, vw.lat, bx, by);
        o1 * o2 < -ORIENT_EPS * ORIENT_EPS && o3 * o4 < -ORIENT_EPS * ORIENT_EPS
    }

    fn first_crossing(
        &self,
        a: VertId,
        ax: f64,
        ay: f64,
        bx: f64,
        by: f64,
    ) -> Option<(FaceId, usize)> {
        // The first crossing is the edge opposite `a` in some face around
        // `a`.
        for f in self.faces_around(a) {
            if let Some(k) = self.index_of_vertex(f, a) {
                if self.segment_crosses(f, k, ax, ay, bx, by) {
                    return Some((f, k));
                }
            }
        }
        // Mid-segment crossings (after partial flips).
        self.all_crossings(ax, ay, bx, by).into_iter().next()
    }

    fn all_crossings(&self, ax: f64, ay: f64, bx: f64, by: f64) -> Vec<(FaceId, usize)> {
        let mut out = Vec::new();
        for f in self.face_ids() {
            for i in 0..3 {
                let (u, w) = self.edge_verts(f, i);
                if u < w && self.segment_crosses(f, i, ax, ay, bx, by) {
                    out.push((f, i));
                }
            }
        }
        out
    }

    fn quad_convex(&self, f: FaceId, i: usize) -> bool {
        let g = self.face(f).n[i];
        if g == NO_FACE {
            return false;
        }
        let j = self.index_of_neighbor(g, f);
        let p = self.face(f).v[i];
        let (b, c) = self.edge_verts(f, i);
        let d = self.face(g).v[j];
        let vp = self.vertex(p);
        let vb = self.vertex(b);
        let vc = self.vertex(c);
        let vd = self.vertex(d);
        // New edge p-d must lie strictly inside quad p-b-d-c.
        orient(vp.lon, vp.lat, vd.lon, vd.lat, vb.lon, vb.lat)
            * orient(vp.lon, vp.lat, vd.lon, vd.lat, vc.lon, vc.lat)
            < 0.0
    }

    // ===== GEOMETRY QUERIES =====

    /// Project a vertex to local meters around the tile center.
    pub fn to_meters(&self, v: VertId) -> (f64, f64) {
        let vv = self.vertex(v);
        let lat0 = 0.5 * (self.south + self.north);
        (
            (vv.lon - self.west) * DEG_TO_MTR_LAT * lat0.to_radians().cos(),
            (vv.lat - self.south) * DEG_TO_MTR_LAT,
        )
    }

    pub fn face_centroid(&self, f: FaceId) -> (f64, f64) {
        let face = self.face(f);
        let mut lon = 0.0;
        let mut lat = 0.0;
        for &v in &face.v {
            let vv = self.vertex(v);
            lon += vv.lon;
            lat += vv.lat;
        }
        (lon / 3.0, lat / 3.0)
    }

    /// Interpolated mesh height at a point, if it lies in the tile.
    pub fn height_at(&self, lon: f64, lat: f64) -> Option<f64> {
        match self.locate(lon, lat) {
            Location::Outside => None,
            Location::OnVertex(v) => Some(self.vertex(v).height),
            Location::OnEdge(f, _) | Location::InFace(f) => {
                let face = self.face(f);
                let [a, b, c] = face.v;
                let va = self.vertex(a);
                let vb = self.vertex(b);
                let vc = self.vertex(c);
                let area = orient(va.lon, va.lat, vb.lon, vb.lat, vc.lon, vc.lat);
                if area.abs() < ORIENT_EPS {
                    return Some(va.height);
                }
                let wa = orient(vb.lon, vb.lat, vc.lon, vc.lat, lon, lat) / area;
                let wb = orient(vc.lon, vc.lat, va.lon, va.lat, lon, lat) / area;
                let wc = 1.0 - wa - wb;
                Some(wa * va.height + wb * vb.height + wc * vc.height)
            }
        }
    }

    /// Squared distance in meters from a point to the nearest edge of a
    /// face.
    pub fn dist2_to_face_m(&self, f: FaceId, lon: f64, lat: f64) -> f64 {
        let lat0 = 0.5 * (self.south + self.north);
        let kx = DEG_TO_MTR_LAT * lat0.to_radians().cos();
        let ky = DEG_TO_MTR_LAT;
        let px = (lon - self.west) * kx;
        let py = (lat - self.south) * ky;
        let mut best = f64::MAX;
        for i in 0..3 {
            let (a, b) = self.edge_verts(f, i);
            let (ax, ay) = self.to_meters(a);
            let (bx, by) = self.to_meters(b);
            let dx = bx - ax;
            let dy = by - ay;
            let len2 = dx * dx + dy * dy;
            let t = if len2 > 0.0 {
                (((px - ax) * dx + (py - ay) * dy) / len2).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let qx = ax + t * dx;
            let qy = ay + t * dy;
            let d2 = (px - qx) * (px - qx) + (py - qy) * (py - qy);
            best = best.min(d2);
        }
        best
    }

    // ===== NORMALS =====

    /// Face and vertex normals in a local meters frame, z up. Degenerate
    /// or downward faces get (0, 0, 1).
    pub fn compute_normals(&mut self) {
        let lat0 = 0.5 * (self.south + self.north);
        let kx = DEG_TO_MTR_LAT * lat0.to_radians().cos();
        let ky = DEG_TO_MTR_LAT;
        for f in 0..self.faces.len() {
            let [a, b, c] = self.faces[f].v;
            let va = self.vertex(a);
            let vb = self.vertex(b);
            let vc = self.vertex(c);
            let ux = (vb.lon - va.lon) * kx;
            let uy = (vb.lat - va.lat) * ky;
            let uz = vb.height - va.height;
            let wx = (vc.lon - va.lon) * kx;
            let wy = (vc.lat - va.lat) * ky;
            let wz = vc.height - va.height;
            let nx = uy * wz - uz * wy;
            let ny = uz * wx - ux * wz;
            let nz = ux * wy - uy * wx;
            let len = (nx * nx + ny * ny + nz * nz).sqrt();
            self.faces[f].normal = if len < 1e-9 || nz <= 0.0 {
                [0.0, 0.0, 1.0]
            } else {
                [(nx / len) as f32, (ny / len) as f32, (nz / len) as f32]
            };
        }
        for v in 0..self.vertices.len() {
            let mut sum = [0.0f32; 3];
            for f in self.faces_around(VertId(v as u32)) {
                let n = self.face(f).normal;
                sum[0] += n[0];
                sum[1] += n[1];
                sum[2] += n[2];
            }
            let len = (sum[0] * sum[0] + sum[1] * sum[1] + sum[2] * sum[2]).sqrt();
            self.vertices[v].normal = if len < 1e-6 {
                [0.0, 0.0, 1.0]
            } else {
                [sum[0] / len, sum[1] / len, sum[2] / len]
            };
        }
    }

    /// Hull edges (twin-less), as (face, opposite index).
    pub fn boundary_edges(&self) -> Vec<(FaceId, usize)> {
        let mut out = Vec::new();
        for f in self.face_ids() {
            for i in 0..3 {
                if self.face(f).n[i] == NO_FACE {
                    out.push((f, i));
                }
            }
        }
        out
    }
}
