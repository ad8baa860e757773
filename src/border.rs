//! Cross-tile border matching.
//!
//! A finished tile writes descriptors for its north and east edges. The
//! tile to the north/east, if processed later, loads them as authoritative
//! for its own south/west edges: vertex positions, heights and blend
//! weights are forced to the stored values, and edge terrain is copied
//! onto the local edge triangles with a priority-respecting rebase. Only
//! one side of any shared edge ever has a file, so the stitch converges
//! regardless of processing order.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::cdt::{FaceId, Location, Mesh, VertId, NO_FACE};
use crate::classify::{rebase_face, spread_border_from};
use crate::error::{Result, TileError};
use crate::rules::{RuleTable, TerrainId, NO_TERRAIN};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileSide {
    North,
    East,
    South,
    West,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BorderVertex {
    pub lon: f64,
    pub lat: f64,
    pub height: f64,
    /// True at a tile corner.
    pub corner: bool,
    /// (terrain name, weight) pairs, sorted by name.
    pub blends: Vec<(String, f32)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BorderEdge {
    pub base: String,
    pub borders: Vec<String>,
}

/// One tile edge: n vertices and n-1 edge records between them, ordered
/// west-to-east (horizontal edges) or south-to-north (vertical edges).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EdgeDescriptor {
    pub vertices: Vec<BorderVertex>,
    pub edges: Vec<BorderEdge>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TileBorder {
    pub north: EdgeDescriptor,
    pub east: EdgeDescriptor,
}

/// Descriptor file path for the tile with this (south, west) corner.
pub fn border_path(dir: &Path, south: i32, west: i32) -> PathBuf {
    dir.join(format!("{:+03}{:+04}.border", south, west))
}

// ===== EXTRACTION =====

/// Collect the mesh boundary along one tile side, ordered, with blends
/// and per-edge terrain.
pub fn extract_edge(mesh: &Mesh, rules: &RuleTable, side: TileSide) -> EdgeDescriptor {
    let on_side = |lon: f64, lat: f64| -> bool {
        match side {
            TileSide::North => (lat - mesh.north).abs() < 1e-9,
            TileSide::South => (lat - mesh.south).abs() < 1e-9,
            TileSide::East => (lon - mesh.east).abs() < 1e-9,
            TileSide::West => (lon - mesh.west).abs() < 1e-9,
        }
    };
    let mut ids: Vec<VertId> = mesh
        .vert_ids()
        .filter(|&v| {
            let vv = mesh.vertex(v);
            on_side(vv.lon, vv.lat)
        })
        .collect();
    ids.sort_by(|&a, &b| {
        let va = mesh.vertex(a);
        let vb = mesh.vertex(b);
        match side {
            TileSide::North | TileSide::South => va.lon.total_cmp(&vb.lon),
            TileSide::East | TileSide::West => va.lat.total_cmp(&vb.lat),
        }
    });

    let vertices: Vec<BorderVertex> = ids
        .iter()
        .map(|&v| {
            let vv = mesh.vertex(v);
            let corner = (vv.lon == mesh.west || vv.lon == mesh.east)
                && (vv.lat == mesh.south || vv.lat == mesh.north);
            let mut blends: Vec<(String, f32)> = vv
                .border_blend
                .iter()
                .filter(|&(_, &w)| w > 0.0)
                .map(|(&t, &w)| (rules.name(t).to_string(), w))
                .collect();
            blends.sort_by(|a, b| a.0.cmp(&b.0));
            BorderVertex {
                lon: vv.lon,
                lat: vv.lat,
                height: vv.height,
                corner,
                blends,
            }
        })
        .collect();

    let mut edges = Vec::new();
    for w in ids.windows(2) {
        let face = hull_face_between(mesh, w[0], w[1]);
        match face {
            Some(f) => {
                let mf = mesh.face(f);
                edges.push(BorderEdge {
                    base: rules.name(mf.terrain).to_string(),
                    borders: mf
                        .border_terrains
                        .iter()
                        .map(|&t| rules.name(t).to_string())
                        .collect(),
                });
            }
            None => edges.push(BorderEdge {
                base: rules.name(NO_TERRAIN).to_string(),
                borders: Vec::new(),
            }),
        }
    }
    EdgeDescriptor { vertices, edges }
}

/// The face incident to the hull edge a-b, if they are mesh-adjacent.
/// A hull edge has exactly one incident face; for an interior edge the
/// first one found stands in.
fn hull_face_between(mesh: &Mesh, a: VertId, b: VertId) -> Option<FaceId> {
    let (f, i) = mesh.find_edge(a, b)?;
    if mesh.face(f).n[i] == NO_FACE {
        Some(f)
    } else {
        mesh.edge_twin(f, i).map(|(g, _)| g)
    }
}

// ===== FILE FORMAT =====

/// Write both descriptors for a finished tile.
pub fn write_border(path: &Path, border: &TileBorder) -> Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    for (name, edge) in [("north", &border.north), ("east", &border.east)] {
        writeln!(out, "EDGE {}", name)?;
        for (i, v) in edge.vertices.iter().enumerate() {
            let tag = if v.corner { "VC" } else { "VT" };
            writeln!(out, "{} {:.9} {:.9} {:.4}", tag, v.lon, v.lat, v.height)?;
            writeln!(out, "VBC {}", v.blends.len())?;
            for (t, w) in &v.blends {
                writeln!(out, "VB {:.6} {}", w, t)?;
            }
            if i < edge.edges.len() {
                let e = &edge.edges[i];
                writeln!(out, "TERRAIN {}", e.base)?;
                writeln!(out, "BORDER_C {}", e.borders.len())?;
                for b in &e.borders {
                    writeln!(out, "BORDER_T {}", b)?;
                }
            }
        }
        writeln!(out, "END")?;
    }
    log::info!(
        "wrote border descriptor {} ({} north, {} east vertices)",
        path.display(),
        border.north.vertices.len(),
        border.east.vertices.len()
    );
    Ok(())
}

/// Load a descriptor file; `None` when absent (matching is disabled for
/// that edge).
pub fn load_border(path: &Path) -> Result<Option<TileBorder>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let bad = |line: usize, reason: &str| TileError::BorderParse {
        file: path.display().to_string(),
        line,
        reason: reason.to_string(),
    };

    // Slot 0 holds the north edge, slot 1 the east edge.
    let mut slots = [EdgeDescriptor::default(), EdgeDescriptor::default()];
    let mut target: Option<usize> = None;

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let lineno = idx + 1;
        let line = line?;
        let mut tok = line.split_whitespace();
        let Some(cmd) = tok.next() else { continue };
        match cmd {
            "EDGE" => {
                let which = tok.next().ok_or_else(|| bad(lineno, "EDGE needs a side"))?;
                target = Some(match which {
                    "north" => 0,
                    "east" => 1,
                    _ => return Err(bad(lineno, "unknown side")),
                });
            }
            "VT" | "VC" => {
                let desc = target.ok_or_else(|| bad(lineno, "vertex before EDGE"))?;
                let lon: f64 = parse_tok(tok.next(), lineno, path)?;
                let lat: f64 = parse_tok(tok.next(), lineno, path)?;
                let height: f64 = parse_tok(tok.next(), lineno, path)?;
                slots[desc].vertices.push(BorderVertex {
                    lon,
                    lat,
                    height,
                    corner: cmd == "VC",
                    blends: Vec::new(),
                });
            }
            "VBC" => {}
            "VB" => {
                let desc = target.ok_or_else(|| bad(lineno, "VB before EDGE"))?;
                let w: f32 = parse_tok(tok.next(), lineno, path)?;
                let name = tok.next().ok_or_else(|| bad(lineno, "VB needs a name"))?;
                let v = slots[desc]
                    .vertices
                    .last_mut()
                    .ok_or_else(|| bad(lineno, "VB before any vertex"))?;
                v.blends.push((name.to_string(), w));
            }
            "TERRAIN" => {
                let desc = target.ok_or_else(|| bad(lineno, "TERRAIN before EDGE"))?;
                let base = tok.next().ok_or_else(|| bad(lineno, "TERRAIN needs a name"))?;
                slots[desc].edges.push(BorderEdge {
                    base: base.to_string(),
                    borders: Vec::new(),
                });
            }
            "BORDER_C" => {}
            "BORDER_T" => {
                let desc = target.ok_or_else(|| bad(lineno, "BORDER_T before EDGE"))?;
                let name = tok
                    .next()
                    .ok_or_else(|| bad(lineno, "BORDER_T needs a name"))?;
                let e = slots[desc]
                    .edges
                    .last_mut()
                    .ok_or_else(|| bad(lineno, "BORDER_T before TERRAIN"))?;
                e.borders.push(name.to_string());
            }
            "END" => {
                let desc = target
                    .take()
                    .ok_or_else(|| bad(lineno, "END before EDGE"))?;
                let d = &slots[desc];
                let empty = d.vertices.is_empty() && d.edges.is_empty();
                // n vertices carry n-1 edge records between them.
                if !empty && d.edges.len() + 1 != d.vertices.len() {
                    return Err(bad(lineno, "edge record count does not match vertex count"));
                }
            }
            _ => return Err(bad(lineno, "unknown record")),
        }
    }
    let [north, east] = slots;
    Ok(Some(TileBorder { north, east }))
}

fn parse_tok<T: std::str::FromStr>(tok: Option<&str>, line: usize, path: &Path) -> Result<T> {
    tok.and_then(|s| s.parse().ok()).ok_or_else(|| {
        TileError::BorderParse {
            file: path.display().to_string(),
            line,
            reason: "bad numeric field".to_string(),
        }
    })
}

// ===== APPLICATION (SLAVE SIDE) =====

/// The stored positions a slave edge must contain. The pipeline inserts
/// these instead of its own interval posts for matched edges.
pub fn master_points(desc: &EdgeDescriptor) -> Vec<(f64, f64, f64)> {
    desc.vertices
        .iter()
        .map(|v| (v.lon, v.lat, v.height))
        .collect()
}

/// Force stored heights and blend weights onto the slave edge. Vertices
/// are matched nearest-fit; any still-missing master is force-inserted.
/// Local blends with no master record are zeroed: the file is
/// authoritative for the whole edge.
pub fn match_vertices(
    mesh: &mut Mesh,
    rules: &mut RuleTable,
    desc: &EdgeDescriptor,
    side: TileSide,
) -> Result<usize> {
    let mut forced = 0usize;
    for bv in &desc.vertices {
        let v = match mesh.locate(bv.lon, bv.lat) {
            Location::OnVertex(v) => v,
            _ => {
                forced += 1;
                mesh.insert(bv.lon, bv.lat, bv.height)?
            }
        };
        mesh.vertex_mut(v).height = bv.height;
        let mut blends = std::collections::HashMap::new();
        for (name, w) in &bv.blends {
            blends.insert(rules.intern(name), *w);
        }
        mesh.vertex_mut(v).border_blend = blends;
    }
    // Zero blends on unmatched local edge vertices.
    let on_side = |mesh: &Mesh, v: VertId| -> bool {
        let vv = mesh.vertex(v);
        match side {
            TileSide::West => (vv.lon - mesh.west).abs() < 1e-9,
            TileSide::South => (vv.lat - mesh.south).abs() < 1e-9,
            TileSide::East => (vv.lon - mesh.east).abs() < 1e-9,
            TileSide::North => (vv.lat - mesh.north).abs() < 1e-9,
        }
    };
    for v in mesh.vert_ids().collect::<Vec<_>>() {
        if !on_side(mesh, v) {
            continue;
        }
        let vv = mesh.vertex(v);
        let matched = desc
            .vertices
            .iter()
            .any(|bv| (bv.lon - vv.lon).abs() < 1e-9 && (bv.lat - vv.lat).abs() < 1e-9);
        if !matched {
            mesh.vertex_mut(v).border_blend.clear();
        }
    }
    Ok(forced)
}

/// Copy stored edge terrain onto the slave edge triangles, rebasing and
/// smearing where the import outranks the local base.
pub fn apply_edge_terrain(mesh: &mut Mesh, rules: &mut RuleTable, desc: &EdgeDescriptor) -> usize {
    let mut rebased = 0usize;
    for (rec, pair) in desc.edges.iter().zip(desc.vertices.windows(2)) {
        let (a, b) = (&pair[0], &pair[1]);
        let va = match mesh.locate(a.lon, a.lat) {
            Location::OnVertex(v) => v,
            _ => continue,
        };
        let vb = match mesh.locate(b.lon, b.lat) {
            Location::OnVertex(v) => v,
            _ => continue,
        };
        let Some(f) = hull_face_between(mesh, va, vb) else {
            continue;
        };
        let imported = rules.intern(&rec.base);
        let local = mesh.face(f).terrain;
        if local != imported && rules.is_lower_priority(local, imported) {
            smear_rebase(mesh, rules, f, imported);
            rebased += 1;
        }
        for bname in &rec.borders {
            let bt = rules.intern(bname);
            if bt != mesh.face(f).terrain && !mesh.face(f).border_terrains.contains(&bt) {
                mesh.face_mut(f).border_terrains.push(bt);
                mesh.face_mut(f).border_terrains.sort();
            }
        }
    }
    rebased
}

/// Rebase one face and let the change ripple: the new base spreads its
/// border into strictly-lower-priority neighbors. Each step strictly
/// lowers some face's priority rank, so the ripple terminates.
pub fn smear_rebase(mesh: &mut Mesh, rules: &RuleTable, f: FaceId, terrain: TerrainId) {
    rebase_face(mesh, rules, f, terrain);
    spread_border_from(mesh, rules, f);
}
