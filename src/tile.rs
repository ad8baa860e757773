//! Tile serialization: bucketed patches, beach polygons, manifest.
//!
//! Triangles are bucketed into a fine 8x8 grid (plus a 4x4 coarse
//! companion for far-view meshes when one is supplied) by centroid, then
//! emitted terrain-by-terrain, bucket-by-bucket as fan/triangle-list
//! primitives. Water patches carry a per-vertex wetness scalar from a
//! box-smoothed depth raster. The artifact is plain JSON with a manifest
//! identifying the producer and format revision.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::beaches::{extract_beaches, BeachChain};
use crate::cdt::{FaceId, Mesh, VertId};
use crate::error::Result;
use crate::fans::{build_primitives, FanParams, Primitive};
use crate::raster::{derive_smoothed, Dem, Layer, RasterBundle, NO_DATA};
use crate::rules::{RuleTable, NO_TERRAIN};

pub const FORMAT_REVISION: u32 = 3;
pub const FINE_BUCKETS: usize = 8;
pub const COARSE_BUCKETS: usize = 4;
const WETNESS_SMOOTH_PASSES: usize = 5;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TileParams {
    pub fans: FanParams,
    /// Also emit the coarse 4x4 bucketing for far-view use.
    pub coarse_companion: bool,
}

impl Default for TileParams {
    fn default() -> Self {
        Self {
            fans: FanParams::default(),
            coarse_companion: false,
        }
    }
}

// ===== ARTIFACT MODEL =====

#[derive(Clone, Debug, Serialize)]
pub struct Manifest {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
    pub creation_agent: String,
    pub format_revision: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct PatchVertex {
    pub lon: f64,
    pub lat: f64,
    pub height: f64,
    pub normal: [f32; 3],
    /// Blend weight for the patch terrain at this vertex; 1.0 on base
    /// patches, the spread weight on border patches.
    pub blend: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wetness: Option<f32>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", content = "indices")]
pub enum PatchPrimitive {
    Fan(Vec<u32>),
    List(Vec<u32>),
}

#[derive(Clone, Debug, Serialize)]
pub struct Patch {
    pub terrain: String,
    /// Texture variant index in 1..=4.
    pub variant: u8,
    /// Slope-draped texture projection.
    pub projected: bool,
    /// True when this patch overlays another terrain's base with blend
    /// weights rather than standing alone.
    pub overlay: bool,
    pub resolution: u32,
    pub bucket: (u32, u32),
    pub vertices: Vec<PatchVertex>,
    pub primitives: Vec<PatchPrimitive>,
}

#[derive(Clone, Debug, Serialize)]
pub struct BeachPolygon {
    pub kind: u16,
    pub closed: bool,
    pub wave_height: f32,
    /// (lon, lat, height, nx, ny, nz) per vertex.
    pub vertices: Vec<(f64, f64, f64, f32, f32, f32)>,
}

/// A point feature placed by an external collaborator.
#[derive(Clone, Debug, Serialize)]
pub struct Placement {
    pub lon: f64,
    pub lat: f64,
    pub definition: String,
    pub heading_deg: f32,
}

#[derive(Clone, Debug, Serialize)]
pub struct TileArtifact {
    pub manifest: Manifest,
    pub patches: Vec<Patch>,
    pub beaches: Vec<BeachPolygon>,
    pub placements: Vec<Placement>,
}

// ===== BUCKETING =====

/// Face ids grouped by (bucket, terrain, variant, overlay) in
/// deterministic order.
type BucketKey = (u32, u32, String, u8, bool);

fn bucket_of(mesh: &Mesh, f: FaceId, n: usize) -> (u32, u32) {
    let (cx, cy) = mesh.face_centroid(f);
    let fx = (cx - mesh.west) / (mesh.east - mesh.west);
    let fy = (cy - mesh.south) / (mesh.north - mesh.south);
    let bx = ((fx * n as f64) as i64).clamp(0, n as i64 - 1) as u32;
    let by = ((fy * n as f64) as i64).clamp(0, n as i64 - 1) as u32;
    (bx, by)
}

fn bucket_faces(
    mesh: &Mesh,
    rules: &RuleTable,
    n: usize,
) -> BTreeMap<BucketKey, Vec<FaceId>> {
    let mut out: BTreeMap<BucketKey, Vec<FaceId>> = BTreeMap::new();
    for f in mesh.face_ids() {
        let face = mesh.face(f);
        if face.terrain == NO_TERRAIN {
            continue;
        }
        let (bx, by) = bucket_of(mesh, f, n);
        out.entry((bx, by, rules.name(face.terrain).to_string(), face.variant, false))
            .or_default()
            .push(f);
        // Border terrains overlay the same geometry with blend weights;
        // overlays always use the first variant.
        for &bt in &face.border_terrains {
            out.entry((bx, by, rules.name(bt).to_string(), 1, true))
                .or_default()
                .push(f);
        }
    }
    out
}

/// The terrain names touching each bucket, borders included.
pub fn bucket_terrain_sets(
    mesh: &Mesh,
    rules: &RuleTable,
    n: usize,
) -> BTreeMap<(u32, u32), BTreeSet<String>> {
    let mut out: BTreeMap<(u32, u32), BTreeSet<String>> = BTreeMap::new();
    for ((bx, by, name, _, _), _) in bucket_faces(mesh, rules, n) {
        out.entry((bx, by)).or_default().insert(name);
    }
    out
}

// ===== PATCH EMISSION =====

fn remap_primitive(p: &Primitive, index_of: &HashMap<VertId, u32>) -> PatchPrimitive {
    let remap = |ids: &[VertId]| ids.iter().map(|v| index_of[v]).collect();
    match p {
        Primitive::Fan(v) => PatchPrimitive::Fan(remap(v)),
        Primitive::List(v) => PatchPrimitive::List(remap(v)),
    }
}

fn emit_patches(
    mesh: &Mesh,
    rules: &RuleTable,
    wetness: Option<&Dem>,
    params: &TileParams,
    resolution: usize,
) -> Vec<Patch> {
    let water_name = rules.name(rules.water).to_string();
    let mut out = Vec::new();
    for ((bx, by, terrain, variant, overlay), faces) in bucket_faces(mesh, rules, resolution) {
        let prims = build_primitives(mesh, &faces, &params.fans);

        // Local vertex table in first-use order.
        let mut index_of: HashMap<VertId, u32> = HashMap::new();
        let mut order: Vec<VertId> = Vec::new();
        let mut note = |v: VertId| {
            if !index_of.contains_key(&v) {
                index_of.insert(v, order.len() as u32);
                order.push(v);
            }
        };
        for p in &prims {
            match p {
                Primitive::Fan(v) | Primitive::List(v) => {
                    for &id in v {
                        note(id);
                    }
                }
            }
        }

        let tid = rules.lookup(&terrain);
        let is_water = terrain == water_name;
        let vertices = order
            .iter()
            .map(|&v| {
                let vv = mesh.vertex(v);
                let blend = if overlay {
                    tid.and_then(|t| vv.border_blend.get(&t).copied())
                        .unwrap_or(0.0)
                } else {
                    1.0
                };
                let wet = if is_water {
                    wetness.map(|w| {
                        let s = w.sample_linear(vv.lon, vv.lat);
                        if s == NO_DATA {
                            0.0
                        } else {
                            s
                        }
                    })
                } else {
                    None
                };
                PatchVertex {
                    lon: vv.lon,
                    lat: vv.lat,
                    height: vv.height,
                    normal: vv.normal,
                    blend,
                    wetness: wet,
                }
            })
            .collect();

        out.push(Patch {
            terrain,
            variant,
            projected: tid.map_or(false, |t| rules.is_projected(t)),
            overlay,
            resolution: resolution as u32,
            bucket: (bx, by),
            vertices,
            primitives: prims.iter().map(|p| remap_primitive(p, &index_of)).collect(),
        });
    }
    out
}

// ===== ASSEMBLY =====

fn manifest_for(mesh: &Mesh) -> Manifest {
    Manifest {
        west: mesh.west,
        south: mesh.south,
        east: mesh.east,
        north: mesh.north,
        creation_agent: format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            chrono::Utc::now().format("%Y-%m-%d")
        ),
        format_revision: FORMAT_REVISION,
    }
}

fn beach_polygon(chain: &BeachChain) -> BeachPolygon {
    BeachPolygon {
        kind: chain.kind,
        closed: chain.closed,
        wave_height: chain.vertices.first().map_or(0.0, |v| v.wave_height),
        vertices: chain
            .vertices
            .iter()
            .map(|v| {
                (
                    v.lon,
                    v.lat,
                    v.height,
                    v.normal[0],
                    v.normal[1],
                    v.normal[2],
                )
            })
            .collect(),
    }
}

/// Build the complete tile artifact. Placements outside the tile box are
/// logged and skipped.
pub fn build_artifact(
    mesh: &Mesh,
    rules: &RuleTable,
    rasters: &RasterBundle,
    placements: &[Placement],
    params: &TileParams,
) -> TileArtifact {
    let wetness = rasters
        .get(Layer::Bathymetry)
        .map(|d| derive_smoothed(d, WETNESS_SMOOTH_PASSES));

    let mut patches = emit_patches(mesh, rules, wetness.as_ref(), params, FINE_BUCKETS);
    if params.coarse_companion {
        patches.extend(emit_patches(
            mesh,
            rules,
            wetness.as_ref(),
            params,
            COARSE_BUCKETS,
        ));
    }

    let beaches = extract_beaches(mesh, rules)
        .iter()
        .map(beach_polygon)
        .collect();

    let mut kept = Vec::new();
    for p in placements {
        let inside = p.lon >= mesh.west
            && p.lon <= mesh.east
            && p.lat >= mesh.south
            && p.lat <= mesh.north;
        if inside {
            kept.push(p.clone());
        } else {
            log::warn!(
                "placement {} at ({:.6}, {:.6}) is outside the tile, skipped",
                p.definition,
                p.lon,
                p.lat
            );
        }
    }

    TileArtifact {
        manifest: manifest_for(mesh),
        patches,
        beaches,
        placements: kept,
    }
}

pub fn write_artifact(path: &Path, artifact: &TileArtifact) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), artifact)?;
    log::info!(
        "wrote tile {} ({} patches, {} beaches, {} placements)",
        path.display(),
        artifact.patches.len(),
        artifact.beaches.len(),
        artifact.placements.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::TerrainRule;

    fn grass_rules() -> RuleTable {
        let mut t = RuleTable::new();
        let grass = t.intern("grass");
        t.push_rule(TerrainRule {
            terrain: grass,
            ..TerrainRule::default()
        });
        t
    }

    fn classified_mesh(rules: &RuleTable) -> Mesh {
        let grass = rules.lookup("grass").unwrap();
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [50.0; 4]);
        for &(x, y) in &[(0.25, 0.3), (0.7, 0.6), (0.4, 0.8)] {
            mesh.insert(x, y, 50.0).unwrap();
        }
        mesh.compute_normals();
        for f in mesh.face_ids().collect::<Vec<_>>() {
            mesh.face_mut(f).terrain = grass;
        }
        mesh
    }

    #[test]
    fn every_triangle_lands_in_one_patch() {
        let rules = grass_rules();
        let mesh = classified_mesh(&rules);
        let patches = emit_patches(&mesh, &rules, None, &TileParams::default(), FINE_BUCKETS);
        let total: usize = patches
            .iter()
            .flat_map(|p| p.primitives.iter())
            .map(|p| match p {
                PatchPrimitive::Fan(v) => v.len().saturating_sub(2),
                PatchPrimitive::List(v) => v.len() / 3,
            })
            .sum();
        assert_eq!(total, mesh.face_ids().count());
    }

    #[test]
    fn patch_indices_stay_in_range() {
        let rules = grass_rules();
        let mesh = classified_mesh(&rules);
        let patches = emit_patches(&mesh, &rules, None, &TileParams::default(), FINE_BUCKETS);
        for patch in &patches {
            for prim in &patch.primitives {
                let ids = match prim {
                    PatchPrimitive::Fan(v) | PatchPrimitive::List(v) => v,
                };
                for &i in ids {
                    assert!((i as usize) < patch.vertices.len());
                }
            }
        }
    }

    #[test]
    fn border_terrains_become_overlay_patches() {
        let mut rules = grass_rules();
        let rock = rules.intern("rock");
        let mesh = {
            let mut mesh = classified_mesh(&rules);
            let f = mesh.face_ids().next().unwrap();
            mesh.face_mut(f).border_terrains.push(rock);
            for i in 0..3 {
                let v = mesh.face(f).v[i];
                mesh.vertex_mut(v).border_blend.insert(rock, 0.5);
            }
            mesh
        };
        let patches = emit_patches(&mesh, &rules, None, &TileParams::default(), FINE_BUCKETS);
        let overlay: Vec<_> = patches.iter().filter(|p| p.overlay).collect();
        assert_eq!(overlay.len(), 1);
        assert_eq!(overlay[0].terrain, "rock");
        for v in &overlay[0].vertices {
            assert_eq!(v.blend, 0.5);
        }
    }

    #[test]
    fn variants_split_patches() {
        let rules = grass_rules();
        let mut mesh = classified_mesh(&rules);
        for f in mesh.face_ids().collect::<Vec<_>>() {
            mesh.face_mut(f).variant = 2;
        }
        let odd = mesh.face_ids().next().unwrap();
        mesh.face_mut(odd).variant = 1;
        let patches = emit_patches(&mesh, &rules, None, &TileParams::default(), FINE_BUCKETS);
        assert!(patches.iter().any(|p| p.variant == 1));
        assert!(patches.iter().any(|p| p.variant == 2));
        let total: usize = patches
            .iter()
            .flat_map(|p| p.primitives.iter())
            .map(|p| match p {
                PatchPrimitive::Fan(v) => v.len().saturating_sub(2),
                PatchPrimitive::List(v) => v.len() / 3,
            })
            .sum();
        assert_eq!(total, mesh.face_ids().count());
    }

    #[test]
    fn projected_terrains_are_flagged() {
        let mut rules = RuleTable::new();
        let scree = rules.intern("scree");
        rules.push_rule(TerrainRule {
            terrain: scree,
            projected: true,
            ..TerrainRule::default()
        });
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [50.0; 4]);
        mesh.compute_normals();
        for f in mesh.face_ids().collect::<Vec<_>>() {
            mesh.face_mut(f).terrain = scree;
        }
        let patches = emit_patches(&mesh, &rules, None, &TileParams::default(), FINE_BUCKETS);
        assert!(!patches.is_empty());
        for p in &patches {
            assert!(p.projected);
        }
    }

    #[test]
    fn water_patches_carry_wetness() {
        let rules = grass_rules();
        let water = rules.water;
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [0.0; 4]);
        mesh.compute_normals();
        for f in mesh.face_ids().collect::<Vec<_>>() {
            mesh.face_mut(f).terrain = water;
        }
        let mut depth = Dem::new(10, 10, 0.0, 0.0, 1.0, 1.0);
        for y in 0..10 {
            for x in 0..10 {
                depth.set(x, y, 2.0);
            }
        }
        let smoothed = derive_smoothed(&depth, WETNESS_SMOOTH_PASSES);
        let patches = emit_patches(
            &mesh,
            &rules,
            Some(&smoothed),
            &TileParams::default(),
            FINE_BUCKETS,
        );
        assert!(!patches.is_empty());
        for p in &patches {
            for v in &p.vertices {
                let w = v.wetness.unwrap();
                assert!((w - 2.0).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn out_of_bounds_placements_are_skipped() {
        let rules = grass_rules();
        let mesh = classified_mesh(&rules);
        let rasters = RasterBundle::new();
        let placements = vec![
            Placement {
                lon: 0.5,
                lat: 0.5,
                definition: "barn".into(),
                heading_deg: 0.0,
            },
            Placement {
                lon: 2.5,
                lat: 0.5,
                definition: "lost".into(),
                heading_deg: 0.0,
            },
        ];
        let artifact = build_artifact(&mesh, &rules, &rasters, &placements, &TileParams::default());
        assert_eq!(artifact.placements.len(), 1);
        assert_eq!(artifact.placements[0].definition, "barn");
    }

    #[test]
    fn manifest_names_the_producer() {
        let rules = grass_rules();
        let mesh = classified_mesh(&rules);
        let m = manifest_for(&mesh);
        assert!(m.creation_agent.contains(env!("CARGO_PKG_NAME")));
        assert_eq!(m.format_revision, FORMAT_REVISION);
        assert_eq!(m.east, 1.0);
    }

    #[test]
    fn coarse_companion_doubles_the_resolutions() {
        let rules = grass_rules();
        let mesh = classified_mesh(&rules);
        let rasters = RasterBundle::new();
        let params = TileParams {
            coarse_companion: true,
            ..TileParams::default()
        };
        let artifact = build_artifact(&mesh, &rules, &rasters, &[], &params);
        let fine = artifact
            .patches
            .iter()
            .any(|p| p.resolution == FINE_BUCKETS as u32);
        let coarse = artifact
            .patches
            .iter()
            .any(|p| p.resolution == COARSE_BUCKETS as u32);
        assert!(fine && coarse);
    }
}
