//! Tile pipeline orchestration.
//!
//! One call runs the whole chain for a tile: derived raster layers,
//! drainage correction, point selection, constrained triangulation,
//! classification, border blending, cross-tile stitching and artifact
//! assembly. Stages communicate only through the raster bundle, the
//! vector map and the mesh; each logs its own counters.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::border::{
    apply_edge_terrain, border_path, extract_edge, load_border, master_points, match_vertices,
    write_border, TileBorder, TileSide,
};
use crate::cdt::Mesh;
use crate::classify::{
    assign_water_terrain, classify_mesh, flatten_water, promote_saturated, spread_all_borders,
    ClassifyParams, ClassifyStats,
};
use crate::constraints::{
    apply_constraints, build_constraints, snap_away_raster_points, ConstraintParams,
    ConstraintStats,
};
use crate::error::{Result, TileError};
use crate::hydro::{build_drainage, HydroParams, HydroStats};
use crate::raster::{
    derive_elevation_range, derive_relative_elevation, derive_slope, Layer, RasterBundle,
};
use crate::rules::RuleTable;
use crate::select::{
    densify_to_error, mask_to_points, select_points, split_beached_water, split_cliff_faces,
    SelectParams, SelectStats,
};
use crate::tile::{build_artifact, Placement, TileArtifact, TileParams};
use crate::vector_map::VectorMap;

/// Window radius, posts, for the relative-elevation and elevation-range
/// layers.
const TERRAIN_WINDOW_POSTS: i32 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Layers,
    Hydrology,
    Selection,
    Constraints,
    Triangulation,
    WaterAssignment,
    Classification,
    BorderMatching,
    Serialization,
}

pub const PHASE_COUNT: usize = 9;

impl Phase {
    pub fn index(self) -> usize {
        match self {
            Phase::Layers => 0,
            Phase::Hydrology => 1,
            Phase::Selection => 2,
            Phase::Constraints => 3,
            Phase::Triangulation => 4,
            Phase::WaterAssignment => 5,
            Phase::Classification => 6,
            Phase::BorderMatching => 7,
            Phase::Serialization => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Layers => "derived layers",
            Phase::Hydrology => "drainage correction",
            Phase::Selection => "point selection",
            Phase::Constraints => "constraint building",
            Phase::Triangulation => "triangulation",
            Phase::WaterAssignment => "water assignment",
            Phase::Classification => "classification",
            Phase::BorderMatching => "border matching",
            Phase::Serialization => "serialization",
        }
    }
}

/// Invoked synchronously at the start of every phase with the phase, the
/// total phase count, a display name and the completed fraction.
pub type ProgressFn<'a> = &'a mut dyn FnMut(Phase, usize, &str, f32);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    pub select: SelectParams,
    pub constraints: ConstraintParams,
    pub hydro: HydroParams,
    pub classify: ClassifyParams,
    pub tile: TileParams,
    /// Directory for cross-tile border descriptors; `None` disables
    /// stitching entirely.
    pub border_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineStats {
    pub select: SelectStats,
    pub constraints: ConstraintStats,
    pub hydro: HydroStats,
    pub classify: ClassifyStats,
    pub densified: usize,
    pub cliff_splits: usize,
    pub beached_splits: usize,
    pub border_forced: usize,
    pub border_rebased: usize,
}

pub struct TileOutput {
    pub artifact: TileArtifact,
    pub mesh: Mesh,
    pub stats: PipelineStats,
}

fn phase(progress: &mut Option<ProgressFn<'_>>, p: Phase) {
    log::info!("phase {}", p.name());
    if let Some(cb) = progress.as_mut() {
        cb(p, PHASE_COUNT, p.name(), p.index() as f32 / PHASE_COUNT as f32);
    }
}

/// Run the full pipeline for one tile.
///
/// The bundle must carry `Layer::Elevation` and `Layer::WaterSurface`;
/// both are mutated in place by drainage correction. The rule table is
/// mutable because border stitching may intern terrain names this tile
/// never produced itself.
pub fn generate_tile(
    rasters: &mut RasterBundle,
    map: &VectorMap,
    rules: &mut RuleTable,
    placements: &[Placement],
    params: &PipelineParams,
    mut progress: Option<ProgressFn<'_>>,
) -> Result<TileOutput> {
    let mut stats = PipelineStats::default();

    // ===== DERIVED LAYERS =====
    phase(&mut progress, Phase::Layers);
    {
        let elev = rasters
            .get(Layer::Elevation)
            .ok_or(TileError::MissingLayer(Layer::Elevation))?;
        let slope = derive_slope(elev);
        let rel = derive_relative_elevation(elev, TERRAIN_WINDOW_POSTS);
        let range = derive_elevation_range(elev, TERRAIN_WINDOW_POSTS);
        rasters.insert(Layer::Slope, slope);
        rasters.insert(Layer::RelativeElevation, rel);
        rasters.insert(Layer::ElevationRange, range);
    }

    // ===== DRAINAGE =====
    // Runs on the raster before meshing so carved channels and flattened
    // sink regions shape the selected points.
    phase(&mut progress, Phase::Hydrology);
    let mut elev = rasters
        .take(Layer::Elevation)
        .ok_or(TileError::MissingLayer(Layer::Elevation))?;
    let mut water_surface = rasters
        .take(Layer::WaterSurface)
        .ok_or(TileError::MissingLayer(Layer::WaterSurface))?;
    let (flow, hydro_stats) = build_drainage(&mut elev, &mut water_surface, map, &params.hydro);
    stats.hydro = hydro_stats;
    {
        let mut quantity = crate::raster::Dem::new(
            elev.width(),
            elev.height(),
            elev.west,
            elev.south,
            elev.east,
            elev.north,
        );
        for y in 0..elev.height() as i32 {
            for x in 0..elev.width() as i32 {
                quantity.set(x, y, *flow.flow.get(x as usize, y as usize));
            }
        }
        rasters.insert(Layer::FlowQuantity, quantity);
    }

    // ===== POINT SELECTION =====
    phase(&mut progress, Phase::Selection);
    let (mut mask, select_stats) = select_points(&elev, map, &params.select);
    stats.select = select_stats;

    // ===== CONSTRAINTS =====
    phase(&mut progress, Phase::Constraints);
    let segments = build_constraints(map, &elev, &water_surface, &params.constraints);
    stats.constraints.snapped_posts =
        snap_away_raster_points(&segments, &elev, &mut mask, &params.constraints);

    // Neighbor descriptors, if any, before the mesh exists: their vertex
    // positions replace nothing, they only add forced insertions.
    let south = elev.south.floor() as i32;
    let west = elev.west.floor() as i32;
    let west_desc = match &params.border_dir {
        Some(dir) => load_border(&border_path(dir, south, west - 1))?.map(|b| b.east),
        None => None,
    };
    let south_desc = match &params.border_dir {
        Some(dir) => load_border(&border_path(dir, south - 1, west))?.map(|b| b.north),
        None => None,
    };

    // ===== TRIANGULATION =====
    phase(&mut progress, Phase::Triangulation);
    let corner = |lon: f64, lat: f64| elev.sample_nearest(lon, lat) as f64;
    let mut mesh = Mesh::new(
        elev.west,
        elev.south,
        elev.east,
        elev.north,
        [
            corner(elev.west, elev.south),
            corner(elev.east, elev.south),
            corner(elev.east, elev.north),
            corner(elev.west, elev.north),
        ],
    );
    for (x, y) in mask_to_points(&mask) {
        let h = elev.get(x, y);
        mesh.insert(elev.x_to_lon(x as f64), elev.y_to_lat(y as f64), h as f64)?;
    }
    // Matched-border masters go in last so their stored heights win over
    // any raster post at the same position.
    for desc in [&west_desc, &south_desc].into_iter().flatten() {
        for (lon, lat, h) in master_points(desc) {
            mesh.insert(lon, lat, h)?;
            stats.border_forced += 1;
        }
    }
    let cstats = apply_constraints(&mut mesh, &segments)?;
    stats.constraints.segments = cstats.segments;
    stats.constraints.vertices = cstats.vertices;
    stats.densified = densify_to_error(&mut mesh, &elev, &params.select);

    // ===== WATER =====
    phase(&mut progress, Phase::WaterAssignment);
    stats.classify.water_faces = assign_water_terrain(&mut mesh, &segments, rules);
    stats.cliff_splits = split_cliff_faces(&mut mesh, &elev, &params.select);
    stats.beached_splits = split_beached_water(&mut mesh, rules.water);
    flatten_water(&mut mesh, rules.water, &params.classify);
    mesh.compute_normals();

    // ===== CLASSIFICATION =====
    phase(&mut progress, Phase::Classification);
    rasters.insert(Layer::Elevation, elev);
    rasters.insert(Layer::WaterSurface, water_surface);
    let cls = classify_mesh(&mut mesh, rasters, rules, &params.classify);
    stats.classify = ClassifyStats {
        water_faces: stats.classify.water_faces,
        ..cls
    };
    stats.classify.border_sources = spread_all_borders(&mut mesh, rules);
    stats.classify.promoted = promote_saturated(&mut mesh, rules);

    // ===== BORDER MATCHING =====
    phase(&mut progress, Phase::BorderMatching);
    if let Some(desc) = &west_desc {
        stats.border_forced += match_vertices(&mut mesh, rules, desc, TileSide::West)?;
        stats.border_rebased += apply_edge_terrain(&mut mesh, rules, desc);
    }
    if let Some(desc) = &south_desc {
        stats.border_forced += match_vertices(&mut mesh, rules, desc, TileSide::South)?;
        stats.border_rebased += apply_edge_terrain(&mut mesh, rules, desc);
    }
    if let Some(dir) = &params.border_dir {
        let border = TileBorder {
            north: extract_edge(&mesh, rules, TileSide::North),
            east: extract_edge(&mesh, rules, TileSide::East),
        };
        write_border(&border_path(dir, south, west), &border)?;
    }

    // ===== SERIALIZATION =====
    phase(&mut progress, Phase::Serialization);
    let artifact = build_artifact(&mesh, rules, rasters, placements, &params.tile);

    log::info!(
        "tile [{}, {}]: {} vertices, {} faces, {} patches",
        west,
        south,
        mesh.vertices.len(),
        mesh.faces.len(),
        artifact.patches.len()
    );
    Ok(TileOutput {
        artifact,
        mesh,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Dem;
    use crate::rules::{TerrainRule, NO_TERRAIN};

    fn flat_bundle(west: f64, south: f64, value: f32) -> RasterBundle {
        let mut elev = Dem::new(10, 10, west, south, west + 1.0, south + 1.0);
        let mut surface = Dem::new(10, 10, west, south, west + 1.0, south + 1.0);
        for y in 0..10i32 {
            for x in 0..10i32 {
                elev.set(x, y, value);
                surface.set(x, y, value);
            }
        }
        let mut rasters = RasterBundle::new();
        rasters.insert(Layer::Elevation, elev);
        rasters.insert(Layer::WaterSurface, surface);
        rasters
    }

    fn grass_rules() -> RuleTable {
        let mut rules = RuleTable::new();
        let grass = rules.intern("grass");
        rules.push_rule(TerrainRule {
            terrain: grass,
            ..TerrainRule::default()
        });
        rules
    }

    #[test]
    fn flat_tile_end_to_end() {
        // A flat tile with an empty map: only the corners survive
        // selection, every face takes the single rule's terrain, and no
        // borders appear anywhere.
        let mut rasters = flat_bundle(0.0, 0.0, 100.0);
        let map = VectorMap::new();
        let mut rules = grass_rules();
        let grass = rules.lookup("grass").unwrap();
        let out = generate_tile(
            &mut rasters,
            &map,
            &mut rules,
            &[],
            &PipelineParams::default(),
            None,
        )
        .unwrap();

        assert_eq!(out.mesh.vertices.len(), 4);
        for f in out.mesh.face_ids() {
            assert_eq!(out.mesh.face(f).terrain, grass);
            assert!(out.mesh.face(f).border_terrains.is_empty());
        }
        for v in out.mesh.vert_ids() {
            assert!((out.mesh.vertex(v).height - 100.0).abs() < 0.5);
        }
        assert!(out.artifact.patches.iter().all(|p| p.terrain == "grass"));
        assert_eq!(out.stats.classify.unmatched, 0);
    }

    #[test]
    fn phases_fire_in_order() {
        let mut rasters = flat_bundle(0.0, 0.0, 100.0);
        let map = VectorMap::new();
        let mut rules = grass_rules();
        let mut seen = Vec::new();
        let mut fractions = Vec::new();
        let mut cb = |p: Phase, n: usize, _name: &str, frac: f32| {
            assert_eq!(n, PHASE_COUNT);
            seen.push(p);
            fractions.push(frac);
        };
        generate_tile(
            &mut rasters,
            &map,
            &mut rules,
            &[],
            &PipelineParams::default(),
            Some(&mut cb),
        )
        .unwrap();
        assert_eq!(
            seen,
            vec![
                Phase::Layers,
                Phase::Hydrology,
                Phase::Selection,
                Phase::Constraints,
                Phase::Triangulation,
                Phase::WaterAssignment,
                Phase::Classification,
                Phase::BorderMatching,
                Phase::Serialization,
            ]
        );
        assert!(fractions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn missing_elevation_is_an_error() {
        let mut rasters = RasterBundle::new();
        let map = VectorMap::new();
        let mut rules = grass_rules();
        let err = generate_tile(
            &mut rasters,
            &map,
            &mut rules,
            &[],
            &PipelineParams::default(),
            None,
        );
        assert!(matches!(err, Err(TileError::MissingLayer(_))));
    }

    #[test]
    fn adjacent_tiles_share_identical_boundary() {
        // West tile first, east tile second: the shared meridian must
        // come out bit-identical on both sides.
        let dir = std::env::temp_dir().join("terratile-border-test");
        std::fs::create_dir_all(&dir).unwrap();
        // Clear any leftover descriptors from earlier runs.
        for (s, w) in [(0, 0), (0, 1)] {
            std::fs::remove_file(border_path(&dir, s, w)).ok();
        }
        let params = PipelineParams {
            border_dir: Some(dir.clone()),
            ..PipelineParams::default()
        };
        let map = VectorMap::new();
        let mut rules = grass_rules();

        let mut west_rasters = flat_bundle(0.0, 0.0, 80.0);
        let west_out =
            generate_tile(&mut west_rasters, &map, &mut rules, &[], &params, None).unwrap();
        let mut east_rasters = flat_bundle(1.0, 0.0, 90.0);
        let east_out =
            generate_tile(&mut east_rasters, &map, &mut rules, &[], &params, None).unwrap();

        let west_edge = extract_edge(&west_out.mesh, &rules, TileSide::East);
        let east_edge = extract_edge(&east_out.mesh, &rules, TileSide::West);
        assert_eq!(west_edge.vertices.len(), east_edge.vertices.len());
        for (a, b) in west_edge.vertices.iter().zip(east_edge.vertices.iter()) {
            assert_eq!(a.lon, b.lon);
            assert_eq!(a.lat, b.lat);
            assert_eq!(a.height, b.height);
            assert_eq!(a.blends, b.blends);
        }

        for (s, w) in [(0, 0), (0, 1)] {
            std::fs::remove_file(border_path(&dir, s, w)).ok();
        }
    }

    #[test]
    fn unmatched_faces_get_the_sentinel() {
        let mut rasters = flat_bundle(0.0, 0.0, 100.0);
        let map = VectorMap::new();
        // A rule table whose single rule can never match a flat tile.
        let mut rules = RuleTable::new();
        let alpine = rules.intern("alpine");
        rules.push_rule(TerrainRule {
            terrain: alpine,
            elevation: crate::rules::Band::new(3000.0, 9000.0),
            ..TerrainRule::default()
        });
        let out = generate_tile(
            &mut rasters,
            &map,
            &mut rules,
            &[],
            &PipelineParams::default(),
            None,
        )
        .unwrap();
        assert!(out.stats.classify.unmatched > 0);
        for f in out.mesh.face_ids() {
            assert_eq!(out.mesh.face(f).terrain, NO_TERRAIN);
        }
    }
}
