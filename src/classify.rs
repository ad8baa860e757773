//! Terrain classification and border blending over the finished mesh.
//!
//! Water faces are painted first by flood fill from the shoreline
//! constraints, then every dry face is classified through the rule table,
//! and finally border-blend weights spread outward so neighboring terrains
//! cross-fade instead of hard-cutting.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::cdt::{FaceId, Mesh, VertId, NO_FACE};
use crate::constraints::ConstraintSegment;
use crate::raster::{Layer, RasterBundle, NM_TO_MTR, NO_DATA};
use crate::rules::{RuleTable, Sample, TerrainId, NO_TERRAIN};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifyParams {
    /// Texture repetition switch distance, meters; drives the variant
    /// hash resolution.
    pub rep_switch_m: f64,
    /// Water flattening slope allowance per step, meters.
    pub flatten_step_m: f64,
    /// Iteration cap for water flattening.
    pub flatten_max_iters: usize,
}

impl Default for ClassifyParams {
    fn default() -> Self {
        Self {
            rep_switch_m: 50_000.0,
            flatten_step_m: 0.5,
            flatten_max_iters: 100,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ClassifyStats {
    pub water_faces: usize,
    pub classified: usize,
    pub unmatched: usize,
    pub border_sources: usize,
    pub promoted: usize,
}

// ===== WATER ASSIGNMENT =====

/// Paint water terrain by flood fill from the wet side of each shoreline
/// constraint. Conflicting paints keep the first assignment.
pub fn assign_water_terrain(
    mesh: &mut Mesh,
    segments: &[ConstraintSegment],
    rules: &RuleTable,
) -> usize {
    let water = rules.water;
    let mut seeds: Vec<FaceId> = Vec::new();
    for seg in segments {
        if !seg.is_wet() {
            continue;
        }
        for w in seg.pts.windows(2) {
            let (alon, alat) = (w[0].0, w[0].1);
            let (blon, blat) = (w[1].0, w[1].1);
            let a = match mesh.locate(alon, alat) {
                crate::cdt::Location::OnVertex(v) => v,
                _ => continue,
            };
            let b = match mesh.locate(blon, blat) {
                crate::cdt::Location::OnVertex(v) => v,
                _ => continue,
            };
            let Some((f, i)) = mesh.find_edge(a, b) else {
                continue;
            };
            // The face whose third corner sits left of a->b is the left
            // side of the polyline.
            let left_is_water = seg.left_water;
            let (fa, fb) = (f, mesh.face(f).n[i]);
            for cand in [fa, fb] {
                if cand == NO_FACE {
                    continue;
                }
                let opp = opposite_vertex(mesh, cand, a, b);
                let Some(opp) = opp else { continue };
                let vo = mesh.vertex(opp);
                let va = mesh.vertex(a);
                let vb = mesh.vertex(b);
                let side = (vb.lon - va.lon) * (vo.lat - va.lat)
                    - (vb.lat - va.lat) * (vo.lon - va.lon);
                let wet = if side > 0.0 {
                    left_is_water
                } else {
                    seg.right_water
                };
                if wet {
                    seeds.push(cand);
                }
            }
        }
    }

    // Flood fill across unconstrained edges.
    let mut painted = 0usize;
    let mut queue: VecDeque<FaceId> = seeds.into();
    while let Some(f) = queue.pop_front() {
        if mesh.face(f).terrain == water {
            continue;
        }
        if mesh.face(f).terrain != NO_TERRAIN {
            log::warn!(
                "face {:?} already {} while painting water; keeping first",
                f,
                rules.name(mesh.face(f).terrain)
            );
            continue;
        }
        mesh.face_mut(f).terrain = water;
        painted += 1;
        for i in 0..3 {
            let face = mesh.face(f);
            if !face.constrained[i] && face.n[i] != NO_FACE {
                queue.push_back(face.n[i]);
            }
        }
    }
    painted
}

fn opposite_vertex(mesh: &Mesh, f: FaceId, a: VertId, b: VertId) -> Option<VertId> {
    mesh.face(f).v.iter().copied().find(|&v| v != a && v != b)
}

/// Pull every wet vertex down toward its lowest wet neighbor so water
/// never runs uphill. Iterates to a fixed point.
pub fn flatten_water(mesh: &mut Mesh, water: TerrainId, params: &ClassifyParams) -> usize {
    let mut wet_verts: Vec<VertId> = Vec::new();
    let mut is_wet = vec![false; mesh.vertices.len()];
    for f in mesh.face_ids() {
        if mesh.face(f).terrain == water {
            for &v in &mesh.face(f).v {
                if !is_wet[v.0 as usize] {
                    is_wet[v.0 as usize] = true;
                    wet_verts.push(v);
                }
            }
        }
    }
    let mut changed_total = 0usize;
    for _ in 0..params.flatten_max_iters {
        let mut changed = 0usize;
        for &v in &wet_verts {
            let mut lowest = f64::MAX;
            for f in mesh.faces_around(v) {
                if mesh.face(f).terrain != water {
                    continue;
                }
                for &w in &mesh.face(f).v {
                    if w != v {
                        lowest = lowest.min(mesh.vertex(w).height);
                    }
                }
            }
            if lowest == f64::MAX {
                continue;
            }
            let cap = lowest + params.flatten_step_m;
            if mesh.vertex(v).height > cap {
                mesh.vertex_mut(v).height = cap;
                changed += 1;
            }
        }
        changed_total += changed;
        if changed == 0 {
            break;
        }
    }
    changed_total
}

// ===== CLASSIFICATION =====

/// Deterministic texture variant in 1..=n from a face centroid.
pub fn variant_for(lon: f64, lat: f64, rep_switch_m: f64, n: u8) -> u8 {
    if n <= 1 {
        return 1;
    }
    let patches = 60.0 * NM_TO_MTR / rep_switch_m;
    let xi = (lon.abs() * patches) as i64;
    let yi = (lat.abs() * patches) as i64;
    let h = (xi.wrapping_mul(73_856_093) ^ yi.wrapping_mul(19_349_663)) as u64;
    (h % n as u64) as u8 + 1
}

/// Heading variant from the face normal: 1 N, 2 E, 3 S, 4 W.
pub fn heading_variant(normal: [f32; 3]) -> u8 {
    let flat = (normal[0] * normal[0] + normal[1] * normal[1]).sqrt();
    if flat < 1e-6 {
        return 1;
    }
    // Normal leans downhill; the slope faces the opposite way.
    let (nx, ny) = (normal[0] / flat, normal[1] / flat);
    if ny.abs() >= nx.abs() {
        if ny > 0.0 {
            3
        } else {
            1
        }
    } else if nx > 0.0 {
        4
    } else {
        2
    }
}

/// Classify every unpainted face through the rule table.
pub fn classify_mesh(
    mesh: &mut Mesh,
    rasters: &RasterBundle,
    rules: &RuleTable,
    params: &ClassifyParams,
) -> ClassifyStats {
    let mut stats = ClassifyStats::default();
    let water = rules.water;

    let face_count = mesh.faces.len();
    for fi in 0..face_count {
        let f = FaceId(fi as u32);
        if mesh.face(f).terrain == water {
            stats.water_faces += 1;
            continue;
        }
        let sample = sample_face(mesh, f, rasters, rules, params);
        match rules.find_terrain(&sample) {
            Some(rule) => {
                // Projected textures pick their variant by slope heading;
                // the rest re-scale the hash to the rule's own count.
                let variant = if rule.projected {
                    heading_variant(mesh.face(f).normal)
                } else {
                    let (clon, clat) = mesh.face_centroid(f);
                    variant_for(clon, clat, params.rep_switch_m, rules.variants_of(rule.terrain))
                };
                let terrain = rule.terrain;
                let face = mesh.face_mut(f);
                face.terrain = terrain;
                face.variant = variant;
                stats.classified += 1;
            }
            None => {
                let (lon, lat) = mesh.face_centroid(f);
                log::warn!(
                    "no terrain rule matched at ({:.5}, {:.5}): elev {:.1} slope {:.3}",
                    lon,
                    lat,
                    sample.elevation,
                    sample.slope
                );
                mesh.face_mut(f).terrain = NO_TERRAIN;
                stats.unmatched += 1;
            }
        }
    }
    stats
}

/// Sample the rasters at a face's centroid and 3 corners: majority vote
/// for enums, average for continuous fields, max for slope.
fn sample_face(
    mesh: &Mesh,
    f: FaceId,
    rasters: &RasterBundle,
    rules: &RuleTable,
    params: &ClassifyParams,
) -> Sample {
    let (clon, clat) = mesh.face_centroid(f);
    let mut pts = vec![(clon, clat)];
    for &v in &mesh.face(f).v {
        let vv = mesh.vertex(v);
        pts.push((vv.lon, vv.lat));
    }

    let avg = |layer: Layer| -> f32 {
        let Some(dem) = rasters.get(layer) else {
            return 0.0;
        };
        let mut sum = 0.0f32;
        let mut n = 0;
        for &(lon, lat) in &pts {
            let v = dem.sample_linear(lon, lat);
            if v != NO_DATA {
                sum += v;
                n += 1;
            }
        }
        if n == 0 {
            0.0
        } else {
            sum / n as f32
        }
    };
    let maxi = |layer: Layer| -> f32 {
        let Some(dem) = rasters.get(layer) else {
            return 0.0;
        };
        let mut best = 0.0f32;
        for &(lon, lat) in &pts {
            let v = dem.sample_linear(lon, lat);
            if v != NO_DATA {
                best = best.max(v);
            }
        }
        best
    };
    let vote = |layer: Layer| -> Option<i32> {
        let dem = rasters.get(layer)?;
        let v = dem.sample_majority(&pts);
        if v == NO_DATA {
            None
        } else {
            Some(v as i32)
        }
    };

    let normal = mesh.face(f).normal;
    let slope_tri = 1.0 - normal[2];
    let flat = (normal[0] * normal[0] + normal[1] * normal[1]).sqrt();
    let heading = if flat < 1e-6 { 0.0 } else { normal[1] / flat };

    let near_water = (0..3).any(|i| {
        let n = mesh.face(f).n[i];
        n != NO_FACE && mesh.face(n).terrain == rules.water
    });

    // The variant hash uses the widest variant count any rule offers so a
    // rule gated on variant k can fire; the emitting rule re-scales.
    let max_vars = rules
        .rules
        .iter()
        .map(|r| r.variants)
        .max()
        .unwrap_or(1)
        .max(1);
    let variant = variant_for(clon, clat, params.rep_switch_m, max_vars);

    Sample {
        category: None,
        land_use: vote(Layer::LandUse),
        climate: vote(Layer::Climate),
        elevation: avg(Layer::Elevation),
        slope: maxi(Layer::Slope),
        slope_tri,
        temperature: avg(Layer::Temperature),
        temperature_range: avg(Layer::TemperatureRange),
        rainfall: avg(Layer::Rainfall),
        near_water,
        slope_heading: heading,
        relative_elevation: avg(Layer::RelativeElevation),
        elevation_range: avg(Layer::ElevationRange),
        urban_density: avg(Layer::UrbanDensity),
        urban_radial: avg(Layer::UrbanRadial),
        urban_transport: avg(Layer::UrbanTransport),
        urban_square: vote(Layer::UrbanSquare),
        latitude: clat as f32,
        variant,
    }
}

// ===== BORDER BLENDING =====

/// Max cross-fade distance between two terrains: the smaller of their
/// configured transition distances, foreshortened by the source face tilt.
pub fn transition_distance(rules: &RuleTable, a: TerrainId, b: TerrainId, y_normal: f32) -> f32 {
    rules.transition_m(a).min(rules.transition_m(b)) * y_normal.max(0.1)
}

/// Spread border weights for `terrain` outward from a source face.
/// Neighbors join while they carry strictly lower priority and at least
/// one corner weight still rises.
pub fn spread_border_from(mesh: &mut Mesh, rules: &RuleTable, source: FaceId) {
    let terrain = mesh.face(source).terrain;
    if terrain == NO_TERRAIN || terrain == rules.water {
        return;
    }
    let y_normal = mesh.face(source).normal[2];
    let mut queue: VecDeque<FaceId> = VecDeque::new();
    let mut visited = vec![false; mesh.faces.len()];
    visited[source.0 as usize] = true;
    for i in 0..3 {
        let n = mesh.face(source).n[i];
        if n != NO_FACE {
            queue.push_back(n);
        }
    }
    while let Some(f) = queue.pop_front() {
        if visited[f.0 as usize] {
            continue;
        }
        visited[f.0 as usize] = true;
        let base = mesh.face(f).terrain;
        if base == rules.water || !rules.is_lower_priority(base, terrain) {
            continue;
        }
        let dist_max = transition_distance(rules, terrain, base, y_normal);
        if dist_max <= 0.0 {
            continue;
        }
        let mut raised = false;
        for i in 0..3 {
            let v = mesh.face(f).v[i];
            let vv = mesh.vertex(v);
            let d = mesh.dist2_to_face_m(source, vv.lon, vv.lat).sqrt() as f32;
            let w = ((dist_max - d) / dist_max).max(0.0);
            if w <= 0.0 {
                continue;
            }
            let entry = mesh
                .vertex_mut(v)
                .border_blend
                .entry(terrain)
                .or_insert(0.0);
            if w > *entry {
                *entry = w;
                raised = true;
            }
        }
        if raised {
            if !mesh.face(f).border_terrains.contains(&terrain) {
                mesh.face_mut(f).border_terrains.push(terrain);
                mesh.face_mut(f).border_terrains.sort();
            }
            for i in 0..3 {
                let n = mesh.face(f).n[i];
                if n != NO_FACE && !visited[n.0 as usize] {
                    queue.push_back(n);
                }
            }
        }
    }
}

/// Run border spreading from every eligible source face.
pub fn spread_all_borders(mesh: &mut Mesh, rules: &RuleTable) -> usize {
    let mut sources = 0;
    for fi in 0..mesh.faces.len() {
        let f = FaceId(fi as u32);
        let t = mesh.face(f).terrain;
        if t != NO_TERRAIN && t != rules.water {
            spread_border_from(mesh, rules, f);
            sources += 1;
        }
    }
    sources
}

/// Rebase a face onto a higher-priority terrain: the old base becomes a
/// saturated border on the face's corners, and borders at or below the new
/// base are dropped.
pub fn rebase_face(mesh: &mut Mesh, rules: &RuleTable, f: FaceId, new_terrain: TerrainId) {
    let old = mesh.face(f).terrain;
    debug_assert!(rules.is_lower_priority(old, new_terrain));
    if old != NO_TERRAIN && old != rules.water {
        for i in 0..3 {
            let v = mesh.face(f).v[i];
            mesh.vertex_mut(v).border_blend.insert(old, 1.0);
        }
        if !mesh.face(f).border_terrains.contains(&old) {
            mesh.face_mut(f).border_terrains.push(old);
        }
    }
    {
        let face = mesh.face_mut(f);
        face.terrain = new_terrain;
        // The old base's variant means nothing to the new terrain.
        face.variant = 1;
    }
    let keep: Vec<TerrainId> = mesh
        .face(f)
        .border_terrains
        .iter()
        .copied()
        .filter(|&b| rules.is_lower_priority(new_terrain, b) || b == old)
        .collect();
    let mut keep = keep;
    keep.retain(|&b| b != new_terrain);
    keep.sort();
    mesh.face_mut(f).border_terrains = keep;
}

/// Promote faces whose blend saturates at every corner for some
/// higher-priority border terrain.
pub fn promote_saturated(mesh: &mut Mesh, rules: &RuleTable) -> usize {
    let mut promoted = 0;
    for fi in 0..mesh.faces.len() {
        let f = FaceId(fi as u32);
        let base = mesh.face(f).terrain;
        if base == rules.water {
            continue;
        }
        let borders = mesh.face(f).border_terrains.clone();
        let mut best: Option<TerrainId> = None;
        for b in borders {
            if !rules.is_lower_priority(base, b) {
                continue;
            }
            let saturated = (0..3).all(|i| {
                let v = mesh.face(f).v[i];
                mesh.vertex(v)
                    .border_blend
                    .get(&b)
                    .map(|&w| w >= 0.999)
                    .unwrap_or(false)
            });
            if saturated {
                // Highest-priority saturated border wins.
                best = match best {
                    Some(cur) if rules.is_lower_priority(b, cur) => Some(cur),
                    _ => Some(b),
                };
            }
        }
        if let Some(b) = best {
            rebase_face(mesh, rules, f, b);
            // A fully saturated base needs no residual border entry.
            mesh.face_mut(f).border_terrains.retain(|&t| t != b);
            promoted += 1;
        }
    }
    promoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Dem;
    use crate::rules::{Band, TerrainRule};

    fn two_terrain_rules() -> RuleTable {
        let mut t = RuleTable::new();
        let grass = t.intern("grass");
        let rock = t.intern("rock");
        t.push_rule(TerrainRule {
            slope: Band::new(0.3, 1.0),
            terrain: rock,
            transition_m: 1000.0,
            ..TerrainRule::default()
        });
        t.push_rule(TerrainRule {
            terrain: grass,
            transition_m: 1000.0,
            ..TerrainRule::default()
        });
        t
    }

    fn bundle_with_elev(elev: Dem) -> RasterBundle {
        let mut b = RasterBundle::new();
        b.insert(Layer::Slope, crate::raster::derive_slope(&elev));
        b.insert(Layer::Elevation, elev);
        b
    }

    #[test]
    fn variant_is_deterministic_and_bounded() {
        for n in 1..=4u8 {
            let v1 = variant_for(-71.123, 42.5, 50_000.0, n);
            let v2 = variant_for(-71.123, 42.5, 50_000.0, n);
            assert_eq!(v1, v2);
            assert!(v1 >= 1 && v1 <= n);
        }
    }

    #[test]
    fn heading_variant_quadrants() {
        assert_eq!(heading_variant([0.0, -0.5, 0.8]), 1); // faces north
        assert_eq!(heading_variant([-0.5, 0.0, 0.8]), 2); // faces east
        assert_eq!(heading_variant([0.0, 0.5, 0.8]), 3);
        assert_eq!(heading_variant([0.5, 0.0, 0.8]), 4);
    }

    #[test]
    fn flat_tile_single_rule_everywhere() {
        let mut elev = Dem::new(10, 10, 0.0, 0.0, 1.0, 1.0);
        for y in 0..10i32 {
            for x in 0..10i32 {
                elev.set(x, y, 100.0);
            }
        }
        let rules = two_terrain_rules();
        let grass = rules.lookup("grass").unwrap();
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [100.0; 4]);
        mesh.insert(0.5, 0.5, 100.0).unwrap();
        mesh.compute_normals();
        let bundle = bundle_with_elev(elev);
        let stats = classify_mesh(&mut mesh, &bundle, &rules, &ClassifyParams::default());
        assert_eq!(stats.unmatched, 0);
        for f in mesh.face_ids() {
            assert_eq!(mesh.face(f).terrain, grass);
        }
        // No borders anywhere on a single-terrain tile.
        let sources = spread_all_borders(&mut mesh, &rules);
        assert!(sources > 0);
        for f in mesh.face_ids() {
            assert!(mesh.face(f).border_terrains.is_empty());
        }
    }

    #[test]
    fn classified_faces_carry_their_rule_variant() {
        let mut elev = Dem::new(10, 10, 0.0, 0.0, 1.0, 1.0);
        for y in 0..10i32 {
            for x in 0..10i32 {
                elev.set(x, y, 100.0);
            }
        }
        let mut rules = RuleTable::new();
        let grass = rules.intern("grass");
        rules.push_rule(TerrainRule {
            terrain: grass,
            variants: 4,
            ..TerrainRule::default()
        });
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [100.0; 4]);
        mesh.insert(0.5, 0.5, 100.0).unwrap();
        mesh.compute_normals();
        let bundle = bundle_with_elev(elev);
        let params = ClassifyParams::default();
        classify_mesh(&mut mesh, &bundle, &rules, &params);
        for f in mesh.face_ids().collect::<Vec<_>>() {
            let face = mesh.face(f);
            assert!(face.variant >= 1 && face.variant <= 4);
            let (clon, clat) = mesh.face_centroid(f);
            assert_eq!(
                face.variant,
                variant_for(clon, clat, params.rep_switch_m, 4)
            );
        }
    }

    #[test]
    fn projected_rules_take_heading_variants() {
        let mut elev = Dem::new(10, 10, 0.0, 0.0, 1.0, 1.0);
        for y in 0..10i32 {
            for x in 0..10i32 {
                elev.set(x, y, 500.0 * y as f32);
            }
        }
        let mut rules = RuleTable::new();
        let scree = rules.intern("scree");
        rules.push_rule(TerrainRule {
            terrain: scree,
            projected: true,
            variants: 4,
            ..TerrainRule::default()
        });
        // Tilted tile: south corners low, north corners high.
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [0.0, 0.0, 4500.0, 4500.0]);
        mesh.compute_normals();
        let bundle = bundle_with_elev(elev);
        classify_mesh(&mut mesh, &bundle, &rules, &ClassifyParams::default());
        for f in mesh.face_ids().collect::<Vec<_>>() {
            let face = mesh.face(f);
            assert_eq!(face.terrain, scree);
            assert_eq!(face.variant, heading_variant(face.normal));
        }
    }

    #[test]
    fn unmatched_rule_leaves_sentinel() {
        let mut elev = Dem::new(5, 5, 0.0, 0.0, 1.0, 1.0);
        for y in 0..5i32 {
            for x in 0..5i32 {
                elev.set(x, y, 100.0);
            }
        }
        let mut rules = RuleTable::new();
        let alpine = rules.intern("alpine");
        rules.push_rule(TerrainRule {
            elevation: Band::new(2000.0, 9000.0),
            terrain: alpine,
            ..TerrainRule::default()
        });
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [100.0; 4]);
        mesh.compute_normals();
        let bundle = bundle_with_elev(elev);
        let stats = classify_mesh(&mut mesh, &bundle, &rules, &ClassifyParams::default());
        assert_eq!(stats.unmatched, 2);
        for f in mesh.face_ids() {
            assert_eq!(mesh.face(f).terrain, NO_TERRAIN);
        }
    }

    #[test]
    fn border_weights_bounded_and_monotone() {
        let rules = two_terrain_rules();
        let grass = rules.lookup("grass").unwrap();
        let rock = rules.lookup("rock").unwrap();
        let mut mesh = Mesh::new(0.0, 0.0, 0.02, 0.02, [0.0; 4]);
        for (x, y) in [(0.005, 0.005), (0.015, 0.005), (0.005, 0.015), (0.015, 0.015)] {
            mesh.insert(x, y, 0.0).unwrap();
        }
        mesh.compute_normals();
        // Paint the west half rock (higher priority), east half grass.
        for f in mesh.face_ids() {
            let (lon, _) = mesh.face_centroid(f);
            mesh.face_mut(f).terrain = if lon < 0.01 { rock } else { grass };
        }
        spread_all_borders(&mut mesh, &rules);
        let mut saw_blend = false;
        for v in mesh.vert_ids() {
            for (&t, &w) in &mesh.vertex(v).border_blend {
                assert!((0.0..=1.0).contains(&w));
                assert_eq!(t, rock, "only the higher-priority terrain spreads");
                if w > 0.0 {
                    saw_blend = true;
                }
            }
        }
        assert!(saw_blend, "no blend weights were spread");
        // Grass faces adjacent to rock carry the rock border.
        let mut bordered = 0;
        for f in mesh.face_ids() {
            if mesh.face(f).terrain == grass && !mesh.face(f).border_terrains.is_empty() {
                assert_eq!(mesh.face(f).border_terrains, vec![rock]);
                bordered += 1;
            }
        }
        assert!(bordered > 0);
    }

    #[test]
    fn rebase_never_raises_priority() {
        let rules = two_terrain_rules();
        let grass = rules.lookup("grass").unwrap();
        let rock = rules.lookup("rock").unwrap();
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [0.0; 4]);
        mesh.compute_normals();
        let f = FaceId(0);
        mesh.face_mut(f).terrain = grass;
        let before = rules.priority_rank(mesh.face(f).terrain);
        rebase_face(&mut mesh, &rules, f, rock);
        let after = rules.priority_rank(mesh.face(f).terrain);
        assert!(before < after);
        assert_eq!(mesh.face(f).terrain, rock);
        // The old base saturates on the corners.
        for i in 0..3 {
            let v = mesh.face(f).v[i];
            assert_eq!(mesh.vertex(v).border_blend.get(&grass), Some(&1.0));
        }
    }

    #[test]
    fn saturated_faces_promote() {
        let rules = two_terrain_rules();
        let grass = rules.lookup("grass").unwrap();
        let rock = rules.lookup("rock").unwrap();
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [0.0; 4]);
        mesh.compute_normals();
        for f in mesh.face_ids() {
            mesh.face_mut(f).terrain = grass;
        }
        let f = FaceId(0);
        mesh.face_mut(f).border_terrains.push(rock);
        for i in 0..3 {
            let v = mesh.face(f).v[i];
            mesh.vertex_mut(v).border_blend.insert(rock, 1.0);
        }
        let n = promote_saturated(&mut mesh, &rules);
        assert_eq!(n, 1);
        assert_eq!(mesh.face(f).terrain, rock);
        assert!(!mesh.face(f).border_terrains.contains(&rock));
    }

    #[test]
    fn water_flattening_reaches_fixed_point() {
        let mut rules = RuleTable::new();
        let water = rules.water;
        let mut mesh = Mesh::new(0.0, 0.0, 1.0, 1.0, [10.0, 20.0, 30.0, 40.0]);
        mesh.insert(0.5, 0.5, 50.0).unwrap();
        for f in mesh.face_ids() {
            mesh.face_mut(f).terrain = water;
        }
        let _ = &mut rules;
        let n = flatten_water(&mut mesh, water, &ClassifyParams::default());
        assert!(n > 0);
        // Every wet vertex is within one step of the global low point.
        let min_h = mesh
            .vert_ids()
            .map(|v| mesh.vertex(v).height)
            .fold(f64::MAX, f64::min);
        for v in mesh.vert_ids() {
            assert!(mesh.vertex(v).height <= min_h + 0.5 * 5.0);
        }
    }
}
