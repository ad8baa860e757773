//! Terrain and beach rule tables.
//!
//! Rules are an ordered list of conjunctive predicates over the sampled
//! raster values of a triangle; the first rule that matches completely
//! wins. The table is loaded once from a text file (or built in code) and
//! shared read-only by every stage. Terrain names stay an open namespace
//! because rule files are externally authored; everything else is a closed
//! enum.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Result, TileError};

/// Interned terrain identifier. `NO_TERRAIN` is the "no rule matched"
/// sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TerrainId(pub u32);

pub const NO_TERRAIN: TerrainId = TerrainId(u32::MAX);

/// Coarse land category from the vector map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LandCategory {
    Natural,
    Manmade,
    Airport,
    Water,
}

impl LandCategory {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "natural" => Some(Self::Natural),
            "manmade" => Some(Self::Manmade),
            "airport" => Some(Self::Airport),
            "water" => Some(Self::Water),
            _ => None,
        }
    }
}

/// Inclusive numeric band; the unset band admits everything.
#[derive(Clone, Copy, Debug)]
pub struct Band {
    pub lo: f32,
    pub hi: f32,
}

impl Band {
    pub fn any() -> Self {
        Self {
            lo: f32::NEG_INFINITY,
            hi: f32::INFINITY,
        }
    }

    pub fn new(lo: f32, hi: f32) -> Self {
        Self { lo, hi }
    }

    pub fn contains(&self, v: f32) -> bool {
        v >= self.lo && v <= self.hi
    }
}

impl Default for Band {
    fn default() -> Self {
        Self::any()
    }
}

// ===== TERRAIN RULES =====

#[derive(Clone, Debug)]
pub struct TerrainRule {
    pub category: Option<LandCategory>,
    pub land_use: Option<i32>,
    pub climate: Option<i32>,
    pub elevation: Band,
    pub slope: Band,
    pub temperature: Band,
    pub temperature_range: Band,
    pub rainfall: Band,
    pub near_water: Option<bool>,
    pub slope_heading: Band,
    pub relative_elevation: Band,
    pub elevation_range: Band,
    pub urban_density: Band,
    pub urban_radial: Band,
    pub urban_transport: Band,
    pub urban_square: Option<i32>,
    pub latitude: Band,
    /// 0 = any variant; 1..=4 requires that exact variant index.
    pub variant: u8,

    pub terrain: TerrainId,
    /// Texture cross-fade distance in meters when bordering this terrain.
    pub transition_m: f32,
    /// Projected (slope-draped) texture: triangle slope replaces point
    /// slope during matching, and heading variants apply.
    pub projected: bool,
    /// Number of texture variants available (1..=4).
    pub variants: u8,
}

impl Default for TerrainRule {
    fn default() -> Self {
        Self {
            category: None,
            land_use: None,
            climate: None,
            elevation: Band::any(),
            slope: Band::any(),
            temperature: Band::any(),
            temperature_range: Band::any(),
            rainfall: Band::any(),
            near_water: None,
            slope_heading: Band::any(),
            relative_elevation: Band::any(),
            elevation_range: Band::any(),
            urban_density: Band::any(),
            urban_radial: Band::any(),
            urban_transport: Band::any(),
            urban_square: None,
            latitude: Band::any(),
            variant: 0,
            terrain: NO_TERRAIN,
            transition_m: 400.0,
            projected: false,
            variants: 1,
        }
    }
}

/// The values sampled for one triangle, fed to rule matching.
#[derive(Clone, Debug, Default)]
pub struct Sample {
    pub category: Option<LandCategory>,
    pub land_use: Option<i32>,
    pub climate: Option<i32>,
    pub elevation: f32,
    /// Point slope (max over the 4 samples).
    pub slope: f32,
    /// Triangle-normal-derived slope, used by projected rules.
    pub slope_tri: f32,
    pub temperature: f32,
    pub temperature_range: f32,
    pub rainfall: f32,
    pub near_water: bool,
    pub slope_heading: f32,
    pub relative_elevation: f32,
    pub elevation_range: f32,
    pub urban_density: f32,
    pub urban_radial: f32,
    pub urban_transport: f32,
    pub urban_square: Option<i32>,
    pub latitude: f32,
    pub variant: u8,
}

impl TerrainRule {
    pub fn matches(&self, s: &Sample) -> bool {
        if let Some(cat) = self.category {
            if s.category != Some(cat) {
                return false;
            }
        }
        if let Some(lu) = self.land_use {
            if s.land_use != Some(lu) {
                return false;
            }
        }
        if let Some(cl) = self.climate {
            if s.climate != Some(cl) {
                return false;
            }
        }
        let slope = if self.projected { s.slope_tri } else { s.slope };
        if !self.elevation.contains(s.elevation) {
            return false;
        }
        if !self.slope.contains(slope) {
            return false;
        }
        if !self.temperature.contains(s.temperature) {
            return false;
        }
        if !self.temperature_range.contains(s.temperature_range) {
            return false;
        }
        if !self.rainfall.contains(s.rainfall) {
            return false;
        }
        if let Some(w) = self.near_water {
            if s.near_water != w {
                return false;
            }
        }
        if !self.slope_heading.contains(s.slope_heading) {
            return false;
        }
        if !self.relative_elevation.contains(s.relative_elevation) {
            return false;
        }
        if !self.elevation_range.contains(s.elevation_range) {
            return false;
        }
        if !self.urban_density.contains(s.urban_density) {
            return false;
        }
        if !self.urban_radial.contains(s.urban_radial) {
            return false;
        }
        if !self.urban_transport.contains(s.urban_transport) {
            return false;
        }
        if let Some(sq) = self.urban_square {
            if s.urban_square != Some(sq) {
                return false;
            }
        }
        if !self.latitude.contains(s.latitude) {
            return false;
        }
        if self.variant != 0 && self.variant != s.variant {
            return false;
        }
        true
    }
}

// ===== BEACH RULES =====

#[derive(Clone, Debug)]
pub struct BeachRule {
    pub slope: Band,
    /// Minimum contiguous shoreline length in meters.
    pub min_length_m: f32,
    pub wave_height: Band,
    /// Backing terrains this beach may appear against; empty = any.
    pub terrains: Vec<TerrainId>,
    /// Beach type code written to the tile artifact.
    pub kind: u16,
}

impl BeachRule {
    pub fn matches(&self, slope: f32, length_m: f32, wave: f32, terrain: TerrainId) -> bool {
        self.slope.contains(slope)
            && length_m >= self.min_length_m
            && self.wave_height.contains(wave)
            && (self.terrains.is_empty() || self.terrains.contains(&terrain))
    }
}

// ===== RULE TABLE =====

pub struct RuleTable {
    pub rules: Vec<TerrainRule>,
    pub beach_rules: Vec<BeachRule>,
    names: Vec<String>,
    by_name: HashMap<String, TerrainId>,
    /// Priority rank per terrain id; lower rank = lower priority.
    rank: Vec<u32>,
    next_rank: u32,
    pub water: TerrainId,
}

impl RuleTable {
    pub fn new() -> Self {
        let mut t = Self {
            rules: Vec::new(),
            beach_rules: Vec::new(),
            names: Vec::new(),
            by_name: HashMap::new(),
            rank: Vec::new(),
            next_rank: 0,
            water: NO_TERRAIN,
        };
        t.water = t.intern("water");
        t
    }

    /// Intern a terrain name. First sighting assigns the next priority
    /// rank, so file order doubles as the default priority order.
    pub fn intern(&mut self, name: &str) -> TerrainId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = TerrainId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.by_name.insert(name.to_string(), id);
        self.rank.push(self.next_rank);
        self.next_rank += 1;
        id
    }

    pub fn lookup(&self, name: &str) -> Option<TerrainId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: TerrainId) -> &str {
        if id == NO_TERRAIN {
            "no_terrain"
        } else {
            &self.names[id.0 as usize]
        }
    }

    pub fn terrain_count(&self) -> usize {
        self.names.len()
    }

    /// Strict priority comparison. `NO_TERRAIN` sits below everything.
    pub fn is_lower_priority(&self, a: TerrainId, b: TerrainId) -> bool {
        let ra = if a == NO_TERRAIN {
            -1i64
        } else {
            self.rank[a.0 as usize] as i64
        };
        let rb = if b == NO_TERRAIN {
            -1i64
        } else {
            self.rank[b.0 as usize] as i64
        };
        ra < rb
    }

    pub fn priority_rank(&self, id: TerrainId) -> i64 {
        if id == NO_TERRAIN {
            -1
        } else {
            self.rank[id.0 as usize] as i64
        }
    }

    pub fn push_rule(&mut self, rule: TerrainRule) {
        self.rules.push(rule);
    }

    /// First rule that fully matches the sample.
    pub fn find_terrain(&self, s: &Sample) -> Option<&TerrainRule> {
        self.rules.iter().find(|r| r.matches(s))
    }

    /// Transition distance for a terrain, from the first rule that emits
    /// it.
    pub fn transition_m(&self, id: TerrainId) -> f32 {
        self.rules
            .iter()
            .find(|r| r.terrain == id)
            .map(|r| r.transition_m)
            .unwrap_or(400.0)
    }

    /// Whether a terrain's texture is projected (slope-draped).
    pub fn is_projected(&self, id: TerrainId) -> bool {
        self.rules
            .iter()
            .find(|r| r.terrain == id)
            .map(|r| r.projected)
            .unwrap_or(false)
    }

    pub fn variants_of(&self, id: TerrainId) -> u8 {
        self.rules
            .iter()
            .find(|r| r.terrain == id)
            .map(|r| r.variants.max(1))
            .unwrap_or(1)
    }

    pub fn find_beach(
        &self,
        slope: f32,
        length_m: f32,
        wave: f32,
        terrain: TerrainId,
    ) -> Option<&BeachRule> {
        self.beach_rules
            .iter()
            .find(|b| b.matches(slope, length_m, wave, terrain))
    }

    // ===== TEXT LOADER =====

    /// Load a rule file. Line formats:
    ///
    /// ```text
    /// # comment
    /// PRIORITY <name>
    /// TERRAIN <name> [key=value ...]
    /// BEACH <kind> [slope=a:b] [len=min] [wave=a:b] [terrains=n1,n2]
    /// ```
    ///
    /// `TERRAIN` keys: cat, landuse, climate, elev, slope, temp, temp_rng,
    /// rain, near_water, head, rel_elev, elev_rng, urban, urban_radial,
    /// urban_trans, urban_square, lat, variant, xon, proj, vars. Band
    /// values are `lo:hi`.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut table = Self::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            table
                .parse_line(&line)
                .map_err(|reason| TileError::RuleParse {
                    file: path.display().to_string(),
                    line: lineno + 1,
                    reason,
                })?;
        }
        log::info!(
            "rule table: {} terrain rules, {} beach rules, {} terrains",
            table.rules.len(),
            table.beach_rules.len(),
            table.names.len()
        );
        Ok(table)
    }

    fn parse_line(&mut self, line: &str) -> std::result::Result<(), String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        let mut tok = line.split_whitespace();
        let cmd = tok.next().unwrap_or("");
        match cmd {
            "PRIORITY" => {
                let name = tok.next().ok_or("PRIORITY needs a name")?;
                self.intern(name);
                Ok(())
            }
            "TERRAIN" => {
                let name = tok.next().ok_or("TERRAIN needs a name")?;
                let mut rule = TerrainRule {
                    terrain: self.intern(name),
                    ..TerrainRule::default()
                };
                for kv in tok {
                    let (key, val) = kv.split_once('=').ok_or_else(|| format!("bad token {kv}"))?;
                    match key {
                        "cat" => {
                            rule.category =
                                Some(LandCategory::parse(val).ok_or_else(|| format!("bad cat {val}"))?)
                        }
                        "landuse" => rule.land_use = Some(parse_num(val)? as i32),
                        "climate" => rule.climate = Some(parse_num(val)? as i32),
                        "elev" => rule.elevation = parse_band(val)?,
                        "slope" => rule.slope = parse_band(val)?,
                        "temp" => rule.temperature = parse_band(val)?,
                        "temp_rng" => rule.temperature_range = parse_band(val)?,
                        "rain" => rule.rainfall = parse_band(val)?,
                        "near_water" => rule.near_water = Some(parse_num(val)? != 0.0),
                        "head" => rule.slope_heading = parse_band(val)?,
                        "rel_elev" => rule.relative_elevation = parse_band(val)?,
                        "elev_rng" => rule.elevation_range = parse_band(val)?,
                        "urban" => rule.urban_density = parse_band(val)?,
                        "urban_radial" => rule.urban_radial = parse_band(val)?,
                        "urban_trans" => rule.urban_transport = parse_band(val)?,
                        "urban_square" => rule.urban_square = Some(parse_num(val)? as i32),
                        "lat" => rule.latitude = parse_band(val)?,
                        "variant" => rule.variant = parse_num(val)? as u8,
                        "xon" => rule.transition_m = parse_num(val)?,
                        "proj" => rule.projected = parse_num(val)? != 0.0,
                        "vars" => rule.variants = parse_num(val)? as u8,
                        _ => return Err(format!("unknown key {key}")),
                    }
                }
                self.rules.push(rule);
                Ok(())
            }
            "BEACH" => {
                let kind = tok.next().ok_or("BEACH needs a kind code")?;
                let mut rule = BeachRule {
                    slope: Band::any(),
                    min_length_m: 0.0,
                    wave_height: Band::any(),
                    terrains: Vec::new(),
                    kind: kind.parse().map_err(|_| format!("bad kind {kind}"))?,
                };
                for kv in tok {
                    let (key, val) = kv.split_once('=').ok_or_else(|| format!("bad token {kv}"))?;
                    match key {
                        "slope" => rule.slope = parse_band(val)?,
                        "len" => rule.min_length_m = parse_num(val)?,
                        "wave" => rule.wave_height = parse_band(val)?,
                        "terrains" => {
                            rule.terrains = val.split(',').map(|n| self.intern(n)).collect()
                        }
                        _ => return Err(format!("unknown key {key}")),
                    }
                }
                self.beach_rules.push(rule);
                Ok(())
            }
            _ => Err(format!("unknown command {cmd}")),
        }
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_num(s: &str) -> std::result::Result<f32, String> {
    s.parse().map_err(|_| format!("bad number {s}"))
}

fn parse_band(s: &str) -> std::result::Result<Band, String> {
    let (lo, hi) = s.split_once(':').ok_or_else(|| format!("bad band {s}"))?;
    Ok(Band::new(parse_num(lo)?, parse_num(hi)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_table() -> RuleTable {
        let mut t = RuleTable::new();
        let rock = t.intern("rock");
        let grass = t.intern("grass");
        t.push_rule(TerrainRule {
            slope: Band::new(0.3, 1.0),
            terrain: rock,
            transition_m: 200.0,
            ..TerrainRule::default()
        });
        t.push_rule(TerrainRule {
            terrain: grass,
            ..TerrainRule::default()
        });
        t
    }

    #[test]
    fn first_match_wins() {
        let t = small_table();
        let rock = t.lookup("rock").unwrap();
        let grass = t.lookup("grass").unwrap();

        let steep = Sample {
            slope: 0.5,
            ..Sample::default()
        };
        assert_eq!(t.find_terrain(&steep).unwrap().terrain, rock);

        let flat = Sample {
            slope: 0.1,
            ..Sample::default()
        };
        assert_eq!(t.find_terrain(&flat).unwrap().terrain, grass);
    }

    #[test]
    fn priority_follows_intern_order() {
        let t = small_table();
        let rock = t.lookup("rock").unwrap();
        let grass = t.lookup("grass").unwrap();
        assert!(t.is_lower_priority(rock, grass));
        assert!(!t.is_lower_priority(grass, rock));
        assert!(t.is_lower_priority(NO_TERRAIN, rock));
    }

    #[test]
    fn projected_rules_use_triangle_slope() {
        let mut t = RuleTable::new();
        let cliff = t.intern("cliff");
        t.push_rule(TerrainRule {
            slope: Band::new(0.3, 1.0),
            terrain: cliff,
            projected: true,
            ..TerrainRule::default()
        });
        let s = Sample {
            slope: 0.1,
            slope_tri: 0.5,
            ..Sample::default()
        };
        assert_eq!(t.find_terrain(&s).unwrap().terrain, cliff);
    }

    #[test]
    fn variant_gating() {
        let mut t = RuleTable::new();
        let a = t.intern("forest_a");
        t.push_rule(TerrainRule {
            variant: 2,
            terrain: a,
            ..TerrainRule::default()
        });
        let hit = Sample {
            variant: 2,
            ..Sample::default()
        };
        let miss = Sample {
            variant: 1,
            ..Sample::default()
        };
        assert!(t.find_terrain(&hit).is_some());
        assert!(t.find_terrain(&miss).is_none());
    }

    #[test]
    fn beach_rule_length_gate() {
        let mut t = RuleTable::new();
        t.beach_rules.push(BeachRule {
            slope: Band::new(0.0, 0.2),
            min_length_m: 100.0,
            wave_height: Band::any(),
            terrains: Vec::new(),
            kind: 3,
        });
        assert!(t.find_beach(0.1, 500.0, 15.0, NO_TERRAIN).is_some());
        assert!(t.find_beach(0.1, 50.0, 15.0, NO_TERRAIN).is_none());
    }

    #[test]
    fn parse_terrain_line() {
        let mut t = RuleTable::new();
        t.parse_line("TERRAIN alpine slope=0.25:1.0 elev=2000:9000 xon=150 proj=1 vars=4")
            .unwrap();
        let r = &t.rules[0];
        assert_eq!(t.name(r.terrain), "alpine");
        assert!(r.projected);
        assert_eq!(r.variants, 4);
        assert!(r.slope.contains(0.3));
        assert!(!r.elevation.contains(100.0));
    }

    #[test]
    fn parse_rejects_garbage() {
        let mut t = RuleTable::new();
        assert!(t.parse_line("TERRAIN x slope=steep").is_err());
        assert!(t.parse_line("FROBNICATE").is_err());
    }
}
