//! Configuration for the photon subsetting engine.

use crate::geo::{PolygonFilter, RasterMask, SpatialFilter};
use crate::subset::{
    ALL_TRACKS, NUM_ATL08_CLASSES, NUM_PHOTON_QUALITY, NUM_SIGNAL_CONF, NUM_TRACKS,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Surface type selecting one column of the 5-wide signal-confidence table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceType {
    #[default]
    Land,
    Ocean,
    SeaIce,
    LandIce,
    InlandWater,
}

impl SurfaceType {
    pub fn column(&self) -> usize {
        *self as usize
    }
}

/// Optional processing stages layered onto the base subsetting pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Stages {
    /// Join ATL08 signal-photon classifications onto ATL03 photons.
    #[serde(default)]
    pub atl08: bool,

    /// Run the YAPC density scorer.
    #[serde(default)]
    pub yapc: bool,

    /// Populate PhoREAL relief/landcover/snowcover fields (requires atl08).
    #[serde(default)]
    pub phoreal: bool,
}

/// YAPC scorer settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct YapcConfig {
    /// Algorithm version; 1 and 2 share an implementation, 3 is the rewrite.
    #[serde(default = "default_yapc_version")]
    pub version: u8,

    /// Minimum score a photon must carry to survive filtering.
    #[serde(default)]
    pub score: u8,

    /// Fixed neighbor count; 0 derives it from the segment photon count.
    #[serde(default)]
    pub knn: u32,

    /// Floor on the per-photon neighbor count (version 3).
    #[serde(default = "default_yapc_min_knn")]
    pub min_knn: u32,

    /// Along-track window in meters.
    #[serde(default = "default_yapc_win_x")]
    pub win_x: f64,

    /// Height window in meters; 0 derives it from the height span (version 2).
    #[serde(default = "default_yapc_win_h")]
    pub win_h: f64,
}

impl Default for YapcConfig {
    fn default() -> Self {
        Self {
            version: default_yapc_version(),
            score: 0,
            knn: 0,
            min_knn: default_yapc_min_knn(),
            win_x: default_yapc_win_x(),
            win_h: default_yapc_win_h(),
        }
    }
}

/// PhoREAL settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PhorealConfig {
    /// Stamp the absolute photon height into the relief field instead of the
    /// ATL08 `ph_h` value.
    #[serde(default)]
    pub use_abs_h: bool,

    /// Reassign high-confidence, low-relief night photons on strong beams to
    /// top-of-canopy.
    #[serde(default)]
    pub above_classifier: bool,
}

/// Parameters for one subsetting run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsetConfig {
    /// Ground track to process: 1..=3, or 0 for all tracks.
    #[serde(default)]
    pub track: u8,

    /// Surface type column of the signal-confidence table.
    #[serde(default)]
    pub surface_type: SurfaceType,

    /// Acceptance per signal-confidence value, indexed by `cnf + 2`.
    #[serde(default = "default_atl03_cnf")]
    pub atl03_cnf: [bool; NUM_SIGNAL_CONF],

    /// Acceptance per photon-quality value.
    #[serde(default = "default_quality_ph")]
    pub quality_ph: [bool; NUM_PHOTON_QUALITY],

    /// Acceptance per ATL08 class; only consulted when the atl08 stage is on.
    #[serde(default = "default_atl08_class")]
    pub atl08_class: [bool; NUM_ATL08_CLASSES],

    #[serde(default)]
    pub stages: Stages,

    #[serde(default)]
    pub yapc: YapcConfig,

    #[serde(default)]
    pub phoreal: PhorealConfig,

    /// Extent length, in meters or in whole segments per `dist_in_seg`.
    #[serde(default = "default_extent_length")]
    pub extent_length: f64,

    /// Extent step, in the same unit as `extent_length`.
    #[serde(default = "default_extent_step")]
    pub extent_step: f64,

    /// Interpret extent length/step in whole 20 m segments.
    #[serde(default)]
    pub dist_in_seg: bool,

    /// Extents with fewer surviving photons are marked invalid.
    #[serde(default)]
    pub minimum_photon_count: usize,

    /// Extents whose surviving photons span less along-track distance are
    /// marked invalid (meters).
    #[serde(default)]
    pub along_track_spread: f64,

    /// Emit invalid extents instead of filtering them.
    #[serde(default)]
    pub pass_invalid: bool,

    /// Deadline for each dataset-bundle join, in seconds.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Ancillary per-segment fields from the geolocation/geophys_corr groups.
    #[serde(default)]
    pub atl03_geo_fields: Vec<String>,

    /// Ancillary per-photon fields from the heights group.
    #[serde(default)]
    pub atl03_ph_fields: Vec<String>,

    /// Ancillary per-land-segment fields from the ATL08 product.
    #[serde(default)]
    pub atl08_fields: Vec<String>,

    /// Polygon region of interest.
    #[serde(default)]
    pub region: Option<PolygonFilter>,

    /// Raster region of interest; takes precedence over `region`. Supplied
    /// programmatically, never from a config file.
    #[serde(skip)]
    pub raster: Option<Arc<dyn RasterMask>>,
}

impl Default for SubsetConfig {
    fn default() -> Self {
        Self {
            track: ALL_TRACKS,
            surface_type: SurfaceType::default(),
            atl03_cnf: default_atl03_cnf(),
            quality_ph: default_quality_ph(),
            atl08_class: default_atl08_class(),
            stages: Stages::default(),
            yapc: YapcConfig::default(),
            phoreal: PhorealConfig::default(),
            extent_length: default_extent_length(),
            extent_step: default_extent_step(),
            dist_in_seg: false,
            minimum_photon_count: 0,
            along_track_spread: 0.0,
            pass_invalid: false,
            read_timeout_secs: default_read_timeout_secs(),
            atl03_geo_fields: Vec::new(),
            atl03_ph_fields: Vec::new(),
            atl08_fields: Vec::new(),
            region: None,
            raster: None,
        }
    }
}

impl SubsetConfig {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: SubsetConfig = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// The read deadline applied to each dataset-bundle join.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// The spatial filter a beam worker crops against. A raster mask takes
    /// precedence over a polygon.
    pub fn spatial_filter(&self) -> SpatialFilter {
        if let Some(raster) = &self.raster {
            SpatialFilter::Raster(raster.clone())
        } else if let Some(polygon) = &self.region {
            SpatialFilter::Polygon(polygon.clone())
        } else {
            SpatialFilter::None
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.track > NUM_TRACKS {
            anyhow::bail!("Track must be 0 (all) or 1..=3, got {}", self.track);
        }
        if self.extent_length <= 0.0 {
            anyhow::bail!("Extent length must be > 0");
        }
        if self.extent_step <= 0.0 {
            anyhow::bail!("Extent step must be > 0");
        }
        if self.stages.yapc && !(1..=3).contains(&self.yapc.version) {
            anyhow::bail!("YAPC version must be 1, 2, or 3, got {}", self.yapc.version);
        }
        if self.stages.yapc && self.yapc.version == 3 && self.yapc.win_h <= 0.0 {
            anyhow::bail!("YAPC v3 requires a positive height window");
        }
        if self.stages.phoreal && !self.stages.atl08 {
            anyhow::bail!("PhoREAL stage requires the atl08 stage");
        }
        if self.read_timeout_secs == 0 {
            anyhow::bail!("Read timeout must be > 0 seconds");
        }
        if let Some(region) = &self.region {
            if region.ring.len() < 3 {
                anyhow::bail!("Polygon region requires at least 3 points");
            }
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_extent_length() -> f64 { 40.0 }
fn default_extent_step() -> f64 { 20.0 }
fn default_read_timeout_secs() -> u64 { 600 }
fn default_yapc_version() -> u8 { 3 }
fn default_yapc_min_knn() -> u32 { 5 }
fn default_yapc_win_x() -> f64 { 15.0 }
fn default_yapc_win_h() -> f64 { 6.0 }

/// Default confidence acceptance: surface low/medium/high.
fn default_atl03_cnf() -> [bool; NUM_SIGNAL_CONF] {
    [false, false, false, false, true, true, true]
}

/// Default quality acceptance: nominal only.
fn default_quality_ph() -> [bool; NUM_PHOTON_QUALITY] {
    [true, false, false, false]
}

/// Default class acceptance: every class.
fn default_atl08_class() -> [bool; NUM_ATL08_CLASSES] {
    [true; NUM_ATL08_CLASSES]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subset::{CNF_SURFACE_LOW, SIGNAL_CONF_OFFSET};

    #[test]
    fn test_defaults() {
        let config = SubsetConfig::default();
        assert_eq!(config.track, ALL_TRACKS);
        assert_eq!(config.extent_length, 40.0);
        assert_eq!(config.extent_step, 20.0);
        assert!(!config.dist_in_seg);
        assert_eq!(config.read_timeout_secs, 600);
        assert!(config.validate().is_ok());

        // Low-confidence photons rejected, surface photons accepted.
        assert!(!config.atl03_cnf[0]);
        assert!(config.atl03_cnf[(CNF_SURFACE_LOW + SIGNAL_CONF_OFFSET) as usize]);
    }

    #[test]
    fn test_validate_bad_track() {
        let config = SubsetConfig {
            track: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_yapc_version() {
        let config = SubsetConfig {
            stages: Stages {
                yapc: true,
                ..Default::default()
            },
            yapc: YapcConfig {
                version: 5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_phoreal_requires_atl08() {
        let config = SubsetConfig {
            stages: Stages {
                phoreal: true,
                atl08: false,
                yapc: false,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = SubsetConfig {
            track: 2,
            minimum_photon_count: 10,
            stages: Stages {
                atl08: true,
                yapc: true,
                phoreal: false,
            },
            ..Default::default()
        };
        let yaml = config.to_yaml().unwrap();
        let restored = SubsetConfig::from_yaml(&yaml).unwrap();
        assert_eq!(restored.track, 2);
        assert_eq!(restored.minimum_photon_count, 10);
        assert!(restored.stages.atl08);
        assert!(restored.stages.yapc);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config = SubsetConfig::from_yaml("track: 1\npass_invalid: true\n").unwrap();
        assert_eq!(config.track, 1);
        assert!(config.pass_invalid);
        assert_eq!(config.extent_length, 40.0);
        assert_eq!(config.yapc.min_knn, 5);
    }

    #[test]
    fn test_spatial_filter_selection() {
        let mut config = SubsetConfig::default();
        assert!(config.spatial_filter().is_none());

        config.region = Some(PolygonFilter {
            ring: vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]],
            projection: "EPSG:4326".to_string(),
        });
        assert!(matches!(
            config.spatial_filter(),
            SpatialFilter::Polygon(_)
        ));
    }
}
