//! Spatial filtering primitives.
//!
//! The region cropper tests per-segment reference coordinates against exactly
//! one of: nothing, a polygon in a caller-supplied projected plane, or a
//! raster mask. Projection goes through `proj`; polygon inclusion through
//! `geo`.
//!
//! Coordinate order convention: `(lon, lat)` in degrees on the WGS84 side,
//! `(x, y)` in the projected plane.

use crate::error::{Result, SubsetError};
use geo::{Contains, Coord, LineString, Point, Polygon};
use proj::Proj;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Geographic coordinate system for segment reference coordinates.
pub const WGS84: &str = "EPSG:4326";

/// Inclusion test against a rasterized region of interest.
///
/// Implementations are supplied by the caller; the pipeline only ever asks
/// whether a lon/lat falls inside.
pub trait RasterMask: Send + Sync + fmt::Debug {
    fn includes(&self, lon: f64, lat: f64) -> bool;
}

/// A polygon in a projected plane, together with the projection that maps
/// segment lon/lat into that plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolygonFilter {
    /// Closed or open exterior ring, already projected: `[[x, y], ...]`.
    pub ring: Vec<[f64; 2]>,

    /// CRS of the projected plane, e.g. "EPSG:3857". "EPSG:4326" leaves
    /// coordinates untouched (plate carrée).
    #[serde(default = "default_projection")]
    pub projection: String,
}

fn default_projection() -> String {
    WGS84.to_string()
}

/// The spatial filter a beam worker crops against.
#[derive(Clone, Default)]
pub enum SpatialFilter {
    #[default]
    None,
    Polygon(PolygonFilter),
    Raster(Arc<dyn RasterMask>),
}

impl fmt::Debug for SpatialFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpatialFilter::None => write!(f, "SpatialFilter::None"),
            SpatialFilter::Polygon(p) => write!(f, "SpatialFilter::Polygon({} points)", p.ring.len()),
            SpatialFilter::Raster(_) => write!(f, "SpatialFilter::Raster"),
        }
    }
}

impl SpatialFilter {
    pub fn is_none(&self) -> bool {
        matches!(self, SpatialFilter::None)
    }
}

/// Projects lon/lat into a target plane.
///
/// `Proj` is not `Send`, so projectors are created where they are used and
/// never held across awaits.
pub struct PlaneProjector {
    proj: Option<Proj>,
}

impl PlaneProjector {
    /// Create a projector into `to_crs`. Identity when the target is WGS84.
    pub fn new(to_crs: &str) -> Result<Self> {
        if to_crs == WGS84 {
            return Ok(Self { proj: None });
        }
        let proj = Proj::new_known_crs(WGS84, to_crs, None).map_err(|e| {
            SubsetError::InvalidParameter(format!(
                "failed to create projection from {} to {}: {}",
                WGS84, to_crs, e
            ))
        })?;
        Ok(Self { proj: Some(proj) })
    }

    pub fn project(&self, lon: f64, lat: f64) -> Result<(f64, f64)> {
        match &self.proj {
            None => Ok((lon, lat)),
            Some(proj) => proj.convert((lon, lat)).map_err(|e| {
                SubsetError::InvalidParameter(format!(
                    "failed to project point ({}, {}): {}",
                    lon, lat, e
                ))
            }),
        }
    }
}

/// Point-in-polygon test over a projected exterior ring.
pub struct ProjectedPolygon {
    polygon: Polygon<f64>,
}

impl ProjectedPolygon {
    pub fn new(ring: &[[f64; 2]]) -> Result<Self> {
        if ring.len() < 3 {
            return Err(SubsetError::InvalidParameter(format!(
                "polygon requires at least 3 points, got {}",
                ring.len()
            )));
        }
        let exterior: LineString<f64> = ring
            .iter()
            .map(|p| Coord { x: p[0], y: p[1] })
            .collect();
        Ok(Self {
            polygon: Polygon::new(exterior, vec![]),
        })
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.polygon.contains(&Point::new(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> Vec<[f64; 2]> {
        vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]
    }

    #[test]
    fn test_polygon_contains() {
        let poly = ProjectedPolygon::new(&unit_square()).unwrap();
        assert!(poly.contains(5.0, 5.0));
        assert!(!poly.contains(15.0, 5.0));
        assert!(!poly.contains(-1.0, 5.0));
    }

    #[test]
    fn test_polygon_too_few_points() {
        assert!(ProjectedPolygon::new(&[[0.0, 0.0], [1.0, 1.0]]).is_err());
    }

    #[test]
    fn test_identity_projection() {
        let projector = PlaneProjector::new(WGS84).unwrap();
        let (x, y) = projector.project(-105.5, 40.1).unwrap();
        assert_eq!((x, y), (-105.5, 40.1));
    }

    #[test]
    fn test_filter_default_is_none() {
        assert!(SpatialFilter::default().is_none());
    }

    #[derive(Debug)]
    struct EastMask;
    impl RasterMask for EastMask {
        fn includes(&self, lon: f64, _lat: f64) -> bool {
            lon >= 0.0
        }
    }

    #[test]
    fn test_raster_mask_object() {
        let filter = SpatialFilter::Raster(Arc::new(EastMask));
        match filter {
            SpatialFilter::Raster(mask) => {
                assert!(mask.includes(10.0, 0.0));
                assert!(!mask.includes(-10.0, 0.0));
            }
            _ => unreachable!(),
        }
    }
}
