//! Region cropping against the spatial filter.
//!
//! The crop is computed from three per-segment arrays (reference lat/lon and
//! photon count) and yields the row windows every later dataset read is
//! parameterized with. Empty segments never change inclusion state; they only
//! carry their photon counts into the running totals.

use crate::error::{Result, SubsetError};
use crate::geo::{PlaneProjector, ProjectedPolygon, RasterMask, SpatialFilter};
use crate::io::{ArrayHandle, DataSource, ReadSlice};
use std::sync::Arc;
use tokio::time::Instant;

/// Crop window for one beam, with the per-segment arrays that produced it.
#[derive(Debug, Default)]
pub struct Region {
    /// Reference photon latitude per segment, trimmed to start at
    /// `first_segment`.
    pub segment_lat: Vec<f64>,
    pub segment_lon: Vec<f64>,
    pub segment_ph_cnt: Vec<i32>,

    pub first_segment: usize,
    /// `None` reads every segment (no spatial filter).
    pub num_segments: Option<usize>,
    pub first_photon: usize,
    /// `None` reads every photon (no spatial filter).
    pub num_photons: Option<usize>,

    /// Per-segment inclusion bits for raster crops, indexed from
    /// `first_segment`.
    pub inclusion_mask: Option<Vec<bool>>,
}

impl Region {
    /// Read the geolocation arrays and crop them against `filter`.
    pub async fn fetch(
        source: &Arc<dyn DataSource>,
        resource: &str,
        prefix: &str,
        filter: &SpatialFilter,
        deadline: Instant,
    ) -> Result<Region> {
        let lat = ArrayHandle::<f64>::launch(
            source.clone(),
            resource,
            &format!("{}/geolocation/reference_photon_lat", prefix),
            ReadSlice::all(),
        );
        let lon = ArrayHandle::<f64>::launch(
            source.clone(),
            resource,
            &format!("{}/geolocation/reference_photon_lon", prefix),
            ReadSlice::all(),
        );
        let ph_cnt = ArrayHandle::<i32>::launch(
            source.clone(),
            resource,
            &format!("{}/geolocation/segment_ph_cnt", prefix),
            ReadSlice::all(),
        );

        let mut region = Region {
            segment_lat: lat.join(deadline).await?,
            segment_lon: lon.join(deadline).await?,
            segment_ph_cnt: ph_cnt.join(deadline).await?,
            ..Default::default()
        };

        if region.segment_lat.len() != region.segment_ph_cnt.len()
            || region.segment_lon.len() != region.segment_ph_cnt.len()
        {
            return Err(SubsetError::DataInvariant(format!(
                "geolocation arrays disagree on length {}",
                region.segment_ph_cnt.len()
            )));
        }

        match filter {
            SpatialFilter::None => return Ok(region),
            SpatialFilter::Polygon(polygon) => {
                let projector = PlaneProjector::new(&polygon.projection)?;
                let poly = ProjectedPolygon::new(&polygon.ring)?;
                region.crop_polygon(&projector, &poly)?;
            }
            SpatialFilter::Raster(mask) => {
                region.crop_raster(mask.as_ref());
            }
        }

        if region.num_photons.unwrap_or(0) == 0 {
            return Err(SubsetError::EmptySubset);
        }

        // Trim the leading segments so downstream indexing is crop-relative.
        region.segment_lat.drain(..region.first_segment);
        region.segment_lon.drain(..region.first_segment);
        region.segment_ph_cnt.drain(..region.first_segment);

        Ok(region)
    }

    /// Scan forward for the first included non-empty segment, then extend the
    /// crop until the first excluded non-empty segment.
    fn crop_polygon(&mut self, projector: &PlaneProjector, poly: &ProjectedPolygon) -> Result<()> {
        let mut first_segment_found = false;
        let mut num_photons: usize = 0;
        let mut segment = 0;

        while segment < self.segment_ph_cnt.len() {
            let (x, y) = projector.project(self.segment_lon[segment], self.segment_lat[segment])?;
            let inclusion = poly.contains(x, y);
            let count = self.segment_ph_cnt[segment] as usize;

            if !first_segment_found {
                if inclusion && count != 0 {
                    first_segment_found = true;
                    self.first_segment = segment;
                    num_photons = count;
                } else {
                    self.first_photon += count;
                }
            } else {
                if !inclusion && count != 0 {
                    break; // full extent found
                }
                num_photons += count;
            }

            segment += 1;
        }

        if first_segment_found {
            self.num_segments = Some(segment - self.first_segment);
            self.num_photons = Some(num_photons);
        } else {
            self.num_segments = Some(0);
            self.num_photons = Some(0);
        }
        Ok(())
    }

    /// Scan the whole array, tracking the last included non-empty segment;
    /// everything through it stays in the crop under a per-segment mask.
    fn crop_raster(&mut self, mask: &dyn RasterMask) {
        let len = self.segment_ph_cnt.len();
        if len == 0 {
            self.num_segments = Some(0);
            self.num_photons = Some(0);
            return;
        }

        let mut inclusion_mask = vec![false; len];
        let mut first_segment_found = false;
        let mut curr_num_photons: usize = 0;
        let mut num_photons: usize = 0;
        let mut last_segment = 0;

        for segment in 0..len {
            let count = self.segment_ph_cnt[segment] as usize;
            if count == 0 {
                continue;
            }

            let inclusion = mask.includes(self.segment_lon[segment], self.segment_lat[segment]);
            inclusion_mask[segment] = inclusion;

            if !first_segment_found {
                if inclusion {
                    first_segment_found = true;
                    self.first_segment = segment;
                    last_segment = segment;
                    curr_num_photons = count;
                    num_photons = curr_num_photons;
                } else {
                    self.first_photon += count;
                }
            } else {
                curr_num_photons += count;
                if inclusion {
                    num_photons = curr_num_photons;
                    last_segment = segment;
                }
            }
        }

        if first_segment_found {
            let num_segments = last_segment - self.first_segment + 1;
            self.num_segments = Some(num_segments);
            self.num_photons = Some(num_photons);
            self.inclusion_mask =
                Some(inclusion_mask[self.first_segment..self.first_segment + num_segments].to_vec());
        } else {
            self.num_segments = Some(0);
            self.num_photons = Some(0);
        }
    }

    /// Photon-axis read window.
    pub fn photon_slice(&self) -> ReadSlice {
        ReadSlice::rows(self.first_photon, self.num_photons)
    }

    /// Segment-axis read window.
    pub fn segment_slice(&self) -> ReadSlice {
        ReadSlice::rows(self.first_segment, self.num_segments)
    }
}
