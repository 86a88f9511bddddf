//! The ATL03 dataset bundle.
//!
//! Every array the pipeline needs is launched as an async read the moment the
//! bundle is constructed, parameterized by the region crop, then joined
//! against one shared deadline. Ancillary field lists are materialized as
//! name-keyed arrays in the caller's list order, so the `field_index` stamped
//! into ancillary records is reproducible run to run.

use crate::config::SubsetConfig;
use crate::error::{Result, SubsetError};
use crate::io::{ArrayData, ArrayHandle, ColumnSel, DataSource, RawHandle, ReadSlice};
use crate::subset::region::Region;
use std::sync::Arc;
use tokio::time::Instant;

/// Field prefixes resolved to the geophys_corr group instead of geolocation.
const GEOPHYS_PREFIXES: [&str; 4] = ["tid", "geo", "dem", "dac"];

/// All ATL03 arrays for one beam, materialized.
#[derive(Debug, Default)]
pub struct Atl03Data {
    /// Spacecraft orientation; a single-element array for non-transitional
    /// granules.
    pub sc_orient: Vec<u8>,
    /// Spacecraft velocity, 3 components per segment.
    pub velocity_sc: Vec<f32>,
    pub segment_delta_time: Vec<f64>,
    pub segment_id: Vec<i32>,
    pub segment_dist_x: Vec<f64>,
    pub solar_elevation: Vec<f32>,

    pub dist_ph_along: Vec<f32>,
    pub dist_ph_across: Vec<f32>,
    pub h_ph: Vec<f32>,
    /// Signal confidence for the configured surface type.
    pub signal_conf_ph: Vec<i8>,
    pub quality_ph: Vec<i8>,
    pub lat_ph: Vec<f64>,
    pub lon_ph: Vec<f64>,
    pub delta_time: Vec<f64>,

    pub bckgrd_delta_time: Vec<f64>,
    pub bckgrd_rate: Vec<f64>,

    /// Caller-selected per-segment fields, in list order.
    pub anc_geo_data: Option<Vec<(String, ArrayData)>>,
    /// Caller-selected per-photon fields, in list order.
    pub anc_ph_data: Option<Vec<(String, ArrayData)>>,
}

impl Atl03Data {
    /// Launch every read and join them all against `deadline`.
    pub async fn fetch(
        source: &Arc<dyn DataSource>,
        resource: &str,
        prefix: &str,
        parms: &SubsetConfig,
        region: &Region,
        deadline: Instant,
    ) -> Result<Atl03Data> {
        let seg = region.segment_slice();
        let ph = region.photon_slice();
        let geoloc = |name: &str| format!("{}/geolocation/{}", prefix, name);
        let heights = |name: &str| format!("{}/heights/{}", prefix, name);
        let bckgrd = |name: &str| format!("{}/bckgrd_atlas/{}", prefix, name);

        let sc_orient = ArrayHandle::<u8>::launch(
            source.clone(),
            resource,
            "/orbit_info/sc_orient",
            ReadSlice::all(),
        );
        let velocity_sc = ArrayHandle::<f32>::launch(
            source.clone(),
            resource,
            &geoloc("velocity_sc"),
            seg.with_column(ColumnSel::All),
        );
        let segment_delta_time =
            ArrayHandle::<f64>::launch(source.clone(), resource, &geoloc("delta_time"), seg);
        let segment_id =
            ArrayHandle::<i32>::launch(source.clone(), resource, &geoloc("segment_id"), seg);
        let segment_dist_x =
            ArrayHandle::<f64>::launch(source.clone(), resource, &geoloc("segment_dist_x"), seg);
        let solar_elevation =
            ArrayHandle::<f32>::launch(source.clone(), resource, &geoloc("solar_elevation"), seg);

        let dist_ph_along =
            ArrayHandle::<f32>::launch(source.clone(), resource, &heights("dist_ph_along"), ph);
        let dist_ph_across =
            ArrayHandle::<f32>::launch(source.clone(), resource, &heights("dist_ph_across"), ph);
        let h_ph = ArrayHandle::<f32>::launch(source.clone(), resource, &heights("h_ph"), ph);
        let signal_conf_ph = ArrayHandle::<i8>::launch(
            source.clone(),
            resource,
            &heights("signal_conf_ph"),
            ph.with_column(ColumnSel::Index(parms.surface_type.column())),
        );
        let quality_ph =
            ArrayHandle::<i8>::launch(source.clone(), resource, &heights("quality_ph"), ph);
        let lat_ph = ArrayHandle::<f64>::launch(source.clone(), resource, &heights("lat_ph"), ph);
        let lon_ph = ArrayHandle::<f64>::launch(source.clone(), resource, &heights("lon_ph"), ph);
        let delta_time =
            ArrayHandle::<f64>::launch(source.clone(), resource, &heights("delta_time"), ph);

        let bckgrd_delta_time = ArrayHandle::<f64>::launch(
            source.clone(),
            resource,
            &bckgrd("delta_time"),
            ReadSlice::all(),
        );
        let bckgrd_rate = ArrayHandle::<f64>::launch(
            source.clone(),
            resource,
            &bckgrd("bckgrd_rate"),
            ReadSlice::all(),
        );

        let anc_geo_handles: Option<Vec<RawHandle>> = if parms.atl03_geo_fields.is_empty() {
            None
        } else {
            Some(
                parms
                    .atl03_geo_fields
                    .iter()
                    .map(|field| {
                        let group = if GEOPHYS_PREFIXES.iter().any(|p| field.starts_with(p)) {
                            "geophys_corr"
                        } else {
                            "geolocation"
                        };
                        RawHandle::launch(
                            source.clone(),
                            resource,
                            field,
                            &format!("{}/{}/{}", prefix, group, field),
                            seg,
                        )
                    })
                    .collect(),
            )
        };

        let anc_ph_handles: Option<Vec<RawHandle>> = if parms.atl03_ph_fields.is_empty() {
            None
        } else {
            Some(
                parms
                    .atl03_ph_fields
                    .iter()
                    .map(|field| {
                        RawHandle::launch(source.clone(), resource, field, &heights(field), ph)
                    })
                    .collect(),
            )
        };

        let mut data = Atl03Data {
            sc_orient: sc_orient.join(deadline).await?,
            velocity_sc: velocity_sc.join(deadline).await?,
            segment_delta_time: segment_delta_time.join(deadline).await?,
            segment_id: segment_id.join(deadline).await?,
            segment_dist_x: segment_dist_x.join(deadline).await?,
            solar_elevation: solar_elevation.join(deadline).await?,
            dist_ph_along: dist_ph_along.join(deadline).await?,
            dist_ph_across: dist_ph_across.join(deadline).await?,
            h_ph: h_ph.join(deadline).await?,
            signal_conf_ph: signal_conf_ph.join(deadline).await?,
            quality_ph: quality_ph.join(deadline).await?,
            lat_ph: lat_ph.join(deadline).await?,
            lon_ph: lon_ph.join(deadline).await?,
            delta_time: delta_time.join(deadline).await?,
            bckgrd_delta_time: bckgrd_delta_time.join(deadline).await?,
            bckgrd_rate: bckgrd_rate.join(deadline).await?,
            anc_geo_data: None,
            anc_ph_data: None,
        };

        if let Some(handles) = anc_geo_handles {
            let mut fields = Vec::with_capacity(handles.len());
            for handle in handles {
                fields.push(handle.join(deadline).await?);
            }
            data.anc_geo_data = Some(fields);
        }

        if let Some(handles) = anc_ph_handles {
            let mut fields = Vec::with_capacity(handles.len());
            for handle in handles {
                fields.push(handle.join(deadline).await?);
            }
            data.anc_ph_data = Some(fields);
        }

        data.check_shape()?;
        Ok(data)
    }

    /// Reject bundles whose arrays disagree on the photon or segment axis.
    fn check_shape(&self) -> Result<()> {
        let num_photons = self.dist_ph_along.len();
        let photon_axes = [
            self.dist_ph_across.len(),
            self.h_ph.len(),
            self.signal_conf_ph.len(),
            self.quality_ph.len(),
            self.lat_ph.len(),
            self.lon_ph.len(),
            self.delta_time.len(),
        ];
        if photon_axes.iter().any(|&len| len != num_photons) {
            return Err(SubsetError::DataInvariant(format!(
                "photon arrays disagree on length {}",
                num_photons
            )));
        }

        let num_segments = self.segment_id.len();
        let segment_axes = [
            self.segment_delta_time.len(),
            self.segment_dist_x.len(),
            self.solar_elevation.len(),
        ];
        if segment_axes.iter().any(|&len| len != num_segments)
            || self.velocity_sc.len() != num_segments * 3
        {
            return Err(SubsetError::DataInvariant(format!(
                "segment arrays disagree on length {}",
                num_segments
            )));
        }
        if self.bckgrd_delta_time.len() != self.bckgrd_rate.len() {
            return Err(SubsetError::DataInvariant(
                "background arrays disagree on length".to_string(),
            ));
        }
        Ok(())
    }

    pub fn num_photons(&self) -> usize {
        self.dist_ph_along.len()
    }

    pub fn num_segments(&self) -> usize {
        self.segment_id.len()
    }
}
