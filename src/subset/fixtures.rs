//! In-memory granule builders shared by the pipeline tests.

use crate::io::{ArrayData, DataSource, MemorySource};
use crate::resource::atl08_companion;
use std::sync::Arc;

pub(crate) const TEST_RESOURCE: &str = "ATL03_20181019065445_03150111_005_01.h5";

/// One beam's worth of ATL03 (and optionally ATL08) datasets with sensible
/// defaults: segments every 20 m, photons spread evenly inside each segment,
/// high-confidence nominal-quality photons at 100 m height.
pub(crate) struct BeamFixture {
    pub resource: String,
    pub prefix: String,
    pub sc_orient: u8,
    pub segment_ids: Vec<i32>,
    pub segment_ph_cnt: Vec<i32>,
    pub segment_dist_x: Vec<f64>,
    pub segment_delta_time: Vec<f64>,
    pub solar_elevation: Vec<f32>,
    pub segment_lat: Vec<f64>,
    pub segment_lon: Vec<f64>,
    pub velocity: [f32; 3],
    pub dist_ph_along: Vec<f32>,
    pub h_ph: Vec<f32>,
    pub signal_conf: Vec<i8>,
    pub quality: Vec<i8>,
    pub bckgrd_delta_time: Vec<f64>,
    pub bckgrd_rate: Vec<f64>,

    /// ATL08 signal-photon rows `(ph_segment_id, classed_pc_indx,
    /// classed_pc_flag)`; empty leaves the companion granule out entirely.
    pub atl08_rows: Vec<(i32, i32, i32)>,
    pub atl08_ph_h: Vec<f32>,
    pub atl08_segment_id_beg: Vec<i32>,
    pub atl08_landcover: Vec<i32>,
    pub atl08_snowcover: Vec<i32>,
    pub extra_atl08_datasets: Vec<(String, Vec<f64>)>,

    /// Extra ATL03 datasets relative to the beam prefix, e.g.
    /// `("geolocation/ref_azimuth", values)`.
    pub extra_segment_datasets: Vec<(String, Vec<f64>)>,
    pub extra_photon_datasets: Vec<(String, Vec<f64>)>,
}

impl BeamFixture {
    pub fn new(segment_ids: &[i32], segment_ph_cnt: &[i32]) -> Self {
        assert_eq!(segment_ids.len(), segment_ph_cnt.len());
        let num_segments = segment_ids.len();
        let num_photons: usize = segment_ph_cnt.iter().map(|&c| c as usize).sum();

        let mut dist_ph_along = Vec::with_capacity(num_photons);
        for &count in segment_ph_cnt {
            for j in 0..count {
                dist_ph_along.push(j as f32 * 20.0 / count.max(1) as f32);
            }
        }

        Self {
            resource: TEST_RESOURCE.to_string(),
            prefix: "/gt1l".to_string(),
            sc_orient: 0,
            segment_ids: segment_ids.to_vec(),
            segment_ph_cnt: segment_ph_cnt.to_vec(),
            segment_dist_x: (0..num_segments).map(|i| 1000.0 + 20.0 * i as f64).collect(),
            segment_delta_time: (0..num_segments).map(|i| i as f64).collect(),
            solar_elevation: vec![-10.0; num_segments],
            segment_lat: vec![0.0; num_segments],
            segment_lon: (0..num_segments).map(|i| i as f64).collect(),
            velocity: [7000.0, 0.0, 0.0],
            dist_ph_along,
            h_ph: vec![100.0; num_photons],
            signal_conf: vec![4; num_photons],
            quality: vec![0; num_photons],
            bckgrd_delta_time: vec![0.0, 1.0e9],
            bckgrd_rate: vec![100.0, 100.0],
            atl08_rows: Vec::new(),
            atl08_ph_h: Vec::new(),
            atl08_segment_id_beg: Vec::new(),
            atl08_landcover: Vec::new(),
            atl08_snowcover: Vec::new(),
            extra_atl08_datasets: Vec::new(),
            extra_segment_datasets: Vec::new(),
            extra_photon_datasets: Vec::new(),
        }
    }

    pub fn num_photons(&self) -> usize {
        self.dist_ph_along.len()
    }

    pub fn install(&self, source: &mut MemorySource) {
        let res = &self.resource;
        let pre = |name: &str| format!("{}/{}", self.prefix, name);
        let num_photons = self.num_photons();

        source.insert(
            res,
            "/orbit_info/sc_orient",
            ArrayData::UInt8(vec![self.sc_orient]),
        );
        source.insert(
            res,
            &pre("geolocation/reference_photon_lat"),
            ArrayData::Double(self.segment_lat.clone()),
        );
        source.insert(
            res,
            &pre("geolocation/reference_photon_lon"),
            ArrayData::Double(self.segment_lon.clone()),
        );
        source.insert(
            res,
            &pre("geolocation/segment_ph_cnt"),
            ArrayData::Int32(self.segment_ph_cnt.clone()),
        );
        source.insert(
            res,
            &pre("geolocation/delta_time"),
            ArrayData::Double(self.segment_delta_time.clone()),
        );
        source.insert(
            res,
            &pre("geolocation/segment_id"),
            ArrayData::Int32(self.segment_ids.clone()),
        );
        source.insert(
            res,
            &pre("geolocation/segment_dist_x"),
            ArrayData::Double(self.segment_dist_x.clone()),
        );
        source.insert(
            res,
            &pre("geolocation/solar_elevation"),
            ArrayData::Float(self.solar_elevation.clone()),
        );
        let velocity: Vec<f32> = self
            .segment_ids
            .iter()
            .flat_map(|_| self.velocity)
            .collect();
        source.insert_cols(res, &pre("geolocation/velocity_sc"), ArrayData::Float(velocity), 3);

        source.insert(
            res,
            &pre("heights/dist_ph_along"),
            ArrayData::Float(self.dist_ph_along.clone()),
        );
        source.insert(
            res,
            &pre("heights/dist_ph_across"),
            ArrayData::Float(vec![0.0; num_photons]),
        );
        source.insert(res, &pre("heights/h_ph"), ArrayData::Float(self.h_ph.clone()));
        let conf: Vec<i8> = self
            .signal_conf
            .iter()
            .flat_map(|&v| std::iter::repeat(v).take(5))
            .collect();
        source.insert_cols(res, &pre("heights/signal_conf_ph"), ArrayData::Int8(conf), 5);
        source.insert(
            res,
            &pre("heights/quality_ph"),
            ArrayData::Int8(self.quality.clone()),
        );
        source.insert(
            res,
            &pre("heights/lat_ph"),
            ArrayData::Double((0..num_photons).map(|i| 40.0 + i as f64 * 1e-5).collect()),
        );
        source.insert(
            res,
            &pre("heights/lon_ph"),
            ArrayData::Double(vec![-105.0; num_photons]),
        );
        source.insert(
            res,
            &pre("heights/delta_time"),
            ArrayData::Double((0..num_photons).map(|i| i as f64 * 1e-3).collect()),
        );

        source.insert(
            res,
            &pre("bckgrd_atlas/delta_time"),
            ArrayData::Double(self.bckgrd_delta_time.clone()),
        );
        source.insert(
            res,
            &pre("bckgrd_atlas/bckgrd_rate"),
            ArrayData::Double(self.bckgrd_rate.clone()),
        );

        for (name, values) in &self.extra_segment_datasets {
            source.insert(res, &pre(name), ArrayData::Double(values.clone()));
        }
        for (name, values) in &self.extra_photon_datasets {
            source.insert(res, &pre(name), ArrayData::Double(values.clone()));
        }

        if !self.atl08_rows.is_empty() {
            let res08 = atl08_companion(res);
            let seg_ids: Vec<i32> = self.atl08_rows.iter().map(|r| r.0).collect();
            let indices: Vec<i32> = self.atl08_rows.iter().map(|r| r.1).collect();
            let flags: Vec<i32> = self.atl08_rows.iter().map(|r| r.2).collect();
            source.insert(
                &res08,
                &pre("signal_photons/ph_segment_id"),
                ArrayData::Int32(seg_ids),
            );
            source.insert(
                &res08,
                &pre("signal_photons/classed_pc_indx"),
                ArrayData::Int32(indices),
            );
            source.insert(
                &res08,
                &pre("signal_photons/classed_pc_flag"),
                ArrayData::Int32(flags),
            );

            let ph_h = if self.atl08_ph_h.is_empty() {
                vec![0.0; self.atl08_rows.len()]
            } else {
                self.atl08_ph_h.clone()
            };
            source.insert(&res08, &pre("signal_photons/ph_h"), ArrayData::Float(ph_h));

            let seg_beg = if self.atl08_segment_id_beg.is_empty() {
                vec![self.segment_ids[0]]
            } else {
                self.atl08_segment_id_beg.clone()
            };
            let num_land = seg_beg.len();
            source.insert(
                &res08,
                &pre("land_segments/segment_id_beg"),
                ArrayData::Int32(seg_beg),
            );
            let landcover = if self.atl08_landcover.is_empty() {
                vec![0; num_land]
            } else {
                self.atl08_landcover.clone()
            };
            source.insert(
                &res08,
                &pre("land_segments/segment_landcover"),
                ArrayData::Int32(landcover),
            );
            let snowcover = if self.atl08_snowcover.is_empty() {
                vec![0; num_land]
            } else {
                self.atl08_snowcover.clone()
            };
            source.insert(
                &res08,
                &pre("land_segments/segment_snowcover"),
                ArrayData::Int32(snowcover),
            );

            for (name, values) in &self.extra_atl08_datasets {
                source.insert(
                    &res08,
                    &format!("{}/land_segments/{}", self.prefix, name),
                    ArrayData::Double(values.clone()),
                );
            }
        }
    }

    pub fn source(&self) -> Arc<dyn DataSource> {
        let mut source = MemorySource::new();
        self.install(&mut source);
        Arc::new(source)
    }
}
