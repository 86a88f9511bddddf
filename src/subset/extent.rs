//! The extent state machine.
//!
//! A single forward pass over the photon axis that emits one extent per step:
//! extents are `extent_length` long and advance by `extent_step`, both in
//! meters or in whole segments. Each surviving photon passes the confidence,
//! quality, class, score, and region filters; out-of-range confidence,
//! quality, or class values are fatal for the beam.

use crate::config::SubsetConfig;
use crate::error::{Result, SubsetError};
use crate::io::ArrayData;
use crate::records::{AncillaryKind, AncillaryRecord, ExtentRecord, PhotonRecord};
use crate::resource::ResourceIds;
use crate::subset::atl03::Atl03Data;
use crate::subset::atl08::Atl08Class;
use crate::subset::region::Region;
use crate::subset::yapc::YapcScore;
use crate::subset::{
    delta_time_to_ns, pack_extent_id, Beam, ATL03_SEGMENT_LENGTH, ATL08_UNCLASSIFIED,
    CNF_POSSIBLE_TEP, CNF_SURFACE_HIGH, INVALID_FLAG, INVALID_INDICE, NUM_ATL08_CLASSES,
    QUALITY_NOMINAL, QUALITY_POSSIBLE_TEP, SIGNAL_CONF_OFFSET,
};

/// One advance of the state machine.
#[derive(Debug)]
pub enum Step {
    /// An extent survived validation (or `pass_invalid` let it through).
    Extent(ExtentBatch),
    /// The extent failed validation and was dropped.
    Filtered,
    /// The photon axis is exhausted.
    Complete,
}

/// An extent record plus its ancillary side-records.
#[derive(Debug)]
pub struct ExtentBatch {
    pub extent: ExtentRecord,
    pub ancillary: Vec<AncillaryRecord>,
}

/// Walks the photon axis of one beam, emitting extents in along-track order.
pub struct ExtentMachine<'a> {
    parms: &'a SubsetConfig,
    beam: Beam,
    ids: ResourceIds,
    region: &'a Region,
    atl03: &'a Atl03Data,
    atl08: &'a Atl08Class,
    yapc: &'a YapcScore,

    /// Extent length in meters regardless of `dist_in_seg`.
    extent_length_m: f64,

    ph_in: usize,
    seg_in: usize,
    seg_ph: i32,
    start_segment: usize,
    start_distance: f64,
    bckgrd_in: usize,
    track_complete: bool,
    extent_counter: u32,

    photons: Vec<PhotonRecord>,
    segment_indices: Option<Vec<i32>>,
    photon_indices: Option<Vec<i32>>,
    atl08_indices: Option<Vec<i32>>,
}

impl<'a> ExtentMachine<'a> {
    pub fn new(
        parms: &'a SubsetConfig,
        beam: Beam,
        ids: ResourceIds,
        region: &'a Region,
        atl03: &'a Atl03Data,
        atl08: &'a Atl08Class,
        yapc: &'a YapcScore,
    ) -> Self {
        let mut extent_length_m = parms.extent_length;
        if parms.dist_in_seg {
            extent_length_m *= ATL03_SEGMENT_LENGTH;
        }

        Self {
            parms,
            beam,
            ids,
            region,
            atl03,
            atl08,
            yapc,
            extent_length_m,
            ph_in: 0,
            seg_in: 0,
            seg_ph: 0,
            start_segment: 0,
            start_distance: atl03.segment_dist_x.first().copied().unwrap_or(0.0),
            bckgrd_in: 0,
            track_complete: atl03.num_photons() == 0 || atl03.segment_dist_x.is_empty(),
            extent_counter: 0,
            photons: Vec::new(),
            segment_indices: atl03.anc_geo_data.as_ref().map(|_| Vec::new()),
            photon_indices: atl03.anc_ph_data.as_ref().map(|_| Vec::new()),
            atl08_indices: atl08.anc_seg_data.as_ref().map(|_| Vec::new()),
        }
    }

    /// Advance by one extent.
    pub fn step(&mut self) -> Result<Step> {
        if self.track_complete {
            return Ok(Step::Complete);
        }

        let parms = self.parms;
        let atl03 = self.atl03;

        let mut current_photon = self.ph_in;
        let mut current_segment = self.seg_in;
        let mut current_count = self.seg_ph;
        let mut extent_complete = false;
        let mut step_complete = false;

        let start_seg_portion = atl03.dist_ph_along[current_photon] as f64 / ATL03_SEGMENT_LENGTH;
        let extent_segment = self.seg_in;
        self.photons.clear();
        if let Some(indices) = self.segment_indices.as_mut() {
            indices.clear();
        }
        if let Some(indices) = self.photon_indices.as_mut() {
            indices.clear();
        }
        if let Some(indices) = self.atl08_indices.as_mut() {
            indices.clear();
        }

        while !extent_complete || !step_complete {
            // Go to the photon's segment.
            current_count += 1;
            while current_segment < self.region.segment_ph_cnt.len()
                && current_count > self.region.segment_ph_cnt[current_segment]
            {
                current_count = 1;
                current_segment += 1;
            }

            if current_segment >= atl03.segment_dist_x.len() {
                tracing::error!(
                    "photons with no segments detected at segment {} of {}",
                    current_segment,
                    atl03.segment_dist_x.len()
                );
                self.track_complete = true;
                break;
            }

            let delta_distance = atl03.segment_dist_x[current_segment] - self.start_distance;
            let x_atc = delta_distance + atl03.dist_ph_along[current_photon] as f64;
            let along_track_segments = current_segment as i64 - extent_segment as i64;

            // Latch the next extent's first photon, once.
            if !step_complete
                && ((!parms.dist_in_seg && x_atc >= parms.extent_step)
                    || (parms.dist_in_seg && along_track_segments >= parms.extent_step as i64))
            {
                self.ph_in = current_photon;
                self.seg_in = current_segment;
                self.seg_ph = current_count - 1;
                step_complete = true;
            }

            if (!parms.dist_in_seg && x_atc < parms.extent_length)
                || (parms.dist_in_seg && along_track_segments < parms.extent_length as i64)
            {
                self.filter_photon(current_photon, current_segment, x_atc)?;
            } else {
                extent_complete = true;
            }

            current_photon += 1;
            if current_photon >= atl03.num_photons() {
                self.track_complete = true;
                break;
            }
        }

        // Distance from the equator at mid-extent.
        let seg_distance = self.start_distance + self.extent_length_m / 2.0;

        // Step the start distance forward for the next extent.
        if !parms.dist_in_seg {
            self.start_distance += parms.extent_step;

            // Absorb the surplus over 20 m of every crossed segment.
            while (self.start_segment + 1) < atl03.segment_dist_x.len()
                && self.start_distance >= atl03.segment_dist_x[self.start_segment + 1]
            {
                self.start_distance +=
                    atl03.segment_dist_x[self.start_segment + 1] - atl03.segment_dist_x[self.start_segment];
                self.start_distance -= ATL03_SEGMENT_LENGTH;
                self.start_segment += 1;
            }
        } else {
            let next_segment = extent_segment + parms.extent_step as usize;
            if next_segment < atl03.segment_dist_x.len() {
                self.start_distance = atl03.segment_dist_x[next_segment];
            }
        }

        let mut extent_valid = true;
        if self.photons.len() < parms.minimum_photon_count {
            extent_valid = false;
        }
        if self.photons.len() > 1 {
            let along_track_spread =
                (self.photons[self.photons.len() - 1].x_atc - self.photons[0].x_atc) as f64;
            if along_track_spread < parms.along_track_spread {
                extent_valid = false;
            }
        }

        let step = if extent_valid || parms.pass_invalid {
            Ok(Step::Extent(self.assemble(extent_segment, start_seg_portion, seg_distance, extent_valid)))
        } else {
            Ok(Step::Filtered)
        };

        self.extent_counter += 1;
        step
    }

    /// Apply the acceptance tables to one photon and accumulate it if it
    /// survives. Out-of-range values are fatal.
    fn filter_photon(&mut self, current_photon: usize, current_segment: usize, x_atc: f64) -> Result<()> {
        let parms = self.parms;
        let atl03 = self.atl03;

        let atl03_cnf = atl03.signal_conf_ph[current_photon];
        if !(CNF_POSSIBLE_TEP..=CNF_SURFACE_HIGH).contains(&atl03_cnf) {
            return Err(SubsetError::DataInvariant(format!(
                "invalid atl03 signal confidence: {}",
                atl03_cnf
            )));
        }
        if !parms.atl03_cnf[(atl03_cnf + SIGNAL_CONF_OFFSET) as usize] {
            return Ok(());
        }

        let quality_ph = atl03.quality_ph[current_photon];
        if !(QUALITY_NOMINAL..=QUALITY_POSSIBLE_TEP).contains(&quality_ph) {
            return Err(SubsetError::DataInvariant(format!(
                "invalid atl03 photon quality: {}",
                quality_ph
            )));
        }
        if !parms.quality_ph[quality_ph as usize] {
            return Ok(());
        }

        let mut atl08_class = ATL08_UNCLASSIFIED;
        if let Some(classification) = &self.atl08.classification {
            atl08_class = classification[current_photon];
            if atl08_class as usize >= NUM_ATL08_CLASSES {
                return Err(SubsetError::DataInvariant(format!(
                    "invalid atl08 classification: {}",
                    atl08_class
                )));
            }
            if !parms.atl08_class[atl08_class as usize] {
                return Ok(());
            }
        }

        let mut yapc_score = 0u8;
        if let Some(scores) = &self.yapc.score {
            yapc_score = scores[current_photon];
            if yapc_score < parms.yapc.score {
                return Ok(());
            }
        }

        if let Some(mask) = &self.region.inclusion_mask {
            if !mask[current_segment] {
                return Ok(());
            }
        }

        let mut relief = 0.0f32;
        let mut landcover_flag = INVALID_FLAG;
        let mut snowcover_flag = INVALID_FLAG;
        if self.atl08.phoreal {
            if let (Some(reliefs), Some(landcovers), Some(snowcovers)) =
                (&self.atl08.relief, &self.atl08.landcover, &self.atl08.snowcover)
            {
                relief = if !parms.phoreal.use_abs_h {
                    reliefs[current_photon]
                } else {
                    atl03.h_ph[current_photon]
                };
                landcover_flag = landcovers[current_photon];
                snowcover_flag = snowcovers[current_photon];
            }
        }

        self.photons.push(PhotonRecord {
            time_ns: delta_time_to_ns(atl03.delta_time[current_photon]),
            latitude: atl03.lat_ph[current_photon],
            longitude: atl03.lon_ph[current_photon],
            x_atc: (x_atc - self.extent_length_m / 2.0) as f32,
            y_atc: atl03.dist_ph_across[current_photon],
            height: atl03.h_ph[current_photon],
            relief,
            landcover: landcover_flag,
            snowcover: snowcover_flag,
            atl08_class,
            atl03_cnf,
            quality_ph,
            yapc_score,
        });

        if let Some(indices) = self.segment_indices.as_mut() {
            indices.push(current_segment as i32);
        }
        if let Some(indices) = self.photon_indices.as_mut() {
            indices.push(current_photon as i32);
        }
        if let Some(indices) = self.atl08_indices.as_mut() {
            let back_index = self
                .atl08
                .anc_seg_indices
                .as_ref()
                .map(|v| v[current_photon])
                .unwrap_or(INVALID_INDICE);
            indices.push(back_index);
        }

        Ok(())
    }

    fn assemble(
        &mut self,
        extent_segment: usize,
        start_seg_portion: f64,
        seg_distance: f64,
        extent_valid: bool,
    ) -> ExtentBatch {
        let atl03 = self.atl03;
        let extent_id = pack_extent_id(
            self.ids.rgt,
            self.ids.cycle,
            self.ids.region,
            self.beam.track,
            self.beam.pair,
            self.extent_counter,
        );

        let sc_v_offset = extent_segment * 3;
        let sc_v1 = atl03.velocity_sc[sc_v_offset] as f64;
        let sc_v2 = atl03.velocity_sc[sc_v_offset + 1] as f64;
        let sc_v3 = atl03.velocity_sc[sc_v_offset + 2] as f64;
        let spacecraft_velocity = (sc_v1 * sc_v1 + sc_v2 * sc_v2 + sc_v3 * sc_v3).sqrt() as f32;

        let extent = ExtentRecord {
            track: self.beam.track,
            pair: self.beam.pair,
            sc_orient: atl03.sc_orient.first().copied().unwrap_or(0),
            valid: extent_valid,
            rgt: self.ids.rgt,
            cycle: self.ids.cycle as u16,
            segment_id: self.calculate_segment_id(extent_segment, start_seg_portion),
            segment_dist: seg_distance,
            extent_length: self.extent_length_m,
            background_rate: self.calculate_background(extent_segment),
            solar_elevation: atl03.solar_elevation[extent_segment],
            spacecraft_velocity,
            extent_id,
            photons: self.photons.clone(),
        };

        let mut ancillary = Vec::new();
        if let (Some(fields), Some(indices)) = (&atl03.anc_ph_data, &self.photon_indices) {
            ancillary_records(extent_id, fields, AncillaryKind::Photon, indices, &mut ancillary);
        }
        if let (Some(fields), Some(indices)) = (&atl03.anc_geo_data, &self.segment_indices) {
            ancillary_records(extent_id, fields, AncillaryKind::Extent, indices, &mut ancillary);
        }
        if let (Some(fields), Some(indices)) = (&self.atl08.anc_seg_data, &self.atl08_indices) {
            ancillary_records(extent_id, fields, AncillaryKind::Atl08, indices, &mut ancillary);
        }

        ExtentBatch { extent, ancillary }
    }

    /// Closest ATL06 segment id represented by the extent mid-point.
    fn calculate_segment_id(&self, extent_segment: usize, start_seg_portion: f64) -> u32 {
        let mut atl06_segment_id = self.atl03.segment_id[extent_segment] as f64;
        if !self.parms.dist_in_seg {
            atl06_segment_id += start_seg_portion;
            atl06_segment_id += ((self.parms.extent_length / ATL03_SEGMENT_LENGTH) / 2.0).trunc();
        } else {
            atl06_segment_id += (self.parms.extent_length / 2.0).trunc();
        }
        (atl06_segment_id + 0.5) as u32
    }

    /// Piecewise-linear interpolation of the background rate onto the extent
    /// segment's delta time. The cursor only moves forward.
    fn calculate_background(&mut self, extent_segment: usize) -> f64 {
        let atl03 = self.atl03;
        let mut background_rate = atl03.bckgrd_rate.last().copied().unwrap_or(0.0);
        while self.bckgrd_in < atl03.bckgrd_rate.len() {
            let curr_bckgrd_time = atl03.bckgrd_delta_time[self.bckgrd_in];
            let segment_time = atl03.segment_delta_time[extent_segment];
            if curr_bckgrd_time >= segment_time {
                if self.bckgrd_in > 0 {
                    let prev_bckgrd_time = atl03.bckgrd_delta_time[self.bckgrd_in - 1];
                    let prev_bckgrd_rate = atl03.bckgrd_rate[self.bckgrd_in - 1];
                    let curr_bckgrd_rate = atl03.bckgrd_rate[self.bckgrd_in];

                    let bckgrd_run = curr_bckgrd_time - prev_bckgrd_time;
                    let bckgrd_rise = curr_bckgrd_rate - prev_bckgrd_rate;
                    let segment_to_bckgrd_delta = segment_time - prev_bckgrd_time;

                    background_rate =
                        (bckgrd_rise / bckgrd_run) * segment_to_bckgrd_delta + prev_bckgrd_rate;
                } else {
                    background_rate = atl03.bckgrd_rate[0];
                }
                break;
            }
            self.bckgrd_in += 1;
        }
        background_rate
    }
}

/// Serialize one ancillary field per record, filling `0xFF` for photons
/// without a valid back-index.
fn ancillary_records(
    extent_id: u64,
    fields: &[(String, ArrayData)],
    kind: AncillaryKind,
    indices: &[i32],
    out: &mut Vec<AncillaryRecord>,
) {
    for (field_index, (_name, array)) in fields.iter().enumerate() {
        let element_size = array.element_size();
        let mut data = Vec::with_capacity(element_size * indices.len());
        for &index in indices {
            if index != INVALID_INDICE {
                array.serialize(&mut data, index as usize, 1);
            } else {
                data.extend(std::iter::repeat(0xFFu8).take(element_size));
            }
        }
        out.push(AncillaryRecord {
            extent_id,
            anc_type: kind,
            field_index: field_index as u32,
            data_type: array.element_type(),
            num_elements: indices.len() as u32,
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Stages;
    use crate::geo::SpatialFilter;
    use crate::io::ElementType;
    use crate::resource::parse_resource;
    use crate::subset::atl08::Atl08Handles;
    use crate::subset::fixtures::BeamFixture;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    /// Accept every in-range confidence value.
    fn accept_all(parms: &mut SubsetConfig) {
        parms.atl03_cnf = [true; 7];
        parms.quality_ph = [true; 4];
    }

    struct Pipeline {
        region: Region,
        atl03: Atl03Data,
        atl08: Atl08Class,
        yapc: YapcScore,
        ids: ResourceIds,
    }

    async fn run_stages(fixture: &BeamFixture, parms: &SubsetConfig) -> Pipeline {
        run_stages_with_filter(fixture, parms, &SpatialFilter::None).await
    }

    async fn run_stages_with_filter(
        fixture: &BeamFixture,
        parms: &SubsetConfig,
        filter: &SpatialFilter,
    ) -> Pipeline {
        let source = fixture.source();
        let resource08 = crate::resource::atl08_companion(&fixture.resource);
        let handles = Atl08Handles::launch(&source, &resource08, &fixture.prefix, parms);
        let region = Region::fetch(&source, &fixture.resource, &fixture.prefix, filter, deadline())
            .await
            .unwrap();
        let atl03 = Atl03Data::fetch(
            &source,
            &fixture.resource,
            &fixture.prefix,
            parms,
            &region,
            deadline(),
        )
        .await
        .unwrap();
        let yapc = YapcScore::compute(parms, &region, &atl03).unwrap();
        let atl08 = Atl08Class::finish(handles, Beam::new(1, 0), parms, &region, &atl03, deadline())
            .await
            .unwrap();
        Pipeline {
            region,
            atl03,
            atl08,
            yapc,
            ids: parse_resource(&fixture.resource).unwrap(),
        }
    }

    fn drain(machine: &mut ExtentMachine<'_>) -> (Vec<ExtentBatch>, usize) {
        let mut batches = Vec::new();
        let mut filtered = 0;
        loop {
            match machine.step().unwrap() {
                Step::Extent(batch) => batches.push(batch),
                Step::Filtered => filtered += 1,
                Step::Complete => return (batches, filtered),
            }
        }
    }

    #[tokio::test]
    async fn test_single_segment_single_extent() {
        let fixture = BeamFixture::new(&[100], &[10]);
        let mut parms = SubsetConfig {
            extent_length: 20.0,
            extent_step: 20.0,
            ..Default::default()
        };
        accept_all(&mut parms);

        let p = run_stages(&fixture, &parms).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let (batches, filtered) = drain(&mut machine);

        assert_eq!(filtered, 0);
        assert_eq!(batches.len(), 1);
        let extent = &batches[0].extent;
        assert_eq!(extent.photons.len(), 10);
        assert!(extent.valid);
        assert_eq!(extent.rgt, 315);
        assert_eq!(extent.cycle, 1);
        // Photon x_atc is centered on the extent mid-point.
        for photon in &extent.photons {
            assert!(photon.x_atc >= -10.0 && photon.x_atc < 10.0);
        }
    }

    #[tokio::test]
    async fn test_extents_step_along_track() {
        let fixture = BeamFixture::new(&[100, 101, 102], &[10, 10, 10]);
        let mut parms = SubsetConfig {
            extent_length: 20.0,
            extent_step: 20.0,
            ..Default::default()
        };
        accept_all(&mut parms);

        let p = run_stages(&fixture, &parms).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let (batches, _) = drain(&mut machine);

        assert_eq!(batches.len(), 3);
        for pair in batches.windows(2) {
            assert!(pair[1].extent.extent_id > pair[0].extent.extent_id);
            assert!(pair[1].extent.segment_dist >= pair[0].extent.segment_dist);
        }
        for batch in &batches {
            assert_eq!(batch.extent.photons.len(), 10);
        }
        // ATL06-style segment id advances with the extent segment.
        assert_eq!(batches[0].extent.segment_id, 100);
        assert_eq!(batches[1].extent.segment_id, 101);
    }

    #[tokio::test]
    async fn test_confidence_filter_survivors() {
        // 100 photons uniformly across four confidence levels; accept only
        // the highest.
        let mut fixture = BeamFixture::new(&[100, 101, 102, 103, 104], &[20, 20, 20, 20, 20]);
        fixture.signal_conf = (0..100).map(|i| [1i8, 2, 3, 4][i % 4]).collect();

        let mut parms = SubsetConfig {
            extent_length: 2000.0,
            extent_step: 2000.0,
            ..Default::default()
        };
        accept_all(&mut parms);
        parms.atl03_cnf = [false; 7];
        parms.atl03_cnf[(CNF_SURFACE_HIGH + SIGNAL_CONF_OFFSET) as usize] = true;

        let p = run_stages(&fixture, &parms).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let (batches, _) = drain(&mut machine);

        let survivors: Vec<&PhotonRecord> =
            batches.iter().flat_map(|b| b.extent.photons.iter()).collect();
        assert_eq!(survivors.len(), 25);
        assert!(survivors.iter().all(|p| p.atl03_cnf == CNF_SURFACE_HIGH));
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_fatal() {
        let mut fixture = BeamFixture::new(&[100], &[3]);
        fixture.signal_conf = vec![4, 9, 4];
        let mut parms = SubsetConfig::default();
        accept_all(&mut parms);

        let p = run_stages(&fixture, &parms).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let err = machine.step().unwrap_err();
        assert!(matches!(err, SubsetError::DataInvariant(_)));
    }

    #[tokio::test]
    async fn test_background_interpolation() {
        let mut fixture = BeamFixture::new(&[100], &[5]);
        fixture.bckgrd_delta_time = vec![0.0, 10.0];
        fixture.bckgrd_rate = vec![100.0, 200.0];
        fixture.segment_delta_time = vec![7.0];

        let mut parms = SubsetConfig::default();
        accept_all(&mut parms);
        let p = run_stages(&fixture, &parms).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let (batches, _) = drain(&mut machine);

        assert_eq!(batches[0].extent.background_rate, 170.0);
    }

    #[tokio::test]
    async fn test_background_before_first_and_after_last_sample() {
        let mut fixture = BeamFixture::new(&[100, 101], &[5, 5]);
        fixture.bckgrd_delta_time = vec![5.0, 10.0];
        fixture.bckgrd_rate = vec![100.0, 200.0];
        // Segment 0 precedes the first sample, segment 1 follows the last.
        fixture.segment_delta_time = vec![2.0, 50.0];

        let mut parms = SubsetConfig {
            extent_length: 20.0,
            extent_step: 20.0,
            ..Default::default()
        };
        accept_all(&mut parms);
        let p = run_stages(&fixture, &parms).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let (batches, _) = drain(&mut machine);

        assert_eq!(batches[0].extent.background_rate, 100.0);
        assert_eq!(batches[1].extent.background_rate, 200.0);
    }

    #[tokio::test]
    async fn test_dist_in_seg_mode() {
        let fixture = BeamFixture::new(&[100, 101, 102, 103], &[4, 4, 4, 4]);
        let mut parms = SubsetConfig {
            extent_length: 2.0,
            extent_step: 2.0,
            dist_in_seg: true,
            ..Default::default()
        };
        accept_all(&mut parms);

        let p = run_stages(&fixture, &parms).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let (batches, _) = drain(&mut machine);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].extent.photons.len(), 8);
        assert_eq!(batches[1].extent.photons.len(), 8);
        // segment_id gains half the extent length in segments.
        assert_eq!(batches[0].extent.segment_id, 101);
    }

    #[tokio::test]
    async fn test_minimum_photon_count_filters_extent() {
        let fixture = BeamFixture::new(&[100], &[3]);
        let mut parms = SubsetConfig {
            minimum_photon_count: 5,
            ..Default::default()
        };
        accept_all(&mut parms);

        let p = run_stages(&fixture, &parms).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let (batches, filtered) = drain(&mut machine);
        assert!(batches.is_empty());
        assert_eq!(filtered, 1);
    }

    #[tokio::test]
    async fn test_pass_invalid_emits_marked_extent() {
        let fixture = BeamFixture::new(&[100], &[3]);
        let mut parms = SubsetConfig {
            minimum_photon_count: 5,
            pass_invalid: true,
            ..Default::default()
        };
        accept_all(&mut parms);

        let p = run_stages(&fixture, &parms).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let (batches, filtered) = drain(&mut machine);
        assert_eq!(filtered, 0);
        assert_eq!(batches.len(), 1);
        assert!(!batches[0].extent.valid);
    }

    #[tokio::test]
    async fn test_empty_extent_over_photon_gap() {
        // Photons in segment 0, a bare segment in the middle, photons beyond.
        let mut fixture = BeamFixture::new(&[100, 101, 102], &[5, 0, 5]);
        fixture.dist_ph_along = (0..10).map(|i| (i % 5) as f32 * 4.0).collect();
        let mut parms = SubsetConfig {
            extent_length: 20.0,
            extent_step: 20.0,
            minimum_photon_count: 1,
            pass_invalid: true,
            ..Default::default()
        };
        accept_all(&mut parms);

        let p = run_stages(&fixture, &parms).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let (batches, _) = drain(&mut machine);

        // The gap extent is emitted empty and invalid.
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].extent.photons.len(), 0);
        assert!(!batches[1].extent.valid);
        assert!(batches[0].extent.valid);
        assert!(batches[2].extent.valid);
    }

    #[tokio::test]
    async fn test_raster_mask_gates_photons() {
        #[derive(Debug)]
        struct FirstSegmentOnly;
        impl crate::geo::RasterMask for FirstSegmentOnly {
            fn includes(&self, lon: f64, _lat: f64) -> bool {
                lon < 0.5 || lon > 1.5
            }
        }

        // Segments at lon 0, 1, 2; the mask drops the middle one but the
        // crop keeps it (it precedes the last included segment).
        let fixture = BeamFixture::new(&[100, 101, 102], &[4, 4, 4]);
        let mut parms = SubsetConfig {
            extent_length: 60.0,
            extent_step: 60.0,
            ..Default::default()
        };
        accept_all(&mut parms);
        let filter = SpatialFilter::Raster(Arc::new(FirstSegmentOnly));

        let p = run_stages_with_filter(&fixture, &parms, &filter).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let (batches, _) = drain(&mut machine);

        let survivors: usize = batches.iter().map(|b| b.extent.photons.len()).sum();
        assert_eq!(survivors, 8);
    }

    #[tokio::test]
    async fn test_ancillary_records_per_field() {
        let mut fixture = BeamFixture::new(&[100, 101], &[2, 2]);
        fixture.extra_segment_datasets =
            vec![("geophys_corr/dem_h".to_string(), vec![1600.0, 1601.0])];
        fixture.extra_photon_datasets =
            vec![("heights/weight_ph".to_string(), vec![0.1, 0.2, 0.3, 0.4])];

        let mut parms = SubsetConfig {
            extent_length: 40.0,
            extent_step: 40.0,
            atl03_geo_fields: vec!["dem_h".to_string()],
            atl03_ph_fields: vec!["weight_ph".to_string()],
            ..Default::default()
        };
        accept_all(&mut parms);

        let p = run_stages(&fixture, &parms).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let (batches, _) = drain(&mut machine);

        assert_eq!(batches.len(), 1);
        let ancillary = &batches[0].ancillary;
        assert_eq!(ancillary.len(), 2);

        let photon_rec = ancillary
            .iter()
            .find(|a| a.anc_type == AncillaryKind::Photon)
            .unwrap();
        assert_eq!(photon_rec.num_elements, 4);
        assert_eq!(photon_rec.data_type, ElementType::Double);
        assert_eq!(photon_rec.data.len(), 4 * 8);

        let seg_rec = ancillary
            .iter()
            .find(|a| a.anc_type == AncillaryKind::Extent)
            .unwrap();
        assert_eq!(seg_rec.num_elements, 4);
        assert_eq!(seg_rec.extent_id, batches[0].extent.extent_id);
    }

    #[tokio::test]
    async fn test_atl08_ancillary_invalid_index_fill() {
        let mut fixture = BeamFixture::new(&[100], &[2]);
        // Only the first photon has an ATL08 row.
        fixture.atl08_rows = vec![(100, 1, 1)];
        fixture.atl08_segment_id_beg = vec![100];
        fixture.extra_atl08_datasets = vec![("h_canopy".to_string(), vec![12.5])];

        let mut parms = SubsetConfig {
            stages: Stages {
                atl08: true,
                yapc: false,
                phoreal: false,
            },
            atl08_fields: vec!["h_canopy".to_string()],
            ..Default::default()
        };
        accept_all(&mut parms);

        let p = run_stages(&fixture, &parms).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let (batches, _) = drain(&mut machine);

        let anc = &batches[0].ancillary[0];
        assert_eq!(anc.anc_type, AncillaryKind::Atl08);
        assert_eq!(anc.num_elements, 2);
        // Matched photon serializes the field; unmatched photon is 0xFF fill.
        assert_eq!(&anc.data[..8], &12.5f64.to_ne_bytes());
        assert_eq!(&anc.data[8..], &[0xFF; 8]);
    }

    #[tokio::test]
    async fn test_filter_conservation() {
        let mut fixture = BeamFixture::new(&[100, 101], &[10, 10]);
        fixture.signal_conf = (0..20).map(|i| [2i8, 3, 4][i % 3]).collect();
        fixture.quality = (0..20).map(|i| (i % 2) as i8).collect();

        let mut parms = SubsetConfig {
            extent_length: 40.0,
            extent_step: 40.0,
            ..Default::default()
        };
        accept_all(&mut parms);
        parms.atl03_cnf = [false; 7];
        parms.atl03_cnf[(CNF_SURFACE_HIGH + SIGNAL_CONF_OFFSET) as usize] = true;
        parms.quality_ph = [true, false, false, false];

        let p = run_stages(&fixture, &parms).await;
        let mut machine =
            ExtentMachine::new(&parms, Beam::new(1, 0), p.ids, &p.region, &p.atl03, &p.atl08, &p.yapc);
        let (batches, _) = drain(&mut machine);

        for batch in &batches {
            for photon in &batch.extent.photons {
                assert_eq!(photon.atl03_cnf, CNF_SURFACE_HIGH);
                assert_eq!(photon.quality_ph, 0);
            }
        }
    }
}
