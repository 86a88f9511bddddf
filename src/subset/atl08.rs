//! ATL08 classification join.
//!
//! ATL03 photons and ATL08 signal-photon rows are walked in parallel, keyed
//! by `(segment_id, 1-based photon index within segment)`. Reads against the
//! companion granule are launched before the region crop so they overlap the
//! ATL03 I/O; they are only joined once classification runs.

use crate::config::SubsetConfig;
use crate::error::{Result, SubsetError};
use crate::io::{ArrayData, ArrayHandle, DataSource, RawHandle, ReadSlice};
use crate::subset::atl03::Atl03Data;
use crate::subset::region::Region;
use crate::subset::{
    Beam, ATL08_TOP_OF_CANOPY, ATL08_UNCLASSIFIED, CNF_SURFACE_HIGH, INVALID_FLAG,
    INVALID_INDICE, NUM_ATL03_SEGS_IN_ATL08_SEG,
};
use std::sync::Arc;
use tokio::time::Instant;

/// In-flight ATL08 reads for one beam.
pub struct Atl08Handles {
    enabled: bool,
    phoreal: bool,
    ancillary: bool,
    segment_id: Option<ArrayHandle<i32>>,
    pc_indx: Option<ArrayHandle<i32>>,
    pc_flag: Option<ArrayHandle<i32>>,
    ph_h: Option<ArrayHandle<f32>>,
    segment_id_beg: Option<ArrayHandle<i32>>,
    segment_landcover: Option<ArrayHandle<i32>>,
    segment_snowcover: Option<ArrayHandle<i32>>,
    anc_handles: Option<Vec<RawHandle>>,
}

impl Atl08Handles {
    /// Launch the reads this configuration needs. A disabled atl08 stage
    /// launches nothing.
    pub fn launch(
        source: &Arc<dyn DataSource>,
        resource08: &str,
        prefix: &str,
        parms: &SubsetConfig,
    ) -> Self {
        let enabled = parms.stages.atl08;
        let phoreal = parms.stages.phoreal;
        let ancillary = enabled && !parms.atl08_fields.is_empty();
        let signal = |name: &str| format!("{}/signal_photons/{}", prefix, name);
        let land = |name: &str| format!("{}/land_segments/{}", prefix, name);
        let launch_i32 = |dataset: String| {
            ArrayHandle::<i32>::launch(source.clone(), resource08, &dataset, ReadSlice::all())
        };

        let mut handles = Self {
            enabled,
            phoreal,
            ancillary,
            segment_id: None,
            pc_indx: None,
            pc_flag: None,
            ph_h: None,
            segment_id_beg: None,
            segment_landcover: None,
            segment_snowcover: None,
            anc_handles: None,
        };
        if !enabled {
            return handles;
        }

        handles.segment_id = Some(launch_i32(signal("ph_segment_id")));
        handles.pc_indx = Some(launch_i32(signal("classed_pc_indx")));
        handles.pc_flag = Some(launch_i32(signal("classed_pc_flag")));
        if phoreal {
            handles.ph_h = Some(ArrayHandle::<f32>::launch(
                source.clone(),
                resource08,
                &signal("ph_h"),
                ReadSlice::all(),
            ));
            handles.segment_landcover = Some(launch_i32(land("segment_landcover")));
            handles.segment_snowcover = Some(launch_i32(land("segment_snowcover")));
        }
        if phoreal || ancillary {
            handles.segment_id_beg = Some(launch_i32(land("segment_id_beg")));
        }
        if ancillary {
            handles.anc_handles = Some(
                parms
                    .atl08_fields
                    .iter()
                    .map(|field| {
                        RawHandle::launch(
                            source.clone(),
                            resource08,
                            field,
                            &land(field),
                            ReadSlice::all(),
                        )
                    })
                    .collect(),
            );
        }
        handles
    }
}

/// Per-photon ATL08 classification results.
#[derive(Debug, Default)]
pub struct Atl08Class {
    pub enabled: bool,
    pub phoreal: bool,
    pub ancillary: bool,

    /// ATL08 class per ATL03 photon; `None` when the stage is disabled.
    pub classification: Option<Vec<u8>>,
    pub relief: Option<Vec<f32>>,
    pub landcover: Option<Vec<u8>>,
    pub snowcover: Option<Vec<u8>>,

    /// Caller-selected per-land-segment fields, in list order.
    pub anc_seg_data: Option<Vec<(String, ArrayData)>>,
    /// ATL08 land-segment back-index per ATL03 photon.
    pub anc_seg_indices: Option<Vec<i32>>,
}

impl Atl08Class {
    /// Join the launched reads and classify every ATL03 photon.
    pub async fn finish(
        handles: Atl08Handles,
        beam: Beam,
        parms: &SubsetConfig,
        region: &Region,
        atl03: &Atl03Data,
        deadline: Instant,
    ) -> Result<Atl08Class> {
        let mut class = Atl08Class {
            enabled: handles.enabled,
            phoreal: handles.phoreal,
            ancillary: handles.ancillary,
            ..Default::default()
        };
        if !handles.enabled {
            return Ok(class);
        }

        let atl08_segment_id = handles.segment_id.unwrap().join(deadline).await?;
        let atl08_pc_indx = handles.pc_indx.unwrap().join(deadline).await?;
        let atl08_pc_flag = handles.pc_flag.unwrap().join(deadline).await?;
        let segment_id_beg = match handles.segment_id_beg {
            Some(handle) => handle.join(deadline).await?,
            None => Vec::new(),
        };
        let (ph_h, segment_landcover, segment_snowcover) = if handles.phoreal {
            (
                handles.ph_h.unwrap().join(deadline).await?,
                handles.segment_landcover.unwrap().join(deadline).await?,
                handles.segment_snowcover.unwrap().join(deadline).await?,
            )
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };
        if let Some(anc_handles) = handles.anc_handles {
            let mut fields = Vec::with_capacity(anc_handles.len());
            for handle in anc_handles {
                fields.push(handle.join(deadline).await?);
            }
            class.anc_seg_data = Some(fields);
        }

        let num_photons = atl03.num_photons();
        let mut classification = vec![ATL08_UNCLASSIFIED; num_photons];
        let mut relief = if class.phoreal {
            Some(vec![0.0f32; num_photons])
        } else {
            None
        };
        let mut landcover = if class.phoreal {
            Some(vec![INVALID_FLAG; num_photons])
        } else {
            None
        };
        let mut snowcover = if class.phoreal {
            Some(vec![INVALID_FLAG; num_photons])
        } else {
            None
        };
        let mut anc_seg_indices = if class.ancillary {
            Some(vec![INVALID_INDICE; num_photons])
        } else {
            None
        };

        let spot = beam.spot(atl03.sc_orient.first().copied().unwrap_or(0));
        let mut atl03_photon: usize = 0;
        let mut atl08_photon: usize = 0;
        let mut atl08_segment_index: usize = 0;

        for s in 0..atl03.segment_id.len() {
            let atl03_segment = atl03.segment_id[s];

            if class.phoreal || class.ancillary {
                while atl08_segment_index < segment_id_beg.len()
                    && segment_id_beg[atl08_segment_index] + NUM_ATL03_SEGS_IN_ATL08_SEG
                        <= atl03_segment
                {
                    atl08_segment_index += 1;
                }
            }

            let segment_count = region.segment_ph_cnt[s];
            for c in 1..=segment_count {
                if atl03_photon >= num_photons {
                    return Err(SubsetError::DataInvariant(format!(
                        "segment photon counts exceed {} photons",
                        num_photons
                    )));
                }
                while atl08_photon < atl08_segment_id.len()
                    && atl08_segment_id[atl08_photon] < atl03_segment
                {
                    atl08_photon += 1;
                }
                while atl08_photon < atl08_segment_id.len()
                    && atl08_segment_id[atl08_photon] == atl03_segment
                    && atl08_pc_indx[atl08_photon] < c
                {
                    atl08_photon += 1;
                }

                let matched = atl08_photon < atl08_segment_id.len()
                    && atl08_segment_id[atl08_photon] == atl03_segment
                    && atl08_pc_indx[atl08_photon] == c;

                if matched {
                    classification[atl03_photon] = atl08_pc_flag[atl08_photon] as u8;

                    if class.phoreal {
                        let land_index = atl08_segment_index.min(segment_id_beg.len().saturating_sub(1));
                        relief.as_mut().unwrap()[atl03_photon] = ph_h[atl08_photon];
                        landcover.as_mut().unwrap()[atl03_photon] =
                            segment_landcover.get(land_index).copied().unwrap_or(INVALID_FLAG as i32) as u8;
                        snowcover.as_mut().unwrap()[atl03_photon] =
                            segment_snowcover.get(land_index).copied().unwrap_or(INVALID_FLAG as i32) as u8;

                        // TODO: require valid ground photons in the ATL08
                        // segment before reclassifying to top of canopy.
                        if parms.phoreal.above_classifier
                            && classification[atl03_photon] != ATL08_TOP_OF_CANOPY
                        {
                            let ph_relief = relief.as_ref().unwrap()[atl03_photon];
                            if atl03.solar_elevation[s] <= 5.0
                                && matches!(spot, 1 | 3 | 5)
                                && atl03.signal_conf_ph[atl03_photon] == CNF_SURFACE_HIGH
                                && (0.0..35.0).contains(&ph_relief)
                            {
                                classification[atl03_photon] = ATL08_TOP_OF_CANOPY;
                            }
                        }
                    }

                    if let Some(indices) = anc_seg_indices.as_mut() {
                        indices[atl03_photon] = atl08_segment_index as i32;
                    }

                    atl08_photon += 1;
                } else {
                    classification[atl03_photon] = ATL08_UNCLASSIFIED;
                    if class.phoreal {
                        relief.as_mut().unwrap()[atl03_photon] = 0.0;
                        landcover.as_mut().unwrap()[atl03_photon] = INVALID_FLAG;
                        snowcover.as_mut().unwrap()[atl03_photon] = INVALID_FLAG;
                    }
                    if let Some(indices) = anc_seg_indices.as_mut() {
                        indices[atl03_photon] = INVALID_INDICE;
                    }
                }

                atl03_photon += 1;
            }
        }

        class.classification = Some(classification);
        class.relief = relief;
        class.landcover = landcover;
        class.snowcover = snowcover;
        class.anc_seg_indices = anc_seg_indices;
        Ok(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PhorealConfig, Stages};
    use crate::geo::SpatialFilter;
    use crate::subset::fixtures::BeamFixture;
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    async fn classify(fixture: &BeamFixture, parms: &SubsetConfig) -> Atl08Class {
        let source = fixture.source();
        let resource08 = crate::resource::atl08_companion(&fixture.resource);
        let handles = Atl08Handles::launch(&source, &resource08, &fixture.prefix, parms);
        let region = Region::fetch(
            &source,
            &fixture.resource,
            &fixture.prefix,
            &SpatialFilter::None,
            deadline(),
        )
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
        Atl08Class::finish(handles, Beam::new(1, 0), parms, &region, &atl03, deadline())
            .await
            .unwrap()
    }

    fn atl08_parms() -> SubsetConfig {
        SubsetConfig {
            stages: Stages {
                atl08: true,
                yapc: false,
                phoreal: false,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_join_with_gap() {
        // Segment 100 with 3 photons; ATL08 classifies photons 1 and 3.
        let mut fixture = BeamFixture::new(&[100], &[3]);
        fixture.atl08_rows = vec![(100, 1, 1), (100, 3, 3)];

        let class = classify(&fixture, &atl08_parms()).await;
        assert_eq!(
            class.classification.unwrap(),
            vec![1, ATL08_UNCLASSIFIED, 3]
        );
    }

    #[tokio::test]
    async fn test_join_across_segments() {
        let mut fixture = BeamFixture::new(&[100, 101], &[2, 2]);
        // Rows for a segment the crop skipped (99) must be walked past.
        fixture.atl08_rows = vec![(99, 1, 2), (100, 2, 1), (101, 1, 2), (101, 2, 3)];

        let class = classify(&fixture, &atl08_parms()).await;
        assert_eq!(class.classification.unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_disabled_stage_classifies_nothing() {
        let fixture = BeamFixture::new(&[100], &[2]);
        let class = classify(&fixture, &SubsetConfig::default()).await;
        assert!(!class.enabled);
        assert!(class.classification.is_none());
    }

    #[tokio::test]
    async fn test_phoreal_fields() {
        let mut fixture = BeamFixture::new(&[100], &[2]);
        fixture.atl08_rows = vec![(100, 1, 2), (100, 2, 2)];
        fixture.atl08_ph_h = vec![7.5, 9.0];
        fixture.atl08_segment_id_beg = vec![100];
        fixture.atl08_landcover = vec![111];
        fixture.atl08_snowcover = vec![1];

        let parms = SubsetConfig {
            stages: Stages {
                atl08: true,
                yapc: false,
                phoreal: true,
            },
            ..Default::default()
        };
        let class = classify(&fixture, &parms).await;
        assert_eq!(class.relief.unwrap(), vec![7.5, 9.0]);
        assert_eq!(class.landcover.unwrap(), vec![111, 111]);
        assert_eq!(class.snowcover.unwrap(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_phoreal_unmatched_photon_gets_sentinels() {
        let mut fixture = BeamFixture::new(&[100], &[2]);
        fixture.atl08_rows = vec![(100, 1, 2)];
        fixture.atl08_ph_h = vec![7.5];
        fixture.atl08_segment_id_beg = vec![100];
        fixture.atl08_landcover = vec![111];
        fixture.atl08_snowcover = vec![1];

        let parms = SubsetConfig {
            stages: Stages {
                atl08: true,
                yapc: false,
                phoreal: true,
            },
            ..Default::default()
        };
        let class = classify(&fixture, &parms).await;
        assert_eq!(class.relief.unwrap()[1], 0.0);
        assert_eq!(class.landcover.unwrap()[1], INVALID_FLAG);
        assert_eq!(class.snowcover.unwrap()[1], INVALID_FLAG);
    }

    #[tokio::test]
    async fn test_above_reclassifies_night_strong_beam_canopy() {
        // Ground photon at high confidence, low relief, sun below 5 degrees,
        // spot 1 (backward orientation, gt1l).
        let mut fixture = BeamFixture::new(&[100], &[1]);
        fixture.atl08_rows = vec![(100, 1, 1)];
        fixture.atl08_ph_h = vec![10.0];
        fixture.atl08_segment_id_beg = vec![100];
        fixture.solar_elevation = vec![2.0];
        fixture.sc_orient = 0;

        let parms = SubsetConfig {
            stages: Stages {
                atl08: true,
                yapc: false,
                phoreal: true,
            },
            phoreal: PhorealConfig {
                use_abs_h: false,
                above_classifier: true,
            },
            ..Default::default()
        };
        let class = classify(&fixture, &parms).await;
        assert_eq!(class.classification.unwrap(), vec![ATL08_TOP_OF_CANOPY]);
    }

    #[tokio::test]
    async fn test_above_leaves_daytime_photons_alone() {
        let mut fixture = BeamFixture::new(&[100], &[1]);
        fixture.atl08_rows = vec![(100, 1, 1)];
        fixture.atl08_ph_h = vec![10.0];
        fixture.atl08_segment_id_beg = vec![100];
        fixture.solar_elevation = vec![30.0];

        let parms = SubsetConfig {
            stages: Stages {
                atl08: true,
                yapc: false,
                phoreal: true,
            },
            phoreal: PhorealConfig {
                use_abs_h: false,
                above_classifier: true,
            },
            ..Default::default()
        };
        let class = classify(&fixture, &parms).await;
        assert_eq!(class.classification.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_ancillary_back_indices() {
        let mut fixture = BeamFixture::new(&[100, 105], &[1, 1]);
        // Two land segments of five ATL03 segments each.
        fixture.atl08_rows = vec![(100, 1, 1), (105, 1, 2)];
        fixture.atl08_segment_id_beg = vec![100, 105];
        fixture.extra_atl08_datasets = vec![("h_canopy".to_string(), vec![12.5, 14.0])];

        let parms = SubsetConfig {
            stages: Stages {
                atl08: true,
                yapc: false,
                phoreal: false,
            },
            atl08_fields: vec!["h_canopy".to_string()],
            ..Default::default()
        };
        let class = classify(&fixture, &parms).await;
        assert_eq!(class.anc_seg_indices.unwrap(), vec![0, 1]);
        let anc = class.anc_seg_data.unwrap();
        assert_eq!(anc[0].0, "h_canopy");
    }
}
