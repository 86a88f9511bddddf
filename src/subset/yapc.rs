//! YAPC density scoring.
//!
//! Scores every photon 0..=255 by how many near neighbors it has inside a
//! sliding along-track by along-height window. Versions 1 and 2 share the
//! segment-banded implementation; version 3 walks a global along-track
//! distance axis.
//!
//! The v2 spreads are computed over the leading photons of the whole photon
//! axis rather than the segment's own band, and the center band advances by
//! the previous segment's count. Both match the behavior this scorer was
//! validated against; revisit only together with its consumers.

use crate::config::{SubsetConfig, YapcConfig};
use crate::error::{Result, SubsetError};
use crate::subset::atl03::Atl03Data;
use crate::subset::region::Region;

const MAXIMUM_HSPREAD: f64 = 15000.0; // meters
const HSPREAD_BINSIZE: f64 = 1.0; // meters
const MAX_KNN: usize = 25;

/// Per-photon density scores; `None` when the stage is disabled.
#[derive(Debug, Default)]
pub struct YapcScore {
    pub score: Option<Vec<u8>>,
}

impl YapcScore {
    pub fn compute(parms: &SubsetConfig, region: &Region, atl03: &Atl03Data) -> Result<YapcScore> {
        if !parms.stages.yapc {
            return Ok(YapcScore::default());
        }
        let score = match parms.yapc.version {
            3 => yapc_v3(&parms.yapc, region, atl03),
            1 | 2 => yapc_v2(parms, region, atl03),
            version => {
                return Err(SubsetError::InvalidParameter(format!(
                    "invalid YAPC version specified: {}",
                    version
                )))
            }
        };
        Ok(YapcScore { score: Some(score) })
    }
}

/// Banded k-nearest-neighbor scorer (versions 1 and 2).
fn yapc_v2(parms: &SubsetConfig, region: &Region, atl03: &Atl03Data) -> Vec<u8> {
    let settings = &parms.yapc;
    let num_photons = atl03.num_photons();
    let num_segments = atl03.num_segments();
    let mut score = vec![0u8; num_photons];
    let mut nearest_neighbors = [0.0f64; MAX_KNN];

    // Buffer band covers segments s-2..=s+1, center band covers segment s.
    let mut ph_b0: usize = 0;
    let mut ph_b1: usize = 0;
    let mut ph_c0: usize = 0;
    let mut ph_c1: usize = 0;

    for segment_index in 0..num_segments {
        ph_b0 += if segment_index > 1 {
            region.segment_ph_cnt[segment_index - 2] as usize
        } else {
            0
        };
        ph_c0 += if segment_index > 0 {
            region.segment_ph_cnt[segment_index - 1] as usize
        } else {
            0
        };
        ph_c1 += region.segment_ph_cnt[segment_index] as usize;
        ph_b1 += if segment_index < num_segments - 1 {
            region.segment_ph_cnt[segment_index + 1] as usize
        } else {
            0
        };

        let n = region.segment_ph_cnt[segment_index] as usize;
        let mut knn = if settings.knn != 0 {
            settings.knn as usize
        } else {
            f64::max(1.0, ((n as f64).sqrt() + 0.5) / 2.0) as usize
        };
        knn = knn.min(MAX_KNN);

        if n <= knn || n < parms.minimum_photon_count {
            continue;
        }

        let mut min_h = atl03.h_ph[0] as f64;
        let mut max_h = min_h;
        let mut min_x = atl03.dist_ph_along[0] as f64;
        let mut max_x = min_x;
        for p in 1..n {
            let h = atl03.h_ph[p] as f64;
            let x = atl03.dist_ph_along[p] as f64;
            min_h = min_h.min(h);
            max_h = max_h.max(h);
            min_x = min_x.min(x);
            max_x = max_x.max(x);
        }
        let hspread = max_h - min_h;
        let xspread = max_x - min_x;

        if hspread <= 0.0 || hspread > MAXIMUM_HSPREAD || xspread <= 0.0 {
            tracing::error!(
                "unable to perform YAPC selection due to invalid photon spread: {}, {}",
                hspread,
                xspread
            );
            continue;
        }

        // Height span from occupied 1 m bins, discounting telemetry gaps.
        let num_bins = (hspread / HSPREAD_BINSIZE) as usize + 1;
        let mut bins = vec![false; num_bins];
        for p in 0..n {
            let bin = ((atl03.h_ph[p] as f64 - min_h) / HSPREAD_BINSIZE) as usize;
            bins[bin.min(num_bins - 1)] = true;
        }
        let nonzero_bins = bins.iter().filter(|&&b| b).count();
        let h_span = (nonzero_bins as f64 * HSPREAD_BINSIZE) / n as f64 * knn as f64;

        let half_win_x = settings.win_x / 2.0;
        let half_win_h = if settings.win_h != 0.0 {
            settings.win_h / 2.0
        } else {
            h_span / 2.0
        };

        for y in ph_c0..ph_c1 {
            let mut smallest_nearest_neighbor = f64::MAX;
            let mut smallest_nearest_neighbor_index = 0;
            let mut num_nearest_neighbors = 0;

            for x in ph_b0..ph_b1 {
                if y == x {
                    continue;
                }

                let delta_x = (atl03.dist_ph_along[x] as f64 - atl03.dist_ph_along[y] as f64).abs();
                if delta_x > half_win_x {
                    continue;
                }

                let delta_h = (atl03.h_ph[x] as f64 - atl03.h_ph[y] as f64).abs();
                let proximity = half_win_h - delta_h;

                if num_nearest_neighbors < knn {
                    if proximity < smallest_nearest_neighbor {
                        smallest_nearest_neighbor = proximity;
                        smallest_nearest_neighbor_index = num_nearest_neighbors;
                    }
                    nearest_neighbors[num_nearest_neighbors] = proximity;
                    num_nearest_neighbors += 1;
                } else if proximity > smallest_nearest_neighbor {
                    nearest_neighbors[smallest_nearest_neighbor_index] = proximity;
                    smallest_nearest_neighbor = proximity;
                    for (k, &candidate) in nearest_neighbors.iter().enumerate().take(knn) {
                        if candidate < smallest_nearest_neighbor {
                            smallest_nearest_neighbor = candidate;
                            smallest_nearest_neighbor_index = k;
                        }
                    }
                }
            }

            for neighbor in nearest_neighbors.iter_mut().take(knn).skip(num_nearest_neighbors) {
                *neighbor = 0.0;
            }

            let mut nearest_neighbor_sum = 0.0;
            for &neighbor in nearest_neighbors.iter().take(knn) {
                if neighbor > 0.0 {
                    nearest_neighbor_sum += neighbor;
                }
            }
            nearest_neighbor_sum /= knn as f64;

            score[y] = ((nearest_neighbor_sum / half_win_h) * 255.0) as u8;
        }
    }

    score
}

/// Global-distance k-nearest-neighbor scorer (version 3).
fn yapc_v3(settings: &YapcConfig, region: &Region, atl03: &Atl03Data) -> Vec<u8> {
    let h_wx = settings.win_x / 2.0;
    let h_wz = settings.win_h / 2.0;
    let num_segments = atl03.num_segments();
    let num_photons = atl03.num_photons();
    let mut score = vec![0u8; num_photons];

    // Global along-track distance per photon.
    let mut ph_dist = vec![0.0f64; num_photons];
    let mut ph_index: usize = 0;
    for segment_index in 0..num_segments {
        for _ in 0..region.segment_ph_cnt[segment_index] {
            ph_dist[ph_index] = atl03.segment_dist_x[segment_index] + atl03.dist_ph_along[ph_index] as f64;
            ph_index += 1;
        }
    }

    ph_index = 0;
    for segment_index in 0..num_segments {
        let n = region.segment_ph_cnt[segment_index] as usize;
        let mut ph_weights = vec![0.0f64; n];
        let mut max_knn = settings.min_knn as usize;
        let start_ph_index = ph_index;

        for weight in ph_weights.iter_mut() {
            let mut proximities: Vec<f64> = Vec::new();

            // Neighbors to the left; stop once a meter past the window.
            let mut neighbor_index = ph_index as isize - 1;
            while neighbor_index >= 0 {
                let x_dist = ph_dist[ph_index] - ph_dist[neighbor_index as usize];
                if x_dist <= h_wx {
                    let proximity =
                        (atl03.h_ph[ph_index] as f64 - atl03.h_ph[neighbor_index as usize] as f64).abs();
                    if proximity <= h_wz {
                        proximities.push(proximity);
                    }
                }
                if x_dist >= h_wx + 1.0 {
                    break;
                }
                neighbor_index -= 1;
            }

            // Neighbors to the right.
            let mut neighbor_index = ph_index + 1;
            while neighbor_index < num_photons {
                let x_dist = ph_dist[neighbor_index] - ph_dist[ph_index];
                if x_dist <= h_wx {
                    let proximity =
                        (atl03.h_ph[ph_index] as f64 - atl03.h_ph[neighbor_index] as f64).abs();
                    if proximity <= h_wz {
                        proximities.push(proximity);
                    }
                }
                if x_dist >= h_wx + 1.0 {
                    break;
                }
                neighbor_index += 1;
            }

            proximities.sort_by(|a, b| a.total_cmp(b));

            let knn = f64::max((proximities.len() as f64).sqrt(), settings.min_knn as f64) as usize;
            if knn > max_knn {
                max_knn = knn;
            }

            let num_nearest_neighbors = knn.min(proximities.len());
            let weight_sum: f64 = proximities[..num_nearest_neighbors]
                .iter()
                .map(|proximity| h_wz - proximity)
                .sum();
            *weight = weight_sum;

            ph_index += 1;
        }

        for (offset, weight) in ph_weights.iter().enumerate() {
            let wt = weight / (h_wz * max_knn as f64);
            score[start_ph_index + offset] = f64::min(wt * 255.0, 255.0) as u8;
        }
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Stages;
    use crate::geo::SpatialFilter;
    use crate::subset::fixtures::BeamFixture;
    use std::time::Duration;
    use tokio::time::Instant;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    async fn score_fixture(fixture: &BeamFixture, parms: &SubsetConfig) -> Result<YapcScore> {
        let source = fixture.source();
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
        YapcScore::compute(parms, &region, &atl03)
    }

    fn yapc_parms(version: u8, yapc: YapcConfig) -> SubsetConfig {
        SubsetConfig {
            stages: Stages {
                atl08: false,
                yapc: true,
                phoreal: false,
            },
            yapc: YapcConfig { version, ..yapc },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_stage_scores_nothing() {
        let fixture = BeamFixture::new(&[100], &[3]);
        let score = score_fixture(&fixture, &SubsetConfig::default())
            .await
            .unwrap();
        assert!(score.score.is_none());
    }

    #[tokio::test]
    async fn test_invalid_version_is_fatal() {
        let fixture = BeamFixture::new(&[100], &[3]);
        let parms = yapc_parms(4, YapcConfig::default());
        let err = score_fixture(&fixture, &parms).await.unwrap_err();
        assert!(matches!(err, SubsetError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_v3_isolated_pair_scores_full() {
        // Two photons at the same spot; each is the other's only neighbor.
        let mut fixture = BeamFixture::new(&[100], &[2]);
        fixture.dist_ph_along = vec![5.0, 5.0];
        fixture.h_ph = vec![100.0, 100.0];

        let parms = yapc_parms(
            3,
            YapcConfig {
                min_knn: 1,
                win_x: 15.0,
                win_h: 6.0,
                ..Default::default()
            },
        );
        let score = score_fixture(&fixture, &parms).await.unwrap();
        assert_eq!(score.score.unwrap(), vec![255, 255]);
    }

    #[tokio::test]
    async fn test_v3_isolated_photon_scores_zero() {
        let mut fixture = BeamFixture::new(&[100], &[2]);
        fixture.dist_ph_along = vec![0.0, 5.0];
        fixture.h_ph = vec![100.0, 5000.0];

        let parms = yapc_parms(
            3,
            YapcConfig {
                min_knn: 1,
                win_x: 15.0,
                win_h: 6.0,
                ..Default::default()
            },
        );
        let score = score_fixture(&fixture, &parms).await.unwrap();
        assert_eq!(score.score.unwrap(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_v3_denser_scores_higher() {
        // Three clustered photons and one height outlier in the same segment.
        let mut fixture = BeamFixture::new(&[100], &[4]);
        fixture.dist_ph_along = vec![1.0, 1.5, 2.0, 3.0];
        fixture.h_ph = vec![100.0, 100.2, 100.4, 900.0];

        let parms = yapc_parms(
            3,
            YapcConfig {
                min_knn: 1,
                win_x: 15.0,
                win_h: 6.0,
                ..Default::default()
            },
        );
        let score = score_fixture(&fixture, &parms).await.unwrap().score.unwrap();
        assert!(score[1] > score[3]);
        assert_eq!(score[3], 0);
    }

    #[tokio::test]
    async fn test_v2_scores_against_neighbor_band() {
        // Two segments of four photons; the second segment's band is the
        // first segment's photons.
        let mut fixture = BeamFixture::new(&[100, 101], &[4, 4]);
        fixture.dist_ph_along = vec![0.0, 1.0, 2.0, 3.0, 0.0, 1.0, 2.0, 3.0];
        fixture.h_ph = vec![100.0, 101.0, 102.0, 103.0, 100.0, 100.5, 99.5, 2000.0];

        let parms = yapc_parms(
            2,
            YapcConfig {
                knn: 0,
                win_x: 15.0,
                win_h: 10.0,
                ..Default::default()
            },
        );
        let score = score_fixture(&fixture, &parms).await.unwrap().score.unwrap();

        // First segment: nearest neighbor is 1 m away in height, knn = 1.
        // proximity 4 of half-window 5 -> 204.
        assert_eq!(&score[..4], &[204, 204, 204, 204]);
        // Second segment scores against the first: an exact height match
        // saturates, the 2 km outlier gets nothing.
        assert_eq!(score[4], 255);
        assert_eq!(score[7], 0);
    }

    #[tokio::test]
    async fn test_v2_flat_segment_is_skipped() {
        // Zero height spread on the leading photons: segment is skipped and
        // every score stays zero.
        let mut fixture = BeamFixture::new(&[100, 101], &[3, 3]);
        fixture.h_ph = vec![100.0; 6];

        let parms = yapc_parms(2, YapcConfig::default());
        let score = score_fixture(&fixture, &parms).await.unwrap().score.unwrap();
        assert_eq!(score, vec![0; 6]);
    }

    #[tokio::test]
    async fn test_scores_stay_in_range() {
        let mut fixture = BeamFixture::new(&[100, 101, 102], &[5, 5, 5]);
        fixture.h_ph = (0..15).map(|i| 100.0 + (i % 4) as f32 * 0.3).collect();

        for version in [2, 3] {
            let parms = yapc_parms(
                version,
                YapcConfig {
                    min_knn: 2,
                    win_x: 15.0,
                    win_h: 6.0,
                    ..Default::default()
                },
            );
            let score = score_fixture(&fixture, &parms).await.unwrap().score.unwrap();
            assert_eq!(score.len(), 15);
            // u8 already bounds the range; spot-check saturation behavior.
            assert!(score.iter().all(|&s| s <= 255));
        }
    }
}
