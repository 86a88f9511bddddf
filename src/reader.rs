//! The reader: per-beam fan-out, shared statistics, and cooperative
//! cancellation.
//!
//! One worker task runs the full subsetting pipeline per selected
//! `(track, pair)` beam, merging records into the shared output queue. The
//! last worker to finish posts the end-of-data sentinel. Per-beam failures
//! abort that beam only; they surface as one exception record.

use crate::config::SubsetConfig;
use crate::error::{Severity, SubsetError};
use crate::geo::SpatialFilter;
use crate::io::DataSource;
use crate::queue::{OutputQueue, PostError, SYS_TIMEOUT};
use crate::records::{encode_container, ExceptionRecord};
use crate::resource::{atl08_companion, parse_resource, ResourceIds};
use crate::subset::{
    Atl03Data, Atl08Class, Atl08Handles, Beam, ExtentMachine, Region, Step, YapcScore,
    ALL_TRACKS, NUM_PAIR_TRACKS, NUM_TRACKS,
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Live counters for one reader.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReaderStats {
    pub segments_read: u64,
    pub extents_filtered: u64,
    pub extents_sent: u64,
    pub extents_dropped: u64,
    pub extents_retried: u64,
}

impl ReaderStats {
    fn merge(&mut self, other: &ReaderStats) {
        self.segments_read += other.segments_read;
        self.extents_filtered += other.extents_filtered;
        self.extents_sent += other.extents_sent;
        self.extents_dropped += other.extents_dropped;
        self.extents_retried += other.extents_retried;
    }
}

impl std::fmt::Display for ReaderStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Read: {}, Filtered: {}, Sent: {}, Dropped: {}, Retried: {}",
            self.segments_read,
            self.extents_filtered,
            self.extents_sent,
            self.extents_dropped,
            self.extents_retried
        )
    }
}

/// Stats and completion count, guarded by the reader's single mutex.
#[derive(Default)]
struct ReaderState {
    stats: ReaderStats,
    num_complete: usize,
}

struct Shared {
    source: Arc<dyn DataSource>,
    parms: Arc<SubsetConfig>,
    filter: SpatialFilter,
    resource: String,
    resource08: String,
    ids: ResourceIds,
    outq: OutputQueue,
    send_terminator: bool,
    worker_count: usize,
    /// Cooperative cancellation; read relaxed, stale reads cost at most one
    /// extra iteration.
    active: AtomicBool,
    state: Mutex<ReaderState>,
    done_tx: watch::Sender<bool>,
}

/// Subsets one resource onto an output queue across up to six beam workers.
pub struct Atl03Reader {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    done_rx: watch::Receiver<bool>,
}

impl Atl03Reader {
    /// Parse the resource, select the beams, and spawn one worker per beam.
    ///
    /// Construction-time failures (unparseable resource, no beam matching the
    /// selector) post an exception record, optionally post the terminator,
    /// and signal completion; the returned reader then has no workers.
    pub async fn spawn(
        source: Arc<dyn DataSource>,
        resource: &str,
        parms: Arc<SubsetConfig>,
        outq: OutputQueue,
        send_terminator: bool,
    ) -> Atl03Reader {
        let (done_tx, done_rx) = watch::channel(false);
        let filter = parms.spatial_filter();

        let construction = parse_resource(resource).and_then(|ids| {
            let mut beams = Vec::new();
            for track in 1..=NUM_TRACKS {
                for pair in 0..NUM_PAIR_TRACKS {
                    if parms.track == ALL_TRACKS || track == parms.track {
                        beams.push(Beam::new(track, pair));
                    }
                }
            }
            if beams.is_empty() {
                return Err(SubsetError::InvalidParameter(format!(
                    "no reader workers were created, invalid track specified: {}",
                    parms.track
                )));
            }
            Ok((ids, beams))
        });

        let (ids, beams) = match construction {
            Ok(ok) => ok,
            Err(error) => {
                tracing::error!(
                    "failed to read global information in resource {}: {}",
                    resource,
                    error
                );
                let shared = Arc::new(Shared {
                    source,
                    parms,
                    filter,
                    resource: resource.to_string(),
                    resource08: atl08_companion(resource),
                    ids: ResourceIds::default(),
                    outq,
                    send_terminator,
                    worker_count: 0,
                    active: AtomicBool::new(true),
                    state: Mutex::new(ReaderState::default()),
                    done_tx,
                });
                post_exception(&shared, &error).await;
                if shared.send_terminator {
                    let _ = shared.outq.post_terminator().await;
                }
                let _ = shared.done_tx.send(true);
                return Atl03Reader {
                    shared,
                    workers: Vec::new(),
                    done_rx,
                };
            }
        };

        let shared = Arc::new(Shared {
            source,
            parms,
            filter,
            resource: resource.to_string(),
            resource08: atl08_companion(resource),
            ids,
            outq,
            send_terminator,
            worker_count: beams.len(),
            active: AtomicBool::new(true),
            state: Mutex::new(ReaderState::default()),
            done_tx,
        });

        let workers = beams
            .into_iter()
            .map(|beam| {
                let shared = shared.clone();
                tokio::spawn(subsetting_worker(shared, beam))
            })
            .collect();

        Atl03Reader {
            shared,
            workers,
            done_rx,
        }
    }

    /// Snapshot the statistics, optionally resetting them.
    pub fn stats(&self, clear: bool) -> ReaderStats {
        let mut state = self.shared.state.lock();
        let snapshot = state.stats.clone();
        if clear {
            state.stats = ReaderStats::default();
        }
        snapshot
    }

    pub fn parms(&self) -> Arc<SubsetConfig> {
        self.shared.parms.clone()
    }

    pub fn resource(&self) -> &str {
        &self.shared.resource
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Request cooperative shutdown; workers observe the flag at every outer
    /// loop iteration and inside the post-retry loop.
    pub fn cancel(&self) {
        self.shared.active.store(false, Ordering::Relaxed);
    }

    /// Wait until the last worker has finished (or construction failed).
    pub async fn wait_complete(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Await every worker.
    pub async fn join(mut self) {
        let _ = futures::future::join_all(self.workers.drain(..)).await;
    }
}

impl Drop for Atl03Reader {
    fn drop(&mut self) {
        self.shared.active.store(false, Ordering::Relaxed);
    }
}

async fn subsetting_worker(shared: Arc<Shared>, beam: Beam) {
    let mut local = ReaderStats::default();

    if let Err(error) = run_beam(&shared, beam, &mut local).await {
        if error.severity() == Severity::Debug {
            tracing::debug!(
                "beam {} of {} produced no data: {}",
                beam.prefix(),
                shared.resource,
                error
            );
        } else {
            tracing::error!(
                "failure during processing of resource {} track {}: {}",
                shared.resource,
                beam.track,
                error
            );
            post_exception(&shared, &error).await;
        }
    }

    // Fold local statistics and count completion under the reader mutex.
    let is_last = {
        let mut state = shared.state.lock();
        state.stats.merge(&local);
        state.num_complete += 1;
        state.num_complete == shared.worker_count
    };
    if is_last {
        tracing::info!("completed processing resource {}", shared.resource);
        if shared.send_terminator {
            let _ = shared.outq.post_terminator().await;
        }
        let _ = shared.done_tx.send(true);
    }
}

async fn run_beam(
    shared: &Arc<Shared>,
    beam: Beam,
    local: &mut ReaderStats,
) -> crate::error::Result<()> {
    let prefix = beam.prefix();
    let timeout = shared.parms.read_timeout();

    // ATL08 reads start first so they overlap the ATL03 I/O below.
    let atl08_handles =
        Atl08Handles::launch(&shared.source, &shared.resource08, &prefix, &shared.parms);

    let region = Region::fetch(
        &shared.source,
        &shared.resource,
        &prefix,
        &shared.filter,
        Instant::now() + timeout,
    )
    .await?;

    let atl03 = Atl03Data::fetch(
        &shared.source,
        &shared.resource,
        &prefix,
        &shared.parms,
        &region,
        Instant::now() + timeout,
    )
    .await?;

    let yapc = YapcScore::compute(&shared.parms, &region, &atl03)?;

    let atl08 = Atl08Class::finish(
        atl08_handles,
        beam,
        &shared.parms,
        &region,
        &atl03,
        Instant::now() + timeout,
    )
    .await?;

    local.segments_read += region.segment_ph_cnt.len() as u64;

    let mut machine = ExtentMachine::new(
        &shared.parms,
        beam,
        shared.ids,
        &region,
        &atl03,
        &atl08,
        &yapc,
    );

    while shared.active.load(Ordering::Relaxed) {
        match machine.step()? {
            Step::Complete => break,
            Step::Filtered => local.extents_filtered += 1,
            Step::Extent(batch) => {
                let mut records: Vec<Bytes> = Vec::with_capacity(1 + batch.ancillary.len());
                records.push(batch.extent.encode());
                for ancillary in &batch.ancillary {
                    records.push(ancillary.encode());
                }
                let buf = if records.len() == 1 {
                    records.pop().unwrap()
                } else {
                    encode_container(&records)
                };
                post_record(shared, buf, local).await;
            }
        }
    }

    Ok(())
}

/// Post one record, retrying timeouts while the reader stays active.
async fn post_record(shared: &Arc<Shared>, buf: Bytes, local: &mut ReaderStats) {
    loop {
        if !shared.active.load(Ordering::Relaxed) {
            local.extents_dropped += 1;
            return;
        }
        match shared.outq.post(buf.clone(), SYS_TIMEOUT).await {
            Ok(_) => {
                local.extents_sent += 1;
                return;
            }
            Err(PostError::Timeout) => {
                local.extents_retried += 1;
            }
            Err(PostError::Closed) => {
                tracing::error!(
                    "reader failed to post record for resource {}: queue closed",
                    shared.resource
                );
                local.extents_dropped += 1;
                return;
            }
        }
    }
}

async fn post_exception(shared: &Arc<Shared>, error: &SubsetError) {
    let record = ExceptionRecord::new(
        error.code(),
        error.severity() as i32,
        format!("{}: ({})", error, shared.resource),
    );
    if let Err(post_error) = shared.outq.post(record.encode(), SYS_TIMEOUT).await {
        tracing::error!("failed to post exception record: {}", post_error);
    }
}
