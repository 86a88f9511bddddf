//! ATL03 Photon-Cloud Subsetting Engine
//!
//! Consumes ICESat-2 ATL03 photon products (with the companion ATL08
//! land-surface product) and produces, per beam, a stream of fixed-form
//! extent records: geospatially and temporally coherent slices of the photon
//! sequence enriched with per-photon classifications and per-extent metadata.
//!
//! # Architecture
//!
//! - **I/O**: Async array handles over a pluggable columnar [`io::DataSource`],
//!   joined against a shared deadline
//! - **Subset**: Region cropping, the ATL03/ATL08 dataset bundles, YAPC
//!   scoring, and the extent state machine
//! - **Reader**: Per-beam fan-out onto a bounded output queue with live
//!   statistics and cooperative cancellation
//!
//! # Usage
//!
//! ```no_run
//! use atl03_subsetter::{run_subsetter, MemorySource, SubsetConfig};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let source = Arc::new(MemorySource::from_file(Path::new("granules.json"))?);
//!     let config = SubsetConfig::default();
//!     let stats = run_subsetter(
//!         source,
//!         "ATL03_20181019065445_03150111_005_01.h5",
//!         config,
//!         |record| drop(record),
//!     )
//!     .await?;
//!     println!("{}", stats);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod geo;
pub mod io;
pub mod queue;
pub mod reader;
pub mod records;
pub mod resource;
pub mod subset;

pub use config::{PhorealConfig, Stages, SubsetConfig, SurfaceType, YapcConfig};
pub use error::{Severity, SubsetError};
pub use geo::{PolygonFilter, RasterMask, SpatialFilter};
pub use io::{DataSource, MemorySource};
pub use queue::{is_terminator, OutputQueue};
pub use reader::{Atl03Reader, ReaderStats};
pub use records::{AncillaryRecord, ExceptionRecord, ExtentRecord, PhotonRecord};

use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;

/// Default bound on the output queue, in records.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Subset one resource, handing every emitted record to `on_record`.
///
/// Drives the reader to completion and returns the final statistics. Records
/// arrive beam-interleaved; consumers needing order should key on
/// `(track, pair, extent_id)`.
pub async fn run_subsetter(
    source: Arc<dyn DataSource>,
    resource: &str,
    config: SubsetConfig,
    mut on_record: impl FnMut(Bytes),
) -> Result<ReaderStats> {
    config.validate()?;

    let (outq, mut rx) = OutputQueue::channel(DEFAULT_QUEUE_CAPACITY);
    let reader = Atl03Reader::spawn(source, resource, Arc::new(config), outq, true).await;

    tracing::info!("subsetting {}", resource);

    while let Some(msg) = rx.recv().await {
        if is_terminator(&msg) {
            break;
        }
        on_record(msg);
    }

    let stats = reader.stats(false);
    reader.join().await;

    tracing::info!("subsetting complete: {}", stats);

    Ok(stats)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
