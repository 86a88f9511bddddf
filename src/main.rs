//! ATL03 subsetter CLI.
//!
//! Subsets photon granules loaded through a granule dump into a stream of
//! length-framed extent records.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use atl03_subsetter::{build_runtime, run_subsetter, MemorySource, SubsetConfig};

#[derive(Parser)]
#[command(name = "atl03-subsetter")]
#[command(about = "Subset ATL03 photon granules into extent records", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the subsetter over a granule dump
    Run {
        /// Granule dump (JSON) readable by the in-memory source
        #[arg(short, long)]
        granules: PathBuf,

        /// Resource (granule) name to subset
        #[arg(short, long)]
        resource: String,

        /// Output file for length-framed records
        #[arg(short, long, default_value = "extents.bin")]
        output: PathBuf,

        /// Tokio worker threads (default: number of CPUs)
        #[arg(long)]
        worker_threads: Option<usize>,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            granules,
            resource,
            output,
            worker_threads,
        } => run_command(cli.config, granules, resource, output, worker_threads),
        Commands::Validate => validate_command(cli.config),
        Commands::GenerateConfig { output } => generate_config_command(output),
    }
}

fn run_command(
    config_path: PathBuf,
    granules: PathBuf,
    resource: String,
    output: PathBuf,
    worker_threads: Option<usize>,
) -> Result<()> {
    let config = SubsetConfig::from_file(&config_path)?;
    config.validate()?;

    let source = MemorySource::from_file(&granules)
        .with_context(|| format!("failed to load granule dump {}", granules.display()))?;

    let mut out = std::io::BufWriter::new(
        std::fs::File::create(&output)
            .with_context(|| format!("failed to create {}", output.display()))?,
    );

    let runtime = build_runtime(worker_threads)?;
    let stats = runtime.block_on(async {
        run_subsetter(Arc::new(source), &resource, config, |record| {
            // Length-framed so consumers can split the stream back apart.
            let len = (record.len() as u32).to_le_bytes();
            let _ = out.write_all(&len).and_then(|_| out.write_all(&record));
        })
        .await
    })?;

    out.flush()?;

    println!("\n=== Subsetting Summary ===");
    println!("Segments read:    {}", stats.segments_read);
    println!("Extents sent:     {}", stats.extents_sent);
    println!("Extents filtered: {}", stats.extents_filtered);
    println!("Extents dropped:  {}", stats.extents_dropped);
    println!("Extents retried:  {}", stats.extents_retried);
    println!("Output written to {}", output.display());

    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = SubsetConfig::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# ATL03 Subsetter Configuration

# Ground track to process: 0 = all tracks, or 1..3
track: 0

# Surface type column of the signal-confidence table:
# land | ocean | sea_ice | land_ice | inland_water
surface_type: land

# Acceptance per signal-confidence value, indexed by confidence + 2
# (possible TEP, not considered, background, within 10m, low, medium, high)
atl03_cnf: [false, false, false, false, true, true, true]

# Acceptance per photon-quality value
# (nominal, possible afterpulse, possible impulse response, possible TEP)
quality_ph: [true, false, false, false]

# Acceptance per ATL08 class (unclassified, ground, canopy, top of canopy)
atl08_class: [true, true, true, true]

# Optional processing stages
stages:
  atl08: false
  yapc: false
  phoreal: false

# YAPC scorer settings
yapc:
  version: 3
  score: 0      # minimum score to keep a photon
  knn: 0        # 0 = derive from photon count
  min_knn: 5
  win_x: 15.0   # along-track window, meters
  win_h: 6.0    # height window, meters

# PhoREAL settings
phoreal:
  use_abs_h: false
  above_classifier: false

# Extent geometry, in meters (or whole 20 m segments when dist_in_seg)
extent_length: 40.0
extent_step: 20.0
dist_in_seg: false

# Extent validation
minimum_photon_count: 0
along_track_spread: 0.0
pass_invalid: false

# Deadline for each dataset-bundle join, seconds
read_timeout_secs: 600

# Ancillary field lists (optional)
# atl03_geo_fields: ["dem_h"]
# atl03_ph_fields: ["weight_ph"]
# atl08_fields: ["h_canopy"]

# Polygon region of interest (optional). Ring coordinates are in the
# projected plane named by `projection`; segment lon/lat is projected into
# that plane before the inclusion test.
# region:
#   ring: [[-108.0, 39.0], [-107.0, 39.0], [-107.0, 40.0], [-108.0, 40.0]]
#   projection: "EPSG:4326"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
