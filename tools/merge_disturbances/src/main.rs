/// Disturbance merge tool: merge every fire and harvest source layer into one
/// schema and grid the result onto the reference grid.
///
/// Reads a `MergeConfig` JSON document; see `distprep_core::config`.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use distprep_core::config::MergeConfig;
use distprep_core::pipeline::DisturbanceMergePipeline;
use distprep_core::PlanarEngine;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "merge_disturbances",
    about = "Merge disturbance source layers and grid them by largest overlap"
)]
struct Args {
    /// Path to the merge config
    #[arg(short, long, default_value = "config/merge_disturbances.json")]
    config: PathBuf,

    /// Override the configured output workspace
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = MergeConfig::load(&args.config)
        .with_context(|| format!("Cannot load {}", args.config.display()))?;
    if let Some(out) = args.output {
        config.output_workspace = out;
    }

    let outcome = DisturbanceMergePipeline::new(&PlanarEngine)
        .run(&config)
        .context("Disturbance merge failed")?;

    for source in &outcome.sources {
        info!(category = %source.category, layer = %source.layer, units = source.units, "source");
    }
    info!(merged = %outcome.merged, gridded = %outcome.gridded, "done");
    Ok(())
}
