/// Spatial join tool: attach to every target unit the attributes of the join
/// unit it overlaps most.
///
/// Layers are given as `<workspace>/<layer>`; the output must not name either
/// input.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use distprep_core::overlap::{resolve_largest_overlap, SpatialRelation};
use distprep_core::{LayerPath, PlanarEngine};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "spatial_join", about = "Largest-overlap spatial join between two layers")]
struct Args {
    /// Target layer (e.g. the reference grid)
    #[arg(long)]
    target: String,

    /// Join layer whose attributes are attached
    #[arg(long)]
    join: String,

    /// Output workspace directory
    #[arg(short, long)]
    output_workspace: PathBuf,

    /// Output layer name
    #[arg(long)]
    output_name: String,

    /// Keep target units that overlap nothing
    #[arg(long)]
    keep_all: bool,

    /// Spatial relationship; only largest_overlap is supported
    #[arg(long, default_value = "largest_overlap")]
    relation: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let SpatialRelation::LargestOverlap = args
        .relation
        .parse::<SpatialRelation>()
        .context("Invalid --relation")?;

    let target = LayerPath::parse(&args.target).context("Invalid --target")?;
    let join = LayerPath::parse(&args.join).context("Invalid --join")?;
    let output = LayerPath::new(&args.output_workspace, &args.output_name);

    let written = resolve_largest_overlap(&PlanarEngine, &target, &join, &output, args.keep_all)
        .with_context(|| format!("Spatial join of {join} onto {target} failed"))?;
    info!(output = %written, "done");
    Ok(())
}
