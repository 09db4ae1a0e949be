/// Slash-burn tool: relabel a percentage of each year's harvest units as
/// slash-burn (disturbance type 13).
///
/// A harvest unit is eligible for year Y when its harvest year is Y and the
/// inventory records Y as its disturbance year.
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use distprep_core::slashburn::{
    generate_slashburn, InventoryYearLookup, SlashburnOptions, SlashburnSampler, SLASHBURN_LAYER,
};
use distprep_core::{LayerPath, Workspace};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "slashburn", about = "Sample slash-burn units from harvest polygons")]
struct Args {
    /// Harvest layer to sample from
    #[arg(long)]
    harvest: String,

    /// Harvest year field
    #[arg(long, default_value = "HARV_YR")]
    year_field: String,

    /// Inventory layer providing each unit's disturbance year (defaults to --harvest)
    #[arg(long)]
    inventory: Option<String>,

    /// Inventory disturbance year field
    #[arg(long, default_value = "DistYEAR")]
    inventory_year_field: String,

    /// Inventory units whose value here is not positive are skipped
    #[arg(long, default_value = "CELL_ID")]
    cell_field: String,

    /// First year sampled
    #[arg(long)]
    start_year: i32,

    /// Last year sampled (inclusive)
    #[arg(long)]
    end_year: i32,

    /// Percentage of each year's eligible units to relabel
    #[arg(long, default_value = "50")]
    percent: f64,

    /// Field receiving the disturbance code
    #[arg(long, default_value = "DistType")]
    dist_type_field: String,

    /// Output workspace directory
    #[arg(short, long)]
    output_workspace: PathBuf,

    /// Output layer name
    #[arg(long, default_value = SLASHBURN_LAYER)]
    output_name: String,

    /// RNG seed for a reproducible draw
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    if !(0.0..=100.0).contains(&args.percent) {
        bail!("--percent must be within 0-100, got {}", args.percent);
    }

    let harvest = LayerPath::parse(&args.harvest).context("Invalid --harvest")?;
    let inventory = match &args.inventory {
        Some(s) => LayerPath::parse(s).context("Invalid --inventory")?,
        None => harvest.clone(),
    };
    let inventory_layer = Workspace::open(&inventory.workspace)
        .and_then(|ws| ws.read_layer(&inventory.name))
        .with_context(|| format!("Cannot read inventory {inventory}"))?;
    let lookup =
        InventoryYearLookup::from_layer(&inventory_layer, &args.inventory_year_field, Some(&args.cell_field));

    let options = SlashburnOptions {
        dist_type_field: args.dist_type_field.clone(),
        output_name: args.output_name.clone(),
        ..SlashburnOptions::new(args.percent)
    };
    let mut sampler = SlashburnSampler::seeded(args.seed, options);
    let years: Vec<i32> = (args.start_year..=args.end_year).collect();
    let output = LayerPath::new(&args.output_workspace, &args.output_name);

    let outcome = generate_slashburn(&mut sampler, &harvest, &args.year_field, &lookup, &years, &output)
        .context("Slash-burn generation failed")?;

    for (year, s) in &outcome.per_year {
        info!(year, eligible = s.bucket, selected = s.selected, "year");
    }
    match outcome.path {
        Some(path) => info!(output = %path, "done"),
        None => info!("empty year range; nothing written"),
    }
    Ok(())
}
