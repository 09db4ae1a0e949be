/// Historic processor: generates slash-burn for the years after the rollback
/// period and writes the historic tiler config.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use distprep_core::config::PreprocessorConfig;
use distprep_core::historic::HistoricProcessor;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "historic", about = "Historic-period slash-burn and tiler config")]
struct Args {
    /// Path to the preprocessor config
    #[arg(short, long, default_value = "config/preprocessor_config.json")]
    config: PathBuf,

    /// RNG seed; overrides the configured seed
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = PreprocessorConfig::load(&args.config)
        .with_context(|| format!("Cannot load {}", args.config.display()))?;
    if args.seed.is_some() {
        config.seed = args.seed;
    }

    let outcome = HistoricProcessor::new(&config)
        .process()
        .context("Historic processing failed")?;

    for (year, s) in &outcome.per_year {
        info!(year, eligible = s.bucket, selected = s.selected, "slash-burn");
    }
    if let Some(path) = &outcome.slashburn {
        info!(layer = %path, "slash-burn layer");
    }
    info!(tiler_config = %outcome.tiler_config.display(), "done");
    Ok(())
}
