//! Historic-period processing: slash-burn generation and the tiler config
//! entries that describe it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{PreprocessorConfig, RollbackInputLayer};
use crate::error::{PrepError, Result};
use crate::slashburn::{
    generate_slashburn, InventoryYearLookup, SlashburnOptions, SlashburnSampler, YearSample,
    SLASHBURN_DIST_TYPE, SLASHBURN_LAYER,
};
use crate::workspace::{LayerPath, Workspace};

/// Gridded inventory layer the slash-burn sampler draws from.
pub const MERGED_DISTURBANCES: &str = "MergedDisturbances";
const CELL_FIELD: &str = "CELL_ID";

/// One per-year slash-burn layer for the tiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlashburnTilerLayer {
    pub year: i32,
    pub path: PathBuf,
    pub year_field: String,
    pub name: String,
    pub cbm_disturbance_type: String,
    pub layer_meta: String,
}

/// A rollback input layer replayed for one historic year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedDisturbanceTilerLayer {
    pub year: i32,
    pub path: PathBuf,
    pub year_field: String,
    pub name: String,
    pub layer_meta: String,
}

/// Tiler layer list. Entries written by earlier stages are carried through
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TilerConfig {
    #[serde(default)]
    pub layers: Vec<serde_json::Value>,
}

impl TilerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| PrepError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| PrepError::json(path, e))
    }

    /// Empty config when `path` is `None` or the file does not exist yet.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => {
                debug!(path = %p.display(), "no tiler config yet; starting empty");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| PrepError::io(parent, e))?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|e| PrepError::json(path, e))?;
        fs::write(path, text).map_err(|e| PrepError::io(path, e))
    }

    pub fn add_slashburn(&mut self, entry: SlashburnTilerLayer) -> Result<()> {
        self.push(&entry, entry.year)
    }

    /// One entry per input layer per year, layers in the given order.
    pub fn add_merged_disturbances(&mut self, inputs: &[RollbackInputLayer], years: &[i32]) -> Result<()> {
        for input in inputs {
            for &year in years {
                let entry = MergedDisturbanceTilerLayer {
                    year,
                    path: input.workspace.join(&input.workspace_filter),
                    year_field: input.year_field.clone(),
                    name: input.name.clone(),
                    layer_meta: format!("historic_{}", input.name),
                };
                self.push(&entry, year)?;
            }
        }
        Ok(())
    }

    fn push(&mut self, entry: &impl Serialize, year: i32) -> Result<()> {
        let value =
            serde_json::to_value(entry).map_err(|e| PrepError::config(format!("tiler entry for {year}: {e}")))?;
        self.layers.push(value);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HistoricOutcome {
    pub slashburn: Option<LayerPath>,
    pub per_year: Vec<(i32, YearSample)>,
    pub tiler_config: PathBuf,
}

pub struct HistoricProcessor<'c> {
    config: &'c PreprocessorConfig,
}

impl<'c> HistoricProcessor<'c> {
    pub fn new(config: &'c PreprocessorConfig) -> Self {
        Self { config }
    }

    /// Generate slash-burn for the years after the rollback period and write
    /// the historic tiler config, which replays each rollback input layer for
    /// those years. With no such years only the carried entries are written.
    pub fn process(&self) -> Result<HistoricOutcome> {
        let config = self.config;
        config.validate()?;
        let years = config.slashburn_years();
        let mut tiler = TilerConfig::load_or_default(config.rollback_tiler_config.as_deref())?;
        tiler.add_merged_disturbances(&config.rollback_input_layers, &years)?;

        let mut slashburn = None;
        let mut per_year = Vec::new();
        if years.is_empty() {
            info!(
                rollback_end = config.rollback_range.end_year,
                historic_end = config.historic_range.end_year,
                "rollback covers the historic period; no slash-burn"
            );
        } else {
            let harvest = config.harvest_layer()?;
            let names = &config.inventory_field_names;

            let inventory = LayerPath::new(&config.inventory_workspace, MERGED_DISTURBANCES);
            let merged = Workspace::open(&inventory.workspace)?.read_layer(&inventory.name)?;
            let lookup = InventoryYearLookup::from_layer(&merged, &names.disturbance_yr, Some(CELL_FIELD));
            if lookup.is_empty() {
                warn!(layer = %inventory, "inventory lookup is empty; no unit can be sampled");
            } else {
                debug!(units = lookup.len(), "inventory year lookup");
            }

            let options = SlashburnOptions {
                percent: config.slashburn.percent,
                dist_type_field: names.dist_type.clone(),
                code: SLASHBURN_DIST_TYPE,
                output_name: SLASHBURN_LAYER.to_string(),
            };
            let mut sampler = SlashburnSampler::seeded(config.seed, options);
            let output = LayerPath::new(&harvest.workspace, SLASHBURN_LAYER);
            let outcome = generate_slashburn(
                &mut sampler,
                &inventory,
                &harvest.year_field,
                &lookup,
                &years,
                &output,
            )?;

            if let Some(path) = &outcome.path {
                for &year in &years {
                    tiler.add_slashburn(SlashburnTilerLayer {
                        year,
                        path: path.file_path(),
                        year_field: harvest.year_field.clone(),
                        name: config.slashburn.name.clone(),
                        cbm_disturbance_type: config.slashburn.cbm_disturbance_type.clone(),
                        layer_meta: format!("historic_{}", config.slashburn.name),
                    })?;
                }
            }
            per_year = outcome.per_year.into_iter().collect();
            slashburn = outcome.path;
        }

        tiler.save(&config.historic_tiler_config)?;
        info!(path = %config.historic_tiler_config.display(), layers = tiler.layers.len(), "historic tiler config written");
        Ok(HistoricOutcome { slashburn, per_year, tiler_config: config.historic_tiler_config.clone() })
    }
}
