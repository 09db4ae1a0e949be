//! JSON configuration for the merge pipeline and the historic processor.
//!
//! Every parse or validation failure surfaces as `PrepError::Configuration`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PrepError, Result};
use crate::field_map::{FieldSpec, SourceCategory, SourceField, SourceFields};
use crate::layer::FieldKind;

/// Name of the rollback input layer that holds harvest polygons.
pub const HARVEST_LAYER_NAME: &str = "harvest";

fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| PrepError::io(path, e))?;
    serde_json::from_str(&text)
        .map_err(|e| PrepError::config(format!("{}: {e}", path.display())))
}

// ── Merge pipeline ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Searched in this order; the order is part of the merge precedence.
    pub source_workspaces: Vec<PathBuf>,
    /// Highest precedence first.
    #[serde(default = "default_categories")]
    pub categories: Vec<SourceCategory>,
    #[serde(default = "default_field_specs")]
    pub field_specs: Vec<FieldSpec>,
    /// Reference grid, as `<workspace>/<layer>`.
    pub grid: String,
    pub output_workspace: PathBuf,
    #[serde(default = "default_merged_name")]
    pub merged_name: String,
    #[serde(default = "default_gridded_name")]
    pub gridded_name: String,
}

impl MergeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = read_config(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (i, c) in self.categories.iter().enumerate() {
            if c.name.trim().is_empty() || c.pattern.trim().is_empty() {
                return Err(PrepError::config(format!("category #{i} needs a name and a pattern")));
            }
            if self.categories[..i].iter().any(|p| p.name == c.name) {
                return Err(PrepError::config(format!("category '{}' declared twice", c.name)));
            }
        }
        for spec in &self.field_specs {
            spec.validate(&self.categories)?;
        }
        if self.merged_name == self.gridded_name {
            return Err(PrepError::config("merged_name and gridded_name must differ"));
        }
        Ok(())
    }
}

pub fn default_categories() -> Vec<SourceCategory> {
    vec![
        SourceCategory::new("fire_historic", "NFDB*"),
        SourceCategory::new("fire_recent", "NBAC*"),
        SourceCategory::new("harvest", "BC_cutblocks90_15*"),
    ]
}

/// `DistYEAR` from `YEAR_` (NFDB), the first four characters of `EDATE`
/// (NBAC) and `HARV_YR` (cutblocks).
pub fn default_field_specs() -> Vec<FieldSpec> {
    vec![FieldSpec {
        output: "DistYEAR".to_string(),
        kind: Some(FieldKind::Integer),
        inputs: [
            ("fire_historic", SourceField::plain("YEAR_")),
            ("fire_recent", SourceField::substring("EDATE", 0, 4)),
            ("harvest", SourceField::plain("HARV_YR")),
        ]
        .into_iter()
        .map(|(c, f)| (c.to_string(), SourceFields::One(f)))
        .collect(),
    }]
}

fn default_merged_name() -> String {
    "MergedDisturbances_polys".to_string()
}

fn default_gridded_name() -> String {
    "MergedDisturbances".to_string()
}

// ── Historic processor ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub start_year: i32,
    pub end_year: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackInputLayer {
    pub name: String,
    pub workspace: PathBuf,
    pub workspace_filter: String,
    pub year_field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlashburnInfo {
    /// Share of each year's harvest units relabelled as slash-burn, 0–100.
    pub percent: f64,
    pub name: String,
    pub cbm_disturbance_type: String,
}

/// Inventory attribute names. Config entries override the defaults one by one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryFieldNames {
    pub age: String,
    pub species: String,
    pub establishment_date: String,
    pub dist_date_diff: String,
    pub pre_dist_age: String,
    pub dist_type: String,
    pub regen_delay: String,
    pub rollback_age: String,
    pub disturbance_yr: String,
    pub new_disturbance_yr: String,
}

impl Default for InventoryFieldNames {
    fn default() -> Self {
        Self {
            age: "Age2015".to_string(),
            species: "Species".to_string(),
            establishment_date: "DE".to_string(),
            dist_date_diff: "Dist_DE_DIFF".to_string(),
            pre_dist_age: "preDistAge".to_string(),
            dist_type: "DistType".to_string(),
            regen_delay: "RegenDelay".to_string(),
            rollback_age: "Age1990".to_string(),
            disturbance_yr: "DistYEAR".to_string(),
            new_disturbance_yr: "DistYEAR_new".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessorConfig {
    pub rollback_range: YearRange,
    pub historic_range: YearRange,
    pub rollback_input_layers: Vec<RollbackInputLayer>,
    pub inventory_workspace: PathBuf,
    #[serde(default)]
    pub inventory_field_names: InventoryFieldNames,
    pub slashburn: SlashburnInfo,
    /// Tiler config produced by the rollback stage; appended to if present.
    #[serde(default)]
    pub rollback_tiler_config: Option<PathBuf>,
    pub historic_tiler_config: PathBuf,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl PreprocessorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = read_config(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.slashburn.percent) {
            return Err(PrepError::config(format!(
                "slashburn percent {} is outside 0-100",
                self.slashburn.percent
            )));
        }
        Ok(())
    }

    /// First year after the rollback period through the end of the historic
    /// period. Empty when the rollback already reaches the historic end.
    pub fn slashburn_years(&self) -> Vec<i32> {
        (self.rollback_range.end_year + 1..=self.historic_range.end_year).collect()
    }

    /// The single rollback input named `harvest`.
    pub fn harvest_layer(&self) -> Result<&RollbackInputLayer> {
        let mut found = self
            .rollback_input_layers
            .iter()
            .filter(|l| l.name == HARVEST_LAYER_NAME);
        match (found.next(), found.next()) {
            (Some(layer), None) => Ok(layer),
            (None, _) => Err(PrepError::config("expected a single harvest layer, found none")),
            (Some(_), Some(_)) => Err(PrepError::config("expected a single harvest layer, found several")),
        }
    }
}
