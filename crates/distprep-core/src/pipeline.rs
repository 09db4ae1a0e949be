//! Disturbance merge pipeline: discover source layers, merge them under one
//! schema and join the result onto the reference grid.
//!
//! ```text
//! workspaces x categories → build_schema → engine.merge → largest overlap with grid
//! ```
//!
//! Both outputs are staged in a scratch workspace and committed together once
//! every step has succeeded. A failed commit leaves the output workspace as it
//! was.

use tracing::{info, warn};

use crate::config::MergeConfig;
use crate::engine::GeometryEngine;
use crate::error::{PrepError, Result};
use crate::field_map::{build_schema, SourceLayer};
use crate::layer::{Layer, ShapeType};
use crate::overlap::OverlapResolver;
use crate::workspace::{LayerPath, ScratchWorkspace, Workspace};

const SCRATCH_NAME: &str = "merge_temp";

/// A discovered source layer and the category it was found under.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredSource {
    pub category: String,
    pub layer: LayerPath,
    pub units: usize,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merged: LayerPath,
    pub gridded: LayerPath,
    /// Registration order, which is also merge precedence.
    pub sources: Vec<RegisteredSource>,
}

pub struct DisturbanceMergePipeline<'e, E: GeometryEngine> {
    engine: &'e E,
}

impl<'e, E: GeometryEngine> DisturbanceMergePipeline<'e, E> {
    pub fn new(engine: &'e E) -> Self {
        Self { engine }
    }

    pub fn run(&self, config: &MergeConfig) -> Result<MergeOutcome> {
        config.validate()?;

        let workspaces = config
            .source_workspaces
            .iter()
            .map(Workspace::open)
            .collect::<Result<Vec<_>>>()?;

        let grid_path = LayerPath::parse(&config.grid)?;
        let out_ws = Workspace::create(&config.output_workspace)?;
        let merged_path = out_ws.layer_path(&config.merged_name);
        let gridded_path = out_ws.layer_path(&config.gridded_name);
        LayerPath::guard_overwrite(&grid_path, &merged_path)?;
        LayerPath::guard_overwrite(&grid_path, &gridded_path)?;

        let (sources, layers) = self.discover(config, &workspaces)?;
        for s in &sources {
            LayerPath::guard_overwrite(&s.layer, &merged_path)?;
            LayerPath::guard_overwrite(&s.layer, &gridded_path)?;
        }

        let grid = match Workspace::open(&grid_path.workspace)?.read_layer(&grid_path.name) {
            Ok(layer) => layer,
            Err(PrepError::LayerNotFound { .. }) => {
                return Err(PrepError::EmptyInput(format!("reference grid {grid_path} not found")))
            }
            Err(e) => return Err(e),
        };
        if grid.count() == 0 {
            return Err(PrepError::EmptyInput(format!("reference grid {grid_path} has no units")));
        }

        let registered: Vec<SourceLayer<'_>> = sources
            .iter()
            .zip(&layers)
            .map(|(s, layer)| SourceLayer { category: &s.category, layer })
            .collect();
        let mappings = build_schema(&registered, &config.field_specs)?;
        let inputs: Vec<&Layer> = layers.iter().collect();

        let scratch = ScratchWorkspace::create(out_ws.path(), SCRATCH_NAME)?;
        let merged = self.engine.merge(&inputs, &mappings, &config.merged_name)?;
        let staged_merged = scratch.write_layer(&merged)?;
        info!(layer = %staged_merged, units = merged.count(), "merged disturbance polygons");

        let joined = OverlapResolver::new(self.engine).resolve(&grid, &merged, &config.gridded_name, false)?;
        scratch.write_layer(&joined.layer)?;

        out_ws.commit_layers(&scratch, &[config.merged_name.as_str(), config.gridded_name.as_str()])?;
        if let Err(e) = scratch.close() {
            warn!("resource cleanup failure: {e}");
        }

        info!(
            merged = %merged_path,
            gridded = %gridded_path,
            sources = sources.len(),
            "disturbance merge complete"
        );
        Ok(MergeOutcome { merged: merged_path, gridded: gridded_path, sources })
    }

    /// Source layers per workspace, then per category in precedence order,
    /// then by layer name. Only polygon layers are considered.
    fn discover(&self, config: &MergeConfig, workspaces: &[Workspace]) -> Result<(Vec<RegisteredSource>, Vec<Layer>)> {
        let mut sources = Vec::new();
        let mut layers = Vec::new();
        for ws in workspaces {
            for category in &config.categories {
                let names = ws.list_layers(&category.pattern, Some(ShapeType::Polygon))?;
                if names.is_empty() {
                    info!(
                        workspace = %ws.path().display(),
                        category = %category.name,
                        "no source layers for category"
                    );
                    continue;
                }
                for name in names {
                    let layer = ws.read_layer(&name)?;
                    info!(layer = %ws.layer_path(&name), category = %category.name, units = layer.count(), "registered source layer");
                    sources.push(RegisteredSource {
                        category: category.name.clone(),
                        layer: ws.layer_path(&name),
                        units: layer.count(),
                    });
                    layers.push(layer);
                }
            }
        }
        if sources.is_empty() {
            return Err(PrepError::EmptyInput("no disturbance source layers found".to_string()));
        }
        Ok((sources, layers))
    }
}
