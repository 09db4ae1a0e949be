//! Disturbance-data preparation for inventory rollback.
//!
//! Source layers (fire, harvest, ...) are merged under one schema, gridded onto
//! a reference grid by largest overlap, and supplemented with sampled
//! slash-burn units for the historic period.

pub mod config;
pub mod engine;
pub mod error;
pub mod field_map;
pub mod historic;
pub mod layer;
pub mod overlap;
pub mod pipeline;
pub mod select;
pub mod slashburn;
pub mod workspace;

pub use engine::{GeometryEngine, MeasureKind, OverlapCandidate, PlanarEngine};
pub use error::{PrepError, Result};
pub use layer::{Feature, FieldDef, FieldKind, FieldValue, Geometry, Layer, ShapeType, UnitId};
pub use workspace::{LayerPath, ScratchWorkspace, Workspace};
