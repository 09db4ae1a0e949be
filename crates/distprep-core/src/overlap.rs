//! Largest-overlap spatial join.
//!
//! Every target unit is matched to the single join unit it overlaps most. The
//! winner's id is stamped into `JOIN_FID` and the winner's attributes are then
//! attached by a relational join on that id.
//!
//! Tie rule: a stored match is replaced only by a strictly larger measure, so
//! among equal measures the candidate enumerated first wins. Enumeration order
//! is whatever the engine returns (target-major for [`crate::PlanarEngine`]).

use std::collections::HashMap;
use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::engine::{GeometryEngine, MeasureKind, OverlapCandidate};
use crate::error::{PrepError, Result};
use crate::layer::{Feature, FieldDef, FieldKind, FieldValue, Layer, UnitId};
use crate::workspace::{LayerPath, Workspace};

/// Original target unit id.
pub const ORIG_FID: &str = "ORIG_FID";
/// Id of the join unit with the largest overlap.
pub const JOIN_FID: &str = "JOIN_FID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialRelation {
    LargestOverlap,
}

impl FromStr for SpatialRelation {
    type Err = PrepError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "largest_overlap" => Ok(SpatialRelation::LargestOverlap),
            other => Err(PrepError::config(format!("unsupported spatial relationship '{other}'"))),
        }
    }
}

// ── Best-match mapping ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMatch {
    pub join_id: UnitId,
    pub measure: f64,
}

/// `target_id -> best join candidate`, at most one entry per target.
#[derive(Debug, Clone, Default)]
pub struct BestMatches {
    by_target: HashMap<UnitId, BestMatch>,
}

impl BestMatches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_candidates(candidates: impl IntoIterator<Item = OverlapCandidate>) -> Self {
        let mut matches = Self::new();
        for c in candidates {
            matches.observe(c);
        }
        matches
    }

    /// Record a candidate. Returns true if it became the stored match.
    pub fn observe(&mut self, c: OverlapCandidate) -> bool {
        let next = BestMatch { join_id: c.join_id, measure: c.measure };
        match self.by_target.get_mut(&c.target_id) {
            Some(current) if c.measure > current.measure => {
                *current = next;
                true
            }
            Some(_) => false,
            None => {
                self.by_target.insert(c.target_id, next);
                true
            }
        }
    }

    pub fn get(&self, target_id: UnitId) -> Option<BestMatch> {
        self.by_target.get(&target_id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_target.is_empty()
    }
}

// ── Resolver ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct JoinResult {
    pub layer: Layer,
    pub matches: BestMatches,
}

pub struct OverlapResolver<'e, E: GeometryEngine> {
    engine: &'e E,
}

impl<'e, E: GeometryEngine> OverlapResolver<'e, E> {
    pub fn new(engine: &'e E) -> Self {
        Self { engine }
    }

    /// Join `join` onto `target` by largest overlap.
    ///
    /// Unmatched targets are dropped unless `keep_all`, in which case they are
    /// kept with a null `JOIN_FID` and null join attributes.
    pub fn resolve(&self, target: &Layer, join: &Layer, output_name: &str, keep_all: bool) -> Result<JoinResult> {
        let kind = MeasureKind::for_shapes(self.engine.shape_type(target), self.engine.shape_type(join));
        let candidates = self.engine.intersect(target, join, kind);
        debug!(target = %target.name, join = %join.name, ?kind, candidates = candidates.len(), "intersected");
        let matches = BestMatches::from_candidates(candidates);
        if matches.is_empty() && !target.features.is_empty() {
            warn!(target = %target.name, join = %join.name, "no target unit overlaps the join layer");
        }

        let mut out = Layer::new(output_name, target.shape_type);
        out.fields = target.fields.clone();
        out.add_field(FieldDef::new(ORIG_FID, FieldKind::Integer).with_alias(ORIG_FID));
        out.add_field(FieldDef::new(JOIN_FID, FieldKind::Integer).with_alias(JOIN_FID));

        let mut dropped = 0usize;
        for (i, unit) in target.features.iter().enumerate() {
            let mut copy = Feature {
                id: i as UnitId + 1,
                geometry: unit.geometry.clone(),
                attributes: unit.attributes.clone(),
            };
            copy.set(ORIG_FID, FieldValue::Integer(unit.id));
            match matches.get(unit.id) {
                Some(m) => copy.set(JOIN_FID, FieldValue::Integer(m.join_id)),
                None if keep_all => copy.set(JOIN_FID, FieldValue::Null),
                None => {
                    dropped += 1;
                    continue;
                }
            }
            out.features.push(copy);
        }

        join_fields(&mut out, join);
        info!(
            output = output_name,
            matched = matches.len(),
            dropped,
            kept = out.count(),
            "largest-overlap join complete"
        );
        Ok(JoinResult { layer: out, matches })
    }
}

/// Attach every attribute of `join` to `out` keyed by `JOIN_FID`. Names that
/// already exist in `out` get a numeric suffix.
fn join_fields(out: &mut Layer, join: &Layer) {
    let renamed: Vec<(String, String)> = join
        .fields
        .iter()
        .map(|def| {
            let name = unique_field_name(out, &def.name);
            out.add_field(FieldDef { name: name.clone(), kind: def.kind, alias: def.alias.clone() });
            (def.name.clone(), name)
        })
        .collect();

    let by_id: HashMap<UnitId, &Feature> = join.features.iter().map(|f| (f.id, f)).collect();
    for unit in &mut out.features {
        let source = unit.get(JOIN_FID).as_i64().and_then(|id| by_id.get(&id).copied());
        for (src, dst) in &renamed {
            let value = source.map(|f| f.get(src).clone()).unwrap_or_default();
            unit.set(dst, value);
        }
    }
}

fn unique_field_name(layer: &Layer, base: &str) -> String {
    if !layer.has_field(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !layer.has_field(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Read both layers, join them and write the result to `output`.
pub fn resolve_largest_overlap<E: GeometryEngine>(
    engine: &E,
    target: &LayerPath,
    join: &LayerPath,
    output: &LayerPath,
    keep_all: bool,
) -> Result<LayerPath> {
    LayerPath::guard_overwrite(target, output)?;
    LayerPath::guard_overwrite(join, output)?;

    let target_layer = Workspace::open(&target.workspace)?.read_layer(&target.name)?;
    let join_layer = Workspace::open(&join.workspace)?.read_layer(&join.name)?;
    let result = OverlapResolver::new(engine).resolve(&target_layer, &join_layer, &output.name, keep_all)?;
    Workspace::create(&output.workspace)?.write_layer(&result.layer)
}
