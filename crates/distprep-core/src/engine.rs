//! Geometry engine seam and the planar implementation built on `geo`.
//!
//! The algorithms never compute geometry themselves. They ask an engine for
//! shape types, intersection candidates and the multi-source merge.

use geo::{Area, BooleanOps, BoundingRect, EuclideanLength, Intersects, MultiLineString, Rect};

use crate::error::Result;
use crate::field_map::{merge_layers, FieldMappings};
use crate::layer::{Layer, ShapeType, UnitId};

/// Which property of an intersection is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureKind {
    Area,
    Length,
}

impl MeasureKind {
    /// AREA when both inputs are polygons, LENGTH otherwise.
    pub fn for_shapes(target: ShapeType, join: ShapeType) -> Self {
        if target == ShapeType::Polygon && join == ShapeType::Polygon {
            MeasureKind::Area
        } else {
            MeasureKind::Length
        }
    }
}

/// One intersecting (target, join) pair and the size of their overlap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlapCandidate {
    pub target_id: UnitId,
    pub join_id: UnitId,
    pub measure: f64,
}

impl OverlapCandidate {
    pub fn new(target_id: UnitId, join_id: UnitId, measure: f64) -> Self {
        Self { target_id, join_id, measure }
    }
}

pub trait GeometryEngine {
    fn shape_type(&self, layer: &Layer) -> ShapeType {
        layer.shape_type
    }

    /// Every intersecting pair of `target` and `join` units. The returned
    /// order is the enumeration order tie-breaking relies on.
    fn intersect(&self, target: &Layer, join: &Layer, kind: MeasureKind) -> Vec<OverlapCandidate>;

    /// Concatenate `inputs` into one layer, resolving fields through `mappings`.
    fn merge(&self, inputs: &[&Layer], mappings: &FieldMappings, name: &str) -> Result<Layer> {
        merge_layers(inputs, mappings, name)
    }
}

/// Planar (Cartesian) engine. Candidates are enumerated target-major, then in
/// join-layer order.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanarEngine;

impl GeometryEngine for PlanarEngine {
    fn intersect(&self, target: &Layer, join: &Layer, kind: MeasureKind) -> Vec<OverlapCandidate> {
        let joins: Vec<(UnitId, geo::Geometry<f64>, Option<Rect<f64>>)> = join
            .features
            .iter()
            .map(|f| {
                let g = f.geometry.to_geo();
                let bbox = g.bounding_rect();
                (f.id, g, bbox)
            })
            .collect();

        let mut out = Vec::new();
        for t in &target.features {
            let tg = t.geometry.to_geo();
            let tb = tg.bounding_rect();
            for (join_id, jg, jb) in &joins {
                if let (Some(a), Some(b)) = (tb, *jb) {
                    if !a.intersects(&b) {
                        continue;
                    }
                }
                if let Some(measure) = overlap_measure(&tg, jg, kind) {
                    out.push(OverlapCandidate::new(t.id, *join_id, measure));
                }
            }
        }
        out
    }
}

/// Size of the intersection, or `None` when the shapes do not intersect.
/// Boundary-only contact between a polygon and another shape is not an
/// overlap. Pairs with no polygon to clip against (line×line, points) measure
/// 0 whenever they intersect.
fn overlap_measure(a: &geo::Geometry<f64>, b: &geo::Geometry<f64>, kind: MeasureKind) -> Option<f64> {
    use geo::Geometry as G;
    match (a, b) {
        (G::Polygon(pa), G::Polygon(pb)) => {
            let shared = pa.intersection(pb);
            let area = shared.unsigned_area();
            if area <= 0.0 {
                return None;
            }
            Some(match kind {
                MeasureKind::Area => area,
                MeasureKind::Length => shared.0.iter().map(|p| p.exterior().euclidean_length()).sum(),
            })
        }
        (G::Polygon(p), G::LineString(l)) | (G::LineString(l), G::Polygon(p)) => {
            let length = p
                .clip(&MultiLineString::new(vec![l.clone()]), false)
                .euclidean_length();
            (length > 0.0).then_some(length)
        }
        _ => a.intersects(b).then_some(0.0),
    }
}
