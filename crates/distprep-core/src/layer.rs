//! In-memory feature layers: the spatial units every stage reads and writes.
//!
//! A layer's system fields are the unit id and the geometry. Everything in
//! `Layer::fields` is an ordinary attribute.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use geo::{Coord, LineString, Point, Polygon};
use serde::{Deserialize, Serialize};

use crate::select::Predicate;

/// Stable integer identifier of a spatial unit (the OID of its layer).
pub type UnitId = i64;

static NULL: FieldValue = FieldValue::Null;

// ── Attribute values ─────────────────────────────────────────────────────────

/// A single attribute value. JSON `null` maps to [`FieldValue::Null`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Integer view of the value. Floats must be integral; text must parse.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Null => None,
            FieldValue::Integer(v) => Some(*v),
            FieldValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            FieldValue::Float(_) => None,
            FieldValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Null => None,
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Text form used for substring extraction. `None` for null.
    pub fn to_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Integer(v) => Some(v.to_string()),
            FieldValue::Float(v) => Some(v.to_string()),
            FieldValue::Text(s) => Some(s.clone()),
        }
    }

    /// Convert text produced by substring extraction into a field of `kind`.
    /// Unparseable text becomes null.
    pub fn from_text(text: &str, kind: FieldKind) -> FieldValue {
        match kind {
            FieldKind::Text => FieldValue::Text(text.to_string()),
            FieldKind::Integer => text
                .trim()
                .parse()
                .map(FieldValue::Integer)
                .unwrap_or(FieldValue::Null),
            FieldKind::Float => text
                .trim()
                .parse()
                .map(FieldValue::Float)
                .unwrap_or(FieldValue::Null),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(i64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("<null>"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

// ── Schema ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    Float,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self { name: name.into(), kind, alias: None }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeType {
    Polygon,
    Line,
    Point,
}

impl fmt::Display for ShapeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShapeType::Polygon => "polygon",
            ShapeType::Line => "line",
            ShapeType::Point => "point",
        };
        f.write_str(s)
    }
}

// ── Geometry ─────────────────────────────────────────────────────────────────

/// Planar geometry of one unit. Coordinates are `[x, y]` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    Polygon {
        exterior: Vec<[f64; 2]>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        interiors: Vec<Vec<[f64; 2]>>,
    },
    LineString {
        coords: Vec<[f64; 2]>,
    },
    Point {
        coord: [f64; 2],
    },
}

impl Geometry {
    /// Axis-aligned rectangle, the shape of a reference grid cell.
    pub fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Geometry::Polygon {
            exterior: vec![
                [min_x, min_y],
                [max_x, min_y],
                [max_x, max_y],
                [min_x, max_y],
                [min_x, min_y],
            ],
            interiors: Vec::new(),
        }
    }

    pub fn line(coords: Vec<[f64; 2]>) -> Self {
        Geometry::LineString { coords }
    }

    pub fn to_geo(&self) -> geo::Geometry<f64> {
        match self {
            Geometry::Polygon { exterior, interiors } => {
                let rings = interiors.iter().map(|r| ring(r)).collect();
                geo::Geometry::Polygon(Polygon::new(ring(exterior), rings))
            }
            Geometry::LineString { coords } => geo::Geometry::LineString(ring(coords)),
            Geometry::Point { coord } => geo::Geometry::Point(Point::new(coord[0], coord[1])),
        }
    }
}

fn ring(coords: &[[f64; 2]]) -> LineString<f64> {
    LineString::new(coords.iter().map(|&[x, y]| Coord { x, y }).collect())
}

// ── Features and layers ──────────────────────────────────────────────────────

/// One spatial unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: UnitId,
    pub geometry: Geometry,
    #[serde(default)]
    pub attributes: BTreeMap<String, FieldValue>,
}

impl Feature {
    pub fn new(id: UnitId, geometry: Geometry) -> Self {
        Self { id, geometry, attributes: BTreeMap::new() }
    }

    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.attributes.insert(field.to_string(), value.into());
        self
    }

    /// Attribute value, null when the attribute is absent.
    pub fn get(&self, field: &str) -> &FieldValue {
        self.attributes.get(field).unwrap_or(&NULL)
    }

    pub fn set(&mut self, field: &str, value: FieldValue) {
        self.attributes.insert(field.to_string(), value);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub shape_type: ShapeType,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl Layer {
    pub fn new(name: impl Into<String>, shape_type: ShapeType) -> Self {
        Self { name: name.into(), shape_type, fields: Vec::new(), features: Vec::new() }
    }

    pub fn count(&self) -> usize {
        self.features.len()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Add a field to the schema. Returns false if the name already exists.
    pub fn add_field(&mut self, def: FieldDef) -> bool {
        if self.has_field(&def.name) {
            return false;
        }
        self.fields.push(def);
        true
    }

    pub fn feature(&self, id: UnitId) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }

    /// Ids of the features matching `predicate`, in layer order.
    pub fn select(&self, predicate: &Predicate) -> Vec<UnitId> {
        self.features
            .iter()
            .filter(|f| predicate.matches(f))
            .map(|f| f.id)
            .collect()
    }

    /// New layer with the same schema holding copies of the selected features.
    pub fn copy_features(&self, name: &str, ids: &[UnitId]) -> Layer {
        let wanted: HashSet<UnitId> = ids.iter().copied().collect();
        Layer {
            name: name.to_string(),
            shape_type: self.shape_type,
            fields: self.fields.clone(),
            features: self
                .features
                .iter()
                .filter(|f| wanted.contains(&f.id))
                .cloned()
                .collect(),
        }
    }

    /// Append `other`'s features, keeping only attributes this schema knows.
    /// Returns the number of appended features.
    pub fn append_features(&mut self, other: &Layer) -> usize {
        let known: HashSet<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        let appended: Vec<Feature> = other
            .features
            .iter()
            .map(|f| {
                let mut copy = f.clone();
                copy.attributes.retain(|k, _| known.contains(k.as_str()));
                copy
            })
            .collect();
        let n = appended.len();
        self.features.extend(appended);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_layer() -> Layer {
        let mut layer = Layer::new("cutblocks", ShapeType::Polygon);
        layer.add_field(FieldDef::new("HARV_YR", FieldKind::Integer));
        for id in 1..=3 {
            layer.features.push(
                Feature::new(id, Geometry::rect(0.0, 0.0, 1.0, 1.0)).with("HARV_YR", 2000 + id),
            );
        }
        layer
    }

    #[test]
    fn field_value_json_null_round_trips() {
        let v: FieldValue = serde_json::from_str("null").unwrap();
        assert!(v.is_null());
        let v: FieldValue = serde_json::from_str("2005").unwrap();
        assert_eq!(v, FieldValue::Integer(2005));
        let v: FieldValue = serde_json::from_str("\"20050612\"").unwrap();
        assert_eq!(v.as_i64(), Some(20050612));
    }

    #[test]
    fn text_conversion_follows_field_kind() {
        assert_eq!(FieldValue::from_text("2005", FieldKind::Integer), FieldValue::Integer(2005));
        assert_eq!(FieldValue::from_text("20x5", FieldKind::Integer), FieldValue::Null);
        assert_eq!(FieldValue::from_text("2005", FieldKind::Text), FieldValue::from("2005"));
    }

    #[test]
    fn missing_attribute_reads_as_null() {
        let f = Feature::new(1, Geometry::rect(0.0, 0.0, 1.0, 1.0));
        assert!(f.get("DistYEAR").is_null());
    }

    #[test]
    fn copy_features_keeps_schema_and_selection() {
        let layer = sample_layer();
        let copy = layer.copy_features("subset", &[1, 3]);
        assert_eq!(copy.fields, layer.fields);
        let ids: Vec<UnitId> = copy.features.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn append_drops_unknown_attributes() {
        let mut target = Layer::new("out", ShapeType::Polygon);
        target.add_field(FieldDef::new("HARV_YR", FieldKind::Integer));
        let mut source = sample_layer();
        source.features[0].set("EXTRA", FieldValue::from("x"));
        assert_eq!(target.append_features(&source), 3);
        assert!(target.features[0].attributes.get("EXTRA").is_none());
        assert_eq!(target.features[0].get("HARV_YR"), &FieldValue::Integer(2001));
    }

    #[test]
    fn add_field_rejects_duplicates() {
        let mut layer = sample_layer();
        assert!(!layer.add_field(FieldDef::new("HARV_YR", FieldKind::Text)));
        assert_eq!(layer.fields.len(), 1);
    }
}
