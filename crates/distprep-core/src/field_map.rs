//! Field precedence across heterogeneous disturbance sources.
//!
//! [`build_schema`] turns an ordered list of source layers plus the logical
//! [`FieldSpec`]s into [`FieldMappings`]. [`merge_layers`] applies them: every
//! source row is copied into one flat layer and each output field takes the
//! first non-null input, in registration order, that the row's source provides.
//!
//! Registration order is the only precedence. No temporal reconciliation of
//! overlapping records is attempted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PrepError, Result};
use crate::layer::{Feature, FieldDef, FieldKind, FieldValue, Layer, UnitId};

// ── Configuration types ──────────────────────────────────────────────────────

/// A named family of source layers found by layer-name pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCategory {
    pub name: String,
    pub pattern: String,
}

impl SourceCategory {
    pub fn new(name: &str, pattern: &str) -> Self {
        Self { name: name.to_string(), pattern: pattern.to_string() }
    }
}

/// Character range used to normalise encodings such as `"20050612"` → `"2005"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstringRange {
    pub start: usize,
    pub length: usize,
}

impl SubstringRange {
    /// `None` when `start` is past the end of `text`.
    pub fn extract(&self, text: &str) -> Option<String> {
        if self.start >= text.chars().count() {
            return None;
        }
        Some(text.chars().skip(self.start).take(self.length).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceField {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substring: Option<SubstringRange>,
}

impl SourceField {
    pub fn plain(field: &str) -> Self {
        Self { field: field.to_string(), substring: None }
    }

    pub fn substring(field: &str, start: usize, length: usize) -> Self {
        Self { field: field.to_string(), substring: Some(SubstringRange { start, length }) }
    }
}

/// One physical field, or several tried in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceFields {
    One(SourceField),
    Many(Vec<SourceField>),
}

impl SourceFields {
    pub fn as_slice(&self) -> &[SourceField] {
        match self {
            SourceFields::One(f) => std::slice::from_ref(f),
            SourceFields::Many(v) => v,
        }
    }
}

/// A logical output field and, per source category, where to read it from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub output: String,
    /// Output type; defaults to the type of the first registered input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FieldKind>,
    pub inputs: BTreeMap<String, SourceFields>,
}

impl FieldSpec {
    /// Parse a spec, mapping missing or mistyped keys to a configuration error.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| PrepError::config(format!("malformed field spec: {e}")))
    }

    pub fn validate(&self, categories: &[SourceCategory]) -> Result<()> {
        if self.output.trim().is_empty() {
            return Err(PrepError::config("field spec has an empty output name"));
        }
        if self.inputs.is_empty() {
            return Err(PrepError::config(format!("field spec '{}' declares no inputs", self.output)));
        }
        for (category, fields) in &self.inputs {
            if !categories.iter().any(|c| &c.name == category) {
                return Err(PrepError::config(format!(
                    "field spec '{}' refers to unknown category '{category}'",
                    self.output
                )));
            }
            if fields.as_slice().is_empty() {
                return Err(PrepError::config(format!(
                    "field spec '{}' has no fields for category '{category}'",
                    self.output
                )));
            }
            for f in fields.as_slice() {
                if f.field.trim().is_empty() {
                    return Err(PrepError::config(format!(
                        "field spec '{}' has an empty field name for '{category}'",
                        self.output
                    )));
                }
                if f.substring.is_some_and(|s| s.length == 0) {
                    return Err(PrepError::config(format!(
                        "field spec '{}': substring of '{}' has zero length",
                        self.output, f.field
                    )));
                }
            }
        }
        Ok(())
    }
}

// ── Schema ───────────────────────────────────────────────────────────────────

/// A source layer in registration order, tagged with its category.
#[derive(Debug, Clone, Copy)]
pub struct SourceLayer<'a> {
    pub category: &'a str,
    pub layer: &'a Layer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInput {
    /// Index of the source layer in registration order.
    pub source: usize,
    pub field: String,
    pub substring: Option<SubstringRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeRule {
    /// First non-null input in registration order.
    #[default]
    First,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldMap {
    pub output: FieldDef,
    pub inputs: Vec<FieldInput>,
    pub rule: MergeRule,
    logical: bool,
}

impl FieldMap {
    fn pass_through(def: &FieldDef, source: usize) -> Self {
        Self {
            output: def.clone(),
            inputs: vec![FieldInput { source, field: def.name.clone(), substring: None }],
            rule: MergeRule::First,
            logical: false,
        }
    }

    /// Value of this field for `feature`, a row of source `source`.
    pub fn resolve(&self, source: usize, feature: &Feature) -> FieldValue {
        match self.rule {
            MergeRule::First => self
                .inputs
                .iter()
                .filter(|input| input.source == source)
                .map(|input| self.extract(input, feature))
                .find(|v| !v.is_null())
                .unwrap_or_default(),
        }
    }

    fn extract(&self, input: &FieldInput, feature: &Feature) -> FieldValue {
        let raw = feature.get(&input.field);
        match input.substring {
            None => raw.clone(),
            Some(range) => raw
                .to_text()
                .and_then(|text| range.extract(&text))
                .map(|part| FieldValue::from_text(&part, self.output.kind))
                .unwrap_or_default(),
        }
    }
}

/// The unified output schema of a multi-source merge.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldMappings {
    maps: Vec<FieldMap>,
    sources: usize,
}

impl FieldMappings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn maps(&self) -> &[FieldMap] {
        &self.maps
    }

    pub fn map(&self, output: &str) -> Option<&FieldMap> {
        self.maps.iter().find(|m| m.output.name == output)
    }

    pub fn source_count(&self) -> usize {
        self.sources
    }

    /// Register a source table: each of its fields passes through under its
    /// own name. Same-named fields of later tables join the existing mapping.
    pub fn add_table(&mut self, layer: &Layer) -> usize {
        let source = self.sources;
        self.sources += 1;
        for def in &layer.fields {
            match self.maps.iter_mut().find(|m| m.output.name == def.name) {
                Some(existing) if !existing.logical => existing.inputs.push(FieldInput {
                    source,
                    field: def.name.clone(),
                    substring: None,
                }),
                Some(_) => {}
                None => self.maps.push(FieldMap::pass_through(def, source)),
            }
        }
        source
    }

    /// Add a logical mapping, replacing any pass-through of the same name.
    pub fn add_field_map(&mut self, map: FieldMap) {
        match self.maps.iter_mut().find(|m| m.output.name == map.output.name) {
            Some(existing) => *existing = map,
            None => self.maps.push(map),
        }
    }
}

/// Build the merge schema for `sources` (in precedence order).
pub fn build_schema(sources: &[SourceLayer<'_>], specs: &[FieldSpec]) -> Result<FieldMappings> {
    let mut mappings = FieldMappings::new();
    for s in sources {
        mappings.add_table(s.layer);
    }

    for spec in specs {
        let mut inputs = Vec::new();
        let mut first_kind = None;
        for (index, s) in sources.iter().enumerate() {
            let Some(fields) = spec.inputs.get(s.category) else {
                continue;
            };
            for f in fields.as_slice() {
                let Some(def) = s.layer.field(&f.field) else {
                    debug!(layer = %s.layer.name, field = %f.field, output = %spec.output, "source lacks field");
                    continue;
                };
                first_kind.get_or_insert(def.kind);
                inputs.push(FieldInput { source: index, field: f.field.clone(), substring: f.substring });
            }
        }
        if inputs.is_empty() {
            warn!(output = %spec.output, "no source layer provides this field; it will be null");
        }
        let kind = spec.kind.or(first_kind).unwrap_or(FieldKind::Integer);
        mappings.add_field_map(FieldMap {
            output: FieldDef::new(&spec.output, kind).with_alias(&spec.output),
            inputs,
            rule: MergeRule::First,
            logical: true,
        });
    }
    Ok(mappings)
}

/// Concatenate `inputs` (in registration order) into one layer named `name`.
/// Units get fresh sequential ids starting at 1.
pub fn merge_layers(inputs: &[&Layer], mappings: &FieldMappings, name: &str) -> Result<Layer> {
    let Some(first) = inputs.first() else {
        return Err(PrepError::EmptyInput(format!("no source layers to merge into '{name}'")));
    };
    if inputs.len() != mappings.source_count() {
        return Err(PrepError::config(format!(
            "merge of '{name}' got {} layers but the schema registers {}",
            inputs.len(),
            mappings.source_count()
        )));
    }
    if let Some(odd) = inputs.iter().find(|l| l.shape_type != first.shape_type) {
        return Err(PrepError::config(format!(
            "cannot merge {} layer '{}' with {} layer '{}'",
            odd.shape_type, odd.name, first.shape_type, first.name
        )));
    }

    let mut out = Layer::new(name, first.shape_type);
    out.fields = mappings.maps().iter().map(|m| m.output.clone()).collect();
    let mut next_id: UnitId = 1;
    for (source, layer) in inputs.iter().enumerate() {
        for unit in &layer.features {
            let mut row = Feature::new(next_id, unit.geometry.clone());
            for map in mappings.maps() {
                row.set(&map.output.name, map.resolve(source, unit));
            }
            out.features.push(row);
            next_id += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Geometry, ShapeType};
    use serde_json::json;

    fn categories() -> Vec<SourceCategory> {
        vec![
            SourceCategory::new("fire_historic", "NFDB*"),
            SourceCategory::new("fire_recent", "NBAC*"),
            SourceCategory::new("harvest", "BC_cutblocks90_15*"),
        ]
    }

    fn dist_year_spec() -> FieldSpec {
        FieldSpec {
            output: "DistYEAR".to_string(),
            kind: None,
            inputs: BTreeMap::from([
                ("fire_historic".to_string(), SourceFields::One(SourceField::plain("YEAR_"))),
                ("fire_recent".to_string(), SourceFields::One(SourceField::substring("EDATE", 0, 4))),
                ("harvest".to_string(), SourceFields::One(SourceField::plain("HARV_YR"))),
            ]),
        }
    }

    fn layer(name: &str, field: &str, kind: FieldKind, values: Vec<FieldValue>) -> Layer {
        let mut l = Layer::new(name, ShapeType::Polygon);
        l.add_field(FieldDef::new(field, kind));
        for (i, v) in values.into_iter().enumerate() {
            let mut f = Feature::new(i as UnitId + 1, Geometry::rect(0.0, 0.0, 1.0, 1.0));
            f.set(field, v);
            l.features.push(f);
        }
        l
    }

    #[test]
    fn substring_extraction() {
        let r = SubstringRange { start: 0, length: 4 };
        assert_eq!(r.extract("20050612").as_deref(), Some("2005"));
        assert_eq!(r.extract("199").as_deref(), Some("199"));
        assert_eq!(SubstringRange { start: 9, length: 2 }.extract("20050612"), None);
    }

    #[test]
    fn each_source_row_takes_its_own_field() {
        let nfdb = layer("NFDB_poly", "YEAR_", FieldKind::Integer, vec![1995.into()]);
        let nbac = layer("NBAC_poly", "EDATE", FieldKind::Text, vec!["20050612".into()]);
        let cut = layer("BC_cutblocks90_15", "HARV_YR", FieldKind::Integer, vec![2010.into()]);
        let sources = [
            SourceLayer { category: "fire_historic", layer: &nfdb },
            SourceLayer { category: "fire_recent", layer: &nbac },
            SourceLayer { category: "harvest", layer: &cut },
        ];
        let schema = build_schema(&sources, &[dist_year_spec()]).unwrap();
        let year = schema.map("DistYEAR").unwrap();
        assert_eq!(year.output.kind, FieldKind::Integer);
        assert_eq!(year.output.alias.as_deref(), Some("DistYEAR"));
        assert_eq!(year.inputs.len(), 3);

        let merged = merge_layers(&[&nfdb, &nbac, &cut], &schema, "MergedDisturbances_polys").unwrap();
        let years: Vec<&FieldValue> = merged.features.iter().map(|f| f.get("DistYEAR")).collect();
        assert_eq!(years, vec![&FieldValue::Integer(1995), &FieldValue::Integer(2005), &FieldValue::Integer(2010)]);
        // Original per-source attributes survive under their own names.
        assert_eq!(merged.features[1].get("EDATE"), &FieldValue::from("20050612"));
        assert!(merged.features[0].get("EDATE").is_null());
        let ids: Vec<UnitId> = merged.features.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn first_registered_non_null_wins() {
        // One table carrying both a fire and a harvest year for the same unit.
        let mut both = Layer::new("combined", ShapeType::Polygon);
        both.add_field(FieldDef::new("FIRE_YR", FieldKind::Integer));
        both.add_field(FieldDef::new("HARV_YR", FieldKind::Integer));
        both.features.push(
            Feature::new(1, Geometry::rect(0.0, 0.0, 1.0, 1.0)).with("FIRE_YR", 1998).with("HARV_YR", 2003),
        );
        both.features.push(Feature::new(2, Geometry::rect(0.0, 0.0, 1.0, 1.0)).with("HARV_YR", 2003));
        let spec = FieldSpec {
            output: "DistYEAR".to_string(),
            kind: None,
            inputs: BTreeMap::from([(
                "harvest".to_string(),
                SourceFields::Many(vec![SourceField::plain("FIRE_YR"), SourceField::plain("HARV_YR")]),
            )]),
        };
        let sources = [SourceLayer { category: "harvest", layer: &both }];
        let schema = build_schema(&sources, &[spec]).unwrap();
        let merged = merge_layers(&[&both], &schema, "m").unwrap();
        assert_eq!(merged.features[0].get("DistYEAR"), &FieldValue::Integer(1998));
        assert_eq!(merged.features[1].get("DistYEAR"), &FieldValue::Integer(2003));
    }

    #[test]
    fn fire_and_harvest_layers_register_in_source_order() {
        let fire = layer("NFDB_poly", "YEAR_", FieldKind::Integer, vec![1995.into(), FieldValue::Null]);
        let harvest = layer("BC_cutblocks90_15", "HARV_YR", FieldKind::Integer, vec![2012.into()]);
        let sources = [
            SourceLayer { category: "fire_historic", layer: &fire },
            SourceLayer { category: "harvest", layer: &harvest },
        ];
        let schema = build_schema(&sources, &[dist_year_spec()]).unwrap();
        let year = schema.map("DistYEAR").unwrap();
        let inputs: Vec<(usize, &str)> = year.inputs.iter().map(|i| (i.source, i.field.as_str())).collect();
        assert_eq!(inputs, vec![(0, "YEAR_"), (1, "HARV_YR")]);

        let merged = merge_layers(&[&fire, &harvest], &schema, "MergedDisturbances_polys").unwrap();
        let rows: Vec<(UnitId, &FieldValue)> = merged.features.iter().map(|f| (f.id, f.get("DistYEAR"))).collect();
        assert_eq!(rows, vec![(1, &FieldValue::Integer(1995)), (2, &FieldValue::Null), (3, &FieldValue::Integer(2012))]);
        assert!(merged.features[2].get("YEAR_").is_null());
        assert_eq!(merged, merge_layers(&[&fire, &harvest], &schema, "MergedDisturbances_polys").unwrap());
    }

    #[test]
    fn same_named_fields_share_one_mapping() {
        let a = layer("NFDB_a", "YEAR_", FieldKind::Integer, vec![1990.into()]);
        let b = layer("NFDB_b", "YEAR_", FieldKind::Integer, vec![1991.into()]);
        let mut schema = FieldMappings::new();
        schema.add_table(&a);
        schema.add_table(&b);
        assert_eq!(schema.maps().len(), 1);
        let merged = merge_layers(&[&a, &b], &schema, "m").unwrap();
        assert_eq!(merged.features[1].get("YEAR_"), &FieldValue::Integer(1991));
    }

    #[test]
    fn merging_twice_is_identical() {
        let nfdb = layer("NFDB_poly", "YEAR_", FieldKind::Integer, vec![1995.into(), FieldValue::Null]);
        let cut = layer("BC_cutblocks90_15", "HARV_YR", FieldKind::Integer, vec![2010.into(), 2011.into()]);
        let sources = [
            SourceLayer { category: "fire_historic", layer: &nfdb },
            SourceLayer { category: "harvest", layer: &cut },
        ];
        let run = || {
            let schema = build_schema(&sources, &[dist_year_spec()]).unwrap();
            merge_layers(&[&nfdb, &cut], &schema, "m").unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn malformed_spec_fails_fast() {
        let missing_field = json!({
            "output": "DistYEAR",
            "inputs": { "harvest": { "substring": { "start": 0, "length": 4 } } }
        });
        assert!(matches!(FieldSpec::from_json(missing_field), Err(PrepError::Configuration(_))));

        let missing_inputs = json!({ "output": "DistYEAR" });
        assert!(matches!(FieldSpec::from_json(missing_inputs), Err(PrepError::Configuration(_))));

        let bad_length = json!({
            "output": "DistYEAR",
            "inputs": { "fire_recent": { "field": "EDATE", "substring": { "start": 0, "length": 0 } } }
        });
        let spec = FieldSpec::from_json(bad_length).unwrap();
        assert!(matches!(spec.validate(&categories()), Err(PrepError::Configuration(_))));
    }

    #[test]
    fn unknown_category_is_rejected() {
        let spec = FieldSpec::from_json(json!({
            "output": "DistYEAR",
            "inputs": { "insect": { "field": "YEAR" } }
        }))
        .unwrap();
        assert!(matches!(spec.validate(&categories()), Err(PrepError::Configuration(_))));
        assert!(dist_year_spec().validate(&categories()).is_ok());
    }

    #[test]
    fn merge_rejects_mixed_shapes_and_empty_input() {
        let polys = layer("NFDB_poly", "YEAR_", FieldKind::Integer, vec![1995.into()]);
        let mut lines = Layer::new("NFDB_lines", ShapeType::Line);
        lines.add_field(FieldDef::new("YEAR_", FieldKind::Integer));
        let mut schema = FieldMappings::new();
        schema.add_table(&polys);
        schema.add_table(&lines);
        assert!(matches!(merge_layers(&[&polys, &lines], &schema, "m"), Err(PrepError::Configuration(_))));
        assert!(matches!(merge_layers(&[], &FieldMappings::new(), "m"), Err(PrepError::EmptyInput(_))));
    }
}
