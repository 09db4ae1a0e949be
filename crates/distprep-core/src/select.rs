//! Attribute selection: exact-match and compound filters over named fields.

use crate::layer::{Feature, FieldValue};

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `field = value`, compared numerically when both sides are numeric.
    Eq(String, FieldValue),
    /// `field > threshold`. Nulls and non-numeric values never match.
    Gt(String, f64),
    /// Every part matches. Empty matches everything.
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(field: &str, value: impl Into<FieldValue>) -> Self {
        Predicate::Eq(field.to_string(), value.into())
    }

    pub fn gt(field: &str, threshold: f64) -> Self {
        Predicate::Gt(field.to_string(), threshold)
    }

    pub fn matches(&self, feature: &Feature) -> bool {
        match self {
            Predicate::Eq(field, value) => values_equal(feature.get(field), value),
            Predicate::Gt(field, threshold) => {
                feature.get(field).as_f64().is_some_and(|v| v > *threshold)
            }
            Predicate::And(parts) => parts.iter().all(|p| p.matches(feature)),
        }
    }
}

fn values_equal(a: &FieldValue, b: &FieldValue) -> bool {
    if a.is_null() || b.is_null() {
        return false;
    }
    match (a, b) {
        (FieldValue::Text(x), FieldValue::Text(y)) => x == y,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}
