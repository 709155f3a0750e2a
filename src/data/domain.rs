//! Tabular records, feature rules and the frozen feature sets fitted from them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::error::EngineResult;
use crate::common::ids::StableHash;

/// A single cell of an already-materialised business record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    /// Strict numeric coercion: finite numbers, numeric strings and booleans only.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) if n.is_finite() => Some(*n),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Category label; `None` for nulls and blank strings.
    pub fn as_category(&self) -> Option<String> {
        match self {
            Value::Text(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) if n.is_finite() => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// One row of historical project/supplier/risk data, keyed by column name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Value)> {
        self.0.iter_mut()
    }
}

/// How a source column becomes one or more numeric features.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Numeric value passed through.
    Raw,
    /// Z-score with mean/std captured at fit time.
    Standardize,
    /// Scaled into [0, 1] with min/max captured at fit time (serving values may fall outside).
    MinMax,
    /// `ln(1 + x)`; values below -1 are invalid.
    Log1p,
    /// One column per fitted category plus an `unknown` bucket.
    OneHot,
}

/// `source` column → derived `feature`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureRule {
    pub source: String,
    pub feature: String,
    pub kind: RuleKind,
}

impl FeatureRule {
    pub fn new(source: impl Into<String>, kind: RuleKind) -> Self {
        let source = source.into();
        Self {
            feature: source.clone(),
            source,
            kind,
        }
    }

    pub fn named(mut self, feature: impl Into<String>) -> Self {
        self.feature = feature.into();
        self
    }
}

/// Statistics frozen at fit time and replayed verbatim at serving time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stats")]
pub enum RuleStats {
    None,
    Standardize { mean: f64, std: f64 },
    MinMax { min: f64, max: f64 },
    Vocabulary { categories: Vec<String> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FittedRule {
    pub rule: FeatureRule,
    pub stats: RuleStats,
}

/// Bucket name appended to every one-hot vocabulary.
pub const UNKNOWN_CATEGORY: &str = "__unknown__";

impl FittedRule {
    /// Output column names produced by this rule, in order.
    pub fn output_columns(&self) -> Vec<String> {
        match &self.stats {
            RuleStats::Vocabulary { categories } => categories
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(UNKNOWN_CATEGORY))
                .map(|c| format!("{}={}", self.rule.feature, c))
                .collect(),
            _ => vec![self.rule.feature.clone()],
        }
    }
}

/// Named, versioned transform configuration with its fitted statistics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub name: String,
    pub revision: u32,
    pub rules: Vec<FittedRule>,
    pub fitted_rows: usize,
}

impl FeatureSet {
    /// Canonical serialised form. Inference must see exactly these bytes.
    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn checksum(&self) -> EngineResult<u64> {
        Ok(StableHash::of(&self.to_bytes()?))
    }

    pub fn source_columns(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.rule.source.as_str()).collect()
    }

    pub fn output_columns(&self) -> Vec<String> {
        self.rules.iter().flat_map(FittedRule::output_columns).collect()
    }
}

/// Dense row-major matrix of engineered features.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    values: Vec<f64>,
}

impl FeatureMatrix {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            values: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: &[f64]) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.values.extend_from_slice(row);
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn len(&self) -> usize {
        if self.columns.is_empty() {
            0
        } else {
            self.values.len() / self.columns.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        let w = self.width();
        &self.values[idx * w..(idx + 1) * w]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        let w = self.width().max(1);
        self.values.chunks(w)
    }

    /// Little-endian bit patterns of every value; equal bytes mean identical matrices.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// Provider of the current training snapshot for a definition.
///
/// Errors returned here are treated as transient unless they are data errors.
pub trait DataSource: Send + Sync {
    fn snapshot(&self, definition_name: &str) -> EngineResult<Vec<Record>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_coercion_is_strict() {
        assert_eq!(Value::from(2.5).as_number(), Some(2.5));
        assert_eq!(Value::from(" 12 ").as_number(), Some(12.0));
        assert_eq!(Value::from("n/a").as_number(), None);
        assert_eq!(Value::Null.as_number(), None);
        assert_eq!(Value::Number(f64::NAN).as_number(), None);
    }

    #[test]
    fn records_deserialize_from_plain_json() {
        let rec: Record =
            serde_json::from_str(r#"{"budget": 1200.5, "region": "north", "late": true, "notes": null}"#)
                .unwrap();
        assert_eq!(rec.get("budget"), Some(&Value::Number(1200.5)));
        assert_eq!(rec.get("region"), Some(&Value::Text("north".into())));
        assert_eq!(rec.get("late"), Some(&Value::Bool(true)));
        assert_eq!(rec.get("notes"), Some(&Value::Null));
    }

    #[test]
    fn one_hot_columns_include_unknown_bucket() {
        let fitted = FittedRule {
            rule: FeatureRule::new("region", RuleKind::OneHot),
            stats: RuleStats::Vocabulary {
                categories: vec!["north".into(), "south".into()],
            },
        };
        assert_eq!(
            fitted.output_columns(),
            vec!["region=north", "region=south", "region=__unknown__"]
        );
    }
}
