//! Schema Descriptor
//!
//! Column semantics for the loaded campaign dataset. Built once per reload
//! and never mutated afterwards; every reload produces a new version.

use crate::error::{EngineError, Result};
use crate::metrics::{BaseMetric, RATIO_METRICS};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tracing::debug;

/// Categorical columns with at most this many distinct values keep them,
/// so questions like "spend on Facebook" can be turned into filters.
const MAX_TRACKED_DISTINCT_VALUES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    NumericAdditive,
    NumericRatio,
    Categorical,
    Date,
    Identifier,
}

impl SemanticType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::NumericAdditive => "numeric_additive",
            SemanticType::NumericRatio => "numeric_ratio",
            SemanticType::Categorical => "categorical",
            SemanticType::Date => "date",
            SemanticType::Identifier => "identifier",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, SemanticType::NumericAdditive | SemanticType::NumericRatio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayUnit {
    None,
    Count,
    Currency,
    /// Stored as a fraction, displayed as a percentage
    Percent,
    /// Displayed as "3.5x"
    Multiple,
}

/// Numerator/denominator columns a ratio column is recomputed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioBinding {
    pub metric: String,
    pub numerator: String,
    pub denominator: String,
    pub scale: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub semantic_type: SemanticType,
    pub unit: DisplayUnit,
    /// Set for ratio columns whose base columns exist in the dataset
    pub ratio: Option<RatioBinding>,
    /// Dimensions a pre-aggregated column is valid at (one row per combination)
    pub grain: Option<Vec<String>>,
    /// Known values of low-cardinality categorical columns
    #[serde(default)]
    pub distinct_values: Vec<String>,
}

/// Caller-supplied corrections to inferred schema semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaHint {
    pub date_column: Option<String>,
    pub semantic_types: HashMap<String, SemanticType>,
    pub units: HashMap<String, DisplayUnit>,
    pub grains: HashMap<String, Vec<String>>,
    pub base_metric_columns: HashMap<BaseMetric, String>,
}

impl SchemaHint {
    pub fn with_date_column(mut self, column: &str) -> Self {
        self.date_column = Some(column.to_string());
        self
    }

    pub fn with_semantic_type(mut self, column: &str, semantic_type: SemanticType) -> Self {
        self.semantic_types.insert(column.to_string(), semantic_type);
        self
    }

    pub fn with_grain(mut self, column: &str, grain: Vec<String>) -> Self {
        self.grains.insert(column.to_string(), grain);
        self
    }
}

/// Version identifier of the schema a cached answer was computed against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaFingerprint(pub String);

impl std::fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub table_name: String,
    pub columns: Vec<ColumnSpec>,
    pub date_column: Option<String>,
    pub version: u64,
    pub base_columns: HashMap<BaseMetric, String>,
    fingerprint: SchemaFingerprint,
}

impl SchemaDescriptor {
    /// Build a descriptor from explicit column specs.
    pub fn new(table_name: &str, columns: Vec<ColumnSpec>, version: u64) -> Self {
        let date_column = columns
            .iter()
            .find(|c| c.semantic_type == SemanticType::Date)
            .map(|c| c.name.clone());
        let base_columns = bind_base_columns(&columns, &HashMap::new());
        let fingerprint = compute_fingerprint(table_name, &columns, version);
        Self {
            table_name: table_name.to_string(),
            columns,
            date_column,
            version,
            base_columns,
            fingerprint,
        }
    }

    /// Infer column semantics from a loaded DataFrame plus optional hints.
    pub fn infer(df: &DataFrame, table_name: &str, hint: &SchemaHint, version: u64) -> Result<Self> {
        let mut columns = Vec::with_capacity(df.width());

        for series in df.get_columns() {
            let name = series.name().to_string();
            let semantic_type = match hint.semantic_types.get(&name) {
                Some(t) => *t,
                None => infer_semantic_type(&name, series.dtype(), hint),
            };

            let distinct_values = if semantic_type == SemanticType::Categorical {
                distinct_strings(series)?
            } else {
                Vec::new()
            };

            columns.push(ColumnSpec {
                unit: hint
                    .units
                    .get(&name)
                    .copied()
                    .unwrap_or_else(|| default_unit(&name, semantic_type)),
                grain: hint.grains.get(&name).cloned(),
                ratio: None,
                name,
                semantic_type,
                distinct_values,
            });
        }

        if let Some(date_col) = &hint.date_column {
            if !columns.iter().any(|c| &c.name == date_col) {
                return Err(EngineError::Dataset(format!(
                    "Date column '{}' not found in dataset",
                    date_col
                )));
            }
        }

        let base_columns = bind_base_columns(&columns, &hint.base_metric_columns);
        bind_ratio_columns(&mut columns, &base_columns);

        let date_column = hint.date_column.clone().or_else(|| {
            columns
                .iter()
                .find(|c| c.semantic_type == SemanticType::Date)
                .map(|c| c.name.clone())
        });

        let fingerprint = compute_fingerprint(table_name, &columns, version);
        debug!(
            "Inferred schema {} with {} columns (date column: {:?})",
            fingerprint,
            columns.len(),
            date_column
        );

        Ok(Self {
            table_name: table_name.to_string(),
            columns,
            date_column,
            version,
            base_columns,
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> &SchemaFingerprint {
        &self.fingerprint
    }

    /// Case-insensitive column lookup
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table_name.eq_ignore_ascii_case(name)
    }

    pub fn base_column(&self, base: BaseMetric) -> Option<&str> {
        self.base_columns.get(&base).map(|s| s.as_str())
    }

    pub fn categorical_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns
            .iter()
            .filter(|c| c.semantic_type == SemanticType::Categorical)
    }

    pub fn numeric_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(|c| c.semantic_type.is_numeric())
    }

    /// Add a column (used when a dataset gains a column on reload).
    /// Produces a new descriptor version, never mutating the original.
    pub fn with_column(&self, column: ColumnSpec, version: u64) -> Self {
        let mut columns = self.columns.clone();
        columns.push(column);
        let mut schema = SchemaDescriptor::new(&self.table_name, columns, version);
        if schema.date_column.is_none() {
            schema.date_column = self.date_column.clone();
        }
        schema
    }
}

/// Lowercase, non-alphanumerics collapsed to `_`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Double-quote an identifier for SQL, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn infer_semantic_type(name: &str, dtype: &DataType, hint: &SchemaHint) -> SemanticType {
    let normalized = normalize_name(name);

    if hint.date_column.as_deref() == Some(name) {
        return SemanticType::Date;
    }

    match dtype {
        DataType::Date | DataType::Datetime(_, _) => SemanticType::Date,
        dt if dt.is_numeric() => {
            if normalized == "id" || normalized.ends_with("_id") {
                SemanticType::Identifier
            } else if RATIO_METRICS.iter().any(|m| m.matches_column(&normalized)) {
                SemanticType::NumericRatio
            } else {
                SemanticType::NumericAdditive
            }
        }
        _ => {
            if normalized == "id" || normalized.ends_with("_id") {
                SemanticType::Identifier
            } else if normalized == "date" || normalized == "day" {
                SemanticType::Date
            } else {
                SemanticType::Categorical
            }
        }
    }
}

fn default_unit(name: &str, semantic_type: SemanticType) -> DisplayUnit {
    let normalized = normalize_name(name);
    match semantic_type {
        SemanticType::NumericRatio => RATIO_METRICS
            .iter()
            .find(|m| m.matches_column(&normalized))
            .map(|m| m.unit)
            .unwrap_or(DisplayUnit::None),
        SemanticType::NumericAdditive => BaseMetric::ALL
            .iter()
            .find(|b| b.matches_column(&normalized))
            .map(|b| b.unit())
            .unwrap_or(DisplayUnit::None),
        _ => DisplayUnit::None,
    }
}

fn bind_base_columns(
    columns: &[ColumnSpec],
    overrides: &HashMap<BaseMetric, String>,
) -> HashMap<BaseMetric, String> {
    let mut bound = HashMap::new();
    for base in BaseMetric::ALL {
        if let Some(column) = overrides.get(&base) {
            bound.insert(base, column.clone());
            continue;
        }
        let found = columns.iter().find(|c| {
            c.semantic_type == SemanticType::NumericAdditive
                && base.matches_column(&normalize_name(&c.name))
        });
        if let Some(column) = found {
            bound.insert(base, column.name.clone());
        }
    }
    bound
}

fn bind_ratio_columns(columns: &mut [ColumnSpec], base_columns: &HashMap<BaseMetric, String>) {
    for column in columns.iter_mut() {
        if column.semantic_type != SemanticType::NumericRatio {
            continue;
        }
        let normalized = normalize_name(&column.name);
        let Some(metric) = RATIO_METRICS.iter().find(|m| m.matches_column(&normalized)) else {
            continue;
        };
        if let (Some(num), Some(den)) = (
            base_columns.get(&metric.numerator),
            base_columns.get(&metric.denominator),
        ) {
            column.ratio = Some(RatioBinding {
                metric: metric.name.to_string(),
                numerator: num.clone(),
                denominator: den.clone(),
                scale: metric.scale,
            });
        }
    }
}

fn distinct_strings(series: &Series) -> Result<Vec<String>> {
    if series.dtype() != &DataType::String {
        return Ok(Vec::new());
    }
    let unique = series.unique()?;
    if unique.len() > MAX_TRACKED_DISTINCT_VALUES {
        return Ok(Vec::new());
    }
    let mut values: Vec<String> = unique
        .str()?
        .into_iter()
        .flatten()
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.to_string())
        .collect();
    values.sort();
    Ok(values)
}

fn compute_fingerprint(table_name: &str, columns: &[ColumnSpec], version: u64) -> SchemaFingerprint {
    let mut hasher = DefaultHasher::new();
    table_name.hash(&mut hasher);
    for column in columns {
        column.name.hash(&mut hasher);
        column.semantic_type.hash(&mut hasher);
        column.unit.hash(&mut hasher);
    }
    SchemaFingerprint(format!("v{}-{:016x}", version, hasher.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_df() -> DataFrame {
        df![
            "Campaign_ID" => [1i64, 2, 3],
            "Platform" => ["Google", "Facebook", "Google"],
            "Spend" => [100.0, 200.0, 50.0],
            "Clicks" => [10i64, 40, 5],
            "Impressions" => [1000i64, 4000, 800],
            "CTR" => [0.01, 0.01, 0.00625]
        ]
        .unwrap()
    }

    #[test]
    fn test_infers_semantic_types() {
        let schema =
            SchemaDescriptor::infer(&sample_df(), "campaigns", &SchemaHint::default(), 1).unwrap();

        assert_eq!(
            schema.column("campaign_id").unwrap().semantic_type,
            SemanticType::Identifier
        );
        assert_eq!(
            schema.column("Platform").unwrap().semantic_type,
            SemanticType::Categorical
        );
        assert_eq!(
            schema.column("Spend").unwrap().semantic_type,
            SemanticType::NumericAdditive
        );
        assert_eq!(schema.column("Spend").unwrap().unit, DisplayUnit::Currency);

        let ctr = schema.column("CTR").unwrap();
        assert_eq!(ctr.semantic_type, SemanticType::NumericRatio);
        let binding = ctr.ratio.as_ref().unwrap();
        assert_eq!(binding.numerator, "Clicks");
        assert_eq!(binding.denominator, "Impressions");
    }

    #[test]
    fn test_tracks_categorical_values() {
        let schema =
            SchemaDescriptor::infer(&sample_df(), "campaigns", &SchemaHint::default(), 1).unwrap();
        assert_eq!(
            schema.column("Platform").unwrap().distinct_values,
            vec!["Facebook".to_string(), "Google".to_string()]
        );
    }

    #[test]
    fn test_fingerprint_changes_with_version() {
        let df = sample_df();
        let v1 = SchemaDescriptor::infer(&df, "campaigns", &SchemaHint::default(), 1).unwrap();
        let v2 = SchemaDescriptor::infer(&df, "campaigns", &SchemaHint::default(), 2).unwrap();
        assert_ne!(v1.fingerprint(), v2.fingerprint());
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Amount Spent (USD)"), "amount_spent_usd");
        assert_eq!(normalize_name("CTR"), "ctr");
    }
}
