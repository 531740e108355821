//! Result Set - typed rows materialized from a polars DataFrame

use crate::error::{EngineError, Result};
use crate::executor::CancellationFlag;
use crate::metrics::{MetricCatalog, MetricKind};
use crate::schema::{normalize_name, DisplayUnit, SchemaDescriptor, SemanticType};
use crate::synth::OutputColumn;
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// Days from 0001-01-01 (CE) to 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    pub semantic_type: SemanticType,
    pub unit: DisplayUnit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub execution_ms: u64,
}

impl ResultSet {
    pub fn new(columns: Vec<ResultColumn>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            execution_ms: 0,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .or_else(|| self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name)))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&serde_json::Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }

    pub fn f64_value(&self, row: usize, column: &str) -> Option<f64> {
        self.value(row, column)?.as_f64()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Convert a DataFrame into a ResultSet, checking the cancellation token at
/// every batch boundary.
pub fn materialize(
    df: &DataFrame,
    declared: &[OutputColumn],
    schema: &SchemaDescriptor,
    cancel: &CancellationFlag,
    batch_rows: usize,
) -> Result<ResultSet> {
    let series: Vec<&Series> = df.get_columns().iter().collect();
    let columns: Vec<ResultColumn> = series
        .iter()
        .map(|s| describe_column(s.name(), s.dtype(), declared, schema))
        .collect();

    let batch_rows = batch_rows.max(1);
    let mut rows = Vec::with_capacity(df.height());
    for row_idx in 0..df.height() {
        if row_idx % batch_rows == 0 && cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let mut row = Vec::with_capacity(series.len());
        for s in &series {
            row.push(series_to_json_value(s, row_idx)?);
        }
        rows.push(row);
    }
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    Ok(ResultSet::new(columns, rows))
}

/// Semantic type of an output column: declared by the template, else the
/// schema column or catalog metric it names, else the polars dtype.
fn describe_column(
    name: &str,
    dtype: &DataType,
    declared: &[OutputColumn],
    schema: &SchemaDescriptor,
) -> ResultColumn {
    if let Some(column) = declared.iter().find(|c| c.name.eq_ignore_ascii_case(name)) {
        return ResultColumn {
            name: name.to_string(),
            semantic_type: column.semantic_type,
            unit: column.unit,
        };
    }

    if let Some(column) = schema.column(name) {
        return ResultColumn {
            name: name.to_string(),
            semantic_type: column.semantic_type,
            unit: column.unit,
        };
    }

    let (semantic_type, unit) = match MetricCatalog::lookup(&normalize_name(name)) {
        Some(MetricKind::Ratio(ratio)) => (SemanticType::NumericRatio, ratio.unit),
        Some(MetricKind::Base(base)) => (SemanticType::NumericAdditive, base.unit()),
        None => match dtype {
            DataType::Date | DataType::Datetime(_, _) => (SemanticType::Date, DisplayUnit::None),
            dt if dt.is_numeric() => (SemanticType::NumericAdditive, DisplayUnit::None),
            _ => (SemanticType::Categorical, DisplayUnit::None),
        },
    };
    ResultColumn {
        name: name.to_string(),
        semantic_type,
        unit,
    }
}

pub fn date_from_epoch_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
}

fn series_to_json_value(series: &Series, row_idx: usize) -> Result<serde_json::Value> {
    let any_val = series
        .get(row_idx)
        .map_err(|e| EngineError::Execution(format!("Failed to get value: {}", e)))?;

    let value = match any_val {
        AnyValue::Null => serde_json::Value::Null,
        AnyValue::Boolean(b) => serde_json::Value::Bool(b),
        AnyValue::String(s) => serde_json::Value::String(s.to_string()),
        AnyValue::StringOwned(ref s) => serde_json::Value::String(s.to_string()),
        AnyValue::Int8(i) => serde_json::Value::Number(i.into()),
        AnyValue::Int16(i) => serde_json::Value::Number(i.into()),
        AnyValue::Int32(i) => serde_json::Value::Number(i.into()),
        AnyValue::Int64(i) => serde_json::Value::Number(i.into()),
        AnyValue::UInt8(u) => serde_json::Value::Number(u.into()),
        AnyValue::UInt16(u) => serde_json::Value::Number(u.into()),
        AnyValue::UInt32(u) => serde_json::Value::Number(u.into()),
        AnyValue::UInt64(u) => serde_json::Value::Number(u.into()),
        AnyValue::Float32(f) => float(f as f64),
        AnyValue::Float64(f) => float(f),
        AnyValue::Date(days) => match date_from_epoch_days(days) {
            Some(date) => serde_json::Value::String(date.format("%Y-%m-%d").to_string()),
            None => serde_json::Value::Null,
        },
        other => serde_json::Value::String(other.to_string()),
    };
    Ok(value)
}

/// NaN and infinities have no JSON form
fn float(f: f64) -> serde_json::Value {
    serde_json::Number::from_f64(f)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSpec;

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new(
            "campaigns",
            vec![ColumnSpec {
                name: "Platform".to_string(),
                semantic_type: SemanticType::Categorical,
                unit: DisplayUnit::None,
                ratio: None,
                grain: None,
                distinct_values: Vec::new(),
            }],
            1,
        )
    }

    #[test]
    fn test_materialize_types_columns() {
        let df = df! {
            "Platform" => &["Google", "Meta"],
            "ctr" => &[Some(0.012), None],
            "clicks_seen" => &[10i64, 20]
        }
        .unwrap();

        let result = materialize(&df, &[], &schema(), &CancellationFlag::new(), 1).unwrap();
        assert_eq!(result.row_count, 2);
        assert_eq!(result.columns[0].semantic_type, SemanticType::Categorical);
        assert_eq!(result.columns[1].semantic_type, SemanticType::NumericRatio);
        assert_eq!(result.columns[1].unit, DisplayUnit::Percent);
        assert_eq!(result.columns[2].semantic_type, SemanticType::NumericAdditive);
        assert_eq!(result.f64_value(0, "ctr"), Some(0.012));
        assert_eq!(result.value(1, "ctr"), Some(&serde_json::Value::Null));
    }

    #[test]
    fn test_cancelled_materialization_returns_no_rows() {
        let df = df! { "Platform" => &["Google"] }.unwrap();
        let token = CancellationFlag::new();
        token.cancel();
        let err = materialize(&df, &[], &schema(), &token, 1).unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn test_epoch_days_to_date() {
        assert_eq!(date_from_epoch_days(0), NaiveDate::from_ymd_opt(1970, 1, 1));
        assert_eq!(date_from_epoch_days(19_723), NaiveDate::from_ymd_opt(2024, 1, 1));
    }
}
