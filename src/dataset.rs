//! Dataset store
//!
//! Holds the loaded campaign DataFrame together with its schema descriptor.
//! A reload builds a complete new snapshot and swaps it in as one unit, so
//! in-flight questions keep the snapshot they started with.

use crate::error::{EngineError, Result};
use crate::result::date_from_epoch_days;
use crate::schema::{normalize_name, SchemaDescriptor, SchemaFingerprint, SchemaHint};
use crate::temporal::DateRange;
use chrono::NaiveDate;
use polars::prelude::*;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Immutable view of one loaded dataset version.
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    pub df: DataFrame,
    pub schema: SchemaDescriptor,
    /// Min..=max of the date column
    pub span: Option<DateRange>,
}

impl DatasetSnapshot {
    /// Default reference date: the latest date in the data
    pub fn max_date(&self) -> Option<NaiveDate> {
        self.span.as_ref().map(|s| s.last_day())
    }
}

pub struct DatasetStore {
    table_name: String,
    current: RwLock<Option<Arc<DatasetSnapshot>>>,
    version: AtomicU64,
}

impl DatasetStore {
    pub fn new(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            current: RwLock::new(None),
            version: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Result<Arc<DatasetSnapshot>> {
        let guard = self
            .current
            .read()
            .map_err(|_| EngineError::Dataset("dataset lock poisoned".to_string()))?;
        guard
            .clone()
            .ok_or_else(|| EngineError::Dataset("no dataset loaded".to_string()))
    }

    /// Publish a new dataset version. The previous snapshot stays valid for
    /// anyone still holding it.
    pub fn reload(&self, df: DataFrame, hint: &SchemaHint) -> Result<SchemaFingerprint> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;

        let date_column = detect_date_column(&df, hint);
        let df = match &date_column {
            Some(column) => normalize_date_column(df, column)?,
            None => df,
        };

        let mut hint = hint.clone();
        if hint.date_column.is_none() {
            hint.date_column = date_column.clone();
        }
        let schema = SchemaDescriptor::infer(&df, &self.table_name, &hint, version)?;
        let span = match &schema.date_column {
            Some(column) => date_span(&df, column)?,
            None => None,
        };

        let fingerprint = schema.fingerprint().clone();
        info!(
            "Loaded dataset version {} ({} rows, {} columns, span {:?}) as {}",
            version,
            df.height(),
            df.width(),
            span.as_ref().map(|s| s.span_text()),
            fingerprint
        );

        let snapshot = Arc::new(DatasetSnapshot { df, schema, span });
        let mut guard = self
            .current
            .write()
            .map_err(|_| EngineError::Dataset("dataset lock poisoned".to_string()))?;
        *guard = Some(snapshot);
        Ok(fingerprint)
    }

    /// Read a CSV file and publish it
    pub fn load_csv(&self, path: &Path, hint: &SchemaHint) -> Result<SchemaFingerprint> {
        if !path.exists() {
            return Err(EngineError::Dataset(format!(
                "Data file not found: {}",
                path.display()
            )));
        }
        let df = LazyCsvReader::new(path)
            .with_has_header(true)
            .finish()
            .and_then(|lf| lf.collect())
            .map_err(|e| EngineError::Dataset(format!("Failed to load CSV: {}", e)))?;
        self.reload(df, hint)
    }
}

fn detect_date_column(df: &DataFrame, hint: &SchemaHint) -> Option<String> {
    if let Some(column) = &hint.date_column {
        return Some(column.clone());
    }
    let columns = df.get_columns();
    columns
        .iter()
        .find(|s| matches!(s.dtype(), DataType::Date | DataType::Datetime(_, _)))
        .or_else(|| {
            columns.iter().find(|s| {
                let name = normalize_name(s.name());
                s.dtype() == &DataType::String
                    && (name == "date" || name == "day" || name.ends_with("_date"))
            })
        })
        .map(|s| s.name().to_string())
}

/// Cast the date column to `Date`, parsing strings where needed.
fn normalize_date_column(df: DataFrame, column: &str) -> Result<DataFrame> {
    let dtype = df
        .column(column)
        .map_err(|_| EngineError::Dataset(format!("Date column '{}' not found in dataset", column)))?
        .dtype()
        .clone();

    let expr = match dtype {
        DataType::Date => return Ok(df),
        DataType::String => col(column).str().to_date(StrptimeOptions::default()),
        DataType::Datetime(_, _) => col(column).cast(DataType::Date),
        other => {
            return Err(EngineError::Dataset(format!(
                "Date column '{}' has unsupported type {}",
                column, other
            )))
        }
    };

    df.lazy()
        .with_column(expr)
        .collect()
        .map_err(|e| EngineError::Dataset(format!("Failed to parse dates in '{}': {}", column, e)))
}

fn date_span(df: &DataFrame, column: &str) -> Result<Option<DateRange>> {
    let days = df.column(column)?.cast(&DataType::Int32)?;
    let days = days.i32()?;
    let (Some(min), Some(max)) = (days.min(), days.max()) else {
        return Ok(None);
    };
    match (date_from_epoch_days(min), date_from_epoch_days(max)) {
        (Some(first), Some(last)) => Ok(Some(DateRange::inclusive(first, last, "All Data"))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SemanticType;
    use std::io::Write;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sample_df() -> DataFrame {
        df! [
            "Date" => ["2024-01-03", "2024-01-01", "2024-01-09"],
            "Platform" => ["Google", "Meta", "Google"],
            "Spend" => [10.0, 20.0, 30.0]
        ]
        .unwrap()
    }

    #[test]
    fn test_reload_parses_dates_and_span() {
        let store = DatasetStore::new("campaigns");
        store.reload(sample_df(), &SchemaHint::default()).unwrap();

        let snapshot = store.current().unwrap();
        assert_eq!(snapshot.df.column("Date").unwrap().dtype(), &DataType::Date);
        assert_eq!(snapshot.schema.date_column.as_deref(), Some("Date"));
        assert_eq!(
            snapshot.schema.column("Date").map(|c| c.semantic_type),
            Some(SemanticType::Date)
        );
        let span = snapshot.span.clone().unwrap();
        assert_eq!(span.start, date(2024, 1, 1));
        assert_eq!(snapshot.max_date(), Some(date(2024, 1, 9)));
    }

    #[test]
    fn test_reload_bumps_version_and_keeps_old_snapshot() {
        let store = DatasetStore::new("campaigns");
        let first = store.reload(sample_df(), &SchemaHint::default()).unwrap();
        let held = store.current().unwrap();
        let second = store.reload(sample_df(), &SchemaHint::default()).unwrap();

        assert_ne!(first, second);
        assert_eq!(held.schema.version, 1);
        assert_eq!(store.current().unwrap().schema.version, 2);
    }

    #[test]
    fn test_current_without_data_is_dataset_error() {
        let store = DatasetStore::new("campaigns");
        assert!(matches!(store.current(), Err(EngineError::Dataset(_))));
    }

    #[test]
    fn test_load_csv() {
        let dir = std::env::temp_dir().join(format!("campaign-query-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("campaigns.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "Date,Platform,Spend,Clicks").unwrap();
        writeln!(file, "2024-02-01,Google,100.0,10").unwrap();
        writeln!(file, "2024-02-02,Meta,50.0,4").unwrap();
        drop(file);

        let store = DatasetStore::new("campaigns");
        store.load_csv(&path, &SchemaHint::default()).unwrap();
        let snapshot = store.current().unwrap();
        assert_eq!(snapshot.df.height(), 2);
        assert_eq!(snapshot.max_date(), Some(date(2024, 2, 2)));

        std::fs::remove_dir_all(&dir).ok();
    }
}
