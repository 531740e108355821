//! Query Executor
//!
//! Runs validated SQL through a polars `SQLContext` over the current dataset
//! snapshot. Only `ValidatedQuery` values are accepted, and the executor
//! re-checks their proof before touching the data.

use crate::dataset::DatasetSnapshot;
use crate::error::{EngineError, Result};
use crate::result::{materialize, ResultColumn, ResultSet};
use crate::schema::{DisplayUnit, SemanticType};
use crate::synth::{PostProcess, RollingSpec};
use crate::temporal::{shift_days, RollingAggregation};
use crate::validator::ValidatedQuery;
use chrono::NaiveDate;
use polars::prelude::*;
use polars::sql::SQLContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Cooperative cancellation shared between a caller and in-flight work.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    flag: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct QueryExecutor {
    timeout: Duration,
    batch_rows: usize,
    /// A polars collect cannot be interrupted, so a scan keeps its permit
    /// until it finishes even after the caller has timed out
    permits: Arc<Semaphore>,
}

impl QueryExecutor {
    pub fn new(timeout: Duration, batch_rows: usize, max_concurrent: usize) -> Self {
        Self {
            timeout,
            batch_rows: batch_rows.max(1),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Run `query` against `snapshot`. `timeout` may shorten, never extend,
    /// the configured execution timeout; waiting for a permit counts against it.
    pub async fn execute(
        &self,
        query: &ValidatedQuery,
        snapshot: Arc<DatasetSnapshot>,
        cancel: &CancellationFlag,
        timeout: Option<Duration>,
    ) -> Result<ResultSet> {
        if !query.is_intact() {
            error!("Refusing to execute SQL that no longer matches its validation proof");
            return Err(EngineError::Execution("query was not validated".to_string()));
        }
        if query.schema_version() != snapshot.schema.version {
            error!(
                "Refusing to execute SQL validated against schema v{} on v{}",
                query.schema_version(),
                snapshot.schema.version
            );
            return Err(EngineError::Execution(
                "query was validated against another dataset version".to_string(),
            ));
        }

        let start_time = Instant::now();
        info!("Executing query with Polars: {}", query.sql());

        let sql = query.sql().to_string();
        let declared = query.candidate().columns.clone();
        let batch_rows = self.batch_rows;
        let task_cancel = cancel.clone();
        let run = run_blocking(Arc::clone(&self.permits), move || {
            let mut ctx = SQLContext::new();
            ctx.register(&snapshot.schema.table_name, snapshot.df.clone().lazy());
            let df = ctx
                .execute(&sql)
                .and_then(|lf| lf.collect())
                .map_err(|e| EngineError::Execution(e.to_string()))?;
            materialize(&df, &declared, &snapshot.schema, &task_cancel, batch_rows)
        });

        let timeout = timeout.map_or(self.timeout, |t| t.min(self.timeout));
        let mut result = match tokio::time::timeout(timeout, run).await {
            Err(_) => {
                cancel.cancel();
                let timeout_ms = timeout.as_millis() as u64;
                warn!("Query exceeded {}ms, cancelled: {}", timeout_ms, query.sql());
                return Err(EngineError::ExecutionTimeout { timeout_ms });
            }
            Ok(Err(e)) => {
                if !matches!(e, EngineError::Cancelled) {
                    error!("Query failed: {} | sql: {}", e, query.sql());
                }
                return Err(e);
            }
            Ok(Ok(result)) => result,
        };

        if let Some(PostProcess::Rolling(spec)) = &query.candidate().post_process {
            result = apply_rolling(&result, spec)?;
        }

        result.execution_ms = start_time.elapsed().as_millis() as u64;
        info!(
            "Query returned {} rows in {}ms",
            result.row_count, result.execution_ms
        );
        Ok(result)
    }
}

/// Run `job` on the blocking pool once a permit is free. The permit moves
/// into the job, so it is released when the scan ends, not when the caller
/// stops waiting.
async fn run_blocking<F>(permits: Arc<Semaphore>, job: F) -> Result<ResultSet>
where
    F: FnOnce() -> Result<ResultSet> + Send + 'static,
{
    let permit = permits
        .acquire_owned()
        .await
        .map_err(|_| EngineError::Execution("executor is shut down".to_string()))?;
    let task = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        job()
    });
    match task.await {
        Ok(result) => result,
        Err(join_error) => {
            error!("Execution task failed: {}", join_error);
            Err(EngineError::Execution("execution task failed".to_string()))
        }
    }
}

/// Trailing-window aggregation over per-day base sums. Each window sums the
/// components first; ratio metrics are recomputed from those sums. Additive
/// metrics are the window total or its daily mean, per `spec.aggregation`.
pub fn apply_rolling(daily: &ResultSet, spec: &RollingSpec) -> Result<ResultSet> {
    let date_idx = daily.column_index(&spec.date_column).ok_or_else(|| {
        EngineError::Execution(format!("rolling input lacks column {}", spec.date_column))
    })?;

    let mut component_names: Vec<&str> = Vec::new();
    for metric in &spec.metrics {
        for component in &metric.components {
            if !component_names.contains(&component.as_str()) {
                component_names.push(component);
            }
        }
    }
    let component_idx = component_names
        .iter()
        .map(|name| {
            daily
                .column_index(name)
                .ok_or_else(|| EngineError::Execution(format!("rolling input lacks column {}", name)))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut days: Vec<(NaiveDate, Vec<f64>)> = Vec::with_capacity(daily.rows.len());
    for row in &daily.rows {
        let Some(date) = row
            .get(date_idx)
            .and_then(|v| v.as_str())
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        else {
            continue;
        };
        let values = component_idx
            .iter()
            .map(|&i| row.get(i).and_then(|v| v.as_f64()).unwrap_or(0.0))
            .collect();
        days.push((date, values));
    }
    days.sort_by_key(|(date, _)| *date);

    let lookback = 1 - i64::from(spec.window_days.max(1));
    let mut rows = Vec::new();
    for (date, _) in days.iter().filter(|(d, _)| *d >= spec.emit_from) {
        let window_start = shift_days(*date, lookback).unwrap_or(NaiveDate::MIN);
        let mut totals = vec![0.0; component_names.len()];
        for (_, values) in days.iter().filter(|(d, _)| *d >= window_start && *d <= *date) {
            for (total, value) in totals.iter_mut().zip(values) {
                *total += value;
            }
        }
        let total_of = |name: &str| {
            component_names
                .iter()
                .position(|c| *c == name)
                .map(|i| totals[i])
                .unwrap_or(0.0)
        };

        let mut row = vec![serde_json::Value::String(date.format("%Y-%m-%d").to_string())];
        for metric in &spec.metrics {
            let value = match (metric.ratio, metric.components.as_slice()) {
                (Some(ratio), [num, den]) => ratio.compute(total_of(num.as_str()), total_of(den.as_str())),
                (_, [column]) => {
                    let total = total_of(column.as_str());
                    match spec.aggregation {
                        RollingAggregation::Sum => Some(total),
                        RollingAggregation::Mean => Some(total / f64::from(spec.window_days.max(1))),
                    }
                }
                _ => None,
            };
            row.push(
                value
                    .and_then(serde_json::Number::from_f64)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
            );
        }
        rows.push(row);
    }

    let mut columns = vec![ResultColumn {
        name: spec.date_column.clone(),
        semantic_type: SemanticType::Date,
        unit: DisplayUnit::None,
    }];
    for metric in &spec.metrics {
        let (semantic_type, unit) = match metric.ratio {
            Some(ratio) => (SemanticType::NumericRatio, ratio.unit),
            None => {
                let unit = metric
                    .components
                    .first()
                    .and_then(|c| daily.column_index(c))
                    .map(|i| daily.columns[i].unit)
                    .unwrap_or(DisplayUnit::None);
                (SemanticType::NumericAdditive, unit)
            }
        };
        columns.push(ResultColumn {
            name: metric.alias.clone(),
            semantic_type,
            unit,
        });
    }

    let mut result = ResultSet::new(columns, rows);
    result.execution_ms = daily.execution_ms;
    Ok(result)
}
