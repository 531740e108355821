//! Query Engine
//!
//! End-to-end question answering:
//! resolve time intent -> parse intent -> cache lookup -> synthesize ->
//! validate (retrying the generative tier with feedback) -> execute -> cache.

use crate::cache::{cache_key, CacheStats, ResultCache};
use crate::config::EngineConfig;
use crate::dataset::{DatasetSnapshot, DatasetStore};
use crate::error::{EngineError, Result};
use crate::executor::{CancellationFlag, QueryExecutor};
use crate::intent::{IntentParser, QueryIntent};
use crate::llm::TextGenerator;
use crate::result::{ResultColumn, ResultSet};
use crate::schema::{SchemaDescriptor, SchemaFingerprint, SchemaHint};
use crate::synth::{GenerativeSynthesizer, QuerySynthesizer, RejectedAttempt, SynthesisTier};
use crate::temporal::{DateRange, TemporalResolver};
use crate::validator::{SqlValidator, ValidatedQuery};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Successful answer to one question.
#[derive(Debug, Clone)]
pub struct AskOutcome {
    pub request_id: String,
    pub result: ResultSet,
    pub sql_used: String,
    pub tier: SynthesisTier,
    pub cache_hit: bool,
    pub intent: QueryIntent,
}

impl AskOutcome {
    pub fn periods(&self) -> &[DateRange] {
        &self.intent.temporal.ranges
    }
}

/// Wire form of a successful answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub sql_used: String,
    pub execution_ms: u64,
    pub cache_hit: bool,
    pub periods: Vec<DateRange>,
}

impl From<&AskOutcome> for AskResponse {
    fn from(outcome: &AskOutcome) -> Self {
        Self {
            columns: outcome.result.columns.clone(),
            rows: outcome.result.rows.clone(),
            sql_used: outcome.sql_used.clone(),
            execution_ms: outcome.result.execution_ms,
            cache_hit: outcome.cache_hit,
            periods: outcome.periods().to_vec(),
        }
    }
}

/// Wire form of a failure. Never carries SQL or validator details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_kind: String,
    pub message: String,
}

impl From<&EngineError> for ErrorResponse {
    fn from(err: &EngineError) -> Self {
        Self {
            error_kind: err.kind().to_string(),
            message: err.user_message(),
        }
    }
}

/// One entry of the recent-question history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub request_id: String,
    pub question: String,
    pub asked_at: DateTime<Utc>,
    pub sql: Option<String>,
    pub tier: Option<SynthesisTier>,
    pub cache_hit: bool,
    pub duration_ms: u64,
    pub error_kind: Option<String>,
}

pub struct QueryEngine {
    config: EngineConfig,
    store: DatasetStore,
    resolver: TemporalResolver,
    synthesizer: QuerySynthesizer,
    validator: SqlValidator,
    executor: QueryExecutor,
    cache: ResultCache,
    history: Mutex<VecDeque<QueryRecord>>,
}

impl QueryEngine {
    pub fn new(config: EngineConfig, generator: Arc<dyn TextGenerator>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: DatasetStore::new(&config.table_name),
            resolver: TemporalResolver::new(config.temporal.clone()),
            synthesizer: QuerySynthesizer::new(GenerativeSynthesizer::new(
                generator,
                config.generation_timeout(),
            )),
            validator: SqlValidator::new(config.row_limit_ceiling),
            executor: QueryExecutor::new(
                config.execution_timeout(),
                config.materialize_batch_rows,
                config.max_concurrent_executions,
            ),
            cache: ResultCache::new(config.cache_ttl()),
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Publish a new dataset. Answers cached against the previous version
    /// stop matching immediately.
    pub fn reload(&self, df: polars::prelude::DataFrame, hint: &SchemaHint) -> Result<SchemaFingerprint> {
        let fingerprint = self.store.reload(df, hint)?;
        self.cache.purge_stale(&fingerprint);
        Ok(fingerprint)
    }

    pub fn load_csv(&self, path: &Path, hint: &SchemaHint) -> Result<SchemaFingerprint> {
        let fingerprint = self.store.load_csv(path, hint)?;
        self.cache.purge_stale(&fingerprint);
        Ok(fingerprint)
    }

    pub fn schema(&self) -> Result<SchemaDescriptor> {
        Ok(self.store.current()?.schema.clone())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Most recent first
    pub fn recent_queries(&self, limit: usize) -> Vec<QueryRecord> {
        match self.history.lock() {
            Ok(history) => history.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn ask(&self, question: &str, reference_date: Option<NaiveDate>) -> Result<AskOutcome> {
        self.ask_with_cancel(question, reference_date, &CancellationFlag::new(), None)
            .await
    }

    /// `cancel` lets the caller abandon the question; in-flight execution
    /// stops at the next row batch and nothing is cached. `timeout` caps
    /// execution below the configured limit for this call only.
    pub async fn ask_with_cancel(
        &self,
        question: &str,
        reference_date: Option<NaiveDate>,
        cancel: &CancellationFlag,
        timeout: Option<Duration>,
    ) -> Result<AskOutcome> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("ask", request_id = %request_id);
        let start_time = Instant::now();

        let outcome = self
            .answer(&request_id, question, reference_date, cancel, timeout)
            .instrument(span)
            .await;

        let duration_ms = start_time.elapsed().as_millis() as u64;
        let record = match &outcome {
            Ok(outcome) => QueryRecord {
                request_id,
                question: question.to_string(),
                asked_at: Utc::now(),
                sql: Some(outcome.sql_used.clone()),
                tier: Some(outcome.tier.clone()),
                cache_hit: outcome.cache_hit,
                duration_ms,
                error_kind: None,
            },
            Err(e) => {
                warn!("Question failed ({}): {}", e.kind(), e);
                QueryRecord {
                    request_id,
                    question: question.to_string(),
                    asked_at: Utc::now(),
                    sql: None,
                    tier: None,
                    cache_hit: false,
                    duration_ms,
                    error_kind: Some(e.kind().to_string()),
                }
            }
        };
        self.remember(record);
        outcome
    }

    async fn answer(
        &self,
        request_id: &str,
        question: &str,
        reference_date: Option<NaiveDate>,
        cancel: &CancellationFlag,
        timeout: Option<Duration>,
    ) -> Result<AskOutcome> {
        info!("Question: {}", question);
        if question.trim().is_empty() {
            return Err(EngineError::SynthesisFailure {
                question: question.to_string(),
                trace: "empty question".to_string(),
            });
        }

        let snapshot = self.store.current()?;
        let schema = &snapshot.schema;
        let reference = reference_date
            .or_else(|| snapshot.max_date())
            .unwrap_or_else(|| Utc::now().date_naive());

        let temporal = self.resolver.resolve(question, reference, snapshot.span.as_ref());
        let intent = IntentParser::new(schema).parse(question, temporal);
        info!(
            "Intent: metrics={:?} dimensions={:?} periods={:?} comparison={:?}",
            intent.metrics,
            intent.dimensions,
            intent.temporal.ranges.iter().map(|r| r.label.as_str()).collect::<Vec<_>>(),
            intent.temporal.comparison
        );

        let key = cache_key(question, reference_date, schema.fingerprint());
        let cached = self.cache.get_if(&key, |entry| {
            entry.query.schema_version() == schema.version
                && self.validator.validate(entry.query.candidate(), schema).is_ok()
        });
        if let Some(entry) = cached {
            info!("Cache hit for {}", key);
            return Ok(AskOutcome {
                request_id: request_id.to_string(),
                sql_used: entry.query.sql().to_string(),
                tier: entry.query.candidate().tier.clone(),
                result: entry.result,
                cache_hit: true,
                intent,
            });
        }

        let validated = self.synthesize_validated(&intent, schema).await?;
        let result = self
            .executor
            .execute(&validated, Arc::clone(&snapshot), cancel, timeout)
            .await?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        self.cache.put(key, validated.clone(), result.clone());
        Ok(AskOutcome {
            request_id: request_id.to_string(),
            sql_used: validated.sql().to_string(),
            tier: validated.candidate().tier.clone(),
            result,
            cache_hit: false,
            intent,
        })
    }

    /// Synthesize and validate. A rejected generative candidate is fed back
    /// to the generator up to `max_generation_attempts` times; a rejected
    /// template candidate fails immediately.
    async fn synthesize_validated(
        &self,
        intent: &QueryIntent,
        schema: &SchemaDescriptor,
    ) -> Result<ValidatedQuery> {
        let max_attempts = self.config.max_generation_attempts.max(1);
        let mut generative_attempts = 0;
        let mut feedback: Option<RejectedAttempt> = None;

        loop {
            let candidate = self
                .synthesizer
                .synthesize(intent, schema, feedback.as_ref())
                .await?;

            match self.validator.validate(&candidate, schema) {
                Ok(validated) => return Ok(validated),
                Err(e) => {
                    if !candidate.is_generative() {
                        return Err(e.into());
                    }
                    generative_attempts += 1;
                    if generative_attempts >= max_attempts {
                        return Err(e.into());
                    }
                    info!(
                        "Retrying generation after rejection by {} ({}/{})",
                        e.rule(),
                        generative_attempts,
                        max_attempts
                    );
                    feedback = Some(RejectedAttempt {
                        sql: candidate.sql,
                        rule: e.rule(),
                    });
                }
            }
        }
    }

    fn remember(&self, record: QueryRecord) {
        let capacity = self.config.history_capacity;
        if capacity == 0 {
            return;
        }
        if let Ok(mut history) = self.history.lock() {
            while history.len() >= capacity {
                history.pop_front();
            }
            history.push_back(record);
        }
    }

    /// Current snapshot, for callers that format or export alongside answers
    pub fn snapshot(&self) -> Result<Arc<DatasetSnapshot>> {
        self.store.current()
    }
}
