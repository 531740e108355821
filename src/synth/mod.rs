//! Query Synthesizer
//!
//! Two tiers:
//! - templates: deterministic query shapes built from the aggregation model
//!   and the resolved date ranges, correct by construction
//! - generative: an external text generator prompted with the schema and
//!   metric formulas, whose output is untrusted until validated

pub mod generative;
pub mod templates;

use crate::error::Result;
use crate::intent::{FilterValue, QueryIntent};
use crate::metrics::RatioMetric;
use crate::schema::{DisplayUnit, SchemaDescriptor, SemanticType};
use crate::temporal::RollingAggregation;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

pub use generative::{GenerativeSynthesizer, RejectedAttempt};
pub use templates::{TemplateKey, TemplateKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "tier", content = "template")]
pub enum SynthesisTier {
    Template(TemplateKind),
    Generative,
}

impl fmt::Display for SynthesisTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthesisTier::Template(kind) => write!(f, "template:{}", kind.as_str()),
            SynthesisTier::Generative => f.write_str("generative"),
        }
    }
}

/// Declared output column of a candidate query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputColumn {
    pub name: String,
    pub semantic_type: SemanticType,
    pub unit: DisplayUnit,
}

impl OutputColumn {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType, unit: DisplayUnit) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            unit,
        }
    }
}

/// A value the template inlined into the SQL, recorded for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParam {
    pub name: String,
    pub value: FilterValue,
}

/// One metric of a rolling-window post-aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingMetric {
    pub alias: String,
    /// Columns of the daily base sums, numerator first for ratios
    pub components: Vec<String>,
    pub ratio: Option<&'static RatioMetric>,
}

/// Trailing-window aggregation applied to per-day base sums after
/// execution. Ratio metrics are recomputed from windowed sums.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingSpec {
    pub window_days: u32,
    pub aggregation: RollingAggregation,
    pub date_column: String,
    /// Days before this date only warm up the window and are not emitted
    pub emit_from: NaiveDate,
    pub metrics: Vec<RollingMetric>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PostProcess {
    Rolling(RollingSpec),
}

/// Synthesized, not yet validated, SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
    /// Empty for generative output; the executor infers types then
    pub columns: Vec<OutputColumn>,
    pub tier: SynthesisTier,
    pub post_process: Option<PostProcess>,
}

impl CandidateQuery {
    pub fn generative(sql: String) -> Self {
        Self {
            sql,
            params: Vec::new(),
            columns: Vec::new(),
            tier: SynthesisTier::Generative,
            post_process: None,
        }
    }

    pub fn is_generative(&self) -> bool {
        self.tier == SynthesisTier::Generative
    }
}

pub struct QuerySynthesizer {
    generative: GenerativeSynthesizer,
}

impl QuerySynthesizer {
    pub fn new(generative: GenerativeSynthesizer) -> Self {
        Self { generative }
    }

    /// Template tier first; the generative tier only when no template shape
    /// fits. `feedback` carries a previously rejected generative attempt.
    pub async fn synthesize(
        &self,
        intent: &QueryIntent,
        schema: &SchemaDescriptor,
        feedback: Option<&RejectedAttempt>,
    ) -> Result<CandidateQuery> {
        if feedback.is_none() {
            if let Some(candidate) = templates::synthesize(intent, schema)? {
                info!("Synthesized query with {}", candidate.tier);
                return Ok(candidate);
            }
        }

        info!("No template matches, using generative tier");
        self.generative.synthesize(intent, schema, feedback).await
    }
}
