//! Generative tier
//!
//! Prompts an external `TextGenerator` with the schema, the metric formulas
//! and the resolved periods. The returned text is untrusted: this module only
//! checks that it parses, the validator decides whether it may run.

use super::CandidateQuery;
use crate::error::{EngineError, Result};
use crate::intent::QueryIntent;
use crate::llm::TextGenerator;
use crate::metrics::MetricCatalog;
use crate::schema::{quote_ident, SchemaDescriptor};
use crate::validator::{ValidationRule, DENIED_KEYWORDS};
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

lazy_static! {
    static ref CODE_FENCE: Regex = Regex::new(r"(?s)```(?:sql|SQL)?\s*(.*?)```").unwrap();
    static ref SQL_START: Regex = Regex::new(r"(?i)\b(with|select)\b").unwrap();
}

/// A generative attempt the validator rejected, fed back into the next prompt.
#[derive(Debug, Clone)]
pub struct RejectedAttempt {
    pub sql: String,
    pub rule: ValidationRule,
}

pub struct GenerativeSynthesizer {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
}

impl GenerativeSynthesizer {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    pub async fn synthesize(
        &self,
        intent: &QueryIntent,
        schema: &SchemaDescriptor,
        feedback: Option<&RejectedAttempt>,
    ) -> Result<CandidateQuery> {
        let prompt = build_prompt(intent, schema, feedback);
        debug!("Generation prompt:\n{}", prompt);

        // No lock is held across this await
        let raw = tokio::time::timeout(self.timeout, self.generator.generate(&prompt))
            .await
            .map_err(|_| {
                EngineError::Generation(format!(
                    "generation timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        let sql = extract_sql(&raw);
        if sql.is_empty() {
            return Err(EngineError::SynthesisFailure {
                question: intent.question.clone(),
                trace: "generator returned no SQL".to_string(),
            });
        }

        if let Err(e) = Parser::parse_sql(&GenericDialect {}, &sql) {
            warn!("Generated SQL does not parse: {} | raw output: {}", e, raw);
            return Err(EngineError::SynthesisFailure {
                question: intent.question.clone(),
                trace: format!("generated text is not valid SQL: {}", e),
            });
        }

        Ok(CandidateQuery::generative(sql))
    }
}

/// Strip markdown fences and surrounding prose from generator output.
pub fn extract_sql(raw: &str) -> String {
    let text = match CODE_FENCE.captures(raw) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(""),
        None => raw,
    };
    let text = text.trim();

    let start = SQL_START.find(text).map(|m| m.start()).unwrap_or(0);
    text[start..].trim().to_string()
}

fn build_prompt(intent: &QueryIntent, schema: &SchemaDescriptor, feedback: Option<&RejectedAttempt>) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Write one SQL SELECT query over the table {} to answer the question.\n\n",
        quote_ident(&schema.table_name)
    ));

    prompt.push_str("Columns:\n");
    for column in &schema.columns {
        prompt.push_str(&format!("- {} ({})", quote_ident(&column.name), column.semantic_type.as_str()));
        if !column.distinct_values.is_empty() {
            let sample: Vec<&str> = column.distinct_values.iter().take(10).map(|v| v.as_str()).collect();
            prompt.push_str(&format!(" values: {}", sample.join(", ")));
        }
        prompt.push('\n');
    }

    let formulas = MetricCatalog::formula_notes(schema);
    if !formulas.is_empty() {
        prompt.push_str("\nMetric formulas (always use these, never AVG of a ratio column):\n");
        for formula in formulas {
            prompt.push_str(&format!("- {}\n", formula));
        }
    }

    if let Some(date_col) = &schema.date_column {
        if !intent.temporal.ranges.is_empty() {
            prompt.push_str(&format!("\nPeriods on {} (start inclusive, end exclusive):\n", quote_ident(date_col)));
            for range in &intent.temporal.ranges {
                prompt.push_str(&format!(
                    "- {}: {} <= date < {}\n",
                    range.label, range.start, range.end
                ));
            }
        }
    }

    prompt.push_str(
        "\nRules:\n\
         - A single SELECT statement (WITH is allowed), no semicolons\n\
         - Only the table and columns listed above, identifiers in double quotes\n\
         - Divide with NULLIF(denominator, 0)\n\
         - Date literals as CAST('YYYY-MM-DD' AS DATE)\n\
         - Each SELECT sees only its own FROM columns; a projection alias is usable only in that SELECT's GROUP BY, HAVING and ORDER BY\n\
         - No table functions such as read_csv(...)\n",
    );
    prompt.push_str(&format!(
        "- Never write these words unquoted, not even as aliases: {}\n",
        DENIED_KEYWORDS.join(", ")
    ));

    if let Some(rejected) = feedback {
        prompt.push_str(&format!(
            "\nA previous attempt was rejected ({}):\n{}\nDo not repeat that mistake.\n",
            rejected.rule.as_str(),
            rejected.sql
        ));
    }

    prompt.push_str(&format!("\nQuestion: {}\nSQL:", intent.question));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSpec, DisplayUnit, SemanticType};
    use crate::temporal::TemporalIntent;
    use async_trait::async_trait;

    struct Fixed(&'static str);

    #[async_trait]
    impl TextGenerator for Fixed {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Slow;

    #[async_trait]
    impl TextGenerator for Slow {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("SELECT 1".to_string())
        }
    }

    fn schema() -> SchemaDescriptor {
        let column = |name: &str, semantic_type| ColumnSpec {
            name: name.to_string(),
            semantic_type,
            unit: DisplayUnit::None,
            ratio: None,
            grain: None,
            distinct_values: Vec::new(),
        };
        SchemaDescriptor::new(
            "campaigns",
            vec![
                column("Date", SemanticType::Date),
                column("Spend", SemanticType::NumericAdditive),
                column("Clicks", SemanticType::NumericAdditive),
            ],
            1,
        )
    }

    fn intent() -> QueryIntent {
        QueryIntent::new("what happened?", TemporalIntent::all_data(None))
    }

    #[test]
    fn test_extract_sql_strips_fences_and_prose() {
        let raw = "Here you go:\n```sql\nSELECT SUM(\"Spend\") FROM \"campaigns\"\n```";
        assert_eq!(extract_sql(raw), "SELECT SUM(\"Spend\") FROM \"campaigns\"");
        assert_eq!(extract_sql("Sure. SELECT 1"), "SELECT 1");
    }

    #[test]
    fn test_prompt_carries_formulas_and_feedback() {
        let rejected = RejectedAttempt {
            sql: "SELECT * FROM users".to_string(),
            rule: ValidationRule::UnknownTable,
        };
        let prompt = build_prompt(&intent(), &schema(), Some(&rejected));
        assert!(prompt.contains("CPC = SUM(\"Spend\") * 1.0 / NULLIF(SUM(\"Clicks\"), 0)"));
        assert!(prompt.contains("previous attempt was rejected (unknown_table)"));
        assert!(prompt.contains("SELECT * FROM users"));
        assert!(prompt.contains("not even as aliases: DROP, DELETE"));
    }

    #[tokio::test]
    async fn test_unparseable_output_is_synthesis_failure() {
        let synth = GenerativeSynthesizer::new(Arc::new(Fixed("I am not sure.")), Duration::from_secs(1));
        let err = synth.synthesize(&intent(), &schema(), None).await.unwrap_err();
        assert!(matches!(err, EngineError::SynthesisFailure { .. }));
    }

    #[tokio::test]
    async fn test_generation_timeout() {
        let synth = GenerativeSynthesizer::new(Arc::new(Slow), Duration::from_millis(20));
        let err = synth.synthesize(&intent(), &schema(), None).await.unwrap_err();
        assert!(matches!(err, EngineError::Generation(_)));
    }

    #[tokio::test]
    async fn test_parseable_output_is_returned_unvalidated() {
        let synth = GenerativeSynthesizer::new(
            Arc::new(Fixed("SELECT * FROM secrets")),
            Duration::from_secs(1),
        );
        let candidate = synth.synthesize(&intent(), &schema(), None).await.unwrap();
        assert!(candidate.is_generative());
        assert_eq!(candidate.sql, "SELECT * FROM secrets");
    }
}
