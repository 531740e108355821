//! Engine Configuration
//!
//! Tunables for the query engine, loaded from an optional JSON file and
//! overridden from the environment (`.env` is honoured via dotenv).

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name the dataset is registered under in SQL
    pub table_name: String,

    /// Maximum rows any query may return; missing LIMITs get this value
    pub row_limit_ceiling: u64,

    pub execution_timeout_ms: u64,

    pub generation_timeout_ms: u64,

    /// Generative-tier attempts per question (first try plus retries with feedback)
    pub max_generation_attempts: u32,

    pub cache_ttl_secs: u64,

    pub history_capacity: usize,

    /// Rows materialized between cancellation checks
    pub materialize_batch_rows: usize,

    /// Blocking scans allowed at once, including ones whose caller timed out
    pub max_concurrent_executions: usize,

    pub temporal: TemporalVocabulary,

    pub llm: LlmSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            table_name: "campaigns".to_string(),
            row_limit_ceiling: 10_000,
            execution_timeout_ms: 30_000,
            generation_timeout_ms: 20_000,
            max_generation_attempts: 2,
            cache_ttl_secs: 300,
            history_capacity: 100,
            materialize_batch_rows: 1_024,
            max_concurrent_executions: 4,
            temporal: TemporalVocabulary::default(),
            llm: LlmSettings::default(),
        }
    }
}

/// Approximate phrases mapped to fixed day windows.
///
/// These are inherently fuzzy ("couple of months" is not a calendar unit), so
/// they live in configuration where they can be corrected without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalVocabulary {
    pub fuzzy_windows: Vec<FuzzyWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FuzzyWindow {
    pub phrase: String,
    pub days: i64,
}

impl FuzzyWindow {
    fn new(phrase: &str, days: i64) -> Self {
        Self {
            phrase: phrase.to_string(),
            days,
        }
    }
}

impl Default for TemporalVocabulary {
    fn default() -> Self {
        Self {
            fuzzy_windows: vec![
                FuzzyWindow::new("couple of months", 60),
                FuzzyWindow::new("few months", 90),
                FuzzyWindow::new("couple of weeks", 14),
                FuzzyWindow::new("few weeks", 21),
                FuzzyWindow::new("couple of days", 2),
                FuzzyWindow::new("few days", 3),
                FuzzyWindow::new("fortnight", 14),
            ],
        }
    }
}

impl TemporalVocabulary {
    /// Longest matching phrase wins so "couple of months" beats "months".
    pub fn lookup(&self, text: &str) -> Option<&FuzzyWindow> {
        self.fuzzy_windows
            .iter()
            .filter(|w| text.contains(&w.phrase))
            .max_by_key(|w| w.phrase.len())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key: "dummy-api-key".to_string(),
            model: "gpt-4".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let parsed: EngineConfig = serde_json::from_str(&content).map_err(|e| {
                    EngineError::Config(format!("Failed to parse {}: {}", path.display(), e))
                })?;
                info!("Loaded engine config from {}", path.display());
                parsed
            }
            None => EngineConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        dotenv::dotenv().ok();

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.api_key = key;
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            self.llm.model = model;
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Ok(raw) = std::env::var("CAMPAIGN_QUERY_CACHE_TTL_SECS") {
            match raw.parse() {
                Ok(secs) => self.cache_ttl_secs = secs,
                Err(_) => warn!("Ignoring invalid CAMPAIGN_QUERY_CACHE_TTL_SECS={}", raw),
            }
        }
        if let Ok(raw) = std::env::var("CAMPAIGN_QUERY_ROW_LIMIT") {
            match raw.parse() {
                Ok(limit) => self.row_limit_ceiling = limit,
                Err(_) => warn!("Ignoring invalid CAMPAIGN_QUERY_ROW_LIMIT={}", raw),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.table_name.trim().is_empty() {
            return Err(EngineError::Config("table_name must not be empty".to_string()));
        }
        if self.row_limit_ceiling == 0 {
            return Err(EngineError::Config("row_limit_ceiling must be positive".to_string()));
        }
        if self.materialize_batch_rows == 0 {
            return Err(EngineError::Config(
                "materialize_batch_rows must be positive".to_string(),
            ));
        }
        if self.max_concurrent_executions == 0 {
            return Err(EngineError::Config(
                "max_concurrent_executions must be positive".to_string(),
            ));
        }
        if self.temporal.fuzzy_windows.iter().any(|w| w.days <= 0) {
            return Err(EngineError::Config(
                "temporal fuzzy windows must span at least one day".to_string(),
            ));
        }
        Ok(())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"table_name": "ads", "cache_ttl_secs": 60}"#).unwrap();
        assert_eq!(config.table_name, "ads");
        assert_eq!(config.cache_ttl_secs, 60);
        assert_eq!(config.row_limit_ceiling, 10_000);
        assert!(config.temporal.lookup("over the last couple of months").is_some());
    }

    #[test]
    fn test_longest_fuzzy_phrase_wins() {
        let vocab = TemporalVocabulary {
            fuzzy_windows: vec![
                FuzzyWindow::new("months", 30),
                FuzzyWindow::new("couple of months", 60),
            ],
        };
        assert_eq!(vocab.lookup("the last couple of months").map(|w| w.days), Some(60));
    }

    #[test]
    fn test_rejects_zero_ceiling() {
        let config = EngineConfig {
            row_limit_ceiling: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            max_concurrent_executions: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
