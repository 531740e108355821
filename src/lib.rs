//! Natural-language analytics over campaign performance data.
//!
//! A question goes through the temporal resolver and intent parser, the
//! query synthesizer (templates first, text generation as fallback), the
//! SQL safety validator and finally the polars-backed executor. Results are
//! cached per dataset version.

pub mod cache;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod executor;
pub mod format;
pub mod intent;
pub mod llm;
pub mod metrics;
pub mod result;
pub mod schema;
pub mod synth;
pub mod temporal;
pub mod validator;

pub use cache::CacheStats;
pub use config::EngineConfig;
pub use engine::{AskOutcome, AskResponse, ErrorResponse, QueryEngine, QueryRecord};
pub use error::{EngineError, Result};
pub use executor::CancellationFlag;
pub use format::format_answer;
pub use llm::{LlmClient, TextGenerator};
pub use result::{ResultColumn, ResultSet};
pub use schema::{SchemaDescriptor, SchemaHint};
