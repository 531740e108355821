use anyhow::{Context, Result};
use campaign_query::{
    format_answer, AskResponse, EngineConfig, ErrorResponse, LlmClient, QueryEngine, SchemaHint,
};
use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "campaign-query")]
#[command(about = "Ask natural-language questions about campaign performance data")]
struct Args {
    /// The question, e.g. "CPC this week vs last week by platform"
    question: String,

    /// Campaign data CSV
    #[arg(short, long)]
    data: PathBuf,

    /// Engine config JSON (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// "As of" date for relative periods (default: latest date in the data)
    #[arg(long, value_parser = parse_date)]
    reference_date: Option<NaiveDate>,

    /// Name of the date column when it cannot be detected
    #[arg(long)]
    date_column: Option<String>,

    /// Print the JSON response instead of a table
    #[arg(long)]
    json: bool,
}

fn parse_date(raw: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("campaign_query=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = EngineConfig::load(args.config.as_deref()).context("loading engine config")?;
    let llm = Arc::new(LlmClient::from_settings(&config.llm));
    let engine = QueryEngine::new(config, llm)?;

    let mut hint = SchemaHint::default();
    if let Some(column) = &args.date_column {
        hint = hint.with_date_column(column);
    }
    let fingerprint = engine
        .load_csv(&args.data, &hint)
        .with_context(|| format!("loading {}", args.data.display()))?;
    info!("Dataset ready ({})", fingerprint);

    match engine.ask(&args.question, args.reference_date).await {
        Ok(outcome) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&AskResponse::from(&outcome))?);
            } else {
                println!("{}", format_answer(&args.question, &outcome.result));
                for period in outcome.periods() {
                    println!("{}: {}", period.label, period.span_text());
                }
            }
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            let response = ErrorResponse::from(&e);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                eprintln!("{}", response.message);
            }
            std::process::exit(1);
        }
    }
}
