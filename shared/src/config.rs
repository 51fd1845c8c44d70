//! Configuration management for Lambda functions.

use std::env;
use std::time::Duration;

use crate::{Error, Result};

/// Which text-generation backend drafts responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    /// Amazon Bedrock Converse API
    Bedrock { model_id: String },
    /// OpenAI-compatible chat completions endpoint
    Http {
        endpoint: String,
        model: String,
        api_key_secret_arn: Option<String>,
    },
    /// No provider; every run uses the heuristic analyzer
    None,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database host
    pub db_host: String,
    /// Database name
    pub db_name: String,
    /// ARN of the secret containing database credentials
    pub db_secret_arn: String,
    /// Generative provider selection
    pub provider: ProviderKind,
    /// Wall-clock budget for one provider call
    pub ai_timeout: Duration,
    /// Function name of the AI run worker (target of async invokes)
    pub worker_function_name: String,
    /// SNS topic for operator notifications
    pub notification_topic_arn: Option<String>,
    /// Queued runs older than this are re-dispatched by the sweeper
    pub stale_run_threshold: Duration,
    /// Dispatch attempts after which the sweeper gives up on a run
    pub max_dispatch_attempts: i32,
    /// Maximum runs handled per sweep
    pub sweep_batch_size: i64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            db_host: required("DB_HOST")?,
            db_name: env::var("DB_NAME").unwrap_or_else(|_| "support_desk".to_string()),
            db_secret_arn: required("DB_SECRET_ARN")?,
            provider: provider_from_env()?,
            ai_timeout: Duration::from_secs(parse_or("AI_TIMEOUT_SECS", 25)?),
            worker_function_name: env::var("AI_WORKER_FUNCTION_NAME")
                .unwrap_or_else(|_| "support-desk-ai-run-worker".to_string()),
            notification_topic_arn: env::var("NOTIFICATION_TOPIC_ARN").ok(),
            stale_run_threshold: Duration::from_secs(parse_or("STALE_RUN_THRESHOLD_SECS", 300)?),
            max_dispatch_attempts: parse_or("MAX_DISPATCH_ATTEMPTS", 5)?,
            sweep_batch_size: parse_or("SWEEP_BATCH_SIZE", 50)?,
        })
    }
}

fn required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| Error::Config(format!("{} not set", key)))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

fn provider_from_env() -> Result<ProviderKind> {
    let kind = env::var("AI_PROVIDER").unwrap_or_default().to_lowercase();
    match kind.as_str() {
        "" | "none" => Ok(ProviderKind::None),
        "bedrock" => Ok(ProviderKind::Bedrock {
            model_id: env::var("BEDROCK_MODEL_ID")
                .unwrap_or_else(|_| "anthropic.claude-3-haiku-20240307-v1:0".to_string()),
        }),
        "http" => Ok(ProviderKind::Http {
            endpoint: required("AI_HTTP_ENDPOINT")?,
            model: env::var("AI_HTTP_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            api_key_secret_arn: env::var("AI_API_KEY_SECRET_ARN").ok(),
        }),
        other => Err(Error::Config(format!("Unknown AI_PROVIDER: {}", other))),
    }
}
