//! Configuration for the pipeline and its services.
//!
//! Every setting has a default equal to the reference value. `from_env()`
//! overrides them from `FRAGMENT_PIPELINE_*` environment variables, loading a
//! `.env` file first when one is present (development).

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: String, value: String },

    #[error("tracing subscriber could not be installed: {0}")]
    Telemetry(String),
}

/// Retry budgets for external calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total LLM attempts (first call included). Default: 3.
    pub llm_max_attempts: u32,

    /// First LLM backoff delay; doubles on every retry. Default: 1000 ms.
    pub llm_base_delay_ms: u64,

    /// Upper bound for a single LLM backoff delay. Default: 30 s.
    pub llm_max_delay_ms: u64,

    /// Total DB-RPC attempts. Default: 2 (one connection retry).
    pub rpc_max_attempts: u32,

    /// Fixed delay between DB-RPC attempts. Default: 500 ms.
    pub rpc_retry_delay_ms: u64,

    /// Client-side LLM rate limit. 0 disables the limiter.
    pub llm_requests_per_second: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            llm_max_attempts: 3,
            llm_base_delay_ms: 1_000,
            llm_max_delay_ms: 30_000,
            rpc_max_attempts: 2,
            rpc_retry_delay_ms: 500,
            llm_requests_per_second: 0,
        }
    }
}

/// Tuning for the four phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSettings {
    /// Language the extraction prompts expect. Other languages are translated.
    pub target_language: String,

    /// Minimum weighted triage score (/25) when the response has no decision keyword.
    pub relevance_threshold: f64,

    /// Replacement for out-of-range confidence values.
    pub default_confidence: f64,

    /// Maximum length of any sanitized free-text field.
    pub max_text_field_chars: usize,

    /// Fact content length included in the Phase 3 grounding snapshot.
    pub snapshot_fact_chars: usize,

    /// Similarity threshold for entity normalization.
    pub similarity_threshold: f64,

    /// Candidates requested per similarity search.
    pub similarity_limit: usize,

    /// Maximum fragment size when an article is split.
    pub max_fragment_chars: usize,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            target_language: "es".to_string(),
            relevance_threshold: 13.0,
            default_confidence: 0.8,
            max_text_field_chars: 2_000,
            snapshot_fact_chars: 200,
            similarity_threshold: 0.7,
            similarity_limit: 5,
            max_fragment_chars: 4_000,
        }
    }
}

/// Job dispatch and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    /// Inputs longer than this (in characters) run in the background.
    pub async_threshold_chars: usize,

    /// Background fragment runs allowed at the same time.
    pub worker_pool_size: usize,

    /// Fragments of one article processed at the same time.
    pub article_concurrency: usize,

    /// Terminal jobs older than this are removed by the cleanup loop.
    pub retention_minutes: i64,

    /// Interval of the job cleanup loop.
    pub cleanup_interval_secs: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            async_threshold_chars: 10_000,
            worker_pool_size: 4,
            article_concurrency: 2,
            retention_minutes: 60,
            cleanup_interval_secs: 300,
        }
    }
}

/// Sliding-window metric buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSettings {
    pub retention_hours: i64,
    pub max_samples_per_buffer: usize,
    pub purge_interval_secs: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            max_samples_per_buffer: 10_000,
            purge_interval_secs: 300,
        }
    }
}

/// Alert rules and throttling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSettings {
    pub latency_threshold_ms: f64,
    pub error_rate_threshold_pct: f64,
    pub error_rate_window_secs: i64,
    /// Outcomes needed in the window before the error-rate rule can fire.
    pub error_rate_min_samples: usize,
    /// At most one alert of a given type per interval.
    pub throttle_secs: i64,
    pub retention_hours: i64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            latency_threshold_ms: 5_000.0,
            error_rate_threshold_pct: 10.0,
            error_rate_window_secs: 300,
            error_rate_min_samples: 10,
            throttle_secs: 60,
            retention_hours: 24,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub retry: RetrySettings,
    pub phases: PhaseSettings,
    pub jobs: JobSettings,
    pub metrics: MetricsSettings,
    pub alerts: AlertSettings,
}

impl PipelineConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let var = |name: &str| format!("FRAGMENT_PIPELINE_{}", name);

        Ok(Self {
            retry: RetrySettings {
                llm_max_attempts: parse_or(&lookup, &var("LLM_MAX_ATTEMPTS"), d.retry.llm_max_attempts)?,
                llm_base_delay_ms: parse_or(&lookup, &var("LLM_BASE_DELAY_MS"), d.retry.llm_base_delay_ms)?,
                llm_max_delay_ms: parse_or(&lookup, &var("LLM_MAX_DELAY_MS"), d.retry.llm_max_delay_ms)?,
                rpc_max_attempts: parse_or(&lookup, &var("RPC_MAX_ATTEMPTS"), d.retry.rpc_max_attempts)?,
                rpc_retry_delay_ms: parse_or(&lookup, &var("RPC_RETRY_DELAY_MS"), d.retry.rpc_retry_delay_ms)?,
                llm_requests_per_second: parse_or(
                    &lookup,
                    &var("LLM_REQUESTS_PER_SECOND"),
                    d.retry.llm_requests_per_second,
                )?,
            },
            phases: PhaseSettings {
                target_language: lookup(&var("TARGET_LANGUAGE")).unwrap_or(d.phases.target_language),
                relevance_threshold: parse_or(&lookup, &var("RELEVANCE_THRESHOLD"), d.phases.relevance_threshold)?,
                default_confidence: parse_or(&lookup, &var("DEFAULT_CONFIDENCE"), d.phases.default_confidence)?,
                max_text_field_chars: parse_or(&lookup, &var("MAX_TEXT_FIELD_CHARS"), d.phases.max_text_field_chars)?,
                snapshot_fact_chars: parse_or(&lookup, &var("SNAPSHOT_FACT_CHARS"), d.phases.snapshot_fact_chars)?,
                similarity_threshold: parse_or(&lookup, &var("SIMILARITY_THRESHOLD"), d.phases.similarity_threshold)?,
                similarity_limit: parse_or(&lookup, &var("SIMILARITY_LIMIT"), d.phases.similarity_limit)?,
                max_fragment_chars: parse_or(&lookup, &var("MAX_FRAGMENT_CHARS"), d.phases.max_fragment_chars)?,
            },
            jobs: JobSettings {
                async_threshold_chars: parse_or(&lookup, &var("ASYNC_THRESHOLD_CHARS"), d.jobs.async_threshold_chars)?,
                worker_pool_size: parse_or(&lookup, &var("WORKER_POOL_SIZE"), d.jobs.worker_pool_size)?,
                article_concurrency: parse_or(&lookup, &var("ARTICLE_CONCURRENCY"), d.jobs.article_concurrency)?,
                retention_minutes: parse_or(&lookup, &var("JOB_RETENTION_MINUTES"), d.jobs.retention_minutes)?,
                cleanup_interval_secs: interval_or(&lookup, &var("JOB_CLEANUP_INTERVAL_SECS"), d.jobs.cleanup_interval_secs)?,
            },
            metrics: MetricsSettings {
                retention_hours: parse_or(&lookup, &var("METRICS_RETENTION_HOURS"), d.metrics.retention_hours)?,
                max_samples_per_buffer: parse_or(&lookup, &var("METRICS_MAX_SAMPLES"), d.metrics.max_samples_per_buffer)?,
                purge_interval_secs: interval_or(&lookup, &var("METRICS_PURGE_INTERVAL_SECS"), d.metrics.purge_interval_secs)?,
            },
            alerts: AlertSettings {
                latency_threshold_ms: parse_or(&lookup, &var("ALERT_LATENCY_MS"), d.alerts.latency_threshold_ms)?,
                error_rate_threshold_pct: parse_or(&lookup, &var("ALERT_ERROR_RATE_PCT"), d.alerts.error_rate_threshold_pct)?,
                error_rate_window_secs: parse_or(&lookup, &var("ALERT_ERROR_RATE_WINDOW_SECS"), d.alerts.error_rate_window_secs)?,
                error_rate_min_samples: parse_or(&lookup, &var("ALERT_ERROR_RATE_MIN_SAMPLES"), d.alerts.error_rate_min_samples)?,
                throttle_secs: parse_or(&lookup, &var("ALERT_THROTTLE_SECS"), d.alerts.throttle_secs)?,
                retention_hours: parse_or(&lookup, &var("ALERT_RETENTION_HOURS"), d.alerts.retention_hours)?,
            },
        })
    }

    /// Set the async dispatch threshold.
    pub fn with_async_threshold(mut self, chars: usize) -> Self {
        self.jobs.async_threshold_chars = chars;
        self
    }

    /// Set the LLM retry budget and delays.
    pub fn with_llm_retry(mut self, max_attempts: u32, base_delay_ms: u64) -> Self {
        self.retry.llm_max_attempts = max_attempts;
        self.retry.llm_base_delay_ms = base_delay_ms;
        self
    }

    /// Set the DB-RPC retry budget and delay.
    pub fn with_rpc_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry.rpc_max_attempts = max_attempts;
        self.retry.rpc_retry_delay_ms = delay_ms;
        self
    }

    /// Set the background worker pool size.
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.jobs.worker_pool_size = size;
        self
    }

    /// Set the fragment size used when splitting articles.
    pub fn with_max_fragment_chars(mut self, chars: usize) -> Self {
        self.phases.max_fragment_chars = chars;
        self
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

/// Loop intervals must be non-zero; a zero-period ticker panics.
fn interval_or<F>(lookup: &F, key: &str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_or(lookup, key, default)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: "0".to_string(),
        });
    }
    Ok(secs)
}
