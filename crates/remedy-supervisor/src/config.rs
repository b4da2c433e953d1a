//! Configuration for the remedy supervisor.

use std::time::Duration;

use remedy_core::types::TaskSpec;
use remedy_core::RateLimitConfig;
use serde::Deserialize;

/// Top-level supervisor configuration.
///
/// Loaded from `remedy.toml` `[supervisor]` section or
/// `REMEDY_SUPERVISOR__` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Re-check interval when a trigger does not fire.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Cool-down after a `Completed` cycle.
    #[serde(default = "default_success_interval")]
    pub success_interval_secs: u64,

    /// Re-arm backoff after an `Error` cycle.
    #[serde(default)]
    pub error_backoff: BackoffConfig,

    /// How long Completed/Failed ledger entries are remembered.
    #[serde(default = "default_retention")]
    pub idempotency_retention_secs: u64,

    /// How long an InFlight entry may linger before it stops blocking.
    #[serde(default = "default_in_flight_ttl")]
    pub in_flight_ttl_secs: u64,

    #[serde(default = "default_purge_interval")]
    pub ledger_purge_interval_secs: u64,

    /// Supervisor-wide rate limit, overridable per Task.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Timeout for each reasoning stage call.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,

    #[serde(default = "default_observe_timeout")]
    pub observe_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Maximum Task cycles running at once.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// ActionRecords kept per Task.
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    /// Recent records sent to the reasoning service with each analysis.
    #[serde(default = "default_analysis_history")]
    pub analysis_history: usize,

    /// Directory for cycle journals. Empty disables journaling.
    #[serde(default = "default_journal_dir")]
    pub journal_dir: String,

    #[serde(default = "default_reasoning_url")]
    pub reasoning_url: String,

    #[serde(default = "default_target_url")]
    pub target_url: String,

    #[serde(default = "default_observe_url")]
    pub observe_url: String,

    /// Declared supervision requests.
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base")]
    pub base_secs: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_backoff_max")]
    pub max_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts per action, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
}

/// Duration-typed settings consumed by the pipeline components.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub poll_interval: Duration,
    pub success_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub backoff_max: Duration,
    pub idempotency_retention: Duration,
    pub in_flight_ttl: Duration,
    pub rate_limit: RateLimitConfig,
    pub stage_timeout: Duration,
    pub observe_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub attempt_timeout: Duration,
    pub history_cap: usize,
    pub analysis_history: usize,
    pub journal_dir: Option<String>,
}

impl SupervisorConfig {
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            success_interval: Duration::from_secs(self.success_interval_secs),
            backoff_base: Duration::from_secs(self.error_backoff.base_secs),
            backoff_multiplier: self.error_backoff.multiplier,
            backoff_max: Duration::from_secs(self.error_backoff.max_secs),
            idempotency_retention: Duration::from_secs(self.idempotency_retention_secs),
            in_flight_ttl: Duration::from_secs(self.in_flight_ttl_secs),
            rate_limit: self.rate_limit,
            stage_timeout: Duration::from_secs(self.stage_timeout_secs),
            observe_timeout: Duration::from_secs(self.observe_timeout_secs),
            max_attempts: self.retry.max_attempts,
            retry_base_delay: Duration::from_millis(self.retry.base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry.max_delay_ms),
            attempt_timeout: Duration::from_secs(self.retry.attempt_timeout_secs),
            history_cap: self.history_cap,
            analysis_history: self.analysis_history,
            journal_dir: Some(self.journal_dir.clone()).filter(|d| !d.is_empty()),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        SupervisorConfig::default().pipeline_settings()
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_success_interval() -> u64 {
    60
}

fn default_retention() -> u64 {
    24 * 60 * 60
}

fn default_in_flight_ttl() -> u64 {
    60 * 60
}

fn default_purge_interval() -> u64 {
    300
}

fn default_stage_timeout() -> u64 {
    60
}

fn default_observe_timeout() -> u64 {
    30
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_history_cap() -> usize {
    50
}

fn default_analysis_history() -> usize {
    10
}

fn default_journal_dir() -> String {
    "./journal".to_string()
}

fn default_reasoning_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_target_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_observe_url() -> String {
    "http://localhost:8002".to_string()
}

fn default_backoff_base() -> u64 {
    10
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max() -> u64 {
    900
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_attempt_timeout() -> u64 {
    300
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: default_backoff_base(),
            multiplier: default_backoff_multiplier(),
            max_secs: default_backoff_max(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_secs: default_attempt_timeout(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            success_interval_secs: default_success_interval(),
            error_backoff: BackoffConfig::default(),
            idempotency_retention_secs: default_retention(),
            in_flight_ttl_secs: default_in_flight_ttl(),
            ledger_purge_interval_secs: default_purge_interval(),
            rate_limit: RateLimitConfig::default(),
            stage_timeout_secs: default_stage_timeout(),
            observe_timeout_secs: default_observe_timeout(),
            retry: RetryConfig::default(),
            worker_pool_size: default_worker_pool_size(),
            history_cap: default_history_cap(),
            analysis_history: default_analysis_history(),
            journal_dir: default_journal_dir(),
            reasoning_url: default_reasoning_url(),
            target_url: default_target_url(),
            observe_url: default_observe_url(),
            tasks: Vec::new(),
        }
    }
}
