//! TOML configuration parsing and validation.
//!
//! Missing or invalid settings that the scheduler cannot run without (most
//! importantly `verification.lock_ttl_ms`) fail at load time, not per poll.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub verification: VerificationConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub services: ServicesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Pool size. Scheduler polls and running jobs share it.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a statement waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct VerificationConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_verify_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Required: how long a claim stays exclusive.
    pub lock_ttl_ms: Option<u64>,
    /// Delay before a task that was not resolved becomes claimable again.
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default = "default_enabled")]
    pub trigger_answer_job_on_success: bool,
    #[serde(default = "default_answer_job_name")]
    pub answer_job_name: String,
    #[serde(default = "default_status_timeout_secs")]
    pub status_timeout_secs: u64,
    /// Stable worker identity; a random one is minted when absent.
    #[serde(default)]
    pub worker_id: Option<String>,
}

fn default_enabled() -> bool {
    true
}
fn default_delay_ms() -> u64 {
    5_000
}
fn default_verify_batch_size() -> usize {
    20
}
fn default_max_attempts() -> u32 {
    3
}
fn default_answer_job_name() -> String {
    "answer_generation".to_string()
}
fn default_status_timeout_secs() -> u64 {
    10
}

impl VerificationConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }

    /// Lease length. `load_config` guarantees it is set.
    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lock_ttl_ms.unwrap_or(0) as i64)
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.retry_delay_ms as i64)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_concurrency")]
    pub grid_size: usize,
    /// Source system tag written on newly created documents.
    #[serde(default = "default_source")]
    pub source: String,
    /// Queries asked of every ready document.
    #[serde(default)]
    pub query_ids: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            grid_size: default_concurrency(),
            source: default_source(),
            query_ids: Vec::new(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_source() -> String {
    "progression".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    5_000
}

/// Base URLs of the external collaborators. Unset services are reported
/// as errors when a command needs them.
#[derive(Debug, Deserialize, Clone)]
pub struct ServicesConfig {
    #[serde(default)]
    pub ingestion_status_url: Option<String>,
    #[serde(default)]
    pub materials_url: Option<String>,
    #[serde(default)]
    pub storage_url: Option<String>,
    #[serde(default)]
    pub answers_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            ingestion_status_url: None,
            materials_url: None,
            storage_url: None,
            answers_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be >= 1");
    }

    // Validate verification
    match config.verification.lock_ttl_ms {
        None => anyhow::bail!("verification.lock_ttl_ms is required"),
        Some(0) => anyhow::bail!("verification.lock_ttl_ms must be > 0"),
        Some(_) => {}
    }
    if config.verification.max_attempts == 0 {
        anyhow::bail!("verification.max_attempts must be >= 1");
    }
    if config.verification.delay_ms == 0 {
        anyhow::bail!("verification.delay_ms must be > 0");
    }
    if config.verification.answer_job_name.trim().is_empty() {
        anyhow::bail!("verification.answer_job_name must not be empty");
    }

    // Validate pipeline
    if config.pipeline.concurrency == 0 {
        anyhow::bail!("pipeline.concurrency must be >= 1");
    }

    // Validate retry
    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.multiplier < 1.0 {
        anyhow::bail!("retry.multiplier must be >= 1.0");
    }

    Ok(config)
}
