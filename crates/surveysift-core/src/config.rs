//! Run configuration.
//!
//! [`EngineConfig`] is built once, validated, and handed to the orchestrator.
//! [`SiftConfig`] layers it with the model endpoint so a whole setup can be
//! read from one TOML file and then overridden from the environment:
//!
//! ```toml
//! [engine]
//! concurrency = 16
//! model = "gpt-4o-mini"
//!
//! [engine.retry]
//! max_attempts = 5
//!
//! [endpoint]
//! base_url = "http://localhost:8080/v1"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::accounting::{ModelPrice, PriceTable};
use crate::domain::{Result, SiftError};
use crate::evaluator::Criteria;

pub const ENV_BASE_URL: &str = "LLM_BASE_URL";
pub const ENV_API_KEY: &str = "LLM_API_KEY";
pub const ENV_MODEL: &str = "LLM_MODEL";

/// How evaluation tasks are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Spawned tasks, gate capacity `concurrency`.
    #[default]
    Concurrent,
    /// In order on the driving task, gate capacity 1.
    Sequential,
}

/// Retry bounds for transient model failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts for transient failures, first call included. The
    /// corrective retry after an unparseable reply is not counted.
    pub max_attempts: u32,
    /// Base delay for exponential backoff (milliseconds).
    pub backoff_base_ms: u64,
    /// Cap for a single backoff wait (milliseconds).
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Wait before retrying after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let ms = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Immutable settings for one evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum model calls in flight.
    pub concurrency: usize,
    /// Pacing delay taken inside each gate slot (milliseconds).
    pub call_delay_ms: u64,
    /// Candidates per checkpoint chunk.
    pub checkpoint_batch_size: usize,
    /// Checkpoint files kept on disk during a run; older ones are pruned.
    pub checkpoints_kept: usize,
    pub mode: ExecutionMode,
    pub model: String,
    pub temperature: f32,
    pub start_index: usize,
    pub max_candidates: Option<usize>,
    pub retry: RetryPolicy,
    pub criteria: Criteria,
    /// Per-model prices that replace or extend the standard table.
    pub price_overrides: BTreeMap<String, ModelPrice>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 32,
            call_delay_ms: 100,
            checkpoint_batch_size: 10,
            checkpoints_kept: 2,
            mode: ExecutionMode::Concurrent,
            model: "gpt-4".to_string(),
            temperature: 0.1,
            start_index: 0,
            max_candidates: None,
            retry: RetryPolicy::default(),
            criteria: Criteria::default(),
            price_overrides: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_checkpoint_batch_size(mut self, size: usize) -> Self {
        self.checkpoint_batch_size = size;
        self
    }

    pub fn with_checkpoints_kept(mut self, keep: usize) -> Self {
        self.checkpoints_kept = keep;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_window(mut self, start_index: usize, max_candidates: Option<usize>) -> Self {
        self.start_index = start_index;
        self.max_candidates = max_candidates;
        self
    }

    /// Gate capacity actually used: 1 in sequential mode.
    pub fn effective_concurrency(&self) -> usize {
        match self.mode {
            ExecutionMode::Sequential => 1,
            ExecutionMode::Concurrent => self.concurrency,
        }
    }

    pub fn call_delay(&self) -> Duration {
        Duration::from_millis(self.call_delay_ms)
    }

    /// Standard prices with this config's overrides applied.
    pub fn price_table(&self) -> PriceTable {
        PriceTable::standard().with_overrides(&self.price_overrides)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SiftError::InvalidConfig(msg));
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1".into());
        }
        if self.checkpoint_batch_size == 0 {
            return invalid("checkpoint_batch_size must be at least 1".into());
        }
        if self.checkpoints_kept == 0 {
            return invalid("checkpoints_kept must be at least 1".into());
        }
        if self.model.trim().is_empty() {
            return invalid("model must not be empty".into());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return invalid(format!(
                "temperature {} is outside 0.0..=2.0",
                self.temperature
            ));
        }
        if self.max_candidates == Some(0) {
            return invalid("max_candidates must be at least 1 when set".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if self.retry.backoff_base_ms > self.retry.max_backoff_ms {
            return invalid(format!(
                "retry.backoff_base_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.backoff_base_ms, self.retry.max_backoff_ms
            ));
        }
        if self.criteria.target_domains.is_empty() {
            return invalid("criteria.target_domains must not be empty".into());
        }
        for (model, price) in &self.price_overrides {
            if price.prompt_per_1k < 0.0 || price.completion_per_1k < 0.0 {
                return invalid(format!("negative price for model {model}"));
            }
        }
        Ok(())
    }
}

/// Where and how to reach the model API.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelEndpoint {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ModelEndpoint {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            request_timeout_secs: 60,
        }
    }
}

impl std::fmt::Debug for ModelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEndpoint")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl ModelEndpoint {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Engine settings plus endpoint, as read from a config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiftConfig {
    pub engine: EngineConfig,
    pub endpoint: ModelEndpoint,
}

impl SiftConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| SiftError::InvalidConfig(format!("config file: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SiftError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Overlay `LLM_BASE_URL`, `LLM_API_KEY` and `LLM_MODEL`.
    ///
    /// `lookup` is `std::env::var` in production; tests pass a map.
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty(ENV_BASE_URL) {
            self.endpoint.base_url = url;
        }
        if let Some(key) = non_empty(ENV_API_KEY) {
            self.endpoint.api_key = Some(key);
        }
        if let Some(model) = non_empty(ENV_MODEL) {
            self.engine.model = model;
        }
        self
    }

    pub fn from_process_env(self) -> Self {
        self.apply_env(|key| std::env::var(key).ok())
    }
}
