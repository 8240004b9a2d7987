//! Client configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. Batch size and concurrency are not documented by the
//! server; the defaults are deliberately small.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::environment::{EnvironmentConfig, EnvironmentResolver};
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Per network call, not per logical operation.
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
    pub bulk: BulkConfig,
    pub cache: CachePolicy,
    /// Ask the server to regenerate item files on every `SetItem`.
    pub make_item_files: bool,
    /// Environments beyond dev/liveops/production.
    pub environments: Vec<EnvironmentConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            bulk: BulkConfig::default(),
            cache: CachePolicy::default(),
            make_item_files: false,
            environments: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(raw: &str) -> ApiResult<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ApiError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> ApiResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ApiError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> ApiResult<()> {
        if self.timeout_ms == 0 {
            return Err(ApiError::Config("timeout_ms must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ApiError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.bulk.max_batch_size == 0 {
            return Err(ApiError::Config("bulk.max_batch_size must be positive".into()));
        }
        if self.bulk.max_concurrency == 0 {
            return Err(ApiError::Config("bulk.max_concurrency must be positive".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Add the configured environments to `resolver`.
    pub fn register_environments(&self, resolver: &mut EnvironmentResolver) -> ApiResult<()> {
        for env in &self.environments {
            resolver.register(env.build()?);
        }
        Ok(())
    }
}

/// Bounded exponential backoff for read-class requests.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulkConfig {
    /// Maximum ids per `GetBulkItems` call.
    pub max_batch_size: usize,
    /// Maximum batches in flight at once.
    pub max_concurrency: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_concurrency: 4,
        }
    }
}

/// Staleness policy for cached reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CachePolicy {
    /// Entries older than this are refetched. `None` keeps entries until they
    /// are invalidated.
    pub max_age_ms: Option<u64>,
}

impl CachePolicy {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_ms.map(Duration::from_millis)
    }
}
