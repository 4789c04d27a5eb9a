//! Configuration (TOML).
//!
//! すべてのフィールドにデフォルトがあるので、空ファイルでも起動できます。
//! 値の整合性は `validate()` で確認し、AppBuilder::build() が起動時に呼びます。
//!
//! ```toml
//! [lease]
//! duration_secs = 600
//! renew_interval_secs = 120
//!
//! [retry]
//! backoff = "fixed"
//! delay_secs = 300
//! rate_limit_markers = ["GEMINI_429", "429"]
//! rate_limited_delay_secs = 60
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::app::WorkerSettings;
use crate::domain::{Backoff, QueueError, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for QueueError {
    fn from(err: ConfigError) -> Self {
        QueueError::Config(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForemanConfig {
    pub lease: LeaseConfig,
    pub dispatch: DispatchConfig,
    pub reclaim: ReclaimConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
    pub store: StoreConfig,
    pub ingest: IngestConfig,
}

/// Upper bound for `lease.duration_secs` (7 days).
pub const MAX_LEASE_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseConfig {
    pub duration_secs: u64,
    /// Workers renew this often while a handler runs.
    pub renew_interval_secs: u64,
    pub min_duration_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: 600,
            renew_interval_secs: 120,
            min_duration_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Upper bound on a single claim, whatever the caller asks for.
    pub max_batch: usize,
    pub default_max_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_batch: 10,
            default_max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReclaimConfig {
    pub interval_secs: u64,
    /// Ids per bulk update.
    pub batch_size: usize,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    None,
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub backoff: BackoffKind,
    /// Fixed delay, or the exponential base.
    pub delay_secs: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
    pub rate_limit_markers: Vec<String>,
    pub rate_limited_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffKind::None,
            delay_secs: 300,
            multiplier: 2.0,
            max_delay_secs: 3600,
            rate_limit_markers: Vec::new(),
            rate_limited_delay_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Tasks claimed per dispatch call by each worker.
    pub batch_size: usize,
    /// Idle sleep when a dispatch claims nothing.
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_size: 1,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// `None` means the in-memory store.
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// bearer token -> caller subject
    pub tokens: HashMap<String, String>,
}

impl ForemanConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let lease = &self.lease;
        if lease.renew_interval_secs == 0 {
            return Err(invalid("lease.renew_interval_secs must be positive"));
        }
        if lease.duration_secs < lease.min_duration_secs {
            return Err(invalid(format!(
                "lease.duration_secs ({}) is below lease.min_duration_secs ({})",
                lease.duration_secs, lease.min_duration_secs
            )));
        }
        if lease.duration_secs > MAX_LEASE_SECS {
            return Err(invalid(format!(
                "lease.duration_secs ({}) exceeds {MAX_LEASE_SECS}",
                lease.duration_secs
            )));
        }
        if lease.duration_secs <= lease.renew_interval_secs {
            return Err(invalid(format!(
                "lease.duration_secs ({}) must exceed lease.renew_interval_secs ({})",
                lease.duration_secs, lease.renew_interval_secs
            )));
        }
        if self.dispatch.max_batch == 0 {
            return Err(invalid("dispatch.max_batch must be positive"));
        }
        if self.dispatch.default_max_attempts == 0 {
            return Err(invalid("dispatch.default_max_attempts must be positive"));
        }
        if self.reclaim.interval_secs == 0 || self.reclaim.batch_size == 0 {
            return Err(invalid("reclaim.interval_secs and reclaim.batch_size must be positive"));
        }
        let retry = &self.retry;
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be a finite number >= 1.0"));
        }
        if retry.backoff == BackoffKind::Exponential && retry.max_delay_secs < retry.delay_secs {
            return Err(invalid("retry.max_delay_secs must be >= retry.delay_secs"));
        }
        let worker = &self.worker;
        if worker.concurrency == 0 || worker.batch_size == 0 || worker.poll_interval_ms == 0 {
            return Err(invalid(
                "worker.concurrency, worker.batch_size and worker.poll_interval_ms must be positive",
            ));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> TimeDelta {
        TimeDelta::seconds(self.lease.duration_secs.min(MAX_LEASE_SECS) as i64)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.lease.renew_interval_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim.interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            batch_size: self.worker.batch_size,
            poll_interval: self.poll_interval(),
            renew_interval: self.renew_interval(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.retry;
        let backoff = match retry.backoff {
            BackoffKind::None => Backoff::None,
            BackoffKind::Fixed => Backoff::Fixed(Duration::from_secs(retry.delay_secs)),
            BackoffKind::Exponential => Backoff::Exponential {
                base: Duration::from_secs(retry.delay_secs),
                multiplier: retry.multiplier,
                max_delay: Duration::from_secs(retry.max_delay_secs),
            },
        };
        let policy = RetryPolicy::default().with_backoff(backoff);
        if retry.rate_limit_markers.is_empty() {
            policy
        } else {
            policy.with_rate_limit(
                retry.rate_limit_markers.clone(),
                Duration::from_secs(retry.rate_limited_delay_secs),
            )
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
