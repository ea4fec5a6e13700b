//! Runtime configuration loaded from environment variables.
//!
//! Every setting has a default except the external endpoints and secrets,
//! which stay `None` when unset. The service degrades instead of refusing to
//! start: no `DATABASE_URL` means in-memory stores, no `WEBHOOK_SECRET` means
//! the webhook rejects every request.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::jobs::{BackoffStrategy, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub dialer_url: Option<String>,
    #[serde(default)]
    pub dialer_api_key: Option<String>,
    #[serde(default)]
    pub provider_api_url: Option<String>,
    #[serde(default)]
    pub provider_api_key: Option<String>,
    #[serde(default)]
    pub analysis_url: Option<String>,
    #[serde(default = "default_dispatch_interval_secs")]
    pub dispatch_interval_secs: u64,
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_job_poll_interval_ms")]
    pub job_poll_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_metadata_scan_window_hours")]
    pub metadata_scan_window_hours: i64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// How long a task may sit `in_progress` before the dispatcher reclaims it.
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_dispatch_interval_secs() -> u64 {
    30
}

fn default_dispatch_batch_size() -> usize {
    100
}

fn default_worker_count() -> usize {
    4
}

fn default_job_poll_interval_ms() -> u64 {
    250
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    30_000
}

fn default_retry_max_delay_ms() -> u64 {
    900_000
}

fn default_metadata_scan_window_hours() -> i64 {
    48
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_claim_timeout_secs() -> u64 {
    600
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: None,
            webhook_secret: None,
            dialer_url: None,
            dialer_api_key: None,
            provider_api_url: None,
            provider_api_key: None,
            analysis_url: None,
            dispatch_interval_secs: default_dispatch_interval_secs(),
            dispatch_batch_size: default_dispatch_batch_size(),
            worker_count: default_worker_count(),
            job_poll_interval_ms: default_job_poll_interval_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            metadata_scan_window_hours: default_metadata_scan_window_hours(),
            http_timeout_secs: default_http_timeout_secs(),
            claim_timeout_secs: default_claim_timeout_secs(),
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(config::Environment::default())
    }

    /// Load settings from an explicit set of `KEY=value` pairs.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let source = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self::load(config::Environment::default().source(Some(source)))
    }

    fn load(environment: config::Environment) -> Result<Self, ConfigError> {
        let settings: Settings = config::Config::builder()
            .add_source(environment.try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.normalized().validate()
    }

    /// Blank values count as unset.
    fn normalized(mut self) -> Self {
        for value in [
            &mut self.database_url,
            &mut self.webhook_secret,
            &mut self.dialer_url,
            &mut self.dialer_api_key,
            &mut self.provider_api_url,
            &mut self.provider_api_key,
            &mut self.analysis_url,
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *value = None;
            }
        }
        self
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_COUNT",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.dispatch_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "DISPATCH_BATCH_SIZE",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.dispatch_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "DISPATCH_INTERVAL_SECS",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::Invalid {
                key: "RETRY_BASE_DELAY_MS",
                reason: format!(
                    "{} exceeds RETRY_MAX_DELAY_MS ({})",
                    self.retry_base_delay_ms, self.retry_max_delay_ms
                ),
            });
        }
        if self.metadata_scan_window_hours < 0 {
            return Err(ConfigError::Invalid {
                key: "METADATA_SCAN_WINDOW_HOURS",
                reason: "must not be negative".to_string(),
            });
        }
        if chrono::Duration::try_hours(self.metadata_scan_window_hours).is_none() {
            return Err(ConfigError::Invalid {
                key: "METADATA_SCAN_WINDOW_HOURS",
                reason: format!("{} hours is out of range", self.metadata_scan_window_hours),
            });
        }
        // A claim must outlive the dialer request it guards.
        if self.claim_timeout_secs <= self.http_timeout_secs {
            return Err(ConfigError::Invalid {
                key: "CLAIM_TIMEOUT_SECS",
                reason: format!("must exceed HTTP_TIMEOUT_SECS ({})", self.http_timeout_secs),
            });
        }
        if i64::try_from(self.claim_timeout_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .is_none()
        {
            return Err(ConfigError::Invalid {
                key: "CLAIM_TIMEOUT_SECS",
                reason: format!("{} seconds is out of range", self.claim_timeout_secs),
            });
        }
        Ok(self)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn metadata_scan_window(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.metadata_scan_window_hours)
            .unwrap_or_else(|| chrono::Duration::hours(default_metadata_scan_window_hours()))
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        i64::try_from(self.claim_timeout_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| chrono::Duration::seconds(default_claim_timeout_secs() as i64))
    }

    /// Retry policy for transient dialer failures.
    pub fn dial_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}
