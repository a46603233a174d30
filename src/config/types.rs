//! Core configuration types for crawl dispatch
//!
//! `DispatchConfig` holds every tunable of the pool, limiter, memory gate,
//! stream sessions and job queue. Missing keys fall back to the defaults in
//! [`crate::utils::constants`].

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::crawl_engine::crawl_types::{DispatchError, DispatchResult};
use crate::utils::{
    DEFAULT_BASE_DELAY_SECS, DEFAULT_BATCH_PROCESS_TIMEOUT_SECS, DEFAULT_FAILURE_RETRIES,
    DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_IDLE_TTL_SECS, DEFAULT_JITTER_SECS,
    DEFAULT_JOB_RETENTION_SECS, DEFAULT_JOB_WORKERS, DEFAULT_MAX_CONSECUTIVE_OPEN_FAILURES,
    DEFAULT_MAX_DELAY_SECS, DEFAULT_MAX_PAGES, DEFAULT_MAX_RETRIES, DEFAULT_MEMORY_MAX_POLLS,
    DEFAULT_MEMORY_POLL_INTERVAL_MS, DEFAULT_MEMORY_SAMPLE_INTERVAL_MS,
    DEFAULT_MEMORY_THRESHOLD_PERCENT, DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS, DEFAULT_RATE_LIMIT_CODES,
    DEFAULT_RATE_WAIT_TIMEOUT_SECS, DEFAULT_RETRY_DELAY_SECS, DEFAULT_STREAM_INIT_TIMEOUT_SECS,
    DEFAULT_SWEEP_INTERVAL_SECS, MAX_DURATION_SECS,
};

/// Main configuration struct for the dispatch service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on concurrently open page handles, and on in-flight executions
    pub(crate) max_pages: usize,
    pub(crate) idle_ttl_secs: u64,
    pub(crate) sweep_interval_secs: u64,
    pub(crate) max_consecutive_open_failures: u32,

    /// Memory gate closes at or above this percentage of system memory in use
    pub(crate) memory_threshold_percent: f64,
    pub(crate) memory_sample_interval_ms: u64,
    pub(crate) memory_poll_interval_ms: u64,
    pub(crate) memory_max_polls: u32,

    pub(crate) rate_limit: RateLimitConfig,
    pub(crate) retry: RetryConfig,

    pub(crate) rate_wait_timeout_secs: f64,
    pub(crate) pool_acquire_timeout_secs: f64,
    /// Bound on a single backend call
    pub(crate) fetch_timeout_secs: f64,

    /// A stream that delivers nothing within this window fails
    pub(crate) stream_init_timeout_secs: f64,
    /// Deadline for a whole stream session
    pub(crate) batch_process_timeout_secs: f64,

    pub(crate) job_workers: usize,
    pub(crate) job_retention_secs: u64,

    pub(crate) browser: BrowserLaunchConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
            idle_ttl_secs: DEFAULT_IDLE_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_consecutive_open_failures: DEFAULT_MAX_CONSECUTIVE_OPEN_FAILURES,
            memory_threshold_percent: DEFAULT_MEMORY_THRESHOLD_PERCENT,
            memory_sample_interval_ms: DEFAULT_MEMORY_SAMPLE_INTERVAL_MS,
            memory_poll_interval_ms: DEFAULT_MEMORY_POLL_INTERVAL_MS,
            memory_max_polls: DEFAULT_MEMORY_MAX_POLLS,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            rate_wait_timeout_secs: DEFAULT_RATE_WAIT_TIMEOUT_SECS,
            pool_acquire_timeout_secs: DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            stream_init_timeout_secs: DEFAULT_STREAM_INIT_TIMEOUT_SECS,
            batch_process_timeout_secs: DEFAULT_BATCH_PROCESS_TIMEOUT_SECS,
            job_workers: DEFAULT_JOB_WORKERS,
            job_retention_secs: DEFAULT_JOB_RETENTION_SECS,
            browser: BrowserLaunchConfig::default(),
        }
    }
}

/// Per-destination pacing policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// `[min, max]` range the base delay is drawn from after a success
    pub(crate) base_delay_secs: (f64, f64),
    pub(crate) max_delay_secs: f64,
    pub(crate) jitter_secs: f64,
    pub(crate) max_retries: u32,
    pub(crate) rate_limit_codes: Vec<u16>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: DEFAULT_BASE_DELAY_SECS,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
            jitter_secs: DEFAULT_JITTER_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            rate_limit_codes: DEFAULT_RATE_LIMIT_CODES.to_vec(),
        }
    }
}

/// Retry policy for fetches that failed outright
///
/// Independent of the rate-limit retries: those re-admit throttled requests,
/// these re-run requests whose fetch, page open or admission failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub(crate) max_retries: u32,
    pub(crate) retry_delay_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_FAILURE_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

/// Settings for the Chromium backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserLaunchConfig {
    /// Explicit Chrome/Chromium binary; auto-detected when unset
    pub chrome_executable: Option<PathBuf>,
    /// CDP request timeout; chromiumoxide's default when unset
    pub request_timeout_secs: Option<u64>,
}

impl DispatchConfig {
    /// Load a configuration from a JSON file, applying defaults for missing keys
    ///
    /// # Errors
    /// Returns a `Config` error if the file cannot be read, parsed or validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> DispatchResult<Self> {
        let path = path.as_ref();
        let config: Self = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))
            .and_then(|raw| {
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))
            })
            .map_err(|e| DispatchError::config(format!("{e:#}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every tunable against its allowed range
    ///
    /// # Errors
    /// Returns a `Config` error naming the first offending key.
    pub fn validate(&self) -> DispatchResult<()> {
        fn positive(name: &str, value: f64) -> DispatchResult<()> {
            if value > 0.0 && value <= MAX_DURATION_SECS {
                Ok(())
            } else {
                Err(DispatchError::config(format!(
                    "{name} must be within (0, {MAX_DURATION_SECS}] seconds, got {value}"
                )))
            }
        }
        fn non_negative(name: &str, value: f64) -> DispatchResult<()> {
            if (0.0..=MAX_DURATION_SECS).contains(&value) {
                Ok(())
            } else {
                Err(DispatchError::config(format!(
                    "{name} must be within [0, {MAX_DURATION_SECS}] seconds, got {value}"
                )))
            }
        }
        fn nonzero(name: &str, value: u64) -> DispatchResult<()> {
            if value == 0 {
                Err(DispatchError::config(format!("{name} must be > 0")))
            } else {
                Ok(())
            }
        }
        fn whole_secs(name: &str, value: u64) -> DispatchResult<()> {
            positive(name, value as f64)
        }

        nonzero("max_pages", self.max_pages as u64)?;
        whole_secs("idle_ttl_secs", self.idle_ttl_secs)?;
        whole_secs("sweep_interval_secs", self.sweep_interval_secs)?;
        nonzero(
            "max_consecutive_open_failures",
            u64::from(self.max_consecutive_open_failures),
        )?;
        nonzero("memory_sample_interval_ms", self.memory_sample_interval_ms)?;
        nonzero("memory_poll_interval_ms", self.memory_poll_interval_ms)?;
        nonzero("memory_max_polls", u64::from(self.memory_max_polls))?;
        nonzero("job_workers", self.job_workers as u64)?;
        whole_secs("job_retention_secs", self.job_retention_secs)?;

        if !(0.0..=100.0).contains(&self.memory_threshold_percent) {
            return Err(DispatchError::config(format!(
                "memory_threshold_percent must be within 0-100, got {}",
                self.memory_threshold_percent
            )));
        }

        let (base_min, base_max) = self.rate_limit.base_delay_secs;
        non_negative("rate_limit.base_delay_secs min", base_min)?;
        non_negative("rate_limit.base_delay_secs max", base_max)?;
        if base_min > base_max {
            return Err(DispatchError::config(format!(
                "rate_limit.base_delay_secs must satisfy 0 <= min <= max, got [{base_min}, {base_max}]"
            )));
        }
        non_negative("rate_limit.max_delay_secs", self.rate_limit.max_delay_secs)?;
        if self.rate_limit.max_delay_secs < base_max {
            return Err(DispatchError::config(format!(
                "rate_limit.max_delay_secs ({}) must be >= base delay max ({base_max})",
                self.rate_limit.max_delay_secs
            )));
        }
        non_negative("rate_limit.jitter_secs", self.rate_limit.jitter_secs)?;
        non_negative("retry.retry_delay_secs", self.retry.retry_delay_secs)?;

        positive("rate_wait_timeout_secs", self.rate_wait_timeout_secs)?;
        positive("pool_acquire_timeout_secs", self.pool_acquire_timeout_secs)?;
        positive("fetch_timeout_secs", self.fetch_timeout_secs)?;
        positive("stream_init_timeout_secs", self.stream_init_timeout_secs)?;
        positive("batch_process_timeout_secs", self.batch_process_timeout_secs)?;
        if self.batch_process_timeout_secs < self.stream_init_timeout_secs {
            return Err(DispatchError::config(format!(
                "batch_process_timeout_secs ({}) must be >= stream_init_timeout_secs ({})",
                self.batch_process_timeout_secs, self.stream_init_timeout_secs
            )));
        }

        Ok(())
    }
}
