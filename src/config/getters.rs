//! Getter methods for `DispatchConfig`
//!
//! Second-valued settings are stored as floats for JSON ergonomics and handed
//! out as `Duration`.

use std::time::Duration;

use super::types::{BrowserLaunchConfig, DispatchConfig, RateLimitConfig, RetryConfig};

impl DispatchConfig {
    #[must_use]
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    #[must_use]
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub fn max_consecutive_open_failures(&self) -> u32 {
        self.max_consecutive_open_failures
    }

    #[must_use]
    pub fn memory_threshold_percent(&self) -> f64 {
        self.memory_threshold_percent
    }

    #[must_use]
    pub fn memory_sample_interval(&self) -> Duration {
        Duration::from_millis(self.memory_sample_interval_ms)
    }

    #[must_use]
    pub fn memory_poll_interval(&self) -> Duration {
        Duration::from_millis(self.memory_poll_interval_ms)
    }

    #[must_use]
    pub fn memory_max_polls(&self) -> u32 {
        self.memory_max_polls
    }

    #[must_use]
    pub fn rate_limit(&self) -> &RateLimitConfig {
        &self.rate_limit
    }

    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    #[must_use]
    pub fn rate_wait_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.rate_wait_timeout_secs)
    }

    #[must_use]
    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.pool_acquire_timeout_secs)
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.fetch_timeout_secs)
    }

    #[must_use]
    pub fn stream_init_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stream_init_timeout_secs)
    }

    #[must_use]
    pub fn batch_process_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.batch_process_timeout_secs)
    }

    /// Job workers, never more than the pool can serve at once
    #[must_use]
    pub fn effective_job_workers(&self) -> usize {
        self.job_workers.min(self.max_pages).max(1)
    }

    #[must_use]
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    #[must_use]
    pub fn browser(&self) -> &BrowserLaunchConfig {
        &self.browser
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn base_delay(&self) -> (Duration, Duration) {
        (
            Duration::from_secs_f64(self.base_delay_secs.0),
            Duration::from_secs_f64(self.base_delay_secs.1),
        )
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_secs)
    }

    #[must_use]
    pub fn jitter(&self) -> Duration {
        Duration::from_secs_f64(self.jitter_secs)
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub fn rate_limit_codes(&self) -> &[u16] {
        &self.rate_limit_codes
    }
}

impl RetryConfig {
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs)
    }
}
