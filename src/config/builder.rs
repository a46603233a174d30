//! Fluent builder for `DispatchConfig`
//!
//! Every setting has a default, so the builder has no required-field states;
//! `build()` runs the same validation as loading from a file.

use super::types::{BrowserLaunchConfig, DispatchConfig};
use crate::crawl_engine::crawl_types::DispatchResult;

#[derive(Debug, Clone, Default)]
pub struct DispatchConfigBuilder {
    config: DispatchConfig,
}

impl DispatchConfig {
    /// Create a builder for configuring a `DispatchConfig` with a fluent interface
    ///
    /// # Example
    /// ```rust
    /// # use kodegen_crawl_dispatch::config::DispatchConfig;
    /// let config = DispatchConfig::builder()
    ///     .max_pages(4)
    ///     .base_delay_secs(0.5, 1.5)
    ///     .build()
    ///     .expect("valid configuration");
    /// assert_eq!(config.max_pages(), 4);
    /// ```
    #[must_use]
    pub fn builder() -> DispatchConfigBuilder {
        DispatchConfigBuilder::default()
    }
}

impl DispatchConfigBuilder {
    #[must_use]
    pub fn max_pages(mut self, max_pages: usize) -> Self {
        self.config.max_pages = max_pages;
        self
    }

    #[must_use]
    pub fn idle_ttl_secs(mut self, secs: u64) -> Self {
        self.config.idle_ttl_secs = secs;
        self
    }

    #[must_use]
    pub fn sweep_interval_secs(mut self, secs: u64) -> Self {
        self.config.sweep_interval_secs = secs;
        self
    }

    #[must_use]
    pub fn max_consecutive_open_failures(mut self, failures: u32) -> Self {
        self.config.max_consecutive_open_failures = failures;
        self
    }

    #[must_use]
    pub fn memory_threshold_percent(mut self, percent: f64) -> Self {
        self.config.memory_threshold_percent = percent;
        self
    }

    #[must_use]
    pub fn memory_sample_interval_ms(mut self, ms: u64) -> Self {
        self.config.memory_sample_interval_ms = ms;
        self
    }

    /// Poll interval and poll budget for requests held at the memory gate
    #[must_use]
    pub fn memory_polling(mut self, interval_ms: u64, max_polls: u32) -> Self {
        self.config.memory_poll_interval_ms = interval_ms;
        self.config.memory_max_polls = max_polls;
        self
    }

    /// Set the range the per-destination base delay is drawn from
    ///
    /// `(0.0, 0.0)` disables pacing between successful requests; backoff after
    /// rate limiting still applies.
    #[must_use]
    pub fn base_delay_secs(mut self, min: f64, max: f64) -> Self {
        self.config.rate_limit.base_delay_secs = (min, max);
        self
    }

    #[must_use]
    pub fn max_delay_secs(mut self, secs: f64) -> Self {
        self.config.rate_limit.max_delay_secs = secs;
        self
    }

    #[must_use]
    pub fn jitter_secs(mut self, secs: f64) -> Self {
        self.config.rate_limit.jitter_secs = secs;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.rate_limit.max_retries = retries;
        self
    }

    /// Retry failed fetches up to `max_retries` times, pausing `delay_secs` between tries
    #[must_use]
    pub fn failure_retries(mut self, max_retries: u32, delay_secs: f64) -> Self {
        self.config.retry.max_retries = max_retries;
        self.config.retry.retry_delay_secs = delay_secs;
        self
    }

    #[must_use]
    pub fn rate_limit_codes(mut self, codes: impl Into<Vec<u16>>) -> Self {
        self.config.rate_limit.rate_limit_codes = codes.into();
        self
    }

    #[must_use]
    pub fn rate_wait_timeout_secs(mut self, secs: f64) -> Self {
        self.config.rate_wait_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn pool_acquire_timeout_secs(mut self, secs: f64) -> Self {
        self.config.pool_acquire_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn fetch_timeout_secs(mut self, secs: f64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn stream_init_timeout_secs(mut self, secs: f64) -> Self {
        self.config.stream_init_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn batch_process_timeout_secs(mut self, secs: f64) -> Self {
        self.config.batch_process_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn job_workers(mut self, workers: usize) -> Self {
        self.config.job_workers = workers;
        self
    }

    #[must_use]
    pub fn job_retention_secs(mut self, secs: u64) -> Self {
        self.config.job_retention_secs = secs;
        self
    }

    #[must_use]
    pub fn browser(mut self, browser: BrowserLaunchConfig) -> Self {
        self.config.browser = browser;
        self
    }

    /// Validate and produce the configuration
    ///
    /// # Errors
    /// Returns a `Config` error naming the first out-of-range setting.
    pub fn build(self) -> DispatchResult<DispatchConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
