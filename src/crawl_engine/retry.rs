//! Retry decisions for failed requests
//!
//! The dispatcher owns the retry budget (`retry.max_retries`); a
//! `RetryStrategy` only decides, within that budget, whether a particular
//! failure is worth another attempt and how long to wait first.

use std::time::Duration;

use crate::crawl_engine::crawl_types::DispatchError;

pub trait RetryStrategy: Send + Sync {
    /// `Some(delay)` to run the request again after `delay`, `None` to give up
    ///
    /// `attempt` counts failed attempts so far, starting at 1.
    fn retry_after(&self, url: &str, attempt: u32, error: &DispatchError) -> Option<Duration>;
}

/// Retry every retryable failure after the same pause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelayRetry {
    delay: Duration,
}

impl FixedDelayRetry {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryStrategy for FixedDelayRetry {
    fn retry_after(&self, _url: &str, _attempt: u32, error: &DispatchError) -> Option<Duration> {
        error.is_retryable().then_some(self.delay)
    }
}

impl<F> RetryStrategy for F
where
    F: Fn(&str, u32, &DispatchError) -> Option<Duration> + Send + Sync,
{
    fn retry_after(&self, url: &str, attempt: u32, error: &DispatchError) -> Option<Duration> {
        self(url, attempt, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl_engine::crawl_types::{AdmissionGate, CancelReason, FetchFailure};

    #[test]
    fn test_fixed_delay_only_retries_retryable_errors() {
        let strategy = FixedDelayRetry::new(Duration::from_millis(250));

        assert_eq!(
            strategy.retry_after("https://a.test/", 1, &FetchFailure::new("reset").into()),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            strategy.retry_after(
                "https://a.test/",
                2,
                &DispatchError::admission_timeout(AdmissionGate::Pool)
            ),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            strategy.retry_after(
                "https://a.test/",
                1,
                &DispatchError::cancelled(CancelReason::Caller)
            ),
            None
        );
        assert_eq!(
            strategy.retry_after("https://a.test/", 1, &DispatchError::unavailable("down")),
            None
        );
    }

    #[test]
    fn test_closure_strategy() {
        let strategy = |_: &str, attempt: u32, _: &DispatchError| {
            (attempt < 2).then(|| Duration::from_millis(u64::from(attempt) * 100))
        };
        let error = DispatchError::from(FetchFailure::new("boom"));
        assert_eq!(
            strategy.retry_after("https://a.test/", 1, &error),
            Some(Duration::from_millis(100))
        );
        assert_eq!(strategy.retry_after("https://a.test/", 2, &error), None);
    }
}
