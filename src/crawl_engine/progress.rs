//! Progress reporting for dispatched requests
//!
//! A `ProgressReporter` hears about each request twice: once when it clears
//! admission and is about to run for the first time, and once with its final
//! result. Rate-limit and failure retries do not repeat the start report.

use crate::crawl_engine::crawl_types::CrawlResult;
use crate::request::CrawlRequest;

/// Receives per-request lifecycle reports from the dispatcher
///
/// Called inline on the request's task, so implementations should hand off
/// anything slow (send on a channel, bump a counter).
pub trait ProgressReporter: Send + Sync {
    /// The request cleared every admission gate and holds a page
    fn report_started(&self, request: &CrawlRequest);

    /// The request finished, successfully or not
    fn report_completed(&self, result: &CrawlResult);
}

/// Progress reporter that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgress;

impl ProgressReporter for NoOpProgress {
    #[inline(always)]
    fn report_started(&self, _request: &CrawlRequest) {}

    #[inline(always)]
    fn report_completed(&self, _result: &CrawlResult) {}
}
