//! Crawl Engine Module
//!
//! Admission gates and execution of crawl requests: the per-destination rate
//! limiter, the memory gate, fetch timeouts, retry and progress hooks, and the
//! dispatcher tying them to the page pool.

pub mod crawl_types;
pub mod dispatcher;
pub mod memory_monitor;
pub mod page_timeout;
pub mod progress;
pub mod rate_limiter;
pub mod retry;

pub use crawl_types::{
    AdmissionGate, CancelReason, CrawlResult, DispatchError, DispatchResult, FetchFailure,
    FetchPayload, RequestOutcome,
};
pub use dispatcher::Dispatcher;
pub use memory_monitor::{MemoryMonitor, MemorySample, MemorySource, SystemMemory};
pub use page_timeout::with_page_timeout;
pub use progress::{NoOpProgress, ProgressReporter};
pub use rate_limiter::{DestinationState, RateLimiter};
pub use retry::{FixedDelayRetry, RetryStrategy};
