//! Crawl dispatch: a bounded browser page pool with per-destination rate
//! limiting, memory-aware admission, batch and streaming execution, and an
//! asynchronous job queue.

pub mod browser_backend;
pub mod config;
pub mod crawl_engine;
pub mod jobs;
pub mod page_pool;
pub mod request;
pub mod service;
pub mod stream;
pub mod utils;

pub use browser_backend::{ChromiumBackend, ChromiumPage};
pub use config::{
    BrowserLaunchConfig, DispatchConfig, DispatchConfigBuilder, RateLimitConfig, RetryConfig,
};
pub use crawl_engine::{
    AdmissionGate, CancelReason, CrawlResult, DispatchError, DispatchResult, Dispatcher,
    FetchFailure, FetchPayload, FixedDelayRetry, MemoryMonitor, MemorySource, NoOpProgress,
    ProgressReporter, RateLimiter, RequestOutcome, RetryStrategy, SystemMemory,
};
pub use jobs::{Job, JobCounts, JobQueue, JobStatus, TaskId};
pub use page_pool::{HandleState, PageBackend, PageLease, PagePool, PagePoolConfig, PoolStats};
pub use request::{BrowserProfile, CrawlRequest, Fingerprint, RequestId, Viewport};
pub use service::{DispatchOutput, DispatchService, ServiceStats};
pub use stream::{SessionInfo, StreamCoordinator, StreamSession};
