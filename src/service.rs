//! The dispatch service: one explicitly owned instance of every component
//!
//! There are no process-wide globals. An embedder builds a `DispatchService`
//! from a configuration and a backend, calls `start`, and drives requests
//! through `run`, `run_batch`, `run_stream`, `dispatch` or `submit`/`poll`.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use crate::config::DispatchConfig;
use crate::crawl_engine::crawl_types::{CrawlResult, DispatchResult};
use crate::crawl_engine::dispatcher::Dispatcher;
use crate::crawl_engine::memory_monitor::{MemoryMonitor, MemorySource, SystemMemory};
use crate::crawl_engine::progress::ProgressReporter;
use crate::crawl_engine::rate_limiter::RateLimiter;
use crate::crawl_engine::retry::RetryStrategy;
use crate::jobs::{Job, JobCounts, JobQueue, TaskId};
use crate::page_pool::{PageBackend, PagePool, PagePoolConfig, PoolStats};
use crate::request::CrawlRequest;
use crate::stream::{SessionInfo, StreamSession};

/// Output of [`DispatchService::dispatch`]
#[derive(Debug)]
pub enum DispatchOutput {
    /// Every result, in input order
    Batch(Vec<CrawlResult>),
    /// Live session yielding results in completion order
    Stream(StreamSession),
}

/// Observable state of the whole service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub pool: PoolStats,
    pub jobs: JobCounts,
    pub tracked_destinations: usize,
    pub memory_percent_used: Option<f64>,
    pub memory_gate_closed: bool,
    pub active_sessions: Vec<SessionInfo>,
}

pub struct DispatchService<B: PageBackend> {
    config: DispatchConfig,
    pool: Arc<PagePool<B>>,
    limiter: Arc<RateLimiter>,
    memory: Arc<MemoryMonitor>,
    dispatcher: Arc<Dispatcher<B>>,
    jobs: Arc<JobQueue<B>>,
    started: AtomicBool,
}

impl<B: PageBackend> std::fmt::Debug for DispatchService<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchService")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

impl<B: PageBackend> DispatchService<B> {
    /// Build a service sampling system memory from `/proc/meminfo`
    ///
    /// # Errors
    /// Returns a `Config` error if `config` fails validation.
    pub fn new(config: DispatchConfig, backend: Arc<B>) -> DispatchResult<Self> {
        Self::with_memory_source(config, backend, Arc::new(SystemMemory::default()))
    }

    /// Build a service with a custom memory source
    ///
    /// # Errors
    /// Returns a `Config` error if `config` fails validation.
    pub fn with_memory_source(
        config: DispatchConfig,
        backend: Arc<B>,
        memory_source: Arc<dyn MemorySource>,
    ) -> DispatchResult<Self> {
        config.validate()?;

        let pool = PagePool::new(PagePoolConfig::from(&config), backend);
        let limiter = Arc::new(RateLimiter::new(config.rate_limit().clone()));
        let memory = MemoryMonitor::new(
            memory_source,
            config.memory_threshold_percent(),
            config.memory_sample_interval(),
        );
        let dispatcher = Dispatcher::new(
            config.clone(),
            Arc::clone(&pool),
            Arc::clone(&limiter),
            Arc::clone(&memory),
        );
        let jobs = JobQueue::new(Arc::clone(&dispatcher));

        Ok(Self {
            config,
            pool,
            limiter,
            memory,
            dispatcher,
            jobs,
            started: AtomicBool::new(false),
        })
    }

    /// Start the background tasks: idle sweeper, memory sampler, job workers
    /// and job reaping
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.start();
        self.memory.start(self.dispatcher.shutdown_token().clone());
        self.jobs.start();
        self.jobs.start_cleanup_task(self.config.sweep_interval());
        info!(
            "Dispatch service started (max_pages={}, memory threshold {:.1}%)",
            self.config.max_pages(),
            self.config.memory_threshold_percent()
        );
    }

    /// Decide per failure whether (and after how long) it is retried
    ///
    /// The attempt budget stays `retry.max_retries`; with the default budget of
    /// zero the strategy is never consulted.
    pub fn set_retry_strategy(&self, strategy: Arc<dyn RetryStrategy>) {
        self.dispatcher.set_retry_strategy(strategy);
    }

    /// Receive a start and a completion report for every request, on every path
    pub fn set_progress_reporter(&self, reporter: Arc<dyn ProgressReporter>) {
        self.dispatcher.set_progress_reporter(reporter);
    }

    pub async fn run(&self, request: &CrawlRequest) -> CrawlResult {
        self.dispatcher.run(request).await
    }

    pub async fn run_batch(&self, requests: Vec<CrawlRequest>) -> Vec<CrawlResult> {
        self.dispatcher.run_batch(requests).await
    }

    pub fn run_stream(&self, requests: Vec<CrawlRequest>) -> StreamSession {
        self.dispatcher.run_stream(requests)
    }

    /// Stream when any request asks for streaming, batch otherwise
    pub async fn dispatch(&self, requests: Vec<CrawlRequest>) -> DispatchOutput {
        if requests.iter().any(CrawlRequest::is_stream) {
            DispatchOutput::Stream(self.run_stream(requests))
        } else {
            DispatchOutput::Batch(self.run_batch(requests).await)
        }
    }

    pub fn submit(&self, request: CrawlRequest) -> TaskId {
        self.jobs.submit(request)
    }

    /// # Errors
    /// `JobNotFound` for unknown or already reaped ids.
    pub fn poll(&self, task_id: TaskId) -> DispatchResult<Job> {
        self.jobs.poll(task_id)
    }

    /// Reap terminal jobs older than the configured retention
    pub fn reap_expired(&self) -> usize {
        self.jobs.reap_expired(self.config.job_retention())
    }

    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        let latest = self.memory.latest();
        ServiceStats {
            pool: self.pool.stats(),
            jobs: self.jobs.counts(),
            tracked_destinations: self.limiter.tracked_destinations(),
            memory_percent_used: latest.map(|sample| sample.percent_used),
            memory_gate_closed: self.memory.is_over_threshold(),
            active_sessions: self.dispatcher.active_sessions(),
        }
    }

    /// Cancel in-flight work, stop workers and background tasks, close idle pages
    pub async fn shutdown(&self) {
        info!("Shutting down dispatch service");
        self.dispatcher.shutdown();
        self.jobs.shutdown().await;
        self.memory.stop();
        self.pool.shutdown();
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher<B>> {
        &self.dispatcher
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<PagePool<B>> {
        &self.pool
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<MemoryMonitor> {
        &self.memory
    }

    #[must_use]
    pub fn jobs(&self) -> &Arc<JobQueue<B>> {
        &self.jobs
    }
}
