//! Admission and execution of crawl requests
//!
//! Every request passes three gates in a fixed order before it touches a page:
//! the memory gate, the destination's rate slot, then an execution slot and a
//! pooled page. Memory is checked again once the page is held; if the gate
//! closed in the meantime the page goes back and the request waits at the
//! memory gate again. The fetch runs under `fetch_timeout` and the caller's
//! cancellation token. The page goes back to the pool on every path (reusable
//! only after a clean fetch) and the outcome is fed to the rate limiter.
//!
//! Two retry loops sit on top. Rate-limited responses re-enter the full
//! admission path while the limiter allows it. Other retryable failures are
//! retried up to `retry.max_retries` times, as the `RetryStrategy` decides.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::crawl_types::{
    AdmissionGate, CancelReason, CrawlResult, DispatchError, FetchFailure, FetchPayload,
    RequestOutcome,
};
use super::memory_monitor::MemoryMonitor;
use super::page_timeout::with_page_timeout;
use super::progress::{NoOpProgress, ProgressReporter};
use super::rate_limiter::RateLimiter;
use super::retry::{FixedDelayRetry, RetryStrategy};
use crate::config::DispatchConfig;
use crate::page_pool::{PageBackend, PagePool};
use crate::request::CrawlRequest;
use crate::stream::{SessionInfo, SessionState, StreamCoordinator, StreamSession};

/// Why one attempt did not produce a payload
#[derive(Debug)]
enum AttemptError {
    /// Rate limited and the limiter allows another try
    Throttled(DispatchError),
    /// Failed in a way a failure retry may cure
    Failed(DispatchError),
    Final(DispatchError),
}

impl From<DispatchError> for AttemptError {
    fn from(error: DispatchError) -> Self {
        if error.is_retryable() {
            Self::Failed(error)
        } else {
            Self::Final(error)
        }
    }
}

pub struct Dispatcher<B: PageBackend> {
    config: DispatchConfig,
    pool: Arc<PagePool<B>>,
    limiter: Arc<RateLimiter>,
    memory: Arc<MemoryMonitor>,
    /// In-flight executions; sized to the pool so neither caps the other
    slots: Semaphore,
    shutdown: CancellationToken,
    sessions: DashMap<Uuid, Arc<SessionState>>,
    retry: RwLock<Arc<dyn RetryStrategy>>,
    progress: RwLock<Arc<dyn ProgressReporter>>,
}

impl<B: PageBackend> std::fmt::Debug for Dispatcher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool", &self.pool)
            .field("limiter", &self.limiter)
            .field("memory", &self.memory)
            .field("available_slots", &self.slots.available_permits())
            .field("sessions", &self.sessions.len())
            .field("retry_budget", &self.config.retry().max_retries())
            .finish_non_exhaustive()
    }
}

impl<B: PageBackend> Dispatcher<B> {
    pub fn new(
        config: DispatchConfig,
        pool: Arc<PagePool<B>>,
        limiter: Arc<RateLimiter>,
        memory: Arc<MemoryMonitor>,
    ) -> Arc<Self> {
        let slots = Semaphore::new(config.max_pages());
        let retry = FixedDelayRetry::new(config.retry().retry_delay());
        Arc::new(Self {
            config,
            pool,
            limiter,
            memory,
            slots,
            shutdown: CancellationToken::new(),
            sessions: DashMap::new(),
            retry: RwLock::new(Arc::new(retry)),
            progress: RwLock::new(Arc::new(NoOpProgress)),
        })
    }

    /// Replace the fixed-delay policy deciding which failures are retried
    pub fn set_retry_strategy(&self, strategy: Arc<dyn RetryStrategy>) {
        *self.retry.write() = strategy;
    }

    pub fn set_progress_reporter(&self, reporter: Arc<dyn ProgressReporter>) {
        *self.progress.write() = reporter;
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
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

    /// Token cancelled when the dispatcher shuts down; stream sessions derive from it
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run one request to completion
    pub async fn run(&self, request: &CrawlRequest) -> CrawlResult {
        self.run_cancellable(request, &self.shutdown.child_token())
            .await
    }

    /// Run one request, giving up as soon as `token` is cancelled
    pub async fn run_cancellable(
        &self,
        request: &CrawlRequest,
        token: &CancellationToken,
    ) -> CrawlResult {
        let started = Instant::now();
        let throttled_attempts = self.config.rate_limit().max_retries().saturating_add(1);
        let mut attempts = 0u32;
        let mut throttled = 0u32;
        let mut failures = 0u32;
        let mut reported = false;

        let outcome = loop {
            attempts += 1;
            let budget_left = throttled + 1 < throttled_attempts;
            let error = match self.attempt(request, token, budget_left, &mut reported).await {
                Ok(payload) => break Ok(payload),
                Err(AttemptError::Throttled(error)) => {
                    throttled += 1;
                    debug!(
                        url = %request.url(),
                        attempt = attempts,
                        "Retrying after {error}"
                    );
                    continue;
                }
                Err(AttemptError::Final(error)) => break Err(error),
                Err(AttemptError::Failed(error)) => error,
            };

            failures += 1;
            let Some(delay) = self.failure_retry_delay(request, failures, &error) else {
                break Err(error);
            };
            warn!(
                url = %request.url(),
                attempt = attempts,
                "Attempt failed: {error}; retrying in {delay:?}"
            );
            tokio::select! {
                biased;
                reason = self.cancelled(token) => break Err(DispatchError::cancelled(reason)),
                () = tokio::time::sleep(delay) => {}
            }
        };

        let result = CrawlResult::from_outcome(request, outcome, attempts, started.elapsed());
        debug!(
            url = %result.url,
            success = result.success,
            attempts = result.attempts,
            elapsed_ms = result.elapsed_ms,
            "Request finished"
        );
        self.report_completed(&result);
        result
    }

    /// Completion report for results built outside `run_cancellable`
    pub(crate) fn report_completed(&self, result: &CrawlResult) {
        let reporter = self.progress.read().clone();
        reporter.report_completed(result);
    }

    /// Run every request concurrently; results come back in input order
    pub async fn run_batch(self: &Arc<Self>, requests: Vec<CrawlRequest>) -> Vec<CrawlResult> {
        info!("Dispatching batch of {} requests", requests.len());

        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let dispatcher = Arc::clone(self);
                let request_id = request.id();
                let url = request.url().to_string();
                let handle = tokio::spawn(async move { dispatcher.run(&request).await });
                (request_id, url, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (request_id, url, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Request task for {url} failed: {e}");
                    let result = CrawlResult::failed(
                        request_id,
                        url,
                        DispatchError::internal(format!("request task failed: {e}")),
                    );
                    self.report_completed(&result);
                    result
                }
            };
            results.push(result);
        }
        results
    }

    /// Open a live session yielding results in completion order
    pub fn run_stream(self: &Arc<Self>, requests: Vec<CrawlRequest>) -> StreamSession {
        StreamCoordinator::new(Arc::clone(self)).open(requests)
    }

    /// Snapshot of the stream sessions currently open
    #[must_use]
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|entry| entry.value().info()).collect()
    }

    pub(crate) fn register_session(&self, session: Arc<SessionState>) {
        self.sessions.insert(session.id(), session);
    }

    pub(crate) fn unregister_session(&self, id: Uuid) {
        self.sessions.remove(&id);
    }

    /// Stop admitting work and cancel every session and in-flight request
    pub fn shutdown(&self) {
        info!("Shutting down dispatcher");
        self.shutdown.cancel();
        self.slots.close();
    }

    /// One pass through the gates and one fetch
    async fn attempt(
        &self,
        request: &CrawlRequest,
        token: &CancellationToken,
        throttle_budget_left: bool,
        reported: &mut bool,
    ) -> Result<FetchPayload, AttemptError> {
        if self.pool.is_unavailable() {
            return Err(DispatchError::unavailable("page pool is not admitting work").into());
        }
        let destination = request.destination();

        // Gate 1: memory
        self.memory_gate(token).await?;

        // Gate 2: destination pacing
        tokio::select! {
            biased;
            reason = self.cancelled(token) => return Err(DispatchError::cancelled(reason).into()),
            admitted = self.limiter.wait_turn(destination, self.config.rate_wait_timeout()) => admitted?,
        }

        // Gate 3: execution slot, then a page, under one deadline
        let (_permit, mut lease) = loop {
            let deadline = tokio::time::Instant::now() + self.config.pool_acquire_timeout();
            let permit = tokio::select! {
                biased;
                reason = self.cancelled(token) => return Err(DispatchError::cancelled(reason).into()),
                permit = tokio::time::timeout_at(deadline, self.slots.acquire()) => match permit {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_closed)) => {
                        return Err(DispatchError::unavailable("dispatcher is shut down").into());
                    }
                    Err(_elapsed) => {
                        return Err(DispatchError::admission_timeout(AdmissionGate::Pool).into());
                    }
                },
            };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let lease = tokio::select! {
                biased;
                reason = self.cancelled(token) => return Err(DispatchError::cancelled(reason).into()),
                lease = self.pool.acquire(request, remaining) => lease?,
            };

            // Memory may have crossed the threshold while this request waited
            if !self.memory.is_over_threshold() {
                break (permit, lease);
            }
            debug!(url = %request.url(), "Memory gate closed before execution; holding request");
            lease.release(true);
            drop(permit);
            self.memory_gate(token).await?;
        };

        if !*reported {
            *reported = true;
            let reporter = self.progress.read().clone();
            reporter.report_started(request);
        }
        debug!(
            url = %request.url(),
            page = lease.id(),
            reused = lease.is_reused(),
            "Executing request"
        );

        let backend = self.pool.backend();
        let fetched: Result<Result<FetchPayload, FetchFailure>, CancelReason> = {
            let page = lease.page_mut();
            tokio::select! {
                biased;
                reason = self.cancelled(token) => Err(reason),
                result = with_page_timeout(
                    backend.execute(page, request, token.clone()),
                    self.config.fetch_timeout(),
                    "fetch",
                ) => Ok(result),
            }
        };

        let codes = self.config.rate_limit().rate_limit_codes();
        match fetched {
            Err(reason) => {
                // Page state is unknown after an interrupted fetch
                lease.release(false);
                Err(DispatchError::cancelled(reason).into())
            }
            Ok(Ok(payload)) => {
                lease.release(true);
                let outcome = RequestOutcome::classify(payload.status_code, true, codes);
                let retry_allowed = self.limiter.on_result(destination, outcome);
                if outcome != RequestOutcome::RateLimited {
                    return Ok(payload);
                }
                let error = DispatchError::FetchFailure {
                    reason: format!("Rate limit retry count exceeded for {destination}"),
                    status_code: payload.status_code,
                };
                Err(self.throttled_or_final(error, retry_allowed && throttle_budget_left))
            }
            Ok(Err(failure)) => {
                lease.release(false);
                let outcome = RequestOutcome::classify(failure.status_code, false, codes);
                let retry_allowed = self.limiter.on_result(destination, outcome);
                if outcome.is_throttling() {
                    warn!(url = %request.url(), "{failure}");
                } else {
                    debug!(url = %request.url(), "Fetch failed: {failure}");
                }
                let error = DispatchError::from(failure);
                if outcome == RequestOutcome::RateLimited {
                    Err(self.throttled_or_final(error, retry_allowed && throttle_budget_left))
                } else {
                    Err(error.into())
                }
            }
        }
    }

    /// Wait at the memory gate, or give up on cancellation
    async fn memory_gate(&self, token: &CancellationToken) -> Result<(), AttemptError> {
        tokio::select! {
            biased;
            reason = self.cancelled(token) => Err(DispatchError::cancelled(reason).into()),
            admitted = self.memory.wait_for_admission(
                self.config.memory_poll_interval(),
                self.config.memory_max_polls(),
                token,
            ) => Ok(admitted?),
        }
    }

    fn throttled_or_final(&self, error: DispatchError, retry: bool) -> AttemptError {
        if retry && !self.shutdown.is_cancelled() {
            AttemptError::Throttled(error)
        } else {
            AttemptError::Final(error)
        }
    }

    /// Pause before the next failure retry, or `None` once the budget is spent
    fn failure_retry_delay(
        &self,
        request: &CrawlRequest,
        failures: u32,
        error: &DispatchError,
    ) -> Option<Duration> {
        if failures > self.config.retry().max_retries()
            || !error.is_retryable()
            || self.shutdown.is_cancelled()
        {
            return None;
        }
        let strategy = self.retry.read().clone();
        strategy.retry_after(request.url().as_str(), failures, error)
    }

    /// Resolves when either the caller's token or the dispatcher shuts down
    async fn cancelled(&self, token: &CancellationToken) -> CancelReason {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => CancelReason::Shutdown,
            () = token.cancelled() => CancelReason::Caller,
        }
    }
}
