//! Asynchronous job submission with status polling
//!
//! `submit` records a Pending job and returns its task id at once. A fixed set
//! of workers (never more than the page pool can serve) pops the highest
//! priority job, FIFO within a priority, runs it through the dispatcher and
//! writes the terminal status. Terminal jobs are kept for a retention window so
//! callers can poll them, then reaped.

pub mod types;

pub use types::{Job, JobCounts, JobStatus, TaskId};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::crawl_engine::crawl_types::{CrawlResult, DispatchError, DispatchResult};
use crate::crawl_engine::dispatcher::Dispatcher;
use crate::page_pool::PageBackend;
use crate::request::CrawlRequest;

/// Queued job awaiting a worker
struct PendingJob {
    priority: i32,
    sequence: u64,
    task_id: TaskId,
    request: CrawlRequest,
}

impl PartialEq for PendingJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for PendingJob {}

impl PartialOrd for PendingJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingJob {
    // Max-heap: higher priority first, then earlier submission
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

pub struct JobQueue<B: PageBackend> {
    dispatcher: Arc<Dispatcher<B>>,
    jobs: RwLock<HashMap<TaskId, Job>>,
    pending: Mutex<BinaryHeap<PendingJob>>,
    notify: Notify,
    next_sequence: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl<B: PageBackend> std::fmt::Debug for JobQueue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("counts", &self.counts())
            .field("workers", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}

impl<B: PageBackend> JobQueue<B> {
    /// Create a queue (does NOT start workers)
    pub fn new(dispatcher: Arc<Dispatcher<B>>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            jobs: RwLock::new(HashMap::new()),
            pending: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            next_sequence: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
            cleanup_handle: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn `min(job_workers, max_pages)` workers
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        let count = self.dispatcher.config().effective_job_workers();
        for worker_id in 0..count {
            let queue = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                worker_loop(queue, worker_id).await;
            }));
        }
        info!("Job queue started with {count} workers");
    }

    /// Record a job and return its id without waiting for any work
    pub fn submit(&self, request: CrawlRequest) -> TaskId {
        let task_id = TaskId::new();
        let priority = request.priority();
        let job = Job::pending(task_id, request.url().to_string(), priority);
        self.jobs.write().insert(task_id, job);

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().push(PendingJob {
            priority,
            sequence,
            task_id,
            request,
        });
        self.notify.notify_one();

        debug!("Submitted job {task_id} (priority {priority})");
        task_id
    }

    /// Current state of a job
    ///
    /// # Errors
    /// `JobNotFound` for unknown or already reaped ids.
    pub fn poll(&self, task_id: TaskId) -> DispatchResult<Job> {
        self.jobs
            .read()
            .get(&task_id)
            .cloned()
            .ok_or_else(|| DispatchError::JobNotFound {
                task_id: task_id.to_string(),
            })
    }

    #[must_use]
    pub fn counts(&self) -> JobCounts {
        let jobs = self.jobs.read();
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Remove terminal jobs that finished more than `retention` ago
    ///
    /// Pending and processing jobs are never removed. Returns how many were reaped.
    pub fn reap_expired(&self, retention: Duration) -> usize {
        let now = chrono::Utc::now();
        let mut jobs = self.jobs.write();
        let initial_count = jobs.len();

        jobs.retain(|task_id, job| {
            let Some(completed_at) = job.completed_at else {
                return true;
            };
            let age = now
                .signed_duration_since(completed_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let keep = age < retention;
            if !keep {
                debug!("Reaping job {task_id}: {} (age: {age:?})", job.status);
            }
            keep
        });

        let reaped = initial_count - jobs.len();
        if reaped > 0 {
            info!("Reaped {reaped} expired jobs");
        }
        reaped
    }

    /// Start background reaping every `interval` using the configured retention
    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration) {
        let mut handle = self.cleanup_handle.lock();
        if handle.is_some() {
            return;
        }
        let queue = Arc::clone(self);
        let retention = self.dispatcher.config().job_retention();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = queue.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        queue.reap_expired(retention);
                    }
                }
            }
        }));
    }

    /// Stop workers after their current job and wait for them
    ///
    /// Jobs still pending stay pending.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.cleanup_handle.lock().take() {
            handle.abort();
        }

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Job worker ended abnormally: {e}");
            }
        }
        info!("Job queue shut down");
    }

    fn next_job(&self) -> Option<PendingJob> {
        let mut pending = self.pending.lock();
        let job = pending.pop();
        if job.is_some() && !pending.is_empty() {
            self.notify.notify_one();
        }
        job
    }

    fn advance(&self, task_id: TaskId, next: JobStatus, update: impl FnOnce(&mut Job)) -> bool {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(&task_id) else {
            return false;
        };
        if !job.advance(next) {
            warn!("Refusing job {task_id} transition {} -> {next}", job.status);
            return false;
        }
        update(job);
        true
    }

    async fn process(&self, job: PendingJob) {
        if !self.advance(job.task_id, JobStatus::Processing, |_| {}) {
            return;
        }

        // Own task, so a panicking backend fails this job and not the worker
        let dispatcher = Arc::clone(&self.dispatcher);
        let request_id = job.request.id();
        let url = job.request.url().to_string();
        let request = job.request;
        let handle = tokio::spawn(async move { dispatcher.run(&request).await });
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("Job {} task failed: {e}", job.task_id);
                let result = CrawlResult::failed(
                    request_id,
                    url,
                    DispatchError::internal(format!("job task failed: {e}")),
                );
                self.dispatcher.report_completed(&result);
                result
            }
        };
        let status = if result.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        debug!("Job {} finished: {status}", job.task_id);

        self.advance(job.task_id, status, |record| {
            record.error = result.error.clone();
            record.result = Some(result);
        });
    }
}

/// Background task: drain the queue until shutdown
async fn worker_loop<B: PageBackend>(queue: Arc<JobQueue<B>>, worker_id: usize) {
    loop {
        if queue.shutdown.is_cancelled() {
            break;
        }
        let Some(job) = queue.next_job() else {
            tokio::select! {
                () = queue.shutdown.cancelled() => break,
                () = queue.notify.notified() => continue,
            }
        };
        queue.process(job).await;
    }
    debug!("Job worker {worker_id} exiting");
}
