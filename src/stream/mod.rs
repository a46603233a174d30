//! Live, cancellable result sessions
//!
//! A session runs each request as its own task under a child cancellation
//! token and pushes results as they complete. A driver task owns the tasks and
//! enforces two deadlines: the first result must arrive within
//! `stream_init_timeout`, and the whole session must finish within
//! `batch_process_timeout`. Either expiry, a caller cancel or a dropped session
//! cancels outstanding work; leases dropped by aborted tasks close their pages.

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::crawl_engine::crawl_types::{CancelReason, CrawlResult, DispatchError, DispatchResult};
use crate::crawl_engine::dispatcher::Dispatcher;
use crate::page_pool::PageBackend;
use crate::request::{CrawlRequest, RequestId};

/// Shared bookkeeping of one open session
#[derive(Debug)]
pub struct SessionState {
    id: Uuid,
    started_at: Instant,
    token: CancellationToken,
    outstanding: Mutex<HashSet<RequestId>>,
    delivered: AtomicUsize,
}

impl SessionState {
    fn new(id: Uuid, token: CancellationToken, requests: impl IntoIterator<Item = RequestId>) -> Self {
        Self {
            id,
            started_at: Instant::now(),
            token,
            outstanding: Mutex::new(requests.into_iter().collect()),
            delivered: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    fn resolve(&self, request_id: RequestId) {
        self.outstanding.lock().remove(&request_id);
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            outstanding: self.outstanding(),
            delivered: self.delivered.load(Ordering::Relaxed),
            cancelled: self.is_cancelled(),
            age_ms: u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Point-in-time view of a session for observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub outstanding: usize,
    pub delivered: usize,
    pub cancelled: bool,
    pub age_ms: u64,
}

/// Opens stream sessions on a dispatcher
pub struct StreamCoordinator<B: PageBackend> {
    dispatcher: Arc<Dispatcher<B>>,
}

impl<B: PageBackend> StreamCoordinator<B> {
    pub fn new(dispatcher: Arc<Dispatcher<B>>) -> Self {
        Self { dispatcher }
    }

    /// Start every request and return the session yielding their results
    pub fn open(self, requests: Vec<CrawlRequest>) -> StreamSession {
        let id = Uuid::new_v4();
        let token = self.dispatcher.shutdown_token().child_token();
        let state = Arc::new(SessionState::new(
            id,
            token,
            requests.iter().map(CrawlRequest::id),
        ));
        self.dispatcher.register_session(Arc::clone(&state));

        // Room for every result plus a terminal error; sends never wait
        let (tx, rx) = mpsc::channel(requests.len() + 1);
        info!(session = %id, "Opened stream session with {} requests", requests.len());
        let driver = tokio::spawn(drive(self.dispatcher, Arc::clone(&state), requests, tx));

        StreamSession {
            id,
            results: ReceiverStream::new(rx),
            state,
            driver: Some(driver),
        }
    }
}

/// Results of one session in completion order
///
/// Yields `Ok` per finished request and at most one terminal `Err` when the
/// session is cut short. Dropping the session cancels outstanding requests.
pub struct StreamSession {
    id: Uuid,
    results: ReceiverStream<DispatchResult<CrawlResult>>,
    state: Arc<SessionState>,
    driver: Option<JoinHandle<()>>,
}

impl StreamSession {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Requests that have not produced a result yet
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.outstanding()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Cancel outstanding requests; a terminal `SessionCancelled` follows
    pub fn cancel(&self) {
        self.state.token.cancel();
    }

    /// Cancel and wait until every request task has stopped
    pub async fn close(mut self) {
        self.cancel();
        let Some(driver) = self.driver.take() else {
            return;
        };
        if let Err(e) = driver.await {
            warn!(session = %self.id, "Stream driver ended abnormally: {e}");
        }
    }
}

impl Stream for StreamSession {
    type Item = DispatchResult<CrawlResult>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.results).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.results.size_hint()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.state.token.cancel();
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("state", &self.state.info())
            .finish_non_exhaustive()
    }
}

/// Driver task: owns the request tasks and the session deadlines
async fn drive<B: PageBackend>(
    dispatcher: Arc<Dispatcher<B>>,
    state: Arc<SessionState>,
    requests: Vec<CrawlRequest>,
    tx: mpsc::Sender<DispatchResult<CrawlResult>>,
) {
    let config = dispatcher.config();
    let started = tokio::time::Instant::now();
    let init_deadline = started + config.stream_init_timeout();
    let batch_deadline = started + config.batch_process_timeout();

    let mut set = JoinSet::new();
    let mut tasks = TaskIndex::with_capacity(requests.len());
    for request in requests {
        let worker = Arc::clone(&dispatcher);
        let token = state.token.child_token();
        let request_id = request.id();
        let url = request.url().to_string();
        let handle = set.spawn(async move { worker.run_cancellable(&request, &token).await });
        tasks.insert(handle.id(), (request_id, url));
    }

    let report = |result: &CrawlResult| dispatcher.report_completed(result);
    let mut delivered = 0usize;
    let terminal: Option<DispatchError> = loop {
        let awaiting_first = delivered == 0 && init_deadline < batch_deadline;
        let deadline = if awaiting_first { init_deadline } else { batch_deadline };

        tokio::select! {
            biased;
            () = state.token.cancelled() => {
                let reason = if dispatcher.shutdown_token().is_cancelled() {
                    CancelReason::Shutdown
                } else {
                    CancelReason::Caller
                };
                break Some(DispatchError::cancelled(reason));
            }
            () = tokio::time::sleep_until(deadline) => {
                if awaiting_first || delivered == 0 {
                    warn!(session = %state.id, "No result within the stream init timeout");
                    break Some(DispatchError::StreamInitTimeout {
                        waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    });
                }
                warn!(session = %state.id, "Session deadline elapsed with {} requests outstanding", state.outstanding());
                break Some(DispatchError::cancelled(CancelReason::Timeout));
            }
            joined = set.join_next_with_id() => {
                let Some(joined) = joined else { break None };
                let Some(result) = joined_result(joined, &mut tasks, &state, &report) else {
                    continue;
                };

                state.resolve(result.request_id);
                if tx.send(Ok(result)).await.is_err() {
                    debug!(session = %state.id, "Stream receiver dropped");
                    break None;
                }
                delivered += 1;
            }
        }
    };

    if let Some(mut error) = terminal {
        let forwarded = forward_finished(&mut set, &mut tasks, &state, &tx, &report).await;
        if forwarded > 0 && matches!(error, DispatchError::StreamInitTimeout { .. }) {
            error = DispatchError::cancelled(CancelReason::Timeout);
        }
        delivered += forwarded;
        debug!(session = %state.id, "Stream session ending: {error}");
        // Receiver may already be gone
        let _ = tx.try_send(Err(error));
    }

    state.token.cancel();
    set.shutdown().await;
    dispatcher.unregister_session(state.id);
    info!(session = %state.id, delivered, "Stream session closed");
}

type TaskIndex = HashMap<task::Id, (RequestId, String)>;

/// Result of a joined request task; `None` for a task the session no longer tracks
fn joined_result(
    joined: Result<(task::Id, CrawlResult), JoinError>,
    tasks: &mut TaskIndex,
    state: &SessionState,
    report: &(dyn Fn(&CrawlResult) + Sync),
) -> Option<CrawlResult> {
    match joined {
        Ok((task_id, result)) => {
            tasks.remove(&task_id);
            Some(result)
        }
        Err(e) => {
            let (request_id, url) = tasks.remove(&e.id())?;
            error!(session = %state.id, "Request task for {url} failed: {e}");
            let result = CrawlResult::failed(
                request_id,
                url,
                DispatchError::internal(format!("request task failed: {e}")),
            );
            report(&result);
            Some(result)
        }
    }
}

/// Deliver results of tasks that finished by the time the session ended
///
/// A request completing in the same instant as a cancel or a deadline still
/// reaches the caller. Results carrying only the session's own cancellation
/// are dropped; the terminal error covers them.
async fn forward_finished(
    set: &mut JoinSet<CrawlResult>,
    tasks: &mut TaskIndex,
    state: &SessionState,
    tx: &mpsc::Sender<DispatchResult<CrawlResult>>,
    report: &(dyn Fn(&CrawlResult) + Sync),
) -> usize {
    let mut forwarded = 0;
    while let Some(joined) = set.try_join_next_with_id() {
        let Some(result) = joined_result(joined, tasks, state, report) else {
            continue;
        };
        if matches!(result.error, Some(DispatchError::SessionCancelled { .. })) {
            continue;
        }
        state.resolve(result.request_id);
        if tx.send(Ok(result)).await.is_err() {
            break;
        }
        forwarded += 1;
    }
    forwarded
}
