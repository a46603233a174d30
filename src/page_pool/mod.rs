//! Bounded pool of reusable browser pages keyed by configuration fingerprint
//!
//! The pool never holds more than `max_pages` live (non-closed) handles. A
//! request first reuses an idle handle of its own fingerprint, then opens a new
//! page while capacity remains, then evicts an idle handle of another
//! fingerprint, and only then queues. Queued requests are served strictly FIFO
//! across fingerprints: a released handle goes to the head waiter directly,
//! either as the handle itself (same fingerprint) or as the capacity it frees
//! (different fingerprint).
//!
//! Invariant: while any waiter is queued the idle set is empty. Handles only
//! become idle when nobody is waiting, and a waiter only queues when no idle
//! handle could have served it.

pub mod backend;

pub use backend::PageBackend;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::crawl_engine::crawl_types::{AdmissionGate, DispatchError, DispatchResult};
use crate::request::{CrawlRequest, Fingerprint};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the page pool
#[derive(Debug, Clone)]
pub struct PagePoolConfig {
    /// Maximum live pages (default: 10)
    pub max_pages: usize,
    /// Close idle pages older than this (default: 5 minutes)
    pub idle_ttl: Duration,
    /// Interval between idle sweeps (default: 30s)
    pub sweep_interval: Duration,
    /// Consecutive open failures before the pool refuses work (default: 5)
    pub max_consecutive_open_failures: u32,
}

impl From<&DispatchConfig> for PagePoolConfig {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_pages: config.max_pages(),
            idle_ttl: config.idle_ttl(),
            sweep_interval: config.sweep_interval(),
            max_consecutive_open_failures: config.max_consecutive_open_failures(),
        }
    }
}

impl Default for PagePoolConfig {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

// =============================================================================
// Page Handle
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Idle,
    Active,
    Closed,
}

/// A page with pool metadata
pub struct PageHandle<P> {
    id: u64,
    fingerprint: Fingerprint,
    state: HandleState,
    created_at: Instant,
    last_released_at: Instant,
    uses: u64,
    page: P,
}

impl<P> PageHandle<P> {
    fn new(id: u64, fingerprint: Fingerprint, page: P) -> Self {
        let now = Instant::now();
        Self {
            id,
            fingerprint,
            state: HandleState::Active,
            created_at: now,
            last_released_at: now,
            uses: 0,
            page,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    #[must_use]
    pub fn state(&self) -> HandleState {
        self.state
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn last_released_at(&self) -> Instant {
        self.last_released_at
    }

    /// Executions this page has served, including the current one
    #[must_use]
    pub fn uses(&self) -> u64 {
        self.uses
    }
}

impl<P> std::fmt::Debug for PageHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .field("state", &self.state)
            .field("uses", &self.uses)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Pool State
// =============================================================================

/// What a queued acquirer receives
enum Grant<P> {
    /// An idle-quality handle of the waiter's own fingerprint
    Reuse(PageHandle<P>),
    /// One unit of capacity; the waiter opens its own page
    Open,
}

struct Waiter<P> {
    id: u64,
    fingerprint: Fingerprint,
    grant: oneshot::Sender<Grant<P>>,
}

struct PoolInner<P> {
    /// Idle handles per fingerprint, oldest release at the front
    idle: HashMap<Fingerprint, VecDeque<PageHandle<P>>>,
    /// Non-closed handles plus capacity reserved for pages being opened
    live: usize,
    waiters: VecDeque<Waiter<P>>,
    next_waiter_id: u64,
}

impl<P> PoolInner<P> {
    fn idle_count(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }

    fn take_idle(&mut self, fingerprint: Fingerprint) -> Option<PageHandle<P>> {
        let queue = self.idle.get_mut(&fingerprint)?;
        // Most recently released first: warmest page
        let handle = queue.pop_back();
        if queue.is_empty() {
            self.idle.remove(&fingerprint);
        }
        handle
    }

    /// Oldest idle handle of any fingerprint
    fn take_oldest_idle(&mut self) -> Option<PageHandle<P>> {
        let fingerprint = self
            .idle
            .iter()
            .filter_map(|(fp, queue)| queue.front().map(|h| (*fp, h.last_released_at)))
            .min_by_key(|(_, released)| *released)
            .map(|(fp, _)| fp)?;
        let queue = self.idle.get_mut(&fingerprint)?;
        let handle = queue.pop_front();
        if queue.is_empty() {
            self.idle.remove(&fingerprint);
        }
        handle
    }

    fn push_idle(&mut self, handle: PageHandle<P>) {
        self.idle.entry(handle.fingerprint).or_default().push_back(handle);
    }

    /// Give one unit of capacity to the head waiter, or return it to the pool
    fn release_capacity(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.grant.send(Grant::Open).is_ok() {
                return;
            }
        }
        self.live = self.live.saturating_sub(1);
    }

    fn remove_waiter(&mut self, waiter_id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == waiter_id) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_pages: usize,
    pub live: usize,
    pub idle: usize,
    pub active: usize,
    pub waiting: usize,
    pub peak_active: usize,
    pub created_total: u64,
    pub reused_total: u64,
    pub closed_total: u64,
    pub unavailable: bool,
}

// =============================================================================
// Page Pool
// =============================================================================

enum AcquireStep<P> {
    Reuse(PageHandle<P>),
    Open,
    Evict(PageHandle<P>),
    Wait(u64, oneshot::Receiver<Grant<P>>),
}

/// Bounded page pool over a [`PageBackend`]
pub struct PagePool<B: PageBackend> {
    config: PagePoolConfig,
    backend: Arc<B>,
    inner: Mutex<PoolInner<B::Page>>,
    /// Count of handles currently leased
    active: AtomicUsize,
    peak_active: AtomicUsize,
    /// Counter for unique page IDs
    next_id: AtomicU64,
    created_total: AtomicU64,
    reused_total: AtomicU64,
    closed_total: AtomicU64,
    open_failures: AtomicU32,
    unavailable: AtomicBool,
    shutdown: AtomicBool,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<B: PageBackend> std::fmt::Debug for PagePool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<B: PageBackend> PagePool<B> {
    /// Create a new page pool (does NOT start the sweeper)
    pub fn new(config: PagePoolConfig, backend: Arc<B>) -> Arc<Self> {
        Arc::new(Self {
            config,
            backend,
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                live: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            created_total: AtomicU64::new(0),
            reused_total: AtomicU64::new(0),
            closed_total: AtomicU64::new(0),
            open_failures: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            sweeper_handle: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PagePoolConfig {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Start the idle sweeper
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.sweeper_handle.lock();
        if handle.is_some() {
            return;
        }
        let pool = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        *handle = Some(tokio::spawn(async move {
            sweeper_loop(pool, interval).await;
        }));
        info!(
            "Page pool started (max_pages={}, idle_ttl={:?})",
            self.config.max_pages, self.config.idle_ttl
        );
    }

    /// Acquire a page configured for `request`
    ///
    /// Returns a lease that releases the page as non-reusable if dropped
    /// without an explicit [`PageLease::release`].
    ///
    /// # Errors
    /// - `AdmissionTimeout(pool)` if no page became available within `timeout`
    /// - `PageOpen` if the backend failed to open a page
    /// - `Unavailable` once the pool is shut down or has hit the open-failure limit
    pub async fn acquire(
        self: &Arc<Self>,
        request: &CrawlRequest,
        timeout: Duration,
    ) -> DispatchResult<PageLease<B>> {
        let fingerprint = request.fingerprint();

        let step = {
            let mut inner = self.inner.lock();
            self.ensure_available()?;

            if let Some(handle) = inner.take_idle(fingerprint) {
                AcquireStep::Reuse(handle)
            } else if inner.waiters.is_empty() && inner.live < self.config.max_pages {
                inner.live += 1;
                AcquireStep::Open
            } else if let Some(victim) = inner
                .waiters
                .is_empty()
                .then(|| inner.take_oldest_idle())
                .flatten()
            {
                AcquireStep::Evict(victim)
            } else {
                let (tx, rx) = oneshot::channel();
                let waiter_id = inner.next_waiter_id;
                inner.next_waiter_id += 1;
                inner.waiters.push_back(Waiter {
                    id: waiter_id,
                    fingerprint,
                    grant: tx,
                });
                AcquireStep::Wait(waiter_id, rx)
            }
        };

        match step {
            AcquireStep::Reuse(handle) => Ok(self.lease(handle, true)),
            AcquireStep::Open => self.open_reserved(request).await,
            AcquireStep::Evict(victim) => {
                debug!(
                    "Evicting idle page {} ({}) to open {}",
                    victim.id, victim.fingerprint, fingerprint
                );
                // Capacity moves from the victim to the new page
                self.close_handle(victim);
                self.open_reserved(request).await
            }
            AcquireStep::Wait(waiter_id, rx) => {
                self.wait_for_grant(waiter_id, rx, request, timeout).await
            }
        }
    }

    /// Close idle handles older than `idle_ttl`; returns how many were closed
    pub fn sweep_idle(&self) -> usize {
        let ttl = self.config.idle_ttl;
        let now = Instant::now();

        let expired: Vec<PageHandle<B::Page>> = {
            let mut inner = self.inner.lock();
            let mut expired = Vec::new();
            inner.idle.retain(|_, queue| {
                while queue
                    .front()
                    .is_some_and(|h| now.duration_since(h.last_released_at) > ttl)
                {
                    if let Some(handle) = queue.pop_front() {
                        expired.push(handle);
                    }
                }
                !queue.is_empty()
            });
            for _ in &expired {
                inner.release_capacity();
            }
            expired
        };

        let closed = expired.len();
        for handle in expired {
            debug!(
                "Closing idle page {} (idle {:?})",
                handle.id,
                now.duration_since(handle.last_released_at)
            );
            self.close_handle(handle);
        }
        closed
    }

    /// Stop the sweeper, close idle pages and fail queued waiters
    ///
    /// Leases still in flight drain normally and are closed on release.
    pub fn shutdown(&self) {
        info!("Shutting down page pool");
        self.shutdown.store(true, Ordering::Release);

        if let Some(handle) = self.sweeper_handle.lock().take() {
            handle.abort();
        }

        let idle: Vec<PageHandle<B::Page>> = {
            let mut inner = self.inner.lock();
            // Dropping the senders wakes every waiter with a closed channel
            inner.waiters.clear();
            let idle: Vec<_> = inner.idle.drain().flat_map(|(_, queue)| queue).collect();
            inner.live = inner.live.saturating_sub(idle.len());
            idle
        };

        for handle in idle {
            self.close_handle(handle);
        }
        info!("Page pool shutdown complete");
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (live, idle, waiting) = {
            let inner = self.inner.lock();
            (inner.live, inner.idle_count(), inner.waiters.len())
        };
        PoolStats {
            max_pages: self.config.max_pages,
            live,
            idle,
            active: self.active.load(Ordering::Acquire),
            waiting,
            peak_active: self.peak_active.load(Ordering::Acquire),
            created_total: self.created_total.load(Ordering::Relaxed),
            reused_total: self.reused_total.load(Ordering::Relaxed),
            closed_total: self.closed_total.load(Ordering::Relaxed),
            unavailable: self.is_unavailable(),
        }
    }

    /// Whether new admissions are refused
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Acquire) || self.shutdown.load(Ordering::Acquire)
    }

    fn ensure_available(&self) -> DispatchResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(DispatchError::unavailable("page pool is shut down"));
        }
        if self.unavailable.load(Ordering::Acquire) {
            return Err(DispatchError::unavailable(format!(
                "page pool disabled after {} consecutive page-open failures",
                self.config.max_consecutive_open_failures
            )));
        }
        Ok(())
    }

    /// Open a page into capacity already reserved by the caller
    async fn open_reserved(self: &Arc<Self>, request: &CrawlRequest) -> DispatchResult<PageLease<B>> {
        let reservation = CapacityReservation {
            pool: self.as_ref(),
            armed: true,
        };
        let fingerprint = request.fingerprint();

        match self.backend.open_page(fingerprint, request.profile()).await {
            Ok(page) => {
                reservation.disarm();
                self.open_failures.store(0, Ordering::Release);
                self.created_total.fetch_add(1, Ordering::Relaxed);
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                debug!("Opened page {id} for {fingerprint}");
                Ok(self.lease(PageHandle::new(id, fingerprint, page), false))
            }
            Err(e) => {
                drop(reservation);
                let failures = self.open_failures.fetch_add(1, Ordering::AcqRel) + 1;
                warn!("Failed to open page for {fingerprint} ({failures} in a row): {e:#}");
                if failures >= self.config.max_consecutive_open_failures {
                    self.mark_unavailable(failures);
                }
                Err(DispatchError::PageOpen {
                    message: format!("{e:#}"),
                })
            }
        }
    }

    fn mark_unavailable(&self, failures: u32) {
        if self.unavailable.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(
            "Page pool unavailable after {failures} consecutive page-open failures; \
             refusing new admissions"
        );
        self.inner.lock().waiters.clear();
    }

    async fn wait_for_grant(
        self: &Arc<Self>,
        waiter_id: u64,
        rx: oneshot::Receiver<Grant<B::Page>>,
        request: &CrawlRequest,
        timeout: Duration,
    ) -> DispatchResult<PageLease<B>> {
        let mut pending = PendingGrant {
            pool: self.as_ref(),
            waiter_id,
            rx,
            settled: false,
        };
        debug!(
            "Page pool at capacity ({}), queued waiter {waiter_id}",
            self.config.max_pages
        );

        let grant = match tokio::time::timeout(timeout, &mut pending.rx).await {
            Ok(Ok(grant)) => {
                pending.settled = true;
                grant
            }
            Ok(Err(_closed)) => {
                pending.settled = true;
                self.ensure_available()?;
                return Err(DispatchError::unavailable("page pool stopped serving waiters"));
            }
            Err(_elapsed) => match pending.settle() {
                Some(grant) => grant,
                None => {
                    debug!("Waiter {waiter_id} timed out after {timeout:?}");
                    return Err(DispatchError::admission_timeout(AdmissionGate::Pool));
                }
            },
        };

        match grant {
            Grant::Reuse(handle) => Ok(self.lease(handle, true)),
            Grant::Open => self.open_reserved(request).await,
        }
    }

    fn lease(self: &Arc<Self>, mut handle: PageHandle<B::Page>, reused: bool) -> PageLease<B> {
        handle.state = HandleState::Active;
        handle.uses += 1;
        if reused {
            self.reused_total.fetch_add(1, Ordering::Relaxed);
        }
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_active.fetch_max(active, Ordering::AcqRel);
        PageLease {
            handle: Some(handle),
            pool: Arc::clone(self),
            reused,
        }
    }

    /// Return a leased handle
    fn release_handle(&self, handle: PageHandle<B::Page>, reusable: bool) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.recycle(handle, reusable);
    }

    /// Route a handle that is no longer leased
    fn recycle(&self, mut handle: PageHandle<B::Page>, reusable: bool) {
        if !reusable || self.is_unavailable() {
            self.close_handle(handle);
            self.inner.lock().release_capacity();
            return;
        }

        handle.state = HandleState::Idle;
        handle.last_released_at = Instant::now();

        let mut inner = self.inner.lock();
        loop {
            let Some(waiter) = inner.waiters.pop_front() else {
                debug!("Page {} idle", handle.id);
                inner.push_idle(handle);
                return;
            };

            if waiter.fingerprint == handle.fingerprint {
                match waiter.grant.send(Grant::Reuse(handle)) {
                    Err(Grant::Reuse(returned)) => handle = returned,
                    _ => return,
                }
            } else if waiter.grant.send(Grant::Open).is_ok() {
                drop(inner);
                // The head waiter wants another configuration; it inherits the capacity
                self.close_handle(handle);
                return;
            }
        }
    }

    fn close_handle(&self, mut handle: PageHandle<B::Page>) {
        handle.state = HandleState::Closed;
        self.closed_total.fetch_add(1, Ordering::Relaxed);

        let id = handle.id;
        let page = handle.page;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let backend = Arc::clone(&self.backend);
                runtime.spawn(async move {
                    backend.close_page(page).await;
                    debug!("Closed page {id}");
                });
            }
            Err(_) => {
                warn!("No runtime to close page {id}; dropping it");
                drop(page);
            }
        }
    }
}

impl<B: PageBackend> Drop for PagePool<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper_handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Capacity taken for a page that is still being opened
///
/// Dropped while armed (open failed or the acquiring future was cancelled), it
/// hands the capacity on.
struct CapacityReservation<'a, B: PageBackend> {
    pool: &'a PagePool<B>,
    armed: bool,
}

impl<B: PageBackend> CapacityReservation<'_, B> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<B: PageBackend> Drop for CapacityReservation<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.inner.lock().release_capacity();
        }
    }
}

/// A queued acquire; removes itself from the queue if abandoned
struct PendingGrant<'a, B: PageBackend> {
    pool: &'a PagePool<B>,
    waiter_id: u64,
    rx: oneshot::Receiver<Grant<B::Page>>,
    settled: bool,
}

impl<B: PageBackend> PendingGrant<'_, B> {
    /// Leave the queue, or collect a grant that was sent before we could
    ///
    /// Grants are sent under the pool lock, so a waiter missing from the queue
    /// has its grant (if any) already in the channel.
    fn settle(&mut self) -> Option<Grant<B::Page>> {
        self.settled = true;
        if self.pool.inner.lock().remove_waiter(self.waiter_id) {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

impl<B: PageBackend> Drop for PendingGrant<'_, B> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        match self.settle() {
            Some(Grant::Reuse(handle)) => self.pool.recycle(handle, true),
            Some(Grant::Open) => self.pool.inner.lock().release_capacity(),
            None => {}
        }
    }
}

// =============================================================================
// RAII Lease
// =============================================================================

/// Exclusive use of one page; releases it as non-reusable on drop
pub struct PageLease<B: PageBackend> {
    handle: Option<PageHandle<B::Page>>,
    pool: Arc<PagePool<B>>,
    reused: bool,
}

impl<B: PageBackend> PageLease<B> {
    fn handle(&self) -> &PageHandle<B::Page> {
        self.handle.as_ref().expect("page handle should be present")
    }

    /// Get the page's unique pool ID
    #[must_use]
    pub fn id(&self) -> u64 {
        self.handle().id
    }

    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.handle().fingerprint
    }

    #[must_use]
    pub fn uses(&self) -> u64 {
        self.handle().uses
    }

    /// Whether this lease reused a previously opened page
    #[must_use]
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn page_mut(&mut self) -> &mut B::Page {
        &mut self.handle.as_mut().expect("page handle should be present").page
    }

    /// Return the page to the pool
    ///
    /// Reusable pages go to the head waiter or the idle set; others are closed.
    pub fn release(mut self, reusable: bool) {
        if let Some(handle) = self.handle.take() {
            self.pool.release_handle(handle, reusable);
        }
    }
}

impl<B: PageBackend> Drop for PageLease<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Lease on page {} dropped without release; closing", handle.id);
            self.pool.release_handle(handle, false);
        }
    }
}

impl<B: PageBackend> std::fmt::Debug for PageLease<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageLease")
            .field("handle", &self.handle)
            .field("reused", &self.reused)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

/// Background task: close expired idle pages every `sweep_interval`
async fn sweeper_loop<B: PageBackend>(pool: Weak<PagePool<B>>, sweep_interval: Duration) {
    let mut interval = tokio::time::interval(sweep_interval);
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(pool) = pool.upgrade() else { break };
        if pool.shutdown.load(Ordering::Acquire) {
            break;
        }
        let closed = pool.sweep_idle();
        if closed > 0 {
            debug!("Idle sweep closed {closed} pages");
        }
    }

    debug!("Sweeper loop exiting");
}
