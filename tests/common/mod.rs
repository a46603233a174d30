//! Test utilities shared by the dispatch integration tests

use futures::future::BoxFuture;
use kodegen_crawl_dispatch::config::DispatchConfigBuilder;
use kodegen_crawl_dispatch::crawl_engine::MemorySource;
use kodegen_crawl_dispatch::{
    BrowserProfile, CrawlRequest, DispatchConfig, FetchFailure, FetchPayload, Fingerprint,
    PageBackend,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Page handed out by [`StubBackend`]
#[derive(Debug)]
pub struct StubPage {
    pub id: u64,
    pub fingerprint: Fingerprint,
}

/// Scriptable page backend that records what the pool does with it
#[derive(Debug, Default)]
pub struct StubBackend {
    delays: Mutex<HashMap<String, Duration>>,
    statuses: Mutex<HashMap<String, VecDeque<u16>>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    flaky: Mutex<HashMap<String, u32>>,
    fail_opens: AtomicBool,
    next_page_id: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    open_pages: AtomicUsize,
    peak_open_pages: AtomicUsize,
    executing: AtomicUsize,
    peak_executing: AtomicUsize,
    executions: AtomicU64,
}

#[allow(dead_code)]
impl StubBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every fetch of `url` take `delay`
    pub fn delay(&self, url: &str, delay: Duration) {
        self.delays.lock().insert(key(url), delay);
    }

    /// Answer the next fetches of `url` with these statuses, then 200
    pub fn statuses(&self, url: &str, statuses: &[u16]) {
        self.statuses
            .lock()
            .insert(key(url), statuses.iter().copied().collect());
    }

    /// Fail every fetch of `url`
    pub fn fail(&self, url: &str) {
        self.failing.lock().insert(key(url));
    }

    /// Fail the next `times` fetches of `url`, then answer normally
    pub fn fail_next(&self, url: &str, times: u32) {
        self.flaky.lock().insert(key(url), times);
    }

    /// Panic inside every fetch of `url`
    pub fn panic_on(&self, url: &str) {
        self.panicking.lock().insert(key(url));
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn open_pages(&self) -> usize {
        self.open_pages.load(Ordering::SeqCst)
    }

    pub fn peak_open_pages(&self) -> usize {
        self.peak_open_pages.load(Ordering::SeqCst)
    }

    pub fn peak_executing(&self) -> usize {
        self.peak_executing.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter even when the fetch future is dropped
struct Executing<'a>(&'a AtomicUsize);

impl Drop for Executing<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PageBackend for StubBackend {
    type Page = StubPage;

    fn open_page<'a>(
        &'a self,
        fingerprint: Fingerprint,
        _profile: &'a BrowserProfile,
    ) -> BoxFuture<'a, anyhow::Result<Self::Page>> {
        Box::pin(async move {
            if self.fail_opens.load(Ordering::SeqCst) {
                anyhow::bail!("browser crashed");
            }
            tokio::task::yield_now().await;
            let open = self.open_pages.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_open_pages.fetch_max(open, Ordering::SeqCst);
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(StubPage {
                id: self.next_page_id.fetch_add(1, Ordering::SeqCst),
                fingerprint,
            })
        })
    }

    fn execute<'a>(
        &'a self,
        _page: &'a mut Self::Page,
        request: &'a CrawlRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<FetchPayload, FetchFailure>> {
        Box::pin(async move {
            let url = request.url().to_string();
            self.executions.fetch_add(1, Ordering::SeqCst);
            let running = self.executing.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_executing.fetch_max(running, Ordering::SeqCst);
            let _guard = Executing(&self.executing);

            let delay = self.delays.lock().get(&url).copied().unwrap_or_default();
            tokio::select! {
                () = cancel.cancelled() => return Err(FetchFailure::new("cancelled")),
                () = tokio::time::sleep(delay) => {}
            }

            let panics = self.panicking.lock().contains(&url);
            if panics {
                panic!("scripted panic for {url}");
            }
            let flaky = self.flaky.lock().get_mut(&url).is_some_and(|left| {
                let fail = *left > 0;
                *left = left.saturating_sub(1);
                fail
            });
            if flaky || self.failing.lock().contains(&url) {
                return Err(FetchFailure::new(format!("scripted failure for {url}")));
            }
            let status = self
                .statuses
                .lock()
                .get_mut(&url)
                .and_then(VecDeque::pop_front)
                .unwrap_or(200);

            Ok(FetchPayload {
                status_code: Some(status),
                final_url: Some(url.clone()),
                content: format!("<html><body>{url}</body></html>"),
            })
        })
    }

    fn close_page(&self, _page: Self::Page) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.open_pages.fetch_sub(1, Ordering::SeqCst);
            self.closed.fetch_add(1, Ordering::SeqCst);
        })
    }
}

/// Memory source whose reading the test sets directly
#[derive(Debug, Clone, Default)]
pub struct ScriptedMemory {
    bits: Arc<AtomicU64>,
}

#[allow(dead_code)]
impl ScriptedMemory {
    pub fn new(percent: f64) -> Self {
        let memory = Self::default();
        memory.set(percent);
        memory
    }

    pub fn set(&self, percent: f64) {
        self.bits.store(percent.to_bits(), Ordering::SeqCst);
    }
}

impl MemorySource for ScriptedMemory {
    fn sample_percent(&self) -> anyhow::Result<f64> {
        Ok(f64::from_bits(self.bits.load(Ordering::SeqCst)))
    }
}

/// Builder with pacing disabled so tests run at stub speed
#[allow(dead_code)]
pub fn fast_config() -> DispatchConfigBuilder {
    DispatchConfig::builder()
        .base_delay_secs(0.0, 0.0)
        .jitter_secs(0.0)
        .max_delay_secs(1.0)
        .memory_sample_interval_ms(50)
        .memory_polling(50, 100)
}

#[allow(dead_code)]
pub fn request(url: &str) -> CrawlRequest {
    CrawlRequest::for_url(url).expect("test URL should be valid")
}

/// Normalized form of `url`, as the backend sees it
pub fn key(url: &str) -> String {
    Url::parse(url).expect("test URL should be valid").to_string()
}
