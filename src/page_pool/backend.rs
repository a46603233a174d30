//! Page factory and fetch collaborator seam
//!
//! The pool and dispatcher never talk to a browser directly. A backend opens
//! pages for a configuration, runs one request on a page, and closes pages the
//! pool no longer wants. Methods return boxed futures so the trait stays
//! usable behind `Arc<B>` from spawned tasks.

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::crawl_engine::crawl_types::{FetchFailure, FetchPayload};
use crate::request::{BrowserProfile, CrawlRequest, Fingerprint};

pub trait PageBackend: Send + Sync + 'static {
    /// Backend-specific page handle (a browser tab, a stub, ...)
    type Page: Send + 'static;

    /// Open a fresh page configured for `profile`
    fn open_page<'a>(
        &'a self,
        fingerprint: Fingerprint,
        profile: &'a BrowserProfile,
    ) -> BoxFuture<'a, anyhow::Result<Self::Page>>;

    /// Fetch `request` on `page`
    ///
    /// Implementations should observe `cancel` at their own suspension points;
    /// the dispatcher also drops the future on cancellation, and the page is
    /// then closed rather than reused.
    fn execute<'a>(
        &'a self,
        page: &'a mut Self::Page,
        request: &'a CrawlRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<FetchPayload, FetchFailure>>;

    /// Dispose of a page; errors are the backend's to log
    fn close_page(&self, page: Self::Page) -> BoxFuture<'_, ()>;
}
