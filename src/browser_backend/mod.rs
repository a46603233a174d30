//! Chromium page backend
//!
//! One browser process per launch key (headless mode and proxy); every page
//! is a tab on the matching browser, configured with the profile's user agent,
//! viewport, script policy and extra headers when it is opened.

pub mod setup;

pub use setup::{LaunchOptions, download_managed_browser, find_browser_executable, launch_browser};

use anyhow::Context;
use chromiumoxide::browser::Browser;
use chromiumoxide::{Page, cdp};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrowserLaunchConfig;
use crate::crawl_engine::crawl_types::{FetchFailure, FetchPayload};
use crate::page_pool::PageBackend;
use crate::request::{BrowserProfile, CrawlRequest, Fingerprint};
use crate::utils::constants::CHROME_USER_AGENT;

/// A launched browser with its CDP handler task
///
/// Dropping it aborts the handler and removes the user data directory.
#[derive(Debug)]
struct ManagedBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
    user_data_dir: Option<PathBuf>,
}

impl ManagedBrowser {
    fn cleanup_temp_dir(&mut self) {
        if let Some(path) = self.user_data_dir.take() {
            debug!("Cleaning up browser temp directory: {}", path.display());
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!("Failed to clean up temp directory {}: {e}", path.display());
            }
        }
    }
}

impl Drop for ManagedBrowser {
    fn drop(&mut self) {
        self.handler.abort();
        self.cleanup_temp_dir();
    }
}

/// A browser tab; keeps its browser alive while the pool holds it
pub struct ChromiumPage {
    page: Page,
    _browser: Arc<ManagedBrowser>,
}

impl std::fmt::Debug for ChromiumPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromiumPage").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ChromiumBackend {
    launch: BrowserLaunchConfig,
    browsers: Mutex<HashMap<String, Arc<ManagedBrowser>>>,
}

impl ChromiumBackend {
    #[must_use]
    pub fn new(launch: BrowserLaunchConfig) -> Self {
        Self {
            launch,
            browsers: Mutex::new(HashMap::new()),
        }
    }

    /// Browser for `profile`, launching it on first use
    async fn browser_for(&self, profile: &BrowserProfile) -> anyhow::Result<Arc<ManagedBrowser>> {
        let key = profile.launch_key();
        let mut browsers = self.browsers.lock().await;
        if let Some(existing) = browsers.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let options = LaunchOptions {
            headless: profile.headless,
            proxy: profile.proxy.clone(),
        };
        let (browser, handler, user_data_dir) = launch_browser(&options, &self.launch).await?;
        let managed = Arc::new(ManagedBrowser {
            browser,
            handler,
            user_data_dir: Some(user_data_dir),
        });
        browsers.insert(key.clone(), Arc::clone(&managed));
        info!("Browser ready for launch key {key}");
        Ok(managed)
    }

    /// Forget a browser that failed to open a tab so the next open relaunches it
    async fn discard_browser(&self, profile: &BrowserProfile) {
        if self.browsers.lock().await.remove(&profile.launch_key()).is_some() {
            warn!("Discarded browser for launch key {}", profile.launch_key());
        }
    }

    /// Close every browser not still referenced by an open page
    pub async fn shutdown(&self) {
        let browsers: Vec<_> = self.browsers.lock().await.drain().collect();
        for (key, managed) in browsers {
            match Arc::try_unwrap(managed) {
                Ok(mut managed) => {
                    if let Err(e) = managed.browser.close().await {
                        debug!("Browser {key} did not close cleanly: {e}");
                    }
                    let _ = managed.browser.wait().await;
                }
                Err(_shared) => {
                    debug!("Browser {key} still has open pages; it closes with the last one");
                }
            }
        }
        info!("Chromium backend shut down");
    }
}

impl Default for ChromiumBackend {
    fn default() -> Self {
        Self::new(BrowserLaunchConfig::default())
    }
}

async fn configure_page(page: &Page, profile: &BrowserProfile) -> anyhow::Result<()> {
    page.execute(cdp::browser_protocol::network::SetUserAgentOverrideParams {
        user_agent: profile
            .user_agent
            .clone()
            .unwrap_or_else(|| CHROME_USER_AGENT.to_string()),
        accept_language: profile.locale.clone(),
        platform: None,
        user_agent_metadata: None,
    })
    .await
    .context("Failed to override user agent")?;

    page.execute(
        cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(profile.viewport.width))
            .height(i64::from(profile.viewport.height))
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(anyhow::Error::msg)?,
    )
    .await
    .context("Failed to set viewport")?;

    if !profile.javascript_enabled {
        page.execute(cdp::browser_protocol::emulation::SetScriptExecutionDisabledParams::new(true))
            .await
            .context("Failed to disable scripts")?;
    }

    if !profile.extra_headers.is_empty() {
        let headers = serde_json::to_value(&profile.extra_headers)
            .context("Failed to encode extra headers")?;
        page.execute(cdp::browser_protocol::network::SetExtraHttpHeadersParams::new(
            cdp::browser_protocol::network::Headers::new(headers),
        ))
        .await
        .context("Failed to set extra headers")?;
    }

    Ok(())
}

async fn fetch(page: &Page, request: &CrawlRequest) -> Result<FetchPayload, FetchFailure> {
    page.goto(request.url().as_str())
        .await
        .map_err(|e| FetchFailure::new(format!("Navigation to {} failed: {e}", request.url())))?;

    let status_code = page
        .wait_for_navigation_response()
        .await
        .ok()
        .flatten()
        .and_then(|navigation| navigation.response.as_ref().map(|response| response.status))
        .and_then(|status| u16::try_from(status).ok());

    let content = page
        .content()
        .await
        .map_err(|e| FetchFailure::new(format!("Failed to read page content: {e}")))?;
    let final_url = page.url().await.ok().flatten();

    Ok(FetchPayload {
        status_code,
        final_url,
        content,
    })
}

impl PageBackend for ChromiumBackend {
    type Page = ChromiumPage;

    fn open_page<'a>(
        &'a self,
        fingerprint: Fingerprint,
        profile: &'a BrowserProfile,
    ) -> BoxFuture<'a, anyhow::Result<Self::Page>> {
        Box::pin(async move {
            let browser = self.browser_for(profile).await?;
            let page = match browser.browser.new_page("about:blank").await {
                Ok(page) => page,
                Err(e) => {
                    drop(browser);
                    self.discard_browser(profile).await;
                    return Err(anyhow::Error::new(e).context("Failed to open browser tab"));
                }
            };
            if let Err(e) = configure_page(&page, profile).await {
                let _ = page.close().await;
                return Err(e);
            }
            debug!("Opened tab for profile {fingerprint}");
            Ok(ChromiumPage {
                page,
                _browser: browser,
            })
        })
    }

    fn execute<'a>(
        &'a self,
        page: &'a mut Self::Page,
        request: &'a CrawlRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<FetchPayload, FetchFailure>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(FetchFailure::new("fetch cancelled")),
                result = fetch(&page.page, request) => result,
            }
        })
    }

    fn close_page(&self, page: Self::Page) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = page.page.close().await {
                debug!("Failed to close tab: {e}");
            }
        })
    }
}
