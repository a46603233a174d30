//! Command-line front end for the crawl dispatcher
//!
//! Fetches the given URLs through a Chromium page pool and prints one JSON
//! object per result on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use kodegen_crawl_dispatch::{
    BrowserProfile, ChromiumBackend, CrawlRequest, DispatchConfig, DispatchService,
};

/// Fetch pages through a bounded, rate-limited browser pool
#[derive(Parser, Debug)]
#[command(name = "kodegen-crawl-dispatch")]
#[command(version)]
#[command(about = "Fetch pages through a bounded, rate-limited browser pool", long_about = None)]
struct Cli {
    /// JSON configuration file; defaults apply to missing keys
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print results as they complete instead of in input order
    #[arg(long, conflicts_with = "submit")]
    stream: bool,

    /// Submit every URL as a job and poll until all have finished
    #[arg(long)]
    submit: bool,

    /// Run the browser with a visible window
    #[arg(long)]
    headful: bool,

    /// Proxy server for every request
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,

    #[arg(required = true, value_name = "URL")]
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("kodegen_crawl_dispatch=info,warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DispatchConfig::from_json_file(path)?,
        None => DispatchConfig::default(),
    };

    let mut profile = BrowserProfile {
        headless: !cli.headful,
        ..BrowserProfile::default()
    };
    if let Some(proxy) = &cli.proxy {
        profile = profile.with_proxy(proxy.clone());
    }

    let requests = cli
        .urls
        .iter()
        .map(|url| {
            CrawlRequest::new(url, profile.clone())
                .map(|request| request.with_stream(cli.stream))
                .with_context(|| format!("Invalid URL {url}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let backend = Arc::new(ChromiumBackend::new(config.browser().clone()));
    let service = DispatchService::new(config, Arc::clone(&backend))?;
    service.start();

    let outcome = if cli.submit {
        run_jobs(&service, requests).await
    } else if cli.stream {
        run_stream(&service, requests).await
    } else {
        for result in service.run_batch(requests).await {
            println!("{}", serde_json::to_string(&result)?);
        }
        Ok(())
    };

    service.shutdown().await;
    backend.shutdown().await;
    outcome
}

async fn run_stream(
    service: &DispatchService<ChromiumBackend>,
    requests: Vec<CrawlRequest>,
) -> Result<()> {
    let mut session = service.run_stream(requests);
    while let Some(item) = session.next().await {
        match item {
            Ok(result) => println!("{}", serde_json::to_string(&result)?),
            Err(e) => {
                tracing::error!("Stream ended early: {e}");
                println!("{}", serde_json::to_string(&e)?);
            }
        }
    }
    Ok(())
}

async fn run_jobs(
    service: &DispatchService<ChromiumBackend>,
    requests: Vec<CrawlRequest>,
) -> Result<()> {
    let mut pending: Vec<_> = requests
        .into_iter()
        .map(|request| service.submit(request))
        .collect();
    tracing::info!("Submitted {} jobs", pending.len());

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    while !pending.is_empty() {
        ticker.tick().await;
        let mut still_running = Vec::with_capacity(pending.len());
        for task_id in pending {
            let job = service.poll(task_id)?;
            if job.status.is_terminal() {
                println!("{}", serde_json::to_string(&job)?);
            } else {
                still_running.push(task_id);
            }
        }
        pending = still_running;
    }
    Ok(())
}
