mod common;

use common::{ScriptedMemory, StubBackend, fast_config, key, request};
use kodegen_crawl_dispatch::config::DispatchConfigBuilder;
use kodegen_crawl_dispatch::{
    CrawlRequest, CrawlResult, DispatchError, DispatchOutput, DispatchService, FetchPayload,
    ProgressReporter,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn service(
    builder: DispatchConfigBuilder,
    backend: &Arc<StubBackend>,
) -> DispatchService<StubBackend> {
    let config = builder.build().expect("test config should be valid");
    let service = DispatchService::with_memory_source(
        config,
        Arc::clone(backend),
        Arc::new(ScriptedMemory::new(10.0)),
    )
    .expect("service");
    service.start();
    service
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_results_follow_input_order() {
    let backend = StubBackend::new();
    backend.delay("https://one.test/", Duration::from_millis(300));
    backend.delay("https://two.test/", Duration::from_millis(100));
    backend.delay("https://three.test/", Duration::from_millis(200));
    let service = service(fast_config(), &backend);

    let requests = vec![
        request("https://one.test/"),
        request("https://two.test/"),
        request("https://three.test/"),
    ];
    let ids: Vec<_> = requests.iter().map(|r| r.id()).collect();
    let results = service.run_batch(requests).await;

    assert_eq!(results.len(), 3);
    assert_eq!(
        results.iter().map(|r| r.request_id).collect::<Vec<_>>(),
        ids
    );
    assert_eq!(results[0].url, key("https://one.test/"));
    assert!(results.iter().all(|r| r.success && r.error.is_none()));
    assert_eq!(
        results[1].payload.as_ref().and_then(|p| p.status_code),
        Some(200)
    );

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_concurrency_bounded_by_pool() {
    let backend = StubBackend::new();
    let urls: Vec<String> = (0..8).map(|i| format!("https://bounded{i}.test/")).collect();
    for url in &urls {
        backend.delay(url, Duration::from_millis(80));
    }
    let service = service(fast_config().max_pages(2).job_workers(2), &backend);

    let results = service
        .run_batch(urls.iter().map(|u| request(u)).collect())
        .await;

    assert!(results.iter().all(|r| r.success));
    assert!(backend.peak_executing() <= 2, "peak {}", backend.peak_executing());
    assert!(backend.peak_open_pages() <= 2);
    assert!(service.stats().pool.peak_active <= 2);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rate_limited_response_is_retried() {
    let backend = StubBackend::new();
    backend.statuses("https://busy.test/", &[429]);
    let service = service(fast_config().max_retries(3), &backend);

    let result = service.run(&request("https://busy.test/")).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.attempts, 2);
    assert_eq!(backend.executions(), 2);
    assert!(result.elapsed_ms >= 240, "backoff must apply before the retry");
    let state = service.limiter().snapshot("busy.test").expect("tracked");
    assert_eq!(state.consecutive_failures, 0);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_budget_exhaustion_fails_request() {
    let backend = StubBackend::new();
    backend.statuses("https://wall.test/", &[429, 429, 429, 429]);
    let service = service(fast_config().max_retries(1), &backend);

    let result = service.run(&request("https://wall.test/")).await;

    assert!(!result.success);
    assert_eq!(result.attempts, 2);
    match result.error {
        Some(DispatchError::FetchFailure { reason, status_code }) => {
            assert_eq!(status_code, Some(429));
            assert!(reason.contains("wall.test"), "{reason}");
        }
        other => panic!("expected a fetch failure, got {other:?}"),
    }

    service.shutdown().await;
}

#[tokio::test]
async fn test_failed_fetch_closes_page_and_reports_error() {
    let backend = StubBackend::new();
    backend.fail("https://broken.test/");
    let service = service(fast_config(), &backend);

    let result = service.run(&request("https://broken.test/")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!result.success);
    assert!(result.payload.is_none());
    assert!(matches!(
        result.error,
        Some(DispatchError::FetchFailure { .. })
    ));
    assert_eq!(backend.closed(), 1, "failed pages are never reused");
    assert_eq!(service.stats().pool.idle, 0);

    service.shutdown().await;
}

#[tokio::test]
async fn test_successful_fetch_returns_page_to_pool() {
    let backend = StubBackend::new();
    let service = service(fast_config(), &backend);

    for path in ["a", "b", "c"] {
        let result = service
            .run(&request(&format!("https://warm.test/{path}")))
            .await;
        assert!(result.success);
    }

    assert_eq!(backend.opened(), 1);
    let stats = service.stats().pool;
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.reused_total, 2);

    service.shutdown().await;
}

#[tokio::test]
async fn test_slow_fetch_hits_fetch_timeout() {
    let backend = StubBackend::new();
    backend.delay("https://slow.test/", Duration::from_secs(5));
    let service = service(fast_config().fetch_timeout_secs(0.2), &backend);

    let result = service.run(&request("https://slow.test/")).await;

    assert!(!result.success);
    match result.error {
        Some(DispatchError::FetchFailure { reason, .. }) => {
            assert!(reason.contains("timeout"), "{reason}");
        }
        other => panic!("expected a timeout failure, got {other:?}"),
    }
    assert!(result.elapsed_ms < 2_000);

    service.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_without_stream_flag_is_a_batch() {
    let backend = StubBackend::new();
    let service = service(fast_config(), &backend);

    let output = service
        .dispatch(vec![request("https://x.test/"), request("https://y.test/")])
        .await;
    match output {
        DispatchOutput::Batch(results) => {
            assert_eq!(results.len(), 2);
            let payload: &FetchPayload = results[0].payload.as_ref().expect("payload");
            assert!(payload.content.contains("x.test"));
        }
        DispatchOutput::Stream(_) => panic!("no request asked for streaming"),
    }

    service.shutdown().await;
}

#[tokio::test]
async fn test_run_after_shutdown_is_refused() {
    let backend = StubBackend::new();
    let service = service(fast_config(), &backend);
    service.shutdown().await;

    let result = service.run(&request("https://late.test/")).await;
    assert!(!result.success);
    assert!(matches!(
        result.error,
        Some(DispatchError::Unavailable { .. } | DispatchError::SessionCancelled { .. })
    ));
    assert_eq!(backend.opened(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_request_keeps_its_batch_position() {
    let backend = StubBackend::new();
    backend.delay("https://one.test/", Duration::from_millis(300));
    backend.fail("https://broken.test/");
    backend.delay("https://three.test/", Duration::from_millis(200));
    let service = service(fast_config(), &backend);

    let requests = vec![
        request("https://one.test/"),
        request("https://broken.test/"),
        request("https://three.test/"),
    ];
    let ids: Vec<_> = requests.iter().map(|r| r.id()).collect();
    let results = service.run_batch(requests).await;

    assert_eq!(
        results.iter().map(|r| r.request_id).collect::<Vec<_>>(),
        ids
    );
    assert!(results[0].success && results[2].success);
    assert!(!results[1].success);
    assert!(results[1].payload.is_none());
    assert!(matches!(
        results[1].error,
        Some(DispatchError::FetchFailure { .. })
    ));

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_fetch_is_retried_after_delay() {
    let backend = StubBackend::new();
    backend.fail_next("https://flaky.test/", 2);
    let service = service(fast_config().failure_retries(3, 0.05), &backend);

    let result = service.run(&request("https://flaky.test/")).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.attempts, 3);
    assert_eq!(backend.executions(), 3);
    assert!(result.elapsed_ms >= 100, "two pauses of 50ms precede the success");

    service.shutdown().await;
}

#[tokio::test]
async fn test_failure_retries_stop_at_budget() {
    let backend = StubBackend::new();
    backend.fail("https://down.test/");
    let service = service(fast_config().failure_retries(2, 0.01), &backend);

    let result = service.run(&request("https://down.test/")).await;

    assert!(!result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(backend.executions(), 3);
    assert!(matches!(
        result.error,
        Some(DispatchError::FetchFailure { .. })
    ));

    service.shutdown().await;
}

#[tokio::test]
async fn test_custom_retry_strategy_can_give_up_early() {
    let backend = StubBackend::new();
    backend.fail("https://down.test/");
    let service = service(fast_config().failure_retries(5, 10.0), &backend);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let strategy = {
        let seen = Arc::clone(&seen);
        move |url: &str, attempt: u32, _error: &DispatchError| {
            seen.lock().push((url.to_string(), attempt));
            (attempt < 2).then_some(Duration::from_millis(10))
        }
    };
    service.set_retry_strategy(Arc::new(strategy));

    let result = service.run(&request("https://down.test/")).await;

    assert!(!result.success);
    assert_eq!(result.attempts, 2);
    assert!(result.elapsed_ms < 5_000, "strategy delay replaces the configured one");
    assert_eq!(
        *seen.lock(),
        vec![
            (key("https://down.test/"), 1),
            (key("https://down.test/"), 2)
        ]
    );

    service.shutdown().await;
}

/// Records progress reports as `started:<url>` / `completed:<url>:<success>`
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl ProgressReporter for Recorder {
    fn report_started(&self, request: &CrawlRequest) {
        self.events.lock().push(format!("started:{}", request.url()));
    }

    fn report_completed(&self, result: &CrawlResult) {
        self.events
            .lock()
            .push(format!("completed:{}:{}", result.url, result.success));
    }
}

#[tokio::test]
async fn test_progress_reports_start_and_completion_once() {
    let backend = StubBackend::new();
    backend.fail_next("https://retry.test/", 1);
    let service = service(fast_config().failure_retries(1, 0.01), &backend);
    let recorder = Arc::new(Recorder::default());
    service.set_progress_reporter(Arc::clone(&recorder) as Arc<dyn ProgressReporter>);

    let ok = service.run(&request("https://retry.test/")).await;
    assert!(ok.success);
    assert_eq!(ok.attempts, 2);

    let url = key("https://retry.test/");
    assert_eq!(
        *recorder.events.lock(),
        vec![format!("started:{url}"), format!("completed:{url}:true")]
    );

    service.shutdown().await;
}

#[tokio::test]
async fn test_progress_reports_requests_that_never_started() {
    let backend = StubBackend::new();
    let memory_closed = fast_config()
        .memory_threshold_percent(5.0)
        .memory_polling(10, 2);
    let service = service(memory_closed, &backend);
    let recorder = Arc::new(Recorder::default());
    service.set_progress_reporter(Arc::clone(&recorder) as Arc<dyn ProgressReporter>);

    let result = service.run(&request("https://gated.test/")).await;
    assert!(!result.success);

    let url = key("https://gated.test/");
    assert_eq!(*recorder.events.lock(), vec![format!("completed:{url}:false")]);

    service.shutdown().await;
}
