mod common;

use common::{ScriptedMemory, StubBackend, fast_config, request};
use kodegen_crawl_dispatch::crawl_engine::MemoryMonitor;
use kodegen_crawl_dispatch::{AdmissionGate, CancelReason, DispatchError, DispatchService};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn monitor(memory: &ScriptedMemory) -> Arc<MemoryMonitor> {
    MemoryMonitor::new(Arc::new(memory.clone()), 90.0, Duration::from_millis(50))
}

#[tokio::test]
async fn test_gate_open_before_first_sample() {
    let memory = ScriptedMemory::new(99.0);
    let monitor = monitor(&memory);
    assert!(monitor.latest().is_none());
    assert!(!monitor.is_over_threshold());

    monitor.sample_now().expect("scripted source never fails");
    assert!(monitor.is_over_threshold());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admission_waits_until_memory_drops() {
    let memory = ScriptedMemory::new(95.0);
    let monitor = monitor(&memory);
    let shutdown = CancellationToken::new();
    monitor.start(shutdown.clone());
    assert!(monitor.is_over_threshold());

    let waiter = {
        let monitor = Arc::clone(&monitor);
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            monitor
                .wait_for_admission(Duration::from_millis(25), 400, &cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished(), "admission must hold while over threshold");

    memory.set(40.0);
    let admitted = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("admission should resume after memory drops")
        .expect("task should not panic");
    assert!(admitted.is_ok());
    assert!(!monitor.is_over_threshold());

    shutdown.cancel();
    monitor.stop();
}

#[tokio::test]
async fn test_admission_times_out_after_max_polls() {
    let memory = ScriptedMemory::new(95.0);
    let monitor = monitor(&memory);
    monitor.sample_now().expect("sample");

    let err = monitor
        .wait_for_admission(Duration::from_millis(10), 5, &CancellationToken::new())
        .await
        .expect_err("gate stays closed");
    assert_eq!(
        err,
        DispatchError::AdmissionTimeout {
            gate: AdmissionGate::Memory
        }
    );
}

#[tokio::test]
async fn test_admission_wait_honors_cancel() {
    let memory = ScriptedMemory::new(95.0);
    let monitor = monitor(&memory);
    monitor.sample_now().expect("sample");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = monitor
        .wait_for_admission(Duration::from_secs(1), 10, &cancel)
        .await
        .expect_err("cancelled before admission");
    assert_eq!(err, DispatchError::cancelled(CancelReason::Caller));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_closed_gate_keeps_requests_off_the_pool() {
    let backend = StubBackend::new();
    let memory = ScriptedMemory::new(97.0);
    let config = fast_config()
        .memory_threshold_percent(90.0)
        .memory_polling(10, 5)
        .build()
        .expect("config");
    let service = DispatchService::with_memory_source(config, Arc::clone(&backend), Arc::new(memory))
        .expect("service");
    service.start();

    let result = service.run(&request("https://heavy.test/")).await;
    assert!(!result.success);
    assert_eq!(
        result.error,
        Some(DispatchError::AdmissionTimeout {
            gate: AdmissionGate::Memory
        })
    );
    assert_eq!(backend.opened(), 0);
    assert!(service.stats().memory_gate_closed);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gate_closing_during_rate_wait_holds_execution() {
    let backend = StubBackend::new();
    let memory = ScriptedMemory::new(10.0);
    let config = fast_config()
        .base_delay_secs(0.6, 0.6)
        .memory_threshold_percent(90.0)
        .memory_polling(50, 100)
        .build()
        .expect("config");
    let service = Arc::new(
        DispatchService::with_memory_source(config, Arc::clone(&backend), Arc::new(memory.clone()))
            .expect("service"),
    );
    service.start();

    let first = service.run(&request("https://same.test/a")).await;
    assert!(first.success);
    assert_eq!(backend.executions(), 1);

    // Second request to the same destination sleeps on its rate slot
    let second = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.run(&request("https://same.test/b")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    memory.set(97.0);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(service.memory().is_over_threshold());
    assert_eq!(
        backend.executions(),
        1,
        "no execution may begin while the memory gate is closed"
    );
    assert!(!second.is_finished());
    assert_eq!(service.stats().pool.active, 0, "held request gave its page back");

    memory.set(10.0);
    let second = tokio::time::timeout(Duration::from_secs(3), second)
        .await
        .expect("request should run once memory drops")
        .expect("task should not panic");
    assert!(second.success, "{:?}", second.error);
    assert_eq!(backend.executions(), 2);

    service.shutdown().await;
}
