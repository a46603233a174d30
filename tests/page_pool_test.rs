mod common;

use common::{StubBackend, request};
use kodegen_crawl_dispatch::{
    AdmissionGate, BrowserProfile, CrawlRequest, DispatchError, PagePool, PagePoolConfig,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn pool(max_pages: usize, backend: &Arc<StubBackend>) -> Arc<PagePool<StubBackend>> {
    PagePool::new(
        PagePoolConfig {
            max_pages,
            idle_ttl: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
            max_consecutive_open_failures: 2,
        },
        Arc::clone(backend),
    )
}

fn request_with_agent(url: &str, agent: &str) -> CrawlRequest {
    CrawlRequest::new(url, BrowserProfile::default().with_user_agent(agent))
        .expect("test URL should be valid")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_live_pages_never_exceed_capacity() {
    let backend = StubBackend::new();
    let pool = pool(3, &backend);

    let mut handles = Vec::new();
    for i in 0..24 {
        let pool = Arc::clone(&pool);
        let agent = if i % 3 == 0 { "agent-a" } else { "agent-b" };
        let req = request_with_agent(&format!("https://cap.test/{i}"), agent);
        handles.push(tokio::spawn(async move {
            let lease = pool
                .acquire(&req, Duration::from_secs(10))
                .await
                .expect("acquire should succeed");
            tokio::time::sleep(Duration::from_millis(15)).await;
            lease.release(true);
        }));
    }
    for handle in handles {
        handle.await.expect("task should not panic");
    }

    let stats = pool.stats();
    assert!(stats.peak_active <= 3, "peak active was {}", stats.peak_active);
    assert!(backend.peak_open_pages() <= 3, "peak open was {}", backend.peak_open_pages());
    assert!(stats.live <= 3);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.waiting, 0);
}

#[tokio::test]
async fn test_same_fingerprint_reuses_page() {
    let backend = StubBackend::new();
    let pool = pool(2, &backend);
    let req = request("https://reuse.test/a");

    let first = pool.acquire(&req, Duration::from_secs(1)).await.expect("acquire");
    let first_id = first.id();
    assert!(!first.is_reused());
    first.release(true);

    let second = pool
        .acquire(&request("https://reuse.test/b"), Duration::from_secs(1))
        .await
        .expect("acquire");
    assert!(second.is_reused());
    assert_eq!(second.id(), first_id);
    assert_eq!(second.uses(), 2);
    second.release(true);

    assert_eq!(backend.opened(), 1);
    assert_eq!(pool.stats().reused_total, 1);
}

#[tokio::test]
async fn test_other_fingerprint_evicts_idle_page_at_capacity() {
    let backend = StubBackend::new();
    let pool = pool(1, &backend);

    let lease = pool
        .acquire(&request_with_agent("https://evict.test/", "a"), Duration::from_secs(1))
        .await
        .expect("acquire");
    lease.release(true);

    let lease = pool
        .acquire(&request_with_agent("https://evict.test/", "b"), Duration::from_secs(1))
        .await
        .expect("acquire should evict the idle page");
    assert!(!lease.is_reused());
    lease.release(true);
    settle().await;

    assert_eq!(backend.opened(), 2);
    assert_eq!(backend.closed(), 1);
    assert_eq!(pool.stats().live, 1);
}

#[tokio::test]
async fn test_sweep_closes_expired_idle_pages() {
    let backend = StubBackend::new();
    let pool = pool(2, &backend);

    let lease = pool
        .acquire(&request("https://idle.test/"), Duration::from_secs(1))
        .await
        .expect("acquire");
    lease.release(true);

    assert_eq!(pool.sweep_idle(), 0, "fresh idle page must survive a sweep");
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(pool.sweep_idle(), 1);
    settle().await;

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.live, 0);
    assert_eq!(backend.open_pages(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiters_are_served_in_arrival_order() {
    let backend = StubBackend::new();
    let pool = pool(1, &backend);
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = pool
        .acquire(&request_with_agent("https://fifo.test/", "a"), Duration::from_secs(1))
        .await
        .expect("acquire");

    let mut waiters = Vec::new();
    for (position, agent) in [(1, "b"), (2, "a"), (3, "b")] {
        let pool = Arc::clone(&pool);
        let order = Arc::clone(&order);
        let req = request_with_agent("https://fifo.test/", agent);
        waiters.push(tokio::spawn(async move {
            let lease = pool.acquire(&req, Duration::from_secs(5)).await.expect("acquire");
            order.lock().push(position);
            tokio::time::sleep(Duration::from_millis(10)).await;
            lease.release(true);
        }));
        // Let each waiter queue before the next one arrives
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert_eq!(pool.stats().waiting, 3);

    held.release(true);
    for waiter in waiters {
        waiter.await.expect("waiter should not panic");
    }

    assert_eq!(*order.lock(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_acquire_times_out_and_leaves_queue() {
    let backend = StubBackend::new();
    let pool = pool(1, &backend);
    let held = pool
        .acquire(&request("https://timeout.test/"), Duration::from_secs(1))
        .await
        .expect("acquire");

    let err = pool
        .acquire(&request("https://timeout.test/"), Duration::from_millis(100))
        .await
        .expect_err("pool is exhausted");
    assert_eq!(
        err,
        DispatchError::AdmissionTimeout {
            gate: AdmissionGate::Pool
        }
    );
    assert_eq!(pool.stats().waiting, 0);

    held.release(true);
    let lease = pool
        .acquire(&request("https://timeout.test/"), Duration::from_secs(1))
        .await
        .expect("capacity must not leak after a timed-out waiter");
    assert!(lease.is_reused());
}

#[tokio::test]
async fn test_dropped_lease_closes_page() {
    let backend = StubBackend::new();
    let pool = pool(1, &backend);

    let lease = pool
        .acquire(&request("https://drop.test/"), Duration::from_secs(1))
        .await
        .expect("acquire");
    drop(lease);
    settle().await;

    assert_eq!(backend.closed(), 1);
    let stats = pool.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.idle, 0);
}

#[tokio::test]
async fn test_repeated_open_failures_make_pool_unavailable() {
    let backend = StubBackend::new();
    backend.fail_opens(true);
    let pool = pool(2, &backend);
    let req = request("https://broken.test/");

    for _ in 0..2 {
        let err = pool
            .acquire(&req, Duration::from_secs(1))
            .await
            .expect_err("open should fail");
        assert!(matches!(err, DispatchError::PageOpen { .. }), "got {err:?}");
    }

    assert!(pool.is_unavailable());
    let err = pool
        .acquire(&req, Duration::from_secs(1))
        .await
        .expect_err("pool should refuse work");
    assert!(matches!(err, DispatchError::Unavailable { .. }), "got {err:?}");
    assert_eq!(pool.stats().live, 0);
}

#[tokio::test]
async fn test_shutdown_closes_idle_and_rejects_acquire() {
    let backend = StubBackend::new();
    let pool = pool(2, &backend);
    let lease = pool
        .acquire(&request("https://shutdown.test/"), Duration::from_secs(1))
        .await
        .expect("acquire");
    lease.release(true);

    pool.shutdown();
    settle().await;

    assert_eq!(backend.open_pages(), 0);
    let err = pool
        .acquire(&request("https://shutdown.test/"), Duration::from_secs(1))
        .await
        .expect_err("shut down pool refuses work");
    assert!(matches!(err, DispatchError::Unavailable { .. }));
}
