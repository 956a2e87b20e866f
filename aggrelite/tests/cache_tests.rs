//! Cache read protocol: hits, refresh key changes under both renewal
//! policies, TTL expiry and the disabled cache

#[path = "testutils/mod.rs"]
mod testutils;

use aggrelite::request::CacheDirective;
use aggrelite::{CacheStatus, MemoryDriver, QueryRequest, RefreshKeySpec, RenewalPolicy};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testutils::fixture::{fast_config, TestFixture, DATA_SOURCE};
use testutils::one_row;

const DATA_SQL: &str = "SELECT sum(amount) FROM orders";
const KEY_SQL: &str = "SELECT max(updated_at) FROM orders";

/// Refresh key returns the current version; the data query returns
/// `version * 10` after `delay`
fn versioned_driver(version: Arc<AtomicI64>, delay: Duration) -> Arc<MemoryDriver> {
    let driver = Arc::new(MemoryDriver::new());
    driver.set_handler(move |sql, _| {
        let current = version.load(Ordering::SeqCst);
        async move {
            if sql == KEY_SQL {
                Ok(one_row(current))
            } else {
                tokio::time::sleep(delay).await;
                Ok(one_row(current * 10))
            }
        }
    });
    driver
}

fn data_request() -> QueryRequest {
    QueryRequest::interactive(DATA_SQL, vec![], DATA_SOURCE)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_changed_refresh_key_renews_once_in_foreground() {
    let version = Arc::new(AtomicI64::new(1));
    let driver = versioned_driver(version.clone(), Duration::ZERO);
    let fixture = TestFixture::with_driver(fast_config(), driver, Vec::new());
    let key = RefreshKeySpec::sql(KEY_SQL);
    let orchestrator = &fixture.orchestrator;

    let first = orchestrator.fetch(data_request(), Some(&key)).await.unwrap();
    assert_eq!(first.status, CacheStatus::Miss);
    assert_eq!(*first.output, one_row(10));

    let second = orchestrator.fetch(data_request(), Some(&key)).await.unwrap();
    assert_eq!(second.status, CacheStatus::Hit);
    assert_eq!(fixture.driver.executions_matching("sum(amount)"), 1);

    version.store(2, Ordering::SeqCst);
    let renewed = orchestrator.fetch(data_request(), Some(&key)).await.unwrap();
    assert_eq!(renewed.status, CacheStatus::Renewed);
    assert_eq!(*renewed.output, one_row(20));
    assert_eq!(renewed.refresh_key_value.as_deref(), Some("2"));

    let after = orchestrator.fetch(data_request(), Some(&key)).await.unwrap();
    assert_eq!(after.status, CacheStatus::Hit);
    assert_eq!(fixture.driver.executions_matching("sum(amount)"), 2);
    assert_eq!(fixture.driver.executions_matching("max(updated_at)"), 4);

    let stats = orchestrator.cache_stats();
    assert_eq!((stats.hits, stats.misses, stats.renewals), (2, 1, 1));
    assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_joining_uncached_execution_stores_result() {
    let version = Arc::new(AtomicI64::new(1));
    let driver = versioned_driver(version, Duration::from_millis(200));
    let fixture = TestFixture::with_driver(fast_config(), driver, Vec::new());
    let orchestrator = &fixture.orchestrator;

    // Plain execution with no cache directive
    let running = orchestrator.enqueue(data_request()).await.unwrap();

    let first = orchestrator.fetch(data_request(), None).await.unwrap();
    assert_eq!(first.status, CacheStatus::Miss);
    assert_eq!(*first.output, one_row(10));

    let second = orchestrator.fetch(data_request(), None).await.unwrap();
    assert_eq!(second.status, CacheStatus::Hit);
    assert_eq!(fixture.driver.executions_matching("sum(amount)"), 1);

    assert_eq!(*running.wait().await.unwrap(), one_row(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_background_renewal_joining_uncached_execution_stores_result() {
    let mut config = fast_config();
    config.cache.renewal = RenewalPolicy::StaleWhileRevalidate;
    let version = Arc::new(AtomicI64::new(1));
    let driver = versioned_driver(version.clone(), Duration::from_millis(150));
    let fixture = TestFixture::with_driver(config, driver, Vec::new());
    let key = RefreshKeySpec::sql(KEY_SQL);
    let orchestrator = &fixture.orchestrator;

    orchestrator.fetch(data_request(), Some(&key)).await.unwrap();
    version.store(2, Ordering::SeqCst);

    let running = orchestrator.enqueue(data_request()).await.unwrap();
    let stale = orchestrator.fetch(data_request(), Some(&key)).await.unwrap();
    assert_eq!(stale.status, CacheStatus::Stale);
    assert_eq!(*running.wait().await.unwrap(), one_row(20));

    let fingerprint = data_request().fingerprint;
    let mut renewed = false;
    for _ in 0..200 {
        let entry = orchestrator.cache().get(&fingerprint).await;
        if entry.is_some_and(|entry| entry.refresh_key_value == "2") {
            renewed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(renewed);

    let fresh = orchestrator.fetch(data_request(), Some(&key)).await.unwrap();
    assert_eq!(fresh.status, CacheStatus::Hit);
    assert_eq!(*fresh.output, one_row(20));
    assert_eq!(fixture.driver.executions_matching("sum(amount)"), 2);
    assert_eq!(orchestrator.cache_stats().stale_served, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_changed_refresh_key_serves_stale_and_renews_once() {
    let mut config = fast_config();
    config.cache.renewal = RenewalPolicy::StaleWhileRevalidate;
    let version = Arc::new(AtomicI64::new(1));
    let driver = versioned_driver(version.clone(), Duration::from_millis(100));
    let fixture = TestFixture::with_driver(config, driver, Vec::new());
    let key = RefreshKeySpec::sql(KEY_SQL);
    let orchestrator = &fixture.orchestrator;

    orchestrator.fetch(data_request(), Some(&key)).await.unwrap();
    version.store(2, Ordering::SeqCst);

    // Both readers see the old generation; the renewals share one execution
    for _ in 0..2 {
        let stale = orchestrator.fetch(data_request(), Some(&key)).await.unwrap();
        assert_eq!(stale.status, CacheStatus::Stale);
        assert_eq!(*stale.output, one_row(10));
        assert_eq!(stale.refresh_key_value.as_deref(), Some("1"));
    }

    let fingerprint = data_request().fingerprint;
    let cache = orchestrator.cache();
    let mut renewed = false;
    for _ in 0..200 {
        let entry = cache.get(&fingerprint).await;
        if entry.is_some_and(|entry| entry.refresh_key_value == "2") {
            renewed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(renewed);

    let fresh = orchestrator.fetch(data_request(), Some(&key)).await.unwrap();
    assert_eq!(fresh.status, CacheStatus::Hit);
    assert_eq!(*fresh.output, one_row(20));
    assert_eq!(fixture.driver.executions_matching("sum(amount)"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_ttl_triggers_renewal() {
    let version = Arc::new(AtomicI64::new(1));
    let driver = versioned_driver(version, Duration::ZERO);
    let fixture = TestFixture::with_driver(fast_config(), driver, Vec::new());
    let request = || {
        data_request().with_cache(CacheDirective {
            refresh_key_value: String::new(),
            ttl: Duration::from_millis(50),
        })
    };

    let first = fixture.orchestrator.fetch(request(), None).await.unwrap();
    assert_eq!(first.status, CacheStatus::Miss);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let second = fixture.orchestrator.fetch(request(), None).await.unwrap();
    assert_eq!(second.status, CacheStatus::Renewed);
    assert_eq!(fixture.driver.executions_matching("sum(amount)"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disabled_cache_bypasses_store() {
    let mut config = fast_config();
    config.cache.enabled = false;
    let version = Arc::new(AtomicI64::new(1));
    let driver = versioned_driver(version, Duration::ZERO);
    let fixture = TestFixture::with_driver(config, driver, Vec::new());

    for _ in 0..2 {
        let result = fixture.orchestrator.fetch(data_request(), None).await.unwrap();
        assert_eq!(result.status, CacheStatus::Bypass);
    }
    assert_eq!(fixture.driver.executions_matching("sum(amount)"), 2);
    assert_eq!(fixture.orchestrator.cache_stats().entries, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_query_is_not_cached() {
    let fixture = TestFixture::new();
    fixture.driver.set_handler(|_, _| async {
        Err(aggrelite::DriverError::fatal("relation orders does not exist"))
    });

    let err = fixture
        .orchestrator
        .fetch(data_request(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), aggrelite::ErrorKind::Fatal);
    assert_eq!(fixture.orchestrator.cache_stats().insertions, 0);

    fixture.driver.set_handler(|_, _| async { Ok(one_row(5)) });
    let result = fixture.orchestrator.fetch(data_request(), None).await.unwrap();
    assert_eq!(result.status, CacheStatus::Miss);
}
