//! Integration tests for the single-flight cache.
//!
//! Loaders count their invocations so the tests can verify that concurrent
//! callers share one load and that refreshes happen in place.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use herakles_scrape_gateway::cache::BoxError;
use herakles_scrape_gateway::{CacheSettings, RefreshMode, SingleFlightCache};

/// Settings without a background task; tests drive sweeps themselves.
fn manual(refresh_after: Option<Duration>, expire_after: Option<Duration>) -> CacheSettings {
    CacheSettings {
        refresh_after,
        expire_after,
        sweep_interval: Duration::from_millis(10),
        mode: RefreshMode::Manual,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_gets_share_one_load() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = Arc::new(SingleFlightCache::new(
        "concurrent",
        manual(None, None),
        move |key: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, BoxError>(format!("value-for-{key}"))
            }
        },
    ));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache.get(&"k".to_string()).await
        }));
    }

    for handle in handles {
        let value = handle.await.unwrap().unwrap();
        assert_eq!(value, "value-for-k");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_waiters_share_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = Arc::new(SingleFlightCache::new(
        "failing",
        manual(None, None),
        move |_key: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Err::<u32, BoxError>("backend unavailable".into())
            }
        },
    ));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move { cache.get(&1).await }));
    }

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("backend unavailable"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!cache.contains_key(&1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_load_independently() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = Arc::new(SingleFlightCache::new(
        "independent",
        manual(None, None),
        move |key: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if key == 1 {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Ok::<_, BoxError>(key)
            }
        },
    ));

    let slow = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get(&1).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = std::time::Instant::now();
    assert_eq!(cache.get(&2).await.unwrap(), 2);
    assert!(started.elapsed() < Duration::from_millis(400));

    assert_eq!(slow.await.unwrap().unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refresh_serves_old_value_until_reloaded() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = Arc::new(SingleFlightCache::new(
        "refresh",
        manual(Some(Duration::from_millis(10)), None),
        move |_key: u32| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n > 0 {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                Ok::<_, BoxError>(n)
            }
        },
    ));

    assert_eq!(cache.get(&1).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let sweeper = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.sweep().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The refresh is still running; readers keep the previous value.
    let started = std::time::Instant::now();
    assert_eq!(cache.get(&1).await.unwrap(), 0);
    assert!(started.elapsed() < Duration::from_millis(200));

    sweeper.await.unwrap();
    assert_eq!(cache.get(&1).await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_refresh_keeps_value() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = SingleFlightCache::new(
        "refresh-failure",
        manual(Some(Duration::from_millis(5)), None),
        move |_key: u32| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Ok::<_, BoxError>("first".to_string())
                } else {
                    Err("refresh failed".into())
                }
            }
        },
    );

    assert_eq!(cache.get(&9).await.unwrap(), "first");
    tokio::time::sleep(Duration::from_millis(20)).await;
    cache.sweep().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(cache.contains_key(&9));
    assert_eq!(cache.get(&9).await.unwrap(), "first");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unused_entries_expire() {
    let cache = SingleFlightCache::new(
        "expiry",
        manual(None, Some(Duration::from_millis(20))),
        |key: u32| async move { Ok::<_, BoxError>(key + 100) },
    );

    assert_eq!(cache.get(&1).await.unwrap(), 101);
    assert!(cache.contains_key(&1));

    tokio::time::sleep(Duration::from_millis(60)).await;
    cache.sweep().await;

    assert!(!cache.contains_key(&1));
    assert!(cache.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recently_used_entries_survive_sweep() {
    let cache = SingleFlightCache::new(
        "expiry-used",
        manual(None, Some(Duration::from_millis(500))),
        |key: u32| async move { Ok::<_, BoxError>(key) },
    );

    cache.get(&1).await.unwrap();
    cache.sweep().await;
    assert!(cache.contains_key(&1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_put_counts_as_use() {
    let cache = SingleFlightCache::new(
        "expiry-put",
        manual(None, Some(Duration::from_millis(50))),
        |key: u32| async move { Ok::<_, BoxError>(key) },
    );

    assert_eq!(cache.get(&1).await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    cache.put(1, 42);
    cache.sweep().await;

    assert!(cache.contains_key(&1));
    assert_eq!(cache.get(&1).await.unwrap(), 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalidate_during_load_does_not_start_another() {
    let calls = Arc::new(AtomicUsize::new(0));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let (counter, running, peak) = (calls.clone(), in_flight.clone(), max_in_flight.clone());
    let cache = Arc::new(SingleFlightCache::new(
        "invalidate-busy",
        manual(None, None),
        move |key: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, BoxError>(key * 10)
            }
        },
    ));

    let first = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get(&1).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    cache.invalidate_all();
    assert!(!cache.contains_key(&1));

    assert_eq!(cache.get(&1).await.unwrap(), 10);
    assert_eq!(first.await.unwrap().unwrap(), 10);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Idle entries are dropped right away.
    cache.invalidate_all();
    assert!(cache.is_empty());
    assert_eq!(cache.get(&1).await.unwrap(), 10);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CompositeKey {
    app_id: String,
    instance: Option<u32>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_composite_keys_compare_by_value() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cache = SingleFlightCache::new(
        "composite",
        manual(None, None),
        move |key: CompositeKey| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, BoxError>(format!("{}/{:?}", key.app_id, key.instance)) }
        },
    );

    let first = CompositeKey {
        app_id: "shop".to_string(),
        instance: Some(0),
    };
    let equal = CompositeKey {
        app_id: String::from("shop"),
        instance: Some(0),
    };
    let other = CompositeKey {
        app_id: "shop".to_string(),
        instance: None,
    };

    assert_eq!(cache.get(&first).await.unwrap(), "shop/Some(0)");
    assert_eq!(cache.get(&equal).await.unwrap(), "shop/Some(0)");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(cache.get(&other).await.unwrap(), "shop/None");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_put_and_remove() {
    let cache = SingleFlightCache::new("put", manual(None, None), |key: u32| async move {
        Ok::<_, BoxError>(key)
    });

    cache.put(5, 50);
    assert_eq!(cache.get(&5).await.unwrap(), 50);
    assert_eq!(cache.remove(&5).await, Some(50));
    assert_eq!(cache.get(&5).await.unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_refresher_reloads_entries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let settings = CacheSettings {
        refresh_after: Some(Duration::from_millis(20)),
        expire_after: None,
        sweep_interval: Duration::from_millis(10),
        mode: RefreshMode::Background,
    };
    let cache = SingleFlightCache::new("background", settings, move |_key: u32| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, BoxError>(n) }
    });

    assert_eq!(cache.get(&1).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(calls.load(Ordering::SeqCst) >= 2);
    assert!(cache.get(&1).await.unwrap() >= 1);

    cache.shutdown();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let after_shutdown = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_shutdown);
}
