//! Feed cache behaviour under concurrency and over (virtual) time.

mod common;

use common::CountingSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use weatherdash::config::{FeedConfig, POLL_FLOOR};
use weatherdash::FeedCache;

fn config(poll_interval_ms: u64) -> FeedConfig {
    FeedConfig {
        poll_interval_ms,
        ..FeedConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_share_one_fetch() {
    let source = Arc::new(CountingSource::new(Duration::from_millis(100)));
    let cache = FeedCache::new(source.clone(), &config(60_000));

    let readers: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_snapshot().await })
        })
        .collect();

    let mut snapshots = Vec::new();
    for reader in readers {
        snapshots.push(reader.await.unwrap());
    }

    assert_eq!(source.count(), 1);
    assert_eq!(cache.upstream_fetches(), 1);
    for snap in &snapshots {
        assert_eq!(snap.rainfall.latest_value, Some(1.0));
        assert_eq!(snap, &snapshots[0]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_refreshes_never_overlap() {
    let source = Arc::new(CountingSource::new(Duration::from_millis(50)));
    let cache = FeedCache::new(source.clone(), &config(60_000));

    // Two waves: the second starts after the first refresh has finished.
    let first = futures::future::join_all((0..8).map(|_| cache.refresh())).await;
    let second = futures::future::join_all((0..8).map(|_| cache.refresh())).await;

    assert_eq!(source.count(), 2);
    assert!(first.iter().all(|s| s.rainfall.latest_value == Some(1.0)));
    assert!(second.iter().all(|s| s.rainfall.latest_value == Some(2.0)));
}

#[tokio::test(start_paused = true)]
async fn snapshot_refreshes_only_when_stale() {
    let source = Arc::new(CountingSource::new(Duration::ZERO));
    let cache = FeedCache::new(source.clone(), &config(60_000));

    cache.get_snapshot().await;
    assert_eq!(source.count(), 1);

    tokio::time::sleep(Duration::from_secs(59)).await;
    cache.get_snapshot().await;
    assert_eq!(source.count(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let snap = cache.get_snapshot().await;
    assert_eq!(source.count(), 2);
    assert_eq!(snap.rainfall.latest_value, Some(2.0));
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_also_resets_staleness() {
    let source = Arc::new(CountingSource::failing(Duration::ZERO));
    let cache = FeedCache::new(source.clone(), &config(60_000));

    let snap = cache.get_snapshot().await;
    assert!(snap.last_error.as_deref().unwrap().contains("fetch 1 failed"));

    // A down upstream is not hammered by readers.
    for _ in 0..5 {
        cache.get_snapshot().await;
    }
    assert_eq!(source.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn poll_interval_is_floored() {
    let source = Arc::new(CountingSource::new(Duration::ZERO));
    let cache = FeedCache::new(source.clone(), &config(1_000));
    assert_eq!(cache.poll_interval(), POLL_FLOOR);

    assert!(cache.start_polling());
    assert!(!cache.start_polling());

    // First tick fires immediately.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(source.count(), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(source.count(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(source.count(), 2);
    assert_eq!(cache.cached().poll_interval_ms, 60_000);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_polling() {
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let source = Arc::new(CountingSource::new(Duration::ZERO));
    let cache = FeedCache::new(source.clone(), &config(60_000)).with_shutdown(shutdown_rx);
    cache.start_polling();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(source.count(), 1);

    shutdown_tx.send(()).unwrap();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(source.count(), 1);
}
