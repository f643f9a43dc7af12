use std::time::Duration;

use surgecache_service::caching::{ResourceType, WarmItem, WarmReport};
use surgecache_service::config::{CacheSettings, Config};
use surgecache_service::service::CacheService;
use surgecache_service::types::{Artifact, RateLimitCounter};
use tokio_util::sync::CancellationToken;

use crate::{harness, harness_with, test};

fn warm_item(ticker: &str) -> WarmItem {
    WarmItem {
        resource_type: ResourceType::StockMetadata,
        ids: vec![ticker.to_owned()],
        tags: vec!["sector:IT".to_owned()],
        payload: test::stock_metadata(ticker, "IT"),
    }
}

#[tokio::test]
async fn test_warm() {
    let h = harness();
    let mut items: Vec<_> = ["005930", "000660", "035420"]
        .into_iter()
        .map(warm_item)
        .collect();
    // the payload does not match the resource type
    items.push(WarmItem {
        resource_type: ResourceType::Analysis,
        ids: vec!["005930".into(), "2025-11-06".into()],
        tags: vec![],
        payload: test::stock_metadata("005930", "IT"),
    });

    let report = h.service.warm(items, &CancellationToken::new()).await;
    assert_eq!(
        report,
        WarmReport {
            written: 3,
            failed: 1,
            skipped: 0
        }
    );

    let key = h
        .service
        .key(ResourceType::StockMetadata, ["000660"])
        .unwrap();
    assert!(h.service.get(&key).await.is_some());
    assert_eq!(h.durable.writes(), 3);

    let report = h.service.invalidate_by_tag("sector:IT").await.unwrap();
    assert_eq!(report.deleted, 3);
}

#[tokio::test(start_paused = true)]
async fn test_memory_guard_evicts_nearest_expiry() {
    let h = harness_with(CacheSettings {
        max_memory_bytes: 4096,
        eviction_assist_threshold_percent: 10.0,
        eviction_assist_batch_size: 2,
        ..test::settings()
    });

    let tickers = ["000001", "000002", "000003", "000004", "000005"];
    for ticker in tickers {
        let key = h
            .service
            .key(ResourceType::StockMetadata, [ticker])
            .unwrap();
        h.service
            .write_through(&key, &test::stock_metadata(ticker, "IT"), &["sector:IT"])
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
    }

    let check = h.service.check_memory().await;
    assert!(check.over_threshold);
    assert_eq!(check.evicted, 2);

    let mut remaining = Vec::new();
    for ticker in tickers {
        let key = h
            .service
            .key(ResourceType::StockMetadata, [ticker])
            .unwrap();
        if h.service.get(&key).await.is_some() {
            remaining.push(ticker);
        }
    }
    assert_eq!(remaining, ["000003", "000004", "000005"]);
}

#[tokio::test(start_paused = true)]
async fn test_tag_sweep_drops_expired() {
    let h = harness();
    let key = h
        .service
        .key(ResourceType::RateLimit, ["vip-client"])
        .unwrap();
    let counter = Artifact::RateLimit(RateLimitCounter {
        count: 17,
        window_started_at: chrono::Utc::now(),
    });
    h.service
        .write_through(&key, &counter, &["client:vip-client"])
        .await
        .unwrap();

    assert_eq!(h.service.sweep_tags().await.dropped_refs, 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    let stats = h.service.sweep_tags().await;
    assert_eq!(stats.dropped_refs, 1);
    assert_eq!(stats.dropped_tags, 1);
}

#[tokio::test(start_paused = true)]
async fn test_background_tasks_stop_on_cancel() {
    let h = harness();
    let token = CancellationToken::new();
    let handles = h.service.spawn_background(&token);
    assert_eq!(handles.len(), 3);

    tokio::time::sleep(Duration::from_secs(5)).await;
    token.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_metrics() {
    let h = harness();
    let key = h
        .service
        .key(ResourceType::StockMetadata, ["005930"])
        .unwrap();
    h.service
        .write_through(&key, &test::stock_metadata("005930", "IT"), &["sector:IT"])
        .await
        .unwrap();
    h.service.get(&key).await.unwrap();

    let closed = h.service.shutdown().await;
    assert_eq!(closed.hits, 1);
    assert_eq!(h.service.metrics_snapshot().await.hits, 0);
}

#[tokio::test]
async fn test_create_with_durable_dir() {
    test::setup();
    let durable_dir = test::tempdir();
    let config = Config {
        durable_dir: Some(durable_dir.path().to_owned()),
        cache: test::settings(),
        ..Default::default()
    };
    let service = CacheService::create(&config).unwrap();

    let key = service
        .key(ResourceType::StockMetadata, ["005930"])
        .unwrap();
    service
        .write_through(&key, &test::stock_metadata("005930", "IT"), &["sector:IT"])
        .await
        .unwrap();
    assert!(durable_dir.path().join(key.cache_path()).is_file());

    // a fresh service finds the artifact in the durable store
    let service = CacheService::create(&config).unwrap();
    let generator = test::CountingGenerator::default();
    let artifact = service
        .read_through_durable(&key, &["sector:IT"], generator.fail("unreachable"))
        .await
        .unwrap();
    assert_eq!(artifact, test::stock_metadata("005930", "IT"));
    assert_eq!(generator.calls(), 0);
}
