use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use surgecache_service::caching::{CacheError, ResourceType};
use surgecache_service::service::CacheService;
use surgecache_service::types::{Artifact, ReportKind};

use crate::{CountingGenerator, harness, test};

#[tokio::test(start_paused = true)]
async fn test_write_through_then_get() {
    let h = harness();
    let key = h
        .service
        .key(ResourceType::TriggerSession, ["2025-11-06", "morning"])
        .unwrap();
    let session = test::trigger_session("2025-11-06", "morning");

    assert_eq!(h.service.get(&key).await, None);
    h.service
        .write_through(&key, &session, &["market:KOSPI"])
        .await
        .unwrap();

    assert_eq!(h.service.get(&key).await, Some(session));
    assert!(h.durable.contains(&key));
}

#[tokio::test(start_paused = true)]
async fn test_analysis_expires_after_a_day() {
    let h = harness();
    let key = h
        .service
        .key(ResourceType::Analysis, ["005930", "2025-11-06"])
        .unwrap();
    assert_eq!(key.to_string(), "cache:analysis:005930:2025-11-06:v1");
    let analysis = test::analysis("005930", "2025-11-06");

    h.service
        .write_through(&key, &analysis, &["ticker:005930"])
        .await
        .unwrap();
    assert_eq!(h.service.get(&key).await, Some(analysis.clone()));

    tokio::time::advance(Duration::from_secs(86399)).await;
    assert_eq!(h.service.get(&key).await, Some(analysis));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(h.service.get(&key).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_generate_once() {
    let h = harness();
    let generator = CountingGenerator::new(Duration::from_secs(3));
    let key = h
        .service
        .key(ResourceType::Analysis, ["005930", "2025-11-06"])
        .unwrap();
    let analysis = test::analysis("005930", "2025-11-06");

    let results = join_all((0..16).map(|_| {
        h.service.read_through_durable(
            &key,
            &["ticker:005930"],
            generator.generate(analysis.clone()),
        )
    }))
    .await;

    assert_eq!(generator.calls(), 1);
    assert_eq!(h.durable.writes(), 1);
    for result in results {
        assert_eq!(result, Ok(analysis.clone()));
    }

    // served from the cache from now on
    let result = h
        .service
        .read_through_durable(&key, &["ticker:005930"], generator.generate(analysis.clone()))
        .await;
    assert_eq!(result, Ok(analysis));
    assert_eq!(generator.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_failures_are_shared_and_not_cached() {
    let h = harness();
    let generator = CountingGenerator::new(Duration::from_secs(3));
    let key = h
        .service
        .key(ResourceType::Analysis, ["005930", "2025-11-06"])
        .unwrap();

    let results = join_all((0..8).map(|_| {
        h.service
            .read_through_durable(&key, &["ticker:005930"], generator.fail("llm timed out"))
    }))
    .await;

    assert_eq!(generator.calls(), 1);
    for result in results {
        assert_eq!(
            result,
            Err(CacheError::GenerationFailed("llm timed out".into()))
        );
    }

    // failures are not remembered, the next read generates again
    let analysis = test::analysis("005930", "2025-11-06");
    let result = h
        .service
        .read_through_durable(&key, &["ticker:005930"], generator.generate(analysis.clone()))
        .await;
    assert_eq!(result, Ok(analysis));
    assert_eq!(generator.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_durable_hit_skips_generator() {
    let h = harness();
    let generator = CountingGenerator::default();
    let key = h
        .service
        .key(ResourceType::StockMetadata, ["005930"])
        .unwrap();
    let metadata = test::stock_metadata("005930", "IT");
    h.durable.insert(&key, metadata.clone());

    let result = h
        .service
        .read_through_durable(&key, &["sector:IT"], generator.fail("unreachable"))
        .await;
    assert_eq!(result, Ok(metadata.clone()));
    assert_eq!(generator.calls(), 0);

    // the durable hit was written back into the cache
    assert_eq!(h.service.get(&key).await, Some(metadata));
    assert_eq!(h.durable.reads(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_custom_fetch() {
    let h = harness();
    let generator = CountingGenerator::default();
    let key = h
        .service
        .key(ResourceType::MarketReport, ["KOSPI", "2025-11-06", "close"])
        .unwrap();
    let report = test::market_report("KOSPI", "2025-11-06", ReportKind::Close);

    let fetch = async { Err::<Option<Artifact>, _>(anyhow::anyhow!("replica is lagging")) };
    let result = h
        .service
        .read_through(&key, &["market:KOSPI"], fetch, generator.generate(report.clone()))
        .await;

    // a failing fetch falls through to the generator
    assert_eq!(result, Ok(report));
    assert_eq!(generator.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_store_unavailable_degrades() {
    test::setup();
    let durable = Arc::new(test::MemoryDurableStore::new());
    let service = CacheService::with_stores(
        test::settings(),
        Arc::new(test::UnavailableStore),
        Some(durable.clone()),
    )
    .unwrap();
    let generator = CountingGenerator::default();
    let key = service
        .key(ResourceType::Analysis, ["005930", "2025-11-06"])
        .unwrap();
    let analysis = test::analysis("005930", "2025-11-06");

    for _ in 0..2 {
        let result = service
            .read_through_durable(&key, &["ticker:005930"], generator.generate(analysis.clone()))
            .await;
        assert_eq!(result, Ok(analysis.clone()));
    }

    // the first read generated, the second one was served by the durable store
    assert_eq!(generator.calls(), 1);
    assert_eq!(durable.reads(), 2);
    assert_eq!(service.get(&key).await, None);

    service
        .write_through(&key, &analysis, &["ticker:005930"])
        .await
        .unwrap();
    assert!(service.invalidate(&key).await.failed.len() == 1);
}

#[tokio::test(start_paused = true)]
async fn test_leader_cancellation_fails_waiters() {
    let h = harness();
    let generator = CountingGenerator::new(Duration::from_secs(60));
    let key = h
        .service
        .key(ResourceType::Analysis, ["005930", "2025-11-06"])
        .unwrap();
    let analysis = test::analysis("005930", "2025-11-06");

    let spawn_read = |service: CacheService| {
        let key = key.clone();
        let generator = generator.clone();
        let analysis = analysis.clone();
        tokio::spawn(async move {
            service
                .read_through_durable(&key, &["ticker:005930"], generator.generate(analysis))
                .await
        })
    };

    let leader = spawn_read(h.service.clone());
    tokio::time::sleep(Duration::from_secs(1)).await;
    let waiter = spawn_read(h.service.clone());
    tokio::time::sleep(Duration::from_secs(1)).await;

    leader.abort();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(CacheError::GenerationFailed(_))));
    assert_eq!(generator.calls(), 1);
    assert_eq!(h.service.get(&key).await, None);
}

#[tokio::test]
async fn test_malformed_input() {
    let h = harness();
    assert!(matches!(
        h.service.key(ResourceType::Analysis, ["005930"]),
        Err(CacheError::MalformedKey(_))
    ));
    assert!(matches!(
        h.service.key(ResourceType::StockMetadata, ["00:5930"]),
        Err(CacheError::MalformedKey(_))
    ));

    let key = h
        .service
        .key(ResourceType::StockMetadata, ["005930"])
        .unwrap();
    let metadata = test::stock_metadata("005930", "IT");
    assert!(matches!(
        h.service.write_through(&key, &metadata, &["IT"]).await,
        Err(CacheError::MalformedKey(_))
    ));

    // the artifact has to match the resource type of the key
    let analysis = test::analysis("005930", "2025-11-06");
    assert!(matches!(
        h.service.write_through(&key, &analysis, &["sector:IT"]).await,
        Err(CacheError::MalformedKey(_))
    ));
    assert_eq!(h.service.get(&key).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_metrics_snapshot() {
    let h = harness();
    let generator = CountingGenerator::default();
    let key = h
        .service
        .key(ResourceType::StockMetadata, ["005930"])
        .unwrap();
    let metadata = test::stock_metadata("005930", "IT");

    h.service
        .read_through_durable(&key, &["sector:IT"], generator.generate(metadata.clone()))
        .await
        .unwrap();
    for _ in 0..3 {
        h.service.get(&key).await.unwrap();
    }

    let snapshot = h.service.metrics_snapshot().await;
    assert_eq!(snapshot.hits, 3);
    assert_eq!(snapshot.misses, 1);
    assert_eq!(snapshot.hit_rate, 0.75);
    assert!(snapshot.memory_used > 0);
    assert!(snapshot.memory_percent > 0.0);
}
