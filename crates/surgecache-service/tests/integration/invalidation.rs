use surgecache_service::caching::{CacheError, ResourceType};

use crate::{CountingGenerator, harness, test};

#[tokio::test]
async fn test_invalidate_by_tag() {
    let h = harness();
    let [a, b, c] = ["005930", "000660", "035420"]
        .map(|ticker| h.service.key(ResourceType::StockMetadata, [ticker]).unwrap());

    for key in [&a, &b] {
        let ticker = &key.identifiers()[0];
        h.service
            .write_through(key, &test::stock_metadata(ticker, "IT"), &["sector:IT"])
            .await
            .unwrap();
    }
    h.service
        .write_through(&c, &test::stock_metadata("035420", "SVC"), &["sector:SVC"])
        .await
        .unwrap();

    let report = h.service.invalidate_by_tag("sector:IT").await.unwrap();
    assert_eq!(report.deleted, 2);
    assert!(report.is_complete());

    assert_eq!(h.service.get(&a).await, None);
    assert_eq!(h.service.get(&b).await, None);
    assert!(h.service.get(&c).await.is_some());

    // invalidating again is harmless
    let report = h.service.invalidate_by_tag("sector:IT").await.unwrap();
    assert_eq!(report.deleted, 0);

    assert!(matches!(
        h.service.invalidate_by_tag("IT").await,
        Err(CacheError::MalformedKey(_))
    ));
}

#[tokio::test]
async fn test_price_shock_invalidates_all_analyses() {
    let h = harness();
    let dates = ["2025-11-04", "2025-11-05", "2025-11-06"];
    let mut shocked = Vec::new();
    for date in dates {
        let key = h
            .service
            .key(ResourceType::Analysis, ["005930", date])
            .unwrap();
        h.service
            .write_through(&key, &test::analysis("005930", date), &["ticker:005930"])
            .await
            .unwrap();
        shocked.push(key);
    }

    // entries of an older version are covered as well
    h.service.bump_version();
    let key = h
        .service
        .key(ResourceType::Analysis, ["005930", "2025-11-06"])
        .unwrap();
    h.service
        .write_through(&key, &test::analysis("005930", "2025-11-06"), &["ticker:005930"])
        .await
        .unwrap();
    shocked.push(key);

    let other = h
        .service
        .key(ResourceType::Analysis, ["000660", "2025-11-06"])
        .unwrap();
    h.service
        .write_through(&other, &test::analysis("000660", "2025-11-06"), &["ticker:000660"])
        .await
        .unwrap();
    let metadata = h
        .service
        .key(ResourceType::StockMetadata, ["005930"])
        .unwrap();
    h.service
        .write_through(&metadata, &test::stock_metadata("005930", "IT"), &["sector:IT"])
        .await
        .unwrap();

    // below the threshold nothing happens
    assert_eq!(h.service.on_price_change("005930", 9.5).await, Ok(None));
    assert!(h.service.get(&shocked[0]).await.is_some());

    let report = h
        .service
        .on_price_change("005930", -10.0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.deleted, 4);
    for key in &shocked {
        assert_eq!(h.service.get(key).await, None);
    }
    assert!(h.service.get(&other).await.is_some());
    assert!(h.service.get(&metadata).await.is_some());
}

#[tokio::test]
async fn test_disclosure_invalidates_metadata() {
    let h = harness();
    let analysis = h
        .service
        .key(ResourceType::Analysis, ["005930", "2025-11-06"])
        .unwrap();
    let metadata = h
        .service
        .key(ResourceType::StockMetadata, ["005930"])
        .unwrap();
    h.service
        .write_through(&analysis, &test::analysis("005930", "2025-11-06"), &["ticker:005930"])
        .await
        .unwrap();
    h.service
        .write_through(&metadata, &test::stock_metadata("005930", "IT"), &["ticker:005930"])
        .await
        .unwrap();

    let report = h
        .service
        .invalidate_by_event("disclosure", "005930")
        .await
        .unwrap();
    assert_eq!(report.deleted, 2);
    assert_eq!(h.service.get(&analysis).await, None);
    assert_eq!(h.service.get(&metadata).await, None);

    assert!(matches!(
        h.service.invalidate_by_event("earnings", "005930").await,
        Err(CacheError::MalformedKey(_))
    ));
}

#[tokio::test]
async fn test_invalidation_is_cache_only() {
    let h = harness();
    let generator = CountingGenerator::default();
    let key = h
        .service
        .key(ResourceType::Analysis, ["005930", "2025-11-06"])
        .unwrap();
    let analysis = test::analysis("005930", "2025-11-06");

    h.service
        .write_through(&key, &analysis, &["ticker:005930"])
        .await
        .unwrap();
    let report = h.service.invalidate(&key).await;
    assert_eq!(report.deleted, 1);
    assert_eq!(h.service.get(&key).await, None);

    // the durable store still has it, no regeneration needed
    assert!(h.durable.contains(&key));
    let result = h
        .service
        .read_through_durable(&key, &["ticker:005930"], generator.fail("unreachable"))
        .await;
    assert_eq!(result, Ok(analysis));
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn test_bump_version_misses_without_deleting() {
    let h = harness();
    let old = h
        .service
        .key(ResourceType::StockMetadata, ["005930"])
        .unwrap();
    h.service
        .write_through(&old, &test::stock_metadata("005930", "IT"), &["sector:IT"])
        .await
        .unwrap();

    assert_eq!(h.service.bump_version(), 2);
    let new = h
        .service
        .key(ResourceType::StockMetadata, ["005930"])
        .unwrap();
    assert_ne!(old, new);
    assert_eq!(new.version(), Some(2));

    assert_eq!(h.service.get(&new).await, None);
    // the old entry is left to expire on its own
    assert!(h.service.get(&old).await.is_some());
}
