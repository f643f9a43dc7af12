use std::sync::Arc;

use surgecache_service::caching::InMemoryStore;
use surgecache_service::config::CacheSettings;
use surgecache_service::service::CacheService;
use surgecache_test::MemoryDurableStore;

pub use surgecache_test::{self as test, CountingGenerator};

/// Everything a test needs to poke at the service from the outside.
pub struct Harness {
    pub service: CacheService,
    pub store: Arc<InMemoryStore>,
    pub durable: Arc<MemoryDurableStore>,
}

/// Creates a service with an in-memory cache and an in-memory durable store.
pub fn harness_with(settings: CacheSettings) -> Harness {
    test::setup();

    let store = Arc::new(InMemoryStore::new("test", settings.max_memory_bytes));
    let durable = Arc::new(MemoryDurableStore::new());
    let service =
        CacheService::with_stores(settings, store.clone(), Some(durable.clone())).unwrap();

    Harness {
        service,
        store,
        durable,
    }
}

pub fn harness() -> Harness {
    harness_with(test::settings())
}
