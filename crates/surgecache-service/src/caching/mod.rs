//! # Surgecache Caching infrastructure
//!
//! Trigger sessions, company analyses and market reports are expensive to produce: a single
//! analysis is a call into a language model taking seconds, and the durable store is orders of
//! magnitude slower than what a reader waiting on a dashboard expects. This module contains all
//! the layers that keep those sources out of the hot path, our central [`CacheError`] type, and an
//! explanation of how the pieces interact.
//!
//! ## Cache Layers
//!
//! - A [`CacheStore`] holding serialized artifacts with a per-entry time-to-live. The store owns
//!   expiry and enforces a hard memory limit through its native eviction policy.
//!   [`InMemoryStore`] is the implementation living inside this process.
//! - The durable store, which is the source of truth and is only ever written through, never
//!   invalidated. See [`crate::durable`].
//! - The generator, producing a fresh artifact when nothing else has it.
//!
//! A read goes through the following steps, implemented by [`CacheAside`]:
//! - First, it looks up the cache store, and returns on a hit.
//! - On miss, the request is coalesced with all concurrent requests for the same key by the
//!   [`SingleFlight`] orchestrator. Only one of them continues.
//! - That one tries the durable store, and on miss runs the generator.
//! - A freshly generated artifact is written to the durable store. Either way, the artifact is
//!   written to the cache store and associated with its tags in the [`TagIndex`].
//!
//! Failures of the generator are handed to every coalesced caller, and are never cached.
//!
//! ## Keys and Versions
//!
//! A [`CacheKey`] is `{namespace}:{resource_type}:{id1}:{id2}:...[:v{version}]`. The number of
//! identifiers is fixed per [`ResourceType`]. Changing the serialized form of an artifact is done
//! by bumping the global version: all newly built keys change, and entries under the old version
//! are never read again and expire on their own.
//!
//! ## Invalidation
//!
//! Entries leave the cache in one of these ways:
//!
//! - They expire once their [`TtlPolicy`] time-to-live has elapsed.
//! - An event, like a price shock or a disclosure, invalidates all entries about a stock, across
//!   all dates and versions. See [`InvalidationCoordinator::invalidate_by_event`].
//! - All entries carrying a tag, like `sector:IT`, are invalidated at once.
//! - The [`MemoryGuard`] evicts the entries closest to their expiry once memory usage crosses a
//!   soft threshold.
//! - The store evicts entries on its own when reaching its hard limit.
//!
//! The tag index is best effort. References to entries that expired or were evicted are tolerated
//! and cleaned up periodically by [`TagIndex::sweep`].
//!
//! ### Metrics
//!
//! These metrics are collected, most of them tagged with the `resource` type:
//!
//! - `caches.access`: All accesses, tagged with `hit`.
//! - `caches.access.duration`: The latency of cache lookups.
//! - `caches.single_flight.leader` / `caches.single_flight.coalesced`: Computations run, and
//!   callers that waited for a computation of another caller instead.
//! - `caches.durable.hit` / `caches.durable.miss`: Lookups of the durable store.
//! - `caches.generation.duration` / `caches.generation.failed`: Runs of the generator.
//! - `caches.store.unavailable`: Operations bypassing an unreachable cache store.
//! - `caches.invalidation.deleted` / `caches.invalidation.failed`: Invalidated entries.
//! - `caches.memory.used` / `caches.memory.percent`: Sampled by the memory guard.
//! - `caches.memory.evicted`: Entries evicted by the memory guard.
//!
//! In addition, [`MetricsRecorder`] keeps an in-process window of hits, misses and latency
//! percentiles, which is rolled over periodically.

mod cache_error;
mod cache_key;
mod computation;
mod invalidation;
mod memory;
mod memory_guard;
mod policy;
mod read_through;
mod recorder;
mod store;
mod tags;
mod warm;

pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::{CacheKey, CacheKeyBuilder, KeyPrefix, SEPARATOR};
pub use computation::SingleFlight;
pub use invalidation::{EventKind, InvalidationCoordinator, InvalidationReport};
pub use memory::InMemoryStore;
pub use memory_guard::{MemoryCheck, MemoryGuard, MemoryGuardConfig};
pub use policy::{ResourceType, TtlPolicy};
pub use read_through::CacheAside;
pub use recorder::{MetricsRecorder, MetricsSnapshot};
pub use store::{CacheStore, MemoryUsage};
pub use tags::{SweepStats, TagIndex, validate_tag};
pub use warm::{WarmItem, WarmReport, warm};
