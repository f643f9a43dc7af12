//! The caching and invalidation engine behind surgecache.
//!
//! Surgecache serves derived artifacts (surge-stock trigger sessions, generated company
//! analyses, market open/close reports) to many concurrent readers, keeping a slower durable
//! store and a costly generator out of the hot path. See the [`caching`] module for how the
//! individual layers fit together, and [`service::CacheService`] for the operations exposed to
//! callers.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod durable;
pub mod logging;
pub mod service;
pub mod types;
mod utils;
