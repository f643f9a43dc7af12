//! Surgecache.
//!
//! Surgecache is the caching and invalidation service in front of surge-stock triggers, generated
//! company analyses and market reports. It keeps the durable store and the generation pipeline out
//! of the hot path, and evicts entries on price shocks, disclosures and memory pressure.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod cli;
mod logging;
mod run;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
