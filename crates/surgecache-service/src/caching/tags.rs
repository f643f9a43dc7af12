use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use super::{CacheEntry, CacheError, CacheKey, CacheStore};
use crate::utils::shard_amount;

/// The keys of one tag, each with the generation it was last tagged at.
type TaggedKeys = HashMap<CacheKey, u64>;

/// Checks that `tag` has the `{kind}:{value}` form, for example `sector:IT`.
pub fn validate_tag(tag: &str) -> CacheEntry<()> {
    match tag.split_once(':') {
        Some((kind, value)) if !kind.is_empty() && !value.is_empty() => Ok(()),
        _ => Err(CacheError::MalformedKey(format!(
            "tag `{tag}` is not of the form `kind:value`"
        ))),
    }
}

/// Outcome of a [`TagIndex::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Dangling key references that were dropped.
    pub dropped_refs: usize,
    /// Tags that became empty and were dropped.
    pub dropped_tags: usize,
}

/// A back-reference index from tags to the cache keys carrying them.
///
/// The index is best effort: it can reference keys that have since expired or were evicted, and
/// consumers have to tolerate that. Such stale references are cleaned up by invalidation passes
/// and by a periodic [`sweep`](Self::sweep).
///
/// Every reference carries the generation it was (re-)tagged at. Cleanups only ever drop
/// references that are older than the point at which they looked at the store, so a key that is
/// written and tagged concurrently stays reachable through its tags.
pub struct TagIndex {
    tags: DashMap<String, TaggedKeys, FxBuildHasher>,
    generation: AtomicU64,
}

impl fmt::Debug for TagIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagIndex")
            .field("tags", &self.tags.len())
            .field("generation", &self.generation)
            .finish()
    }
}

impl TagIndex {
    /// Creates an empty index, spread over about `shards` locks.
    pub fn new(shards: usize) -> Self {
        Self {
            tags: DashMap::with_hasher_and_shard_amount(FxBuildHasher, shard_amount(shards)),
            generation: AtomicU64::new(0),
        }
    }

    /// The generation the next tagging will get.
    ///
    /// All references existing right now are older than this.
    pub fn watermark(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Associates `key` with all of the given `tags`.
    pub fn tag<S: AsRef<str>>(&self, key: &CacheKey, tags: &[S]) {
        if tags.is_empty() {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel);
        for tag in tags {
            self.tags
                .entry(tag.as_ref().to_owned())
                .or_default()
                .insert(key.clone(), generation);
        }
    }

    /// Returns all keys currently associated with `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> Vec<CacheKey> {
        self.tags
            .get(tag)
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes the given keys from every tag set, unless they were tagged at or after `before`.
    ///
    /// Tags left empty are dropped.
    pub fn untag_everywhere(&self, keys: &[CacheKey], before: u64) {
        if keys.is_empty() {
            return;
        }
        self.tags.retain(|_, tagged| {
            for key in keys {
                if tagged.get(key).is_some_and(|generation| *generation < before) {
                    tagged.remove(key);
                }
            }
            !tagged.is_empty()
        });
    }

    /// The number of tags with at least one key.
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Drops all references to keys which are no longer in `store`, and all tags left empty.
    ///
    /// Keys whose existence can not be determined because the store is unavailable are kept, as
    /// are keys that were tagged again while the sweep was checking them.
    pub async fn sweep(&self, store: &dyn CacheStore) -> SweepStats {
        let mut stats = SweepStats::default();

        // Snapshot first, so no lock is held while talking to the store.
        let snapshot: Vec<(String, Vec<(CacheKey, u64)>)> = self
            .tags
            .iter()
            .map(|entry| {
                let refs = entry.value().iter().map(|(k, g)| (k.clone(), *g)).collect();
                (entry.key().clone(), refs)
            })
            .collect();

        for (tag, refs) in snapshot {
            let mut dangling = Vec::new();
            for (key, generation) in refs {
                match store.exists(&key).await {
                    Ok(false) => dangling.push((key, generation)),
                    Ok(true) => {}
                    Err(error) => {
                        tracing::debug!(%key, %error, "Could not check tagged key during sweep");
                    }
                }
            }
            if dangling.is_empty() {
                continue;
            }

            if let Some(mut tagged) = self.tags.get_mut(&tag) {
                for (key, generation) in &dangling {
                    if tagged.get(key) == Some(generation) {
                        tagged.remove(key);
                        stats.dropped_refs += 1;
                    }
                }
            }
            if self.tags.remove_if(&tag, |_, tagged| tagged.is_empty()).is_some() {
                stats.dropped_tags += 1;
            }
        }

        stats
    }
}
