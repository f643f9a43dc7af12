pub mod defer;
pub mod periodic;

/// The number of lock shards for a map spread over about `buckets` locks.
///
/// `dashmap` requires a power of two larger than one.
pub fn shard_amount(buckets: usize) -> usize {
    buckets.max(2).next_power_of_two()
}
