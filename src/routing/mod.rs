//! Request routing
//!
//! Single-shard requests (store/delete/fetch by unique id) resolve exactly
//! one owning node; cross-shard requests resolve the node serving every
//! shard of every touched index and fan out in parallel. Both share the
//! same resolution logic: hash or enumerate shards, then pick a node per
//! shard through the selector.

pub mod federator;
pub mod router;

pub use federator::RequestFederator;
pub use router::RequestRouter;

/// Map a document's unique id to its owning shard.
///
/// Uses seahash — a fixed, published algorithm — rather than any
/// language-default string hash, so the assignment is stable across
/// process restarts and across client implementations.
pub fn shard_for_unique_id(unique_id: &str, number_of_shards: u32) -> u32 {
    if number_of_shards == 0 {
        return 0;
    }
    (seahash::hash(unique_id.as_bytes()) % u64::from(number_of_shards)) as u32
}
