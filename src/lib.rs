//! Fathom - a sharded, replicated document search engine
//!
//! Fathom partitions documents into shards, replicates shards across
//! nodes, and routes every operation to an available copy:
//! - Deterministic shard assignment from document ids
//! - Primary/replica selection under partial node failure
//! - Parallel fan-out of cross-shard operations with result aggregation
//! - Near-real-time shard snapshots safe under concurrent writes
//! - A query result cache kept consistent with shard commits

pub mod blob;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod manager;
pub mod remote;
pub mod routing;
pub mod shard;
pub mod types;

pub use error::{Error, Result};
