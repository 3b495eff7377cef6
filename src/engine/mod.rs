//! Per-shard index engine boundary
//!
//! The embedded text index (tokenizing, scoring, storing documents,
//! evaluating a query against one shard) is an external collaborator. The
//! routing layer only ever calls through these traits and never touches
//! the underlying storage format.

use std::sync::Arc;

use crate::types::{
    IndexSettings, SearchQuery, ShardQueryResult, StoredDocument, TermCount, TermsRequest,
};
use crate::Result;

pub mod memory;

/// Factory for per-shard engine instances, one `SearchEngine` per node.
pub trait SearchEngine: Send + Sync {
    /// Open (or create) the engine state backing one shard.
    fn open_shard(
        &self,
        settings: &IndexSettings,
        shard_number: u32,
    ) -> Result<Arc<dyn EngineShard>>;
}

/// The mutable writer surface of one shard's engine state.
///
/// At most one `EngineShard` exists per shard per process; mutation order
/// is the order calls arrive here.
pub trait EngineShard: Send + Sync {
    /// Add or replace the document with this unique id
    fn index_document(&self, doc: StoredDocument) -> Result<()>;

    /// Remove the document with this unique id, if present
    fn delete_document(&self, unique_id: &str) -> Result<()>;

    /// Durably persist writer state; advances the committed version
    fn commit(&self) -> Result<()>;

    /// Compact the underlying store to at most `max_segments` segments
    fn force_merge(&self, max_segments: u32) -> Result<()>;

    /// Remove every document
    fn delete_all(&self) -> Result<()>;

    /// Monotonic version advanced by every commit. Snapshots expose the
    /// version they were built from, letting callers detect staleness
    /// without opening a new snapshot.
    fn committed_version(&self) -> u64;

    /// Build an immutable point-in-time view of the latest committed state
    fn open_snapshot(&self) -> Result<Arc<dyn EngineSnapshot>>;

    fn close(&self) -> Result<()>;
}

/// An immutable, point-in-time searchable view of one shard.
pub trait EngineSnapshot: Send + Sync {
    /// The committed version this snapshot was built from
    fn version(&self) -> u64;

    /// Evaluate a query, returning the shard's top `amount` hits
    fn search(&self, query: &SearchQuery, amount: usize) -> Result<ShardQueryResult>;

    /// Fetch one stored document by unique id
    fn fetch(&self, unique_id: &str) -> Result<Option<StoredDocument>>;

    /// Names of every field present in this shard
    fn field_names(&self) -> Result<Vec<String>>;

    /// Enumerate terms of one field with their frequencies
    fn terms(&self, request: &TermsRequest) -> Result<Vec<TermCount>>;

    fn doc_count(&self) -> Result<u64>;

    /// Unique ids of every stored document; consumed by reindex passes
    fn document_ids(&self) -> Result<Vec<String>>;
}
