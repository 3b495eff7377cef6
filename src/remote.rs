//! Remote execution boundary
//!
//! Dispatching a sub-request to another node goes through `RemoteClient`.
//! Wire framing and serialization are the implementor's concern; the
//! routing layer only sees typed operations. Implementations must map
//! transport-level failures (peer unreachable, malformed response, error
//! status) to `Error::RemoteExecutionFailure` so remote faults share the
//! local error taxonomy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{
    Node, QueryRequest, ShardQueryResult, StoredDocument, TermCount, TermsRequest,
};
use crate::Result;

/// The slice of a federated call served by one node: which shards of which
/// index that node must evaluate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRouting {
    pub index_name: String,
    pub shards: Vec<u32>,
}

/// Typed per-operation remote execution interface.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Store a document on the node owning its shard
    async fn store(&self, node: &Node, index_name: &str, doc: StoredDocument) -> Result<()>;

    /// Delete a document (and optionally its associated blobs)
    async fn delete(
        &self,
        node: &Node,
        index_name: &str,
        unique_id: &str,
        delete_blobs: bool,
    ) -> Result<()>;

    /// Fetch a stored document by unique id
    async fn fetch(
        &self,
        node: &Node,
        index_name: &str,
        unique_id: &str,
    ) -> Result<Option<StoredDocument>>;

    /// Evaluate the query against the routed shards, returning one partial
    /// result per shard
    async fn query(
        &self,
        node: &Node,
        routing: &[IndexRouting],
        request: &QueryRequest,
    ) -> Result<Vec<ShardQueryResult>>;

    /// Enumerate terms across the routed shards of one index
    async fn terms(
        &self,
        node: &Node,
        routing: &IndexRouting,
        request: &TermsRequest,
    ) -> Result<Vec<TermCount>>;

    /// List field names across the routed shards of one index
    async fn field_names(&self, node: &Node, routing: &IndexRouting) -> Result<Vec<String>>;

    /// Count documents across the routed shards of one index
    async fn doc_count(&self, node: &Node, routing: &IndexRouting) -> Result<u64>;

    /// Force-merge the routed shards then commit
    async fn optimize(
        &self,
        node: &Node,
        routing: &IndexRouting,
        max_segments: u32,
    ) -> Result<()>;

    /// Remove every document from the routed shards
    async fn clear(&self, node: &Node, routing: &IndexRouting) -> Result<()>;

    /// Rebuild the routed shards from their stored documents
    async fn reindex(&self, node: &Node, routing: &IndexRouting) -> Result<()>;
}
