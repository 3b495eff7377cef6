//! Multi-node integration tests
//!
//! Builds an in-process cluster: every node gets its own IndexManager, all
//! sharing one topology and one memory engine (standing in for replicated
//! shard storage), wired together by a loopback transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use fathom::blob::{BlobStore, LocalBlobStore};
use fathom::cluster::StaticTopology;
use fathom::engine::memory::MemoryEngine;
use fathom::manager::IndexManager;
use fathom::remote::{IndexRouting, RemoteClient};
use fathom::types::{
    Document, FieldValue, IndexMapping, IndexSettings, MasterSlaveSettings, Metadata, Node,
    QueryRequest, SearchQuery, ShardMapping, ShardQueryResult, StoredDocument, TermCount,
    TermsRequest,
};
use fathom::{Error, Result};

/// Loopback transport: each call executes against the peer's manager
/// in-process. Peers removed from the registry are unreachable, like a
/// killed process.
#[derive(Default)]
struct LoopbackTransport {
    peers: std::sync::RwLock<HashMap<Node, Arc<IndexManager>>>,
    calls: AtomicU64,
}

impl LoopbackTransport {
    fn register(&self, node: Node, manager: Arc<IndexManager>) {
        self.peers.write().unwrap().insert(node, manager);
    }

    fn kill(&self, node: &Node) {
        self.peers.write().unwrap().remove(node);
    }

    fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn peer(&self, node: &Node) -> Result<Arc<IndexManager>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.peers
            .read()
            .unwrap()
            .get(node)
            .cloned()
            .ok_or_else(|| Error::remote(node.to_string(), "peer unreachable"))
    }
}

#[async_trait]
impl RemoteClient for LoopbackTransport {
    async fn store(&self, node: &Node, index_name: &str, doc: StoredDocument) -> Result<()> {
        self.peer(node)?.internal_store(index_name, doc).await
    }

    async fn delete(
        &self,
        node: &Node,
        index_name: &str,
        unique_id: &str,
        delete_blobs: bool,
    ) -> Result<()> {
        self.peer(node)?
            .internal_delete(index_name, unique_id, delete_blobs)
            .await
    }

    async fn fetch(
        &self,
        node: &Node,
        index_name: &str,
        unique_id: &str,
    ) -> Result<Option<StoredDocument>> {
        self.peer(node)?.internal_fetch(index_name, unique_id).await
    }

    async fn query(
        &self,
        node: &Node,
        routing: &[IndexRouting],
        request: &QueryRequest,
    ) -> Result<Vec<ShardQueryResult>> {
        self.peer(node)?.internal_query(routing, request).await
    }

    async fn terms(
        &self,
        node: &Node,
        routing: &IndexRouting,
        request: &TermsRequest,
    ) -> Result<Vec<TermCount>> {
        self.peer(node)?.internal_terms(routing, request).await
    }

    async fn field_names(&self, node: &Node, routing: &IndexRouting) -> Result<Vec<String>> {
        self.peer(node)?.internal_field_names(routing).await
    }

    async fn doc_count(&self, node: &Node, routing: &IndexRouting) -> Result<u64> {
        self.peer(node)?.internal_doc_count(routing).await
    }

    async fn optimize(
        &self,
        node: &Node,
        routing: &IndexRouting,
        max_segments: u32,
    ) -> Result<()> {
        self.peer(node)?.internal_optimize(routing, max_segments).await
    }

    async fn clear(&self, node: &Node, routing: &IndexRouting) -> Result<()> {
        self.peer(node)?.internal_clear(routing).await
    }

    async fn reindex(&self, node: &Node, routing: &IndexRouting) -> Result<()> {
        self.peer(node)?.internal_reindex(routing).await
    }
}

struct TestCluster {
    _blob_dir: TempDir,
    topology: Arc<StaticTopology>,
    transport: Arc<LoopbackTransport>,
    managers: HashMap<Node, Arc<IndexManager>>,
}

impl TestCluster {
    /// Build a cluster from one index mapping; every node named in the
    /// mapping gets a manager with its shards loaded.
    async fn new(settings: IndexSettings, mapping: IndexMapping) -> Self {
        let blob_dir = TempDir::new().unwrap();

        let mut nodes: Vec<Node> = Vec::new();
        for shard_mapping in &mapping.shard_mappings {
            if !nodes.contains(&shard_mapping.primary) {
                nodes.push(shard_mapping.primary.clone());
            }
            for replica in &shard_mapping.replicas {
                if !nodes.contains(replica) {
                    nodes.push(replica.clone());
                }
            }
        }

        let topology = Arc::new(StaticTopology::new(nodes.clone()));
        topology.add_index(settings, mapping).await;

        let transport = Arc::new(LoopbackTransport::default());
        // One engine shared by every node: replicas observe primary
        // commits as a replication mechanism would provide.
        let engine = Arc::new(MemoryEngine::new());
        let blobs: Arc<dyn BlobStore> =
            Arc::new(LocalBlobStore::new(blob_dir.path()).unwrap());

        let mut managers = HashMap::new();
        for node in &nodes {
            let manager = Arc::new(IndexManager::new(
                node.clone(),
                topology.clone(),
                transport.clone(),
                engine.clone(),
                blobs.clone(),
                Duration::from_secs(5),
                Duration::from_millis(500),
            ));
            manager.load_indexes().await.unwrap();
            transport.register(node.clone(), manager.clone());
            managers.insert(node.clone(), manager);
        }

        Self {
            _blob_dir: blob_dir,
            topology,
            transport,
            managers,
        }
    }

    fn manager(&self, node: &Node) -> &Arc<IndexManager> {
        &self.managers[node]
    }

    /// Simulate a process death: drop from the active set and make the
    /// node unreachable through the transport.
    async fn kill(&self, node: &Node) {
        self.topology.mark_offline(node).await;
        self.transport.kill(node);
    }
}

fn node(name: &str) -> Node {
    Node::new(name, 32191)
}

fn doc(id: &str, title: &str) -> StoredDocument {
    StoredDocument {
        unique_id: id.to_string(),
        timestamp: 1,
        document: Document::new().with_field("title", FieldValue::String(title.to_string())),
        metadata: Metadata::default(),
    }
}

/// 1 index, 1 shard, 3 nodes: primary a, replicas b and c.
fn replicated_mapping() -> (IndexSettings, IndexMapping) {
    let settings = IndexSettings::new("articles", 1);
    let mapping = IndexMapping {
        index_name: "articles".to_string(),
        number_of_shards: 1,
        shard_mappings: vec![ShardMapping {
            shard_number: 0,
            primary: node("a"),
            replicas: vec![node("b"), node("c")],
        }],
    };
    (settings, mapping)
}

/// 1 index, 3 shards, primaries spread over a, b, c, no replicas.
fn spread_mapping() -> (IndexSettings, IndexMapping) {
    let settings = IndexSettings::new("articles", 3);
    let mapping = IndexMapping {
        index_name: "articles".to_string(),
        number_of_shards: 3,
        shard_mappings: ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(s, name)| ShardMapping {
                shard_number: s as u32,
                primary: node(name),
                replicas: vec![],
            })
            .collect(),
    };
    (settings, mapping)
}

#[tokio::test]
async fn test_store_routes_across_nodes_and_query_federates() {
    let (settings, mapping) = spread_mapping();
    let cluster = TestCluster::new(settings, mapping).await;
    let entry = cluster.manager(&node("a"));

    for i in 0..30 {
        entry
            .store("articles", doc(&format!("doc-{}", i), "rust shard routing"))
            .await
            .unwrap();
    }

    // Publish pending writes on every primary.
    entry.optimize("articles", 1).await.unwrap();

    let result = entry
        .query(QueryRequest::new("articles", SearchQuery::new("rust"), 50))
        .await
        .unwrap();
    assert_eq!(result.total_hits, 30);
    assert_eq!(result.results.len(), 30);

    let count = entry
        .get_number_of_docs("articles", MasterSlaveSettings::MasterIfAvailable)
        .await
        .unwrap();
    assert_eq!(count, 30);
}

#[tokio::test]
async fn test_fetch_routes_to_owning_node() {
    let (settings, mapping) = spread_mapping();
    let cluster = TestCluster::new(settings, mapping).await;
    let entry = cluster.manager(&node("b"));

    entry.store("articles", doc("the-doc", "find me")).await.unwrap();
    entry.optimize("articles", 1).await.unwrap();

    // Any node can serve the fetch regardless of where the shard lives.
    for name in ["a", "b", "c"] {
        let fetched = cluster
            .manager(&node(name))
            .fetch("articles", "the-doc", MasterSlaveSettings::MasterIfAvailable)
            .await
            .unwrap();
        assert_eq!(fetched.unwrap().unique_id, "the-doc");
    }
}

#[tokio::test]
async fn test_primary_death_failover() {
    let (settings, mapping) = replicated_mapping();
    let cluster = TestCluster::new(settings, mapping).await;
    let primary = node("a");
    let replica = node("b");

    cluster
        .manager(&primary)
        .store("articles", doc("1", "rust text"))
        .await
        .unwrap();
    cluster.manager(&primary).optimize("articles", 1).await.unwrap();

    cluster.kill(&primary).await;

    // Reads fail over to a replica.
    let survivor = cluster.manager(&replica);
    let mut request = QueryRequest::new("articles", SearchQuery::new("rust"), 10);
    request.master_slave_settings = MasterSlaveSettings::MasterIfAvailable;
    let result = survivor.query(request).await.unwrap();
    assert_eq!(result.total_hits, 1);

    // Writes demand the primary and must fail.
    let err = survivor
        .store("articles", doc("2", "more text"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShardOffline { .. }));
}

#[tokio::test]
async fn test_federation_fails_fast_with_zero_dispatches() {
    let (settings, mapping) = spread_mapping();
    let cluster = TestCluster::new(settings, mapping).await;

    cluster.kill(&node("c")).await;
    let calls_before = cluster.transport.call_count();

    // Shard 2 has no live copy: resolution fails before any call goes out.
    let err = cluster
        .manager(&node("a"))
        .query(QueryRequest::new("articles", SearchQuery::new("rust"), 10))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShardOffline { shard: 2, .. }));
    assert_eq!(cluster.transport.call_count(), calls_before);
}

#[tokio::test]
async fn test_terms_and_field_names_union_across_nodes() {
    let (settings, mapping) = spread_mapping();
    let cluster = TestCluster::new(settings, mapping).await;
    let entry = cluster.manager(&node("a"));

    for i in 0..30 {
        let title = if i % 2 == 0 { "alpha body" } else { "beta body" };
        entry
            .store("articles", doc(&format!("doc-{}", i), title))
            .await
            .unwrap();
    }
    entry.optimize("articles", 1).await.unwrap();

    let terms = entry
        .get_terms(TermsRequest::new("articles", "title"))
        .await
        .unwrap();
    let body = terms.iter().find(|t| t.term == "body").unwrap();
    assert_eq!(body.doc_freq, 30);
    assert!(terms.iter().any(|t| t.term == "alpha"));
    assert!(terms.iter().any(|t| t.term == "beta"));

    let fields = entry
        .get_field_names("articles", MasterSlaveSettings::MasterIfAvailable)
        .await
        .unwrap();
    assert_eq!(fields, vec!["title".to_string()]);
}

#[tokio::test]
async fn test_clear_empties_every_shard() {
    let (settings, mapping) = spread_mapping();
    let cluster = TestCluster::new(settings, mapping).await;
    let entry = cluster.manager(&node("a"));

    for i in 0..12 {
        entry
            .store("articles", doc(&format!("doc-{}", i), "text"))
            .await
            .unwrap();
    }
    entry.optimize("articles", 1).await.unwrap();
    assert_eq!(
        entry
            .get_number_of_docs("articles", MasterSlaveSettings::MasterIfAvailable)
            .await
            .unwrap(),
        12
    );

    entry.clear("articles").await.unwrap();

    assert_eq!(
        entry
            .get_number_of_docs("articles", MasterSlaveSettings::MasterIfAvailable)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_unknown_index_is_surfaced() {
    let (settings, mapping) = spread_mapping();
    let cluster = TestCluster::new(settings, mapping).await;

    let err = cluster
        .manager(&node("a"))
        .query(QueryRequest::new("missing", SearchQuery::new("q"), 10))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IndexDoesNotExist(name) if name == "missing"));
}
