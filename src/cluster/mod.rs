//! Cluster topology
//!
//! The routing layer observes cluster membership and shard placement
//! through `TopologySource`; it never causes topology changes itself.
//! Placement and membership are owned by an external coordination service.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::types::{IndexMapping, IndexSettings, Node};
use crate::{Error, Result};

pub mod selector;
pub mod weight;

/// Read-only view of the cluster: index placement, index settings, and the
/// set of currently active nodes.
#[async_trait]
pub trait TopologySource: Send + Sync {
    /// Names of all indexes known to the cluster
    async fn get_index_names(&self) -> Result<Vec<String>>;

    /// Shard placement for one index
    async fn get_index_mapping(&self, index_name: &str) -> Result<IndexMapping>;

    /// Settings for one index
    async fn get_index_settings(&self, index_name: &str) -> Result<IndexSettings>;

    /// Nodes currently considered alive
    async fn get_active_nodes(&self) -> Result<Vec<Node>>;
}

/// In-memory topology, fixed at construction and mutated only through the
/// test/admin surface. Useful for static deployments and tests.
pub struct StaticTopology {
    indexes: RwLock<HashMap<String, (IndexSettings, IndexMapping)>>,
    active_nodes: RwLock<Vec<Node>>,
}

impl StaticTopology {
    pub fn new(active_nodes: Vec<Node>) -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
            active_nodes: RwLock::new(active_nodes),
        }
    }

    pub async fn add_index(&self, settings: IndexSettings, mapping: IndexMapping) {
        let mut indexes = self.indexes.write().await;
        indexes.insert(mapping.index_name.clone(), (settings, mapping));
    }

    /// Replace the active-node set, e.g. after a simulated failure
    pub async fn set_active_nodes(&self, nodes: Vec<Node>) {
        let mut active = self.active_nodes.write().await;
        *active = nodes;
    }

    /// Drop one node from the active set
    pub async fn mark_offline(&self, node: &Node) {
        let mut active = self.active_nodes.write().await;
        active.retain(|n| n != node);
    }
}

#[async_trait]
impl TopologySource for StaticTopology {
    async fn get_index_names(&self) -> Result<Vec<String>> {
        let indexes = self.indexes.read().await;
        Ok(indexes.keys().cloned().collect())
    }

    async fn get_index_mapping(&self, index_name: &str) -> Result<IndexMapping> {
        let indexes = self.indexes.read().await;
        indexes
            .get(index_name)
            .map(|(_, mapping)| mapping.clone())
            .ok_or_else(|| Error::IndexDoesNotExist(index_name.to_string()))
    }

    async fn get_index_settings(&self, index_name: &str) -> Result<IndexSettings> {
        let indexes = self.indexes.read().await;
        indexes
            .get(index_name)
            .map(|(settings, _)| settings.clone())
            .ok_or_else(|| Error::IndexDoesNotExist(index_name.to_string()))
    }

    async fn get_active_nodes(&self) -> Result<Vec<Node>> {
        let active = self.active_nodes.read().await;
        Ok(active.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShardMapping;

    fn one_shard_mapping(name: &str, primary: Node) -> IndexMapping {
        IndexMapping {
            index_name: name.to_string(),
            number_of_shards: 1,
            shard_mappings: vec![ShardMapping {
                shard_number: 0,
                primary,
                replicas: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn test_unknown_index_is_an_error() {
        let topology = StaticTopology::new(vec![]);
        let err = topology.get_index_mapping("missing").await.unwrap_err();
        assert!(matches!(err, Error::IndexDoesNotExist(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_mark_offline_removes_node() {
        let a = Node::new("a", 1);
        let b = Node::new("b", 1);
        let topology = StaticTopology::new(vec![a.clone(), b.clone()]);
        topology
            .add_index(
                IndexSettings::new("articles", 1),
                one_shard_mapping("articles", a.clone()),
            )
            .await;

        topology.mark_offline(&a).await;
        let active = topology.get_active_nodes().await.unwrap();
        assert_eq!(active, vec![b]);
    }
}
