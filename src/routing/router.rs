//! Single-shard request routing
//!
//! A store, delete, or fetch touches exactly one shard: hash the unique
//! id, look up the shard's mapping, and let the selector pick the serving
//! node. Execution is the caller's half — local in-process when the
//! resolved node is this node, otherwise through the remote client.

use crate::cluster::selector::MasterSlaveSelector;
use crate::types::{IndexMapping, MasterSlaveSettings, Node};
use crate::Result;

use super::shard_for_unique_id;

/// The resolved target of a single-shard request.
#[derive(Debug, Clone)]
pub struct RequestRouter {
    shard: u32,
    target: Node,
}

impl RequestRouter {
    /// Resolve the node serving the shard that owns `unique_id`.
    pub fn resolve(
        this_node: &Node,
        active_nodes: &[Node],
        settings: MasterSlaveSettings,
        mapping: &IndexMapping,
        unique_id: &str,
    ) -> Result<Self> {
        let shard = shard_for_unique_id(unique_id, mapping.number_of_shards);

        let selector = MasterSlaveSelector::new(settings, active_nodes, mapping)
            .with_local_node(this_node);
        let target = selector.node_for_unique_id(unique_id)?;

        Ok(Self { shard, target })
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    pub fn target(&self) -> &Node {
        &self.target
    }

    pub fn is_local(&self, this_node: &Node) -> bool {
        self.target == *this_node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShardMapping;
    use crate::Error;

    fn node(name: &str) -> Node {
        Node::new(name, 32191)
    }

    fn mapping(primaries: &[Node]) -> IndexMapping {
        IndexMapping {
            index_name: "articles".to_string(),
            number_of_shards: primaries.len() as u32,
            shard_mappings: primaries
                .iter()
                .enumerate()
                .map(|(s, primary)| ShardMapping {
                    shard_number: s as u32,
                    primary: primary.clone(),
                    replicas: vec![],
                })
                .collect(),
        }
    }

    #[test]
    fn test_resolves_to_owning_primary() {
        let a = node("a");
        let b = node("b");
        let mapping = mapping(&[a.clone(), b.clone()]);
        let active = vec![a.clone(), b.clone()];

        let router = RequestRouter::resolve(
            &a,
            &active,
            MasterSlaveSettings::MasterOnly,
            &mapping,
            "some-doc",
        )
        .unwrap();

        let expected_shard = shard_for_unique_id("some-doc", 2);
        assert_eq!(router.shard(), expected_shard);
        let expected = if expected_shard == 0 { &a } else { &b };
        assert_eq!(router.target(), expected);
    }

    #[test]
    fn test_is_local() {
        let a = node("a");
        let mapping = mapping(&[a.clone()]);
        let active = vec![a.clone()];

        let router = RequestRouter::resolve(
            &a,
            &active,
            MasterSlaveSettings::MasterOnly,
            &mapping,
            "doc",
        )
        .unwrap();

        assert!(router.is_local(&a));
        assert!(!router.is_local(&node("b")));
    }

    #[test]
    fn test_offline_primary_fails_resolution() {
        let a = node("a");
        let mapping = mapping(&[a.clone()]);
        // Not even this node is the primary and the active set is empty.
        let caller = node("caller");

        let err = RequestRouter::resolve(
            &caller,
            &[],
            MasterSlaveSettings::MasterOnly,
            &mapping,
            "doc",
        )
        .unwrap_err();
        assert!(matches!(err, Error::ShardOffline { .. }));
    }
}
