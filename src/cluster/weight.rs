//! Node load weights for shard placement
//!
//! Every shard an index places on a node contributes weight proportional
//! to the index's configured weight. Replicas carry a small discount since
//! they serve queries but take no write load. Placement decisions consume
//! the ascending-by-weight node ordering.

use std::collections::HashMap;

use crate::types::{IndexMapping, IndexSettings, Node};

/// Discount applied to replica placements relative to primaries.
pub const REPLICA_WEIGHT_DELTA: f64 = 0.01;

/// Accumulated load score per active node.
pub struct NodeWeightComputation {
    weights: HashMap<Node, f64>,
}

impl NodeWeightComputation {
    /// Compute weights from the current topology.
    ///
    /// Nodes in `active_nodes` that own no shards still appear with weight
    /// zero, so a freshly joined node is immediately eligible for
    /// placement. Nodes that are no longer active are dropped.
    pub fn compute(
        settings_by_index: &HashMap<String, IndexSettings>,
        mappings: &[IndexMapping],
        active_nodes: &[Node],
    ) -> Self {
        let mut weights: HashMap<Node, f64> = HashMap::new();

        for mapping in mappings {
            let index_weight = settings_by_index
                .get(&mapping.index_name)
                .map(|s| s.effective_weight())
                .unwrap_or(1);

            let shard_weight = f64::from(index_weight) / f64::from(mapping.number_of_shards.max(1));
            let replica_weight = (shard_weight - REPLICA_WEIGHT_DELTA).max(0.0);

            for shard_mapping in &mapping.shard_mappings {
                *weights.entry(shard_mapping.primary.clone()).or_default() += shard_weight;

                for replica in &shard_mapping.replicas {
                    *weights.entry(replica.clone()).or_default() += replica_weight;
                }
            }
        }

        for node in active_nodes {
            weights.entry(node.clone()).or_default();
        }

        weights.retain(|node, _| active_nodes.contains(node));

        Self { weights }
    }

    /// Account for one newly placed shard without recomputing from scratch.
    /// Placement decisions happen one shard at a time.
    pub fn add_shard(&mut self, node: &Node, settings: &IndexSettings, primary: bool) {
        let mut shard_weight =
            f64::from(settings.effective_weight()) / f64::from(settings.number_of_shards.max(1));
        if !primary {
            shard_weight = (shard_weight - REPLICA_WEIGHT_DELTA).max(0.0);
        }
        *self.weights.entry(node.clone()).or_default() += shard_weight;
    }

    pub fn weight(&self, node: &Node) -> Option<f64> {
        self.weights.get(node).copied()
    }

    /// Nodes ascending by accumulated weight, least loaded first.
    ///
    /// Entries are shuffled before the stable sort so equal-weight nodes
    /// rotate instead of always yielding the same placement target.
    pub fn nodes_sorted_by_weight(&self) -> Vec<Node> {
        let mut entries: Vec<(&Node, f64)> =
            self.weights.iter().map(|(n, w)| (n, *w)).collect();

        fastrand::shuffle(&mut entries);
        entries.sort_by(|a, b| a.1.total_cmp(&b.1));

        entries.into_iter().map(|(n, _)| n.clone()).collect()
    }
}
