//! Primary/replica node selection
//!
//! Given a shard's mapping and the caller's consistency preference, pick
//! one concrete online node to serve that shard. Selection is a pure
//! function of its inputs: identical (mapping, settings, active nodes)
//! always yields the same node.

use std::collections::HashMap;

use crate::routing::shard_for_unique_id;
use crate::types::{IndexMapping, MasterSlaveSettings, Node, ShardMapping};
use crate::{Error, Result};

/// Selects the node that should serve each shard of one index.
pub struct MasterSlaveSelector<'a> {
    settings: MasterSlaveSettings,
    active_nodes: &'a [Node],
    mapping: &'a IndexMapping,
    /// The node doing the selecting; preferred over remote matches so a
    /// request served locally never takes a network hop.
    local_node: Option<&'a Node>,
}

impl<'a> MasterSlaveSelector<'a> {
    pub fn new(
        settings: MasterSlaveSettings,
        active_nodes: &'a [Node],
        mapping: &'a IndexMapping,
    ) -> Self {
        Self {
            settings,
            active_nodes,
            mapping,
            local_node: None,
        }
    }

    /// Prefer `local_node` whenever it is an eligible copy of a shard.
    pub fn with_local_node(mut self, local_node: &'a Node) -> Self {
        self.local_node = Some(local_node);
        self
    }

    /// Resolve the node serving the shard that owns `unique_id`.
    pub fn node_for_unique_id(&self, unique_id: &str) -> Result<Node> {
        let shard = shard_for_unique_id(unique_id, self.mapping.number_of_shards);

        let shard_mapping =
            self.mapping
                .mapping_for_shard(shard)
                .ok_or_else(|| Error::ShardDoesNotExist {
                    index: self.mapping.index_name.clone(),
                    shard,
                })?;

        self.select_node(shard_mapping)
    }

    /// Resolve every shard of the index to its serving node.
    ///
    /// All-or-nothing: the first unresolvable shard fails the whole call,
    /// so a federated dispatch never starts with a partial node set.
    pub fn nodes_for_index(&self) -> Result<HashMap<Node, Vec<u32>>> {
        let mut shards_by_node: HashMap<Node, Vec<u32>> = HashMap::new();

        for shard in 0..self.mapping.number_of_shards {
            let shard_mapping =
                self.mapping
                    .mapping_for_shard(shard)
                    .ok_or_else(|| Error::ShardDoesNotExist {
                        index: self.mapping.index_name.clone(),
                        shard,
                    })?;

            let node = self.select_node(shard_mapping)?;
            shards_by_node.entry(node).or_default().push(shard);
        }

        Ok(shards_by_node)
    }

    /// Pick the concrete node serving one shard under the configured
    /// consistency preference.
    pub fn select_node(&self, shard_mapping: &ShardMapping) -> Result<Node> {
        let selected = match self.settings {
            MasterSlaveSettings::MasterOnly => self.select_master(shard_mapping),
            MasterSlaveSettings::SlaveOnly => self.select_slave(shard_mapping),
            MasterSlaveSettings::MasterIfAvailable => self
                .select_master(shard_mapping)
                .or_else(|| self.select_slave(shard_mapping)),
        };

        selected.ok_or_else(|| Error::ShardOffline {
            index: self.mapping.index_name.clone(),
            shard: shard_mapping.shard_number,
            settings: self.settings,
        })
    }

    fn select_master(&self, shard_mapping: &ShardMapping) -> Option<Node> {
        // Local node first: if this process is the primary there is no
        // point consulting the remote active set.
        if let Some(local) = self.local_node {
            if *local == shard_mapping.primary {
                return Some(local.clone());
            }
        }

        self.active_nodes
            .iter()
            .find(|n| **n == shard_mapping.primary)
            .cloned()
    }

    fn select_slave(&self, shard_mapping: &ShardMapping) -> Option<Node> {
        // A local replica beats any remote one regardless of declared order.
        if let Some(local) = self.local_node {
            if shard_mapping.replicas.iter().any(|r| r == local) {
                return Some(local.clone());
            }
        }

        // Replica list order defines failover preference.
        for replica in &shard_mapping.replicas {
            if self.active_nodes.iter().any(|n| n == replica) {
                return Some(replica.clone());
            }
        }

        None
    }
}
