//! Cross-shard request federation
//!
//! A federated operation touches every shard of one or more indexes. The
//! node set is resolved up front — every shard of every index must have a
//! serving node, or the whole federation fails before a single call is
//! dispatched. Dispatch then runs one task per node concurrently and
//! waits for all of them: the first failure is surfaced only after every
//! in-flight sibling has finished, so no task's side effects are left
//! half-observed.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::task::JoinSet;

use crate::cluster::selector::MasterSlaveSelector;
use crate::remote::IndexRouting;
use crate::types::{IndexMapping, MasterSlaveSettings, Node};
use crate::{Error, Result};

/// One node of a federated call and the shards it serves.
#[derive(Debug, Clone)]
pub struct FederatedTarget {
    pub node: Node,
    pub routing: Vec<IndexRouting>,
}

/// A dispatched per-node sub-request.
pub type FederatedTask<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

#[derive(Debug)]
pub struct RequestFederator {
    targets: Vec<FederatedTarget>,
}

impl RequestFederator {
    /// Resolve the serving node for every shard of every listed index.
    ///
    /// All-or-nothing: an unresolvable shard aborts construction with
    /// `ShardOffline` and nothing is dispatched.
    pub fn resolve(
        this_node: &Node,
        active_nodes: &[Node],
        settings: MasterSlaveSettings,
        mappings: &[IndexMapping],
    ) -> Result<Self> {
        let mut by_node: HashMap<Node, Vec<IndexRouting>> = HashMap::new();

        for mapping in mappings {
            let selector = MasterSlaveSelector::new(settings, active_nodes, mapping)
                .with_local_node(this_node);

            for (node, mut shards) in selector.nodes_for_index()? {
                shards.sort_unstable();
                by_node.entry(node).or_default().push(IndexRouting {
                    index_name: mapping.index_name.clone(),
                    shards,
                });
            }
        }

        let mut targets: Vec<FederatedTarget> = by_node
            .into_iter()
            .map(|(node, routing)| FederatedTarget { node, routing })
            .collect();
        // Deterministic dispatch order regardless of map iteration order.
        targets.sort_by(|a, b| {
            (&a.node.server_address, a.node.service_port)
                .cmp(&(&b.node.server_address, b.node.service_port))
        });

        Ok(Self { targets })
    }

    pub fn targets(&self) -> &[FederatedTarget] {
        &self.targets
    }

    /// Run one pre-built task per target concurrently and wait for all.
    ///
    /// Results land in target order (each task writes its own slot). On
    /// failure, every sibling still runs to completion before the first
    /// error — in completion order — is returned.
    pub async fn dispatch<T: Send + 'static>(
        &self,
        tasks: Vec<FederatedTask<T>>,
    ) -> Result<Vec<T>> {
        debug_assert_eq!(tasks.len(), self.targets.len());

        let mut set = JoinSet::new();
        for (slot, task) in tasks.into_iter().enumerate() {
            set.spawn(async move { (slot, task.await) });
        }

        let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None)
            .take(self.targets.len())
            .collect();
        let mut first_error: Option<Error> = None;

        while let Some(joined) = set.join_next().await {
            let (slot, result) =
                joined.map_err(|e| Error::engine(format!("federated task failed: {e}")))?;
            match result {
                Ok(value) => slots[slot] = Some(value),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(slots
            .into_iter()
            .map(|s| s.expect("every slot filled"))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShardMapping;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn node(name: &str) -> Node {
        Node::new(name, 32191)
    }

    fn mapping(name: &str, primaries: &[Node]) -> IndexMapping {
        IndexMapping {
            index_name: name.to_string(),
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
    fn test_resolution_groups_shards_by_node() {
        let a = node("a");
        let b = node("b");
        let mapping = mapping("articles", &[a.clone(), b.clone(), a.clone()]);
        let active = vec![a.clone(), b.clone()];

        let federator = RequestFederator::resolve(
            &a,
            &active,
            MasterSlaveSettings::MasterOnly,
            &[mapping],
        )
        .unwrap();

        assert_eq!(federator.targets().len(), 2);
        let target_a = federator
            .targets()
            .iter()
            .find(|t| t.node == a)
            .unwrap();
        assert_eq!(target_a.routing[0].shards, vec![0, 2]);
    }

    #[test]
    fn test_offline_shard_aborts_resolution() {
        let a = node("a");
        let b = node("b");
        let mapping = mapping("articles", &[a.clone(), b.clone(), a.clone()]);
        // b is down and the caller is not a copy of shard 1.
        let caller = node("caller");
        let active = vec![a.clone()];

        let err = RequestFederator::resolve(
            &caller,
            &active,
            MasterSlaveSettings::MasterOnly,
            &[mapping],
        )
        .unwrap_err();
        assert!(matches!(err, Error::ShardOffline { shard: 1, .. }));
    }

    #[tokio::test]
    async fn test_dispatch_preserves_target_order() {
        let a = node("a");
        let b = node("b");
        let mapping = mapping("articles", &[a.clone(), b.clone()]);
        let active = vec![a.clone(), b.clone()];

        let federator = RequestFederator::resolve(
            &a,
            &active,
            MasterSlaveSettings::MasterOnly,
            &[mapping],
        )
        .unwrap();

        // The first target sleeps so it finishes last; its result must
        // still land in the first slot.
        let tasks: Vec<FederatedTask<String>> = federator
            .targets()
            .iter()
            .enumerate()
            .map(|(i, target)| {
                let name = target.node.server_address.clone();
                let task: FederatedTask<String> = Box::pin(async move {
                    if i == 0 {
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                    Ok(name)
                });
                task
            })
            .collect();

        let results = federator.dispatch(tasks).await.unwrap();
        assert_eq!(results, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_siblings_before_failing() {
        let a = node("a");
        let b = node("b");
        let mapping = mapping("articles", &[a.clone(), b.clone()]);
        let active = vec![a.clone(), b.clone()];

        let federator = RequestFederator::resolve(
            &a,
            &active,
            MasterSlaveSettings::MasterOnly,
            &[mapping],
        )
        .unwrap();

        let sibling_finished = Arc::new(AtomicBool::new(false));
        let flag = sibling_finished.clone();

        let failing: FederatedTask<()> =
            Box::pin(async move { Err(Error::remote("a:32191", "connection refused")) });
        let slow: FederatedTask<()> = Box::pin(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let err = federator.dispatch(vec![failing, slow]).await.unwrap_err();
        assert!(matches!(err, Error::RemoteExecutionFailure { .. }));
        // The barrier drained: the slow sibling ran to completion.
        assert!(sibling_finished.load(Ordering::SeqCst));
    }
}
