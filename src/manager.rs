//! Node-level entry point
//!
//! IndexManager owns the indexes loaded on this node and implements every
//! cluster-facing operation: single-shard requests route to the one node
//! owning the document's shard; cross-shard requests federate over every
//! shard of the touched indexes. Either way a resolved target is executed
//! in-process when it is this node and through the remote client
//! otherwise, with remote faults translated into the same error taxonomy
//! as local ones.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use crate::blob::BlobStore;
use crate::cluster::TopologySource;
use crate::engine::SearchEngine;
use crate::index::SearchIndex;
use crate::remote::{IndexRouting, RemoteClient};
use crate::routing::federator::FederatedTask;
use crate::routing::{RequestFederator, RequestRouter};
use crate::types::{
    compare_field_values, FacetCount, MasterSlaveSettings, Node, QueryRequest, QueryResult,
    ScoredResult, ShardQueryResult, StoredDocument, TermCount, TermsRequest,
};
use crate::{Error, Result};

pub struct IndexManager {
    this_node: Node,
    topology: Arc<dyn TopologySource>,
    remote: Arc<dyn RemoteClient>,
    engine: Arc<dyn SearchEngine>,
    blobs: Arc<dyn BlobStore>,
    indexes: RwLock<HashMap<String, Arc<SearchIndex>>>,
    remote_timeout: Duration,
    commit_tick_interval: Duration,
}

impl IndexManager {
    pub fn new(
        this_node: Node,
        topology: Arc<dyn TopologySource>,
        remote: Arc<dyn RemoteClient>,
        engine: Arc<dyn SearchEngine>,
        blobs: Arc<dyn BlobStore>,
        remote_timeout: Duration,
        commit_tick_interval: Duration,
    ) -> Self {
        Self {
            this_node,
            topology,
            remote,
            engine,
            blobs,
            indexes: RwLock::new(HashMap::new()),
            remote_timeout,
            commit_tick_interval,
        }
    }

    pub fn this_node(&self) -> &Node {
        &self.this_node
    }

    /// Load every index this node serves a shard of, per the topology.
    pub async fn load_indexes(&self) -> Result<()> {
        for index_name in self.topology.get_index_names().await? {
            let mapping = self.topology.get_index_mapping(&index_name).await?;

            let serves_shard = mapping.shard_mappings.iter().any(|m| {
                m.primary == self.this_node || m.replicas.iter().any(|r| *r == self.this_node)
            });
            if !serves_shard {
                continue;
            }

            let settings = self.topology.get_index_settings(&index_name).await?;
            let index = SearchIndex::new(
                settings,
                self.engine.clone(),
                self.blobs.clone(),
                self.commit_tick_interval,
            );
            index.load_shards(&mapping, &self.this_node).await?;

            let mut indexes = self.indexes.write().await;
            indexes.insert(index_name.clone(), index);
            info!(node = %self.this_node, index = %index_name, "index loaded");
        }
        Ok(())
    }

    /// Unload every index, committing primaries on the way down.
    pub async fn shutdown(&self) -> Result<()> {
        let drained: Vec<Arc<SearchIndex>> = {
            let mut indexes = self.indexes.write().await;
            indexes.drain().map(|(_, index)| index).collect()
        };
        for index in drained {
            index.unload_all().await?;
        }
        Ok(())
    }

    async fn get_index(&self, index_name: &str) -> Result<Arc<SearchIndex>> {
        let indexes = self.indexes.read().await;
        indexes
            .get(index_name)
            .cloned()
            .ok_or_else(|| Error::IndexDoesNotExist(index_name.to_string()))
    }

    /// Apply the per-dispatch deadline to a remote call; expiry surfaces
    /// as a remote execution failure for that target.
    async fn with_deadline<T>(
        node: &Node,
        timeout: Duration,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::remote(
                node.to_string(),
                format!("no response within {}s", timeout.as_secs()),
            )),
        }
    }

    // ---- single-shard routed operations ----

    /// Store a document, routing it to the primary of its shard.
    pub async fn store(&self, index_name: &str, doc: StoredDocument) -> Result<()> {
        let mapping = self.topology.get_index_mapping(index_name).await?;
        let active = self.topology.get_active_nodes().await?;

        let router = RequestRouter::resolve(
            &self.this_node,
            &active,
            MasterSlaveSettings::MasterOnly,
            &mapping,
            &doc.unique_id,
        )?;

        if router.is_local(&self.this_node) {
            let index = self.get_index(index_name).await?;
            index.store(router.shard(), doc).await
        } else {
            let node = router.target().clone();
            Self::with_deadline(
                &node,
                self.remote_timeout,
                self.remote.store(&node, index_name, doc),
            )
            .await
        }
    }

    /// Delete a document (and optionally its associated blobs) on the
    /// primary of its shard.
    pub async fn delete(
        &self,
        index_name: &str,
        unique_id: &str,
        delete_blobs: bool,
    ) -> Result<()> {
        let mapping = self.topology.get_index_mapping(index_name).await?;
        let active = self.topology.get_active_nodes().await?;

        let router = RequestRouter::resolve(
            &self.this_node,
            &active,
            MasterSlaveSettings::MasterOnly,
            &mapping,
            unique_id,
        )?;

        if router.is_local(&self.this_node) {
            self.delete_local(index_name, router.shard(), unique_id, delete_blobs)
                .await
        } else {
            let node = router.target().clone();
            Self::with_deadline(
                &node,
                self.remote_timeout,
                self.remote.delete(&node, index_name, unique_id, delete_blobs),
            )
            .await
        }
    }

    async fn delete_local(
        &self,
        index_name: &str,
        shard: u32,
        unique_id: &str,
        delete_blobs: bool,
    ) -> Result<()> {
        let index = self.get_index(index_name).await?;
        index.delete(shard, unique_id).await?;

        if delete_blobs {
            self.blobs.delete_all(index_name, unique_id).await?;
        }
        Ok(())
    }

    /// Fetch a stored document from an available copy of its shard.
    pub async fn fetch(
        &self,
        index_name: &str,
        unique_id: &str,
        settings: MasterSlaveSettings,
    ) -> Result<Option<StoredDocument>> {
        let mapping = self.topology.get_index_mapping(index_name).await?;
        let active = self.topology.get_active_nodes().await?;

        let router = RequestRouter::resolve(
            &self.this_node,
            &active,
            settings,
            &mapping,
            unique_id,
        )?;

        if router.is_local(&self.this_node) {
            let index = self.get_index(index_name).await?;
            index.fetch(router.shard(), unique_id).await
        } else {
            let node = router.target().clone();
            Self::with_deadline(
                &node,
                self.remote_timeout,
                self.remote.fetch(&node, index_name, unique_id),
            )
            .await
        }
    }

    // ---- federated operations ----

    async fn federator_for(
        &self,
        index_names: &[String],
        settings: MasterSlaveSettings,
    ) -> Result<RequestFederator> {
        let mut mappings = Vec::with_capacity(index_names.len());
        for name in index_names {
            mappings.push(self.topology.get_index_mapping(name).await?);
        }
        let active = self.topology.get_active_nodes().await?;
        RequestFederator::resolve(&self.this_node, &active, settings, &mappings)
    }

    /// Resolve the local SearchIndex for each routing entry before a task
    /// is spawned, so dispatch never touches the index registry lock.
    async fn local_routes(
        &self,
        routing: &[IndexRouting],
    ) -> Result<Vec<(Arc<SearchIndex>, IndexRouting)>> {
        let mut routes = Vec::with_capacity(routing.len());
        for entry in routing {
            routes.push((self.get_index(&entry.index_name).await?, entry.clone()));
        }
        Ok(routes)
    }

    /// Query one or more indexes, merging and re-ranking per-shard
    /// results into one response.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResult> {
        if request.indexes.is_empty() {
            return Err(Error::InvalidRequest(
                "query must name at least one index".to_string(),
            ));
        }

        let federator = self
            .federator_for(&request.indexes, request.master_slave_settings)
            .await?;

        let mut tasks: Vec<FederatedTask<Vec<ShardQueryResult>>> = Vec::new();
        for target in federator.targets() {
            if target.node == self.this_node {
                let routes = self.local_routes(&target.routing).await?;
                let request = request.clone();
                tasks.push(Box::pin(async move {
                    let mut results = Vec::new();
                    for (index, routing) in routes {
                        results.extend(
                            index
                                .query_shards(
                                    &routing.shards,
                                    &request.query,
                                    request.amount,
                                    request.dont_cache,
                                    request.pin_to_cache,
                                )
                                .await?,
                        );
                    }
                    Ok(results)
                }));
            } else {
                let remote = self.remote.clone();
                let node = target.node.clone();
                let routing = target.routing.clone();
                let request = request.clone();
                let timeout = self.remote_timeout;
                tasks.push(Box::pin(async move {
                    Self::with_deadline(&node, timeout, remote.query(&node, &routing, &request))
                        .await
                }));
            }
        }

        let per_node = federator.dispatch(tasks).await?;
        let shard_results: Vec<ShardQueryResult> = per_node.into_iter().flatten().collect();

        Ok(merge_query_results(&request, shard_results))
    }

    /// Enumerate terms of one field across every shard of an index.
    pub async fn get_terms(&self, request: TermsRequest) -> Result<Vec<TermCount>> {
        let federator = self
            .federator_for(
                std::slice::from_ref(&request.index_name),
                request.master_slave_settings,
            )
            .await?;

        let mut tasks: Vec<FederatedTask<Vec<TermCount>>> = Vec::new();
        for target in federator.targets() {
            if target.node == self.this_node {
                let routes = self.local_routes(&target.routing).await?;
                let request = request.clone();
                tasks.push(Box::pin(async move {
                    let mut terms = Vec::new();
                    for (index, routing) in routes {
                        terms.extend(index.terms_shards(&routing.shards, &request).await?);
                    }
                    Ok(terms)
                }));
            } else {
                let remote = self.remote.clone();
                let node = target.node.clone();
                let routing = target.routing[0].clone();
                let request = request.clone();
                let timeout = self.remote_timeout;
                tasks.push(Box::pin(async move {
                    Self::with_deadline(&node, timeout, remote.terms(&node, &routing, &request))
                        .await
                }));
            }
        }

        let per_node = federator.dispatch(tasks).await?;

        // Union across nodes, summing frequencies for terms present in
        // more than one shard.
        let mut merged: HashMap<String, TermCount> = HashMap::new();
        for term in per_node.into_iter().flatten() {
            merged
                .entry(term.term.clone())
                .and_modify(|t| {
                    t.doc_freq += term.doc_freq;
                    t.term_freq += term.term_freq;
                })
                .or_insert(term);
        }

        let mut terms: Vec<TermCount> = merged
            .into_values()
            .filter(|t| t.doc_freq >= request.min_doc_freq)
            .collect();
        terms.sort_by(|a, b| a.term.cmp(&b.term));
        if request.amount > 0 {
            terms.truncate(request.amount);
        }
        Ok(terms)
    }

    /// Distinct field names across every shard of an index.
    pub async fn get_field_names(
        &self,
        index_name: &str,
        settings: MasterSlaveSettings,
    ) -> Result<Vec<String>> {
        let names = vec![index_name.to_string()];
        let federator = self.federator_for(&names, settings).await?;

        let mut tasks: Vec<FederatedTask<Vec<String>>> = Vec::new();
        for target in federator.targets() {
            if target.node == self.this_node {
                let routes = self.local_routes(&target.routing).await?;
                tasks.push(Box::pin(async move {
                    let mut fields = Vec::new();
                    for (index, routing) in routes {
                        fields.extend(index.field_names_shards(&routing.shards).await?);
                    }
                    Ok(fields)
                }));
            } else {
                let remote = self.remote.clone();
                let node = target.node.clone();
                let routing = target.routing[0].clone();
                let timeout = self.remote_timeout;
                tasks.push(Box::pin(async move {
                    Self::with_deadline(&node, timeout, remote.field_names(&node, &routing)).await
                }));
            }
        }

        let per_node = federator.dispatch(tasks).await?;
        let mut fields: Vec<String> = per_node.into_iter().flatten().collect();
        fields.sort();
        fields.dedup();
        Ok(fields)
    }

    /// Total documents across every shard of an index.
    pub async fn get_number_of_docs(
        &self,
        index_name: &str,
        settings: MasterSlaveSettings,
    ) -> Result<u64> {
        let names = vec![index_name.to_string()];
        let federator = self.federator_for(&names, settings).await?;

        let mut tasks: Vec<FederatedTask<u64>> = Vec::new();
        for target in federator.targets() {
            if target.node == self.this_node {
                let routes = self.local_routes(&target.routing).await?;
                tasks.push(Box::pin(async move {
                    let mut total = 0u64;
                    for (index, routing) in routes {
                        total += index.doc_count_shards(&routing.shards).await?;
                    }
                    Ok(total)
                }));
            } else {
                let remote = self.remote.clone();
                let node = target.node.clone();
                let routing = target.routing[0].clone();
                let timeout = self.remote_timeout;
                tasks.push(Box::pin(async move {
                    Self::with_deadline(&node, timeout, remote.doc_count(&node, &routing)).await
                }));
            }
        }

        let per_node = federator.dispatch(tasks).await?;
        Ok(per_node.into_iter().sum())
    }

    /// Force-merge and commit every primary shard of an index.
    pub async fn optimize(&self, index_name: &str, max_segments: u32) -> Result<()> {
        let names = vec![index_name.to_string()];
        let federator = self
            .federator_for(&names, MasterSlaveSettings::MasterOnly)
            .await?;

        let mut tasks: Vec<FederatedTask<()>> = Vec::new();
        for target in federator.targets() {
            if target.node == self.this_node {
                let routes = self.local_routes(&target.routing).await?;
                tasks.push(Box::pin(async move {
                    for (index, routing) in routes {
                        index.optimize_shards(&routing.shards, max_segments).await?;
                    }
                    Ok(())
                }));
            } else {
                let remote = self.remote.clone();
                let node = target.node.clone();
                let routing = target.routing[0].clone();
                let timeout = self.remote_timeout;
                tasks.push(Box::pin(async move {
                    Self::with_deadline(
                        &node,
                        timeout,
                        remote.optimize(&node, &routing, max_segments),
                    )
                    .await
                }));
            }
        }

        federator.dispatch(tasks).await?;
        Ok(())
    }

    /// Remove every document from an index, including associated blobs.
    pub async fn clear(&self, index_name: &str) -> Result<()> {
        let names = vec![index_name.to_string()];
        let federator = self
            .federator_for(&names, MasterSlaveSettings::MasterOnly)
            .await?;

        let mut tasks: Vec<FederatedTask<()>> = Vec::new();
        for target in federator.targets() {
            if target.node == self.this_node {
                let routes = self.local_routes(&target.routing).await?;
                tasks.push(Box::pin(async move {
                    for (index, routing) in routes {
                        index.clear_shards(&routing.shards).await?;
                    }
                    Ok(())
                }));
            } else {
                let remote = self.remote.clone();
                let node = target.node.clone();
                let routing = target.routing[0].clone();
                let timeout = self.remote_timeout;
                tasks.push(Box::pin(async move {
                    Self::with_deadline(&node, timeout, remote.clear(&node, &routing)).await
                }));
            }
        }

        federator.dispatch(tasks).await?;
        Ok(())
    }

    /// Rebuild every primary shard of an index from its stored documents.
    pub async fn reindex(&self, index_name: &str) -> Result<()> {
        let names = vec![index_name.to_string()];
        let federator = self
            .federator_for(&names, MasterSlaveSettings::MasterOnly)
            .await?;

        let mut tasks: Vec<FederatedTask<()>> = Vec::new();
        for target in federator.targets() {
            if target.node == self.this_node {
                let routes = self.local_routes(&target.routing).await?;
                tasks.push(Box::pin(async move {
                    for (index, routing) in routes {
                        index.reindex_shards(&routing.shards).await?;
                    }
                    Ok(())
                }));
            } else {
                let remote = self.remote.clone();
                let node = target.node.clone();
                let routing = target.routing[0].clone();
                let timeout = self.remote_timeout;
                tasks.push(Box::pin(async move {
                    Self::with_deadline(&node, timeout, remote.reindex(&node, &routing)).await
                }));
            }
        }

        federator.dispatch(tasks).await?;
        Ok(())
    }

    // ---- internal entry points (the receiving side of RemoteClient) ----

    /// Execute a store dispatched by a peer: the shard is re-derived from
    /// the unique id, which is deterministic across nodes.
    pub async fn internal_store(&self, index_name: &str, doc: StoredDocument) -> Result<()> {
        let index = self.get_index(index_name).await?;
        let shards = index.settings().await.number_of_shards;
        let shard = crate::routing::shard_for_unique_id(&doc.unique_id, shards);
        index.store(shard, doc).await
    }

    pub async fn internal_delete(
        &self,
        index_name: &str,
        unique_id: &str,
        delete_blobs: bool,
    ) -> Result<()> {
        let index = self.get_index(index_name).await?;
        let shards = index.settings().await.number_of_shards;
        let shard = crate::routing::shard_for_unique_id(unique_id, shards);
        index.delete(shard, unique_id).await?;

        if delete_blobs {
            self.blobs.delete_all(index_name, unique_id).await?;
        }
        Ok(())
    }

    pub async fn internal_fetch(
        &self,
        index_name: &str,
        unique_id: &str,
    ) -> Result<Option<StoredDocument>> {
        let index = self.get_index(index_name).await?;
        let shards = index.settings().await.number_of_shards;
        let shard = crate::routing::shard_for_unique_id(unique_id, shards);
        index.fetch(shard, unique_id).await
    }

    pub async fn internal_query(
        &self,
        routing: &[IndexRouting],
        request: &QueryRequest,
    ) -> Result<Vec<ShardQueryResult>> {
        let mut results = Vec::new();
        for entry in routing {
            let index = self.get_index(&entry.index_name).await?;
            results.extend(
                index
                    .query_shards(
                        &entry.shards,
                        &request.query,
                        request.amount,
                        request.dont_cache,
                        request.pin_to_cache,
                    )
                    .await?,
            );
        }
        Ok(results)
    }

    pub async fn internal_terms(
        &self,
        routing: &IndexRouting,
        request: &TermsRequest,
    ) -> Result<Vec<TermCount>> {
        let index = self.get_index(&routing.index_name).await?;
        index.terms_shards(&routing.shards, request).await
    }

    pub async fn internal_field_names(&self, routing: &IndexRouting) -> Result<Vec<String>> {
        let index = self.get_index(&routing.index_name).await?;
        index.field_names_shards(&routing.shards).await
    }

    pub async fn internal_doc_count(&self, routing: &IndexRouting) -> Result<u64> {
        let index = self.get_index(&routing.index_name).await?;
        index.doc_count_shards(&routing.shards).await
    }

    pub async fn internal_optimize(
        &self,
        routing: &IndexRouting,
        max_segments: u32,
    ) -> Result<()> {
        let index = self.get_index(&routing.index_name).await?;
        index.optimize_shards(&routing.shards, max_segments).await
    }

    pub async fn internal_clear(&self, routing: &IndexRouting) -> Result<()> {
        let index = self.get_index(&routing.index_name).await?;
        index.clear_shards(&routing.shards).await
    }

    pub async fn internal_reindex(&self, routing: &IndexRouting) -> Result<()> {
        let index = self.get_index(&routing.index_name).await?;
        index.reindex_shards(&routing.shards).await
    }
}

/// Merge per-shard partial results into one ranked response.
///
/// Shard responses arrive in no particular order, so the merged result is
/// re-sorted explicitly: by the request's sort fields when given,
/// otherwise by score descending, with unique id as the stable tiebreak.
fn merge_query_results(
    request: &QueryRequest,
    shard_results: Vec<ShardQueryResult>,
) -> QueryResult {
    let total_hits = shard_results.iter().map(|r| r.total_hits).sum();

    let mut facet_totals: HashMap<String, HashMap<String, u64>> = HashMap::new();
    for shard_result in &shard_results {
        for (field, counts) in &shard_result.facet_counts {
            let totals = facet_totals.entry(field.clone()).or_default();
            for count in counts {
                *totals.entry(count.facet.clone()).or_default() += count.count;
            }
        }
    }

    let mut results: Vec<ScoredResult> = shard_results
        .into_iter()
        .flat_map(|r| r.results)
        .collect();

    let sort = &request.query.sort;
    results.sort_by(|a, b| {
        for sort_field in sort {
            let ka = a
                .document
                .as_ref()
                .and_then(|d| d.fields.get(&sort_field.field));
            let kb = b
                .document
                .as_ref()
                .and_then(|d| d.fields.get(&sort_field.field));
            let mut ord = compare_field_values(ka, kb);
            if sort_field.descending {
                ord = ord.reverse();
            }
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.unique_id.cmp(&b.unique_id))
    });
    results.truncate(request.amount);

    let facet_counts = facet_totals
        .into_iter()
        .map(|(field, totals)| {
            let max_facets = request
                .query
                .facets
                .iter()
                .find(|f| f.field == field)
                .map(|f| f.max_facets)
                .unwrap_or(0);

            let mut counts: Vec<FacetCount> = totals
                .into_iter()
                .map(|(facet, count)| FacetCount { facet, count })
                .collect();
            counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.facet.cmp(&b.facet)));
            if max_facets > 0 {
                counts.truncate(max_facets as usize);
            }
            (field, counts)
        })
        .collect();

    QueryResult {
        total_hits,
        results,
        facet_counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Document, FieldValue, SearchQuery};

    fn shard_result(shard: u32, hits: Vec<(&str, f32)>) -> ShardQueryResult {
        ShardQueryResult {
            index_name: "articles".to_string(),
            shard,
            total_hits: hits.len() as u64,
            results: hits
                .into_iter()
                .map(|(id, score)| ScoredResult {
                    unique_id: id.to_string(),
                    score,
                    index_name: "articles".to_string(),
                    shard,
                    timestamp: 1,
                    document: Some(Document::new().with_field(
                        "rank",
                        FieldValue::Integer(score as i64),
                    )),
                })
                .collect(),
            facet_counts: Default::default(),
        }
    }

    #[test]
    fn test_merge_reranks_across_shards() {
        let request = QueryRequest::new("articles", SearchQuery::new("q"), 3);

        // Shard responses arrive out of score order.
        let merged = merge_query_results(
            &request,
            vec![
                shard_result(1, vec![("d", 1.0), ("e", 0.5)]),
                shard_result(0, vec![("a", 3.0), ("b", 2.0)]),
            ],
        );

        assert_eq!(merged.total_hits, 4);
        let ids: Vec<&str> = merged.results.iter().map(|r| r.unique_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "d"]);
    }

    #[test]
    fn test_merge_honors_sort_fields() {
        let mut query = SearchQuery::new("q");
        query.sort = vec![crate::types::SortField {
            field: "rank".to_string(),
            descending: false,
        }];
        let request = QueryRequest::new("articles", query, 10);

        let merged = merge_query_results(
            &request,
            vec![
                shard_result(0, vec![("high", 9.0)]),
                shard_result(1, vec![("low", 1.0)]),
            ],
        );

        let ids: Vec<&str> = merged.results.iter().map(|r| r.unique_id.as_str()).collect();
        assert_eq!(ids, vec!["low", "high"]);
    }

    #[test]
    fn test_merge_sums_facets() {
        let request = QueryRequest::new("articles", SearchQuery::new("q"), 10);

        let mut a = shard_result(0, vec![]);
        a.facet_counts.insert(
            "category".to_string(),
            vec![FacetCount {
                facet: "tech".to_string(),
                count: 3,
            }],
        );
        let mut b = shard_result(1, vec![]);
        b.facet_counts.insert(
            "category".to_string(),
            vec![FacetCount {
                facet: "tech".to_string(),
                count: 2,
            }],
        );

        let merged = merge_query_results(&request, vec![a, b]);
        assert_eq!(merged.facet_counts["category"][0].count, 5);
    }
}
