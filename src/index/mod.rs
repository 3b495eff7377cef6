//! Index management on one node
//!
//! A SearchIndex owns the shards of one index loaded on this node. The
//! shard maps sit behind a single index-level read/write lock: document
//! traffic takes the read side (many documents index and query
//! concurrently), structural changes (shard load/unload, settings reload)
//! take the write side. The lock is never held across a remote call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::blob::BlobStore;
use crate::engine::SearchEngine;
use crate::shard::Shard;
use crate::types::{
    IndexMapping, IndexSettings, Node, SearchQuery, ShardQueryResult, StoredDocument, TermCount,
    TermsRequest,
};
use crate::{Error, Result};

/// Both shard maps live under one lock so membership changes are
/// linearized against in-flight document operations.
#[derive(Default)]
struct ShardMaps {
    primary: HashMap<u32, Arc<Shard>>,
    replica: HashMap<u32, Arc<Shard>>,
}

pub struct SearchIndex {
    index_name: String,
    settings: RwLock<IndexSettings>,
    shards: RwLock<ShardMaps>,
    engine: Arc<dyn SearchEngine>,
    blobs: Arc<dyn BlobStore>,
    commit_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SearchIndex {
    /// Create the index and start its commit ticker.
    pub fn new(
        settings: IndexSettings,
        engine: Arc<dyn SearchEngine>,
        blobs: Arc<dyn BlobStore>,
        commit_tick_interval: Duration,
    ) -> Arc<Self> {
        let index = Arc::new(Self {
            index_name: settings.index_name.clone(),
            settings: RwLock::new(settings),
            shards: RwLock::new(ShardMaps::default()),
            engine,
            blobs,
            commit_task: std::sync::Mutex::new(None),
        });

        // One ticker per index, driving idle commits across its shards,
        // rather than one timer per shard.
        let weak = Arc::downgrade(&index);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(commit_tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(index) = weak.upgrade() else {
                    return;
                };
                index.tick_commits().await;
            }
        });
        *index.commit_task.lock().expect("commit task slot poisoned") = Some(handle);

        index
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub async fn settings(&self) -> IndexSettings {
        self.settings.read().await.clone()
    }

    async fn tick_commits(&self) {
        let idle_enabled = self.settings.read().await.idle_time_without_commit_secs != 0;
        if !idle_enabled {
            return;
        }

        let primaries: Vec<Arc<Shard>> = {
            let maps = self.shards.read().await;
            maps.primary.values().cloned().collect()
        };

        for shard in primaries {
            if let Err(e) = shard.try_idle_commit() {
                error!(
                    index = %self.index_name,
                    shard = shard.shard_number(),
                    error = %e,
                    "idle commit failed"
                );
            }
        }
    }

    /// Load every shard of `mapping` this node serves, as primary or
    /// replica, then run the warming searches against each.
    pub async fn load_shards(&self, mapping: &IndexMapping, this_node: &Node) -> Result<()> {
        let settings = self.settings.read().await.clone();

        let mut loaded: Vec<Arc<Shard>> = Vec::new();
        {
            let mut maps = self.shards.write().await;
            for shard_mapping in &mapping.shard_mappings {
                if shard_mapping.primary == *this_node {
                    let shard = Arc::new(Shard::load(
                        &settings,
                        shard_mapping.shard_number,
                        true,
                        self.engine.as_ref(),
                        self.blobs.clone(),
                    )?);
                    maps.primary.insert(shard_mapping.shard_number, shard.clone());
                    loaded.push(shard);
                } else if shard_mapping.replicas.iter().any(|r| r == this_node) {
                    let shard = Arc::new(Shard::load(
                        &settings,
                        shard_mapping.shard_number,
                        false,
                        self.engine.as_ref(),
                        self.blobs.clone(),
                    )?);
                    maps.replica.insert(shard_mapping.shard_number, shard.clone());
                    loaded.push(shard);
                }
            }
        }

        // Warm outside the structural lock.
        if !settings.warming_searches.is_empty() {
            for shard in &loaded {
                shard.warm(&settings.warming_searches);
            }
        }

        info!(index = %self.index_name, shards = loaded.len(), "loaded index shards");
        Ok(())
    }

    pub async fn unload_shard(&self, shard_number: u32) -> Result<()> {
        let shard = {
            let mut maps = self.shards.write().await;
            maps.primary
                .remove(&shard_number)
                .or_else(|| maps.replica.remove(&shard_number))
        };

        if let Some(shard) = shard {
            shard.unload()?;
        }
        Ok(())
    }

    pub async fn unload_all(&self) -> Result<()> {
        let shards: Vec<Arc<Shard>> = {
            let mut maps = self.shards.write().await;
            let mut shards: Vec<Arc<Shard>> =
                maps.primary.drain().map(|(_, s)| s).collect();
            shards.extend(maps.replica.drain().map(|(_, s)| s));
            shards
        };

        for shard in shards {
            shard.unload()?;
        }
        Ok(())
    }

    /// Replace the index settings, propagating commit cadence changes to
    /// loaded writers. Structural: takes the write side of the lock.
    pub async fn reload_settings(&self, settings: IndexSettings) {
        let maps = self.shards.write().await;
        for shard in maps.primary.values() {
            shard.update_writer_settings(settings.clone());
        }
        drop(maps);

        let mut current = self.settings.write().await;
        *current = settings;
    }

    fn local_shard(maps: &ShardMaps, index_name: &str, shard_number: u32) -> Result<Arc<Shard>> {
        maps.primary
            .get(&shard_number)
            .or_else(|| maps.replica.get(&shard_number))
            .cloned()
            .ok_or_else(|| Error::ShardDoesNotExist {
                index: index_name.to_string(),
                shard: shard_number,
            })
    }

    fn local_primary_shard(
        maps: &ShardMaps,
        index_name: &str,
        shard_number: u32,
    ) -> Result<Arc<Shard>> {
        if let Some(shard) = maps.primary.get(&shard_number) {
            return Ok(shard.clone());
        }
        if maps.replica.contains_key(&shard_number) {
            return Err(Error::illegal_shard_state(format!(
                "node holds shard {} of index '{}' as replica, not primary",
                shard_number, index_name
            )));
        }
        Err(Error::ShardDoesNotExist {
            index: index_name.to_string(),
            shard: shard_number,
        })
    }

    /// Store a document in its locally loaded primary shard.
    pub async fn store(&self, shard_number: u32, doc: StoredDocument) -> Result<()> {
        let shard = {
            let maps = self.shards.read().await;
            Self::local_primary_shard(&maps, &self.index_name, shard_number)?
        };
        shard.index(doc)
    }

    /// Delete a document from its locally loaded primary shard.
    pub async fn delete(&self, shard_number: u32, unique_id: &str) -> Result<()> {
        let shard = {
            let maps = self.shards.read().await;
            Self::local_primary_shard(&maps, &self.index_name, shard_number)?
        };
        shard.delete(unique_id)
    }

    /// Fetch a document from whichever copy of the shard is loaded here.
    pub async fn fetch(
        &self,
        shard_number: u32,
        unique_id: &str,
    ) -> Result<Option<StoredDocument>> {
        let shard = {
            let maps = self.shards.read().await;
            Self::local_shard(&maps, &self.index_name, shard_number)?
        };
        shard.fetch(unique_id)
    }

    fn resolve_shards(&self, maps: &ShardMaps, shards: &[u32]) -> Result<Vec<Arc<Shard>>> {
        shards
            .iter()
            .map(|s| Self::local_shard(maps, &self.index_name, *s))
            .collect()
    }

    /// Evaluate a query against the listed local shards in parallel.
    ///
    /// Results come back in shard-list order regardless of completion
    /// order: each task writes its own pre-assigned slot.
    pub async fn query_shards(
        &self,
        shards: &[u32],
        query: &SearchQuery,
        amount: usize,
        dont_cache: bool,
        pin_to_cache: bool,
    ) -> Result<Vec<ShardQueryResult>> {
        let shard_refs = {
            let maps = self.shards.read().await;
            self.resolve_shards(&maps, shards)?
        };

        let mut set = JoinSet::new();
        for (slot, shard) in shard_refs.into_iter().enumerate() {
            let query = query.clone();
            set.spawn_blocking(move || {
                (slot, shard.query(&query, amount, dont_cache, pin_to_cache))
            });
        }

        let mut slots: Vec<Option<Result<ShardQueryResult>>> =
            (0..shards.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            let (slot, result) =
                joined.map_err(|e| Error::engine(format!("shard query task failed: {e}")))?;
            slots[slot] = Some(result);
        }

        slots
            .into_iter()
            .map(|r| r.expect("every slot filled"))
            .collect()
    }

    /// Enumerate terms across the listed local shards, merging frequencies.
    pub async fn terms_shards(
        &self,
        shards: &[u32],
        request: &TermsRequest,
    ) -> Result<Vec<TermCount>> {
        let shard_refs = {
            let maps = self.shards.read().await;
            self.resolve_shards(&maps, shards)?
        };

        let mut merged: HashMap<String, TermCount> = HashMap::new();
        for shard in shard_refs {
            for term in shard.terms(request)? {
                merged
                    .entry(term.term.clone())
                    .and_modify(|t| {
                        t.doc_freq += term.doc_freq;
                        t.term_freq += term.term_freq;
                    })
                    .or_insert(term);
            }
        }

        let mut terms: Vec<TermCount> = merged.into_values().collect();
        terms.sort_by(|a, b| a.term.cmp(&b.term));
        if request.amount > 0 {
            terms.truncate(request.amount);
        }
        Ok(terms)
    }

    /// Distinct field names across the listed local shards.
    pub async fn field_names_shards(&self, shards: &[u32]) -> Result<Vec<String>> {
        let shard_refs = {
            let maps = self.shards.read().await;
            self.resolve_shards(&maps, shards)?
        };

        let mut fields: Vec<String> = Vec::new();
        for shard in shard_refs {
            fields.extend(shard.field_names()?);
        }
        fields.sort();
        fields.dedup();
        Ok(fields)
    }

    /// Total documents across the listed local shards.
    pub async fn doc_count_shards(&self, shards: &[u32]) -> Result<u64> {
        let shard_refs = {
            let maps = self.shards.read().await;
            self.resolve_shards(&maps, shards)?
        };

        let mut total = 0u64;
        for shard in shard_refs {
            total += shard.doc_count()?;
        }
        Ok(total)
    }

    /// Force-merge then commit the listed local primary shards.
    pub async fn optimize_shards(&self, shards: &[u32], max_segments: u32) -> Result<()> {
        let shard_refs = {
            let maps = self.shards.read().await;
            self.resolve_shards(&maps, shards)?
        };

        for shard in shard_refs {
            shard.optimize(max_segments)?;
        }
        Ok(())
    }

    /// Clear the listed local primary shards.
    pub async fn clear_shards(&self, shards: &[u32]) -> Result<()> {
        let shard_refs = {
            let maps = self.shards.read().await;
            self.resolve_shards(&maps, shards)?
        };

        for shard in shard_refs {
            shard.clear().await?;
        }
        Ok(())
    }

    /// Reindex the listed local primary shards.
    pub async fn reindex_shards(&self, shards: &[u32]) -> Result<()> {
        let shard_refs = {
            let maps = self.shards.read().await;
            self.resolve_shards(&maps, shards)?
        };

        let mut set = JoinSet::new();
        for shard in shard_refs {
            set.spawn_blocking(move || shard.reindex());
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let result = joined.map_err(|e| Error::engine(format!("reindex task failed: {e}")))?;
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Force a commit on every local primary shard.
    pub async fn commit_all(&self) -> Result<()> {
        let primaries: Vec<Arc<Shard>> = {
            let maps = self.shards.read().await;
            maps.primary.values().cloned().collect()
        };

        for shard in primaries {
            shard.force_commit()?;
        }
        Ok(())
    }
}

impl Drop for SearchIndex {
    fn drop(&mut self) {
        if let Some(handle) = self
            .commit_task
            .lock()
            .expect("commit task slot poisoned")
            .take()
        {
            handle.abort();
        }
    }
}
