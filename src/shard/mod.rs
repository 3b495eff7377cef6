//! Shard lifecycle
//!
//! A Shard ties together one engine shard, its write manager (primary
//! copies only), its reader manager, and its query result cache. Mutation
//! is primary-only; replicas serve reads from snapshots their engine
//! state produces out of band.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use tracing::{info, warn};

use crate::blob::BlobStore;
use crate::engine::{EngineShard, SearchEngine};
use crate::types::{
    IndexSettings, SearchQuery, ShardQueryResult, StoredDocument, TermCount, TermsRequest,
};
use crate::{Error, Result};

pub mod cache;
pub mod reader;
pub mod writer;

pub use cache::{QueryCacheKey, QueryResultCache};
pub use reader::ShardReaderManager;
pub use writer::ShardWriteManager;

pub struct Shard {
    index_name: String,
    shard_number: u32,
    primary: bool,
    writer: Option<ShardWriteManager>,
    readers: ShardReaderManager,
    cache: Option<QueryResultCache>,
    /// Requests for more results than this bypass the cache; 0 = no limit
    cache_max_amount: u32,
    blobs: Arc<dyn BlobStore>,
    /// Generation token of the newest reindex pass; a running pass aborts
    /// when it observes a newer generation
    reindex_generation: AtomicU64,
    reindex_active: AtomicBool,
    /// Ids already handled by the active reindex pass, including ids
    /// written concurrently while the pass runs
    reindex_seen: DashSet<String>,
}

impl Shard {
    /// Load one shard of an index on this node.
    pub fn load(
        settings: &IndexSettings,
        shard_number: u32,
        primary: bool,
        engine: &dyn SearchEngine,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        let engine_shard: Arc<dyn EngineShard> = engine.open_shard(settings, shard_number)?;

        let writer = primary.then(|| {
            ShardWriteManager::new(settings.clone(), shard_number, engine_shard.clone())
        });

        let readers = ShardReaderManager::open(
            settings.index_name.clone(),
            shard_number,
            engine_shard,
        )?;

        let cache = (settings.shard_query_cache_size > 0)
            .then(|| QueryResultCache::new(settings.shard_query_cache_size));

        info!(
            index = %settings.index_name,
            shard = shard_number,
            primary,
            "loaded shard"
        );

        Ok(Self {
            index_name: settings.index_name.clone(),
            shard_number,
            primary,
            writer,
            readers,
            cache,
            cache_max_amount: settings.shard_query_cache_max_amount,
            blobs,
            reindex_generation: AtomicU64::new(0),
            reindex_active: AtomicBool::new(false),
            reindex_seen: DashSet::new(),
        })
    }

    pub fn shard_number(&self) -> u32 {
        self.shard_number
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    fn writer(&self, operation: &str) -> Result<&ShardWriteManager> {
        self.writer.as_ref().ok_or_else(|| {
            Error::illegal_shard_state(format!(
                "cannot {} on replica shard {} of index '{}'",
                operation, self.shard_number, self.index_name
            ))
        })
    }

    /// Add or replace a document. Primary only.
    pub fn index(&self, doc: StoredDocument) -> Result<()> {
        let writer = self.writer("index document")?;

        if self.reindex_active.load(Ordering::SeqCst) {
            // The running reindex pass must not replay this id.
            self.reindex_seen.insert(doc.unique_id.clone());
        }

        writer.index_document(doc)?;
        if writer.mark_changed_check_if_commit_needed() {
            self.force_commit()?;
        }
        Ok(())
    }

    /// Delete a document. Primary only.
    pub fn delete(&self, unique_id: &str) -> Result<()> {
        let writer = self.writer("delete document")?;

        if self.reindex_active.load(Ordering::SeqCst) {
            self.reindex_seen.insert(unique_id.to_string());
        }

        writer.delete_document(unique_id)?;
        if writer.mark_changed_check_if_commit_needed() {
            self.force_commit()?;
        }
        Ok(())
    }

    /// Durably persist pending mutations and make them visible to new
    /// snapshots. Primary only.
    pub fn force_commit(&self) -> Result<()> {
        let writer = self.writer("commit")?;
        writer.commit()?;
        self.readers.refresh_if_needed()?;
        Ok(())
    }

    /// Commit only when writes have gone idle with uncommitted changes.
    /// Driven by the index commit ticker.
    pub fn try_idle_commit(&self) -> Result<()> {
        if let Some(writer) = &self.writer {
            if writer.needs_idle_commit() {
                writer.commit()?;
                self.readers.refresh_if_needed()?;
            }
        }
        Ok(())
    }

    /// Compact the shard then commit. Primary only.
    pub fn optimize(&self, max_segments: u32) -> Result<()> {
        let writer = self.writer("optimize")?;
        writer.force_merge(max_segments)?;
        self.force_commit()
    }

    /// Remove all documents and the index's associated blobs. Primary
    /// only. A blob-store failure leaves the shard logically empty with
    /// orphaned blobs — degraded, not fatal.
    pub async fn clear(&self) -> Result<()> {
        let writer = self.writer("clear")?;
        writer.delete_all()?;
        self.force_commit()?;

        if let Err(e) = self.blobs.drop_index(&self.index_name).await {
            warn!(
                index = %self.index_name,
                shard = self.shard_number,
                error = %e,
                "cleared shard but failed to drop associated blobs"
            );
        }
        Ok(())
    }

    /// Rebuild the shard by streaming every stored document back through
    /// the index path. Primary only.
    ///
    /// Documents written while the pass runs are marked seen and skipped,
    /// so racing writes are indexed exactly once. Starting a second pass
    /// supersedes the first, which aborts with `InterruptedReindex`.
    pub fn reindex(&self) -> Result<()> {
        let writer = self.writer("reindex")?;

        let my_generation = self.reindex_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.reindex_seen.clear();
        self.reindex_active.store(true, Ordering::SeqCst);

        let result = self.reindex_pass(writer, my_generation);

        // Only the pass that still owns the token resets the active flag;
        // a superseded pass must not clobber its successor's state.
        if self.reindex_generation.load(Ordering::SeqCst) == my_generation {
            self.reindex_active.store(false, Ordering::SeqCst);
        }

        result
    }

    fn reindex_pass(&self, writer: &ShardWriteManager, my_generation: u64) -> Result<()> {
        self.readers.refresh_if_needed()?;
        let snapshot = self.readers.acquire();
        let ids = snapshot.document_ids()?;

        info!(
            index = %self.index_name,
            shard = self.shard_number,
            documents = ids.len(),
            "starting reindex pass"
        );

        for unique_id in ids {
            if self.reindex_generation.load(Ordering::SeqCst) != my_generation {
                return Err(Error::InterruptedReindex {
                    index: self.index_name.clone(),
                    shard: self.shard_number,
                });
            }

            // Inserted by a concurrent write or an earlier iteration.
            if !self.reindex_seen.insert(unique_id.clone()) {
                continue;
            }

            if let Some(doc) = snapshot.fetch(&unique_id)? {
                writer.index_document(doc)?;
                writer.mark_changed_check_if_commit_needed();
            }
        }

        if self.reindex_generation.load(Ordering::SeqCst) != my_generation {
            return Err(Error::InterruptedReindex {
                index: self.index_name.clone(),
                shard: self.shard_number,
            });
        }

        self.force_commit()
    }

    /// Evaluate a query against the current snapshot, consulting the
    /// result cache unless the request opted out or asks for more results
    /// than the cache admits.
    pub fn query(
        &self,
        query: &SearchQuery,
        amount: usize,
        dont_cache: bool,
        pin_to_cache: bool,
    ) -> Result<ShardQueryResult> {
        self.readers.refresh_if_needed()?;
        let snapshot = self.readers.acquire();

        let use_cache = self.cache.is_some()
            && !dont_cache
            && (self.cache_max_amount == 0 || amount <= self.cache_max_amount as usize);

        if !use_cache {
            return snapshot.search(query, amount);
        }

        let cache = self.cache.as_ref().expect("cache checked above");
        let key = QueryCacheKey::new(query, amount, pin_to_cache);

        if let Some(cached) = cache.get(&key, snapshot.version()) {
            return Ok(cached);
        }

        let result = snapshot.search(query, amount)?;
        cache.put(key, snapshot.version(), result.clone());
        Ok(result)
    }

    /// Run the configured warming searches, pinning their results so the
    /// shard answers hot queries from cache before serving traffic.
    pub fn warm(&self, warming_searches: &[crate::types::WarmingSearch]) {
        for search in warming_searches {
            if let Err(e) = self.query(&search.query, search.amount, false, true) {
                warn!(
                    index = %self.index_name,
                    shard = self.shard_number,
                    error = %e,
                    "warming search failed"
                );
            }
        }
    }

    pub fn fetch(&self, unique_id: &str) -> Result<Option<StoredDocument>> {
        self.readers.refresh_if_needed()?;
        self.readers.acquire().fetch(unique_id)
    }

    pub fn field_names(&self) -> Result<Vec<String>> {
        self.readers.refresh_if_needed()?;
        self.readers.acquire().field_names()
    }

    pub fn terms(&self, request: &TermsRequest) -> Result<Vec<TermCount>> {
        self.readers.refresh_if_needed()?;
        self.readers.acquire().terms(request)
    }

    pub fn doc_count(&self) -> Result<u64> {
        self.readers.refresh_if_needed()?;
        self.readers.acquire().doc_count()
    }

    /// Pick up reloaded index settings on the write manager, if any.
    pub fn update_writer_settings(&self, settings: IndexSettings) {
        if let Some(writer) = &self.writer {
            writer.update_settings(settings);
        }
    }

    /// Unload the shard. Commits pending writes on primaries first.
    pub fn unload(&self) -> Result<()> {
        if let Some(writer) = &self.writer {
            writer.commit()?;
            writer.close()?;
        }
        self.readers.close();
        info!(
            index = %self.index_name,
            shard = self.shard_number,
            "unloaded shard"
        );
        Ok(())
    }
}
