//! Reference-counted shard snapshots
//!
//! Readers acquire the current searchable snapshot by cloning an `Arc`;
//! the clone is the refcount. A refresh swaps the current pointer to a
//! snapshot built from the latest committed state without touching
//! existing holders — an old snapshot is freed when its last holder drops
//! it. A snapshot, once acquired, is stable for the caller's entire
//! operation regardless of concurrent writes.

use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::engine::{EngineShard, EngineSnapshot};
use crate::Result;

pub struct ShardReaderManager {
    index_name: String,
    shard_number: u32,
    engine: Arc<dyn EngineShard>,
    current: RwLock<Option<Arc<dyn EngineSnapshot>>>,
}

impl ShardReaderManager {
    /// Open the manager with an initial snapshot of the committed state.
    pub fn open(
        index_name: String,
        shard_number: u32,
        engine: Arc<dyn EngineShard>,
    ) -> Result<Self> {
        let initial = engine.open_snapshot()?;
        Ok(Self {
            index_name,
            shard_number,
            engine,
            current: RwLock::new(Some(initial)),
        })
    }

    /// Acquire the current snapshot. Never fails while the shard is
    /// loaded; acquiring after close is a programming error.
    pub fn acquire(&self) -> Arc<dyn EngineSnapshot> {
        let current = self.current.read().expect("reader state poisoned");
        current
            .as_ref()
            .unwrap_or_else(|| {
                panic!(
                    "acquire on unloaded shard {} of index '{}'",
                    self.shard_number, self.index_name
                )
            })
            .clone()
    }

    /// Version of the snapshot readers currently receive.
    pub fn current_version(&self) -> u64 {
        self.acquire().version()
    }

    /// Swap in a new snapshot if the engine has committed past the current
    /// one. Idempotent: a no-op when nothing changed. Existing snapshot
    /// holders are never blocked or invalidated.
    pub fn refresh_if_needed(&self) -> Result<bool> {
        let committed = self.engine.committed_version();
        {
            let current = self.current.read().expect("reader state poisoned");
            match current.as_ref() {
                Some(snapshot) if snapshot.version() == committed => return Ok(false),
                Some(_) => {}
                None => panic!(
                    "refresh on unloaded shard {} of index '{}'",
                    self.shard_number, self.index_name
                ),
            }
        }

        let fresh = self.engine.open_snapshot()?;
        let mut current = self.current.write().expect("reader state poisoned");
        // A racing refresh may have already swapped; only move forward.
        if current
            .as_ref()
            .map(|s| s.version() < fresh.version())
            .unwrap_or(false)
        {
            debug!(
                index = %self.index_name,
                shard = self.shard_number,
                version = fresh.version(),
                "refreshed shard snapshot"
            );
            *current = Some(fresh);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Drop the current snapshot; outstanding holders keep theirs until
    /// they finish.
    pub fn close(&self) {
        let mut current = self.current.write().expect("reader state poisoned");
        *current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::engine::SearchEngine;
    use crate::types::{Document, FieldValue, IndexSettings, Metadata, StoredDocument};

    fn open_pair() -> (Arc<dyn EngineShard>, ShardReaderManager) {
        let engine = MemoryEngine::new()
            .open_shard(&IndexSettings::new("articles", 1), 0)
            .unwrap();
        let readers =
            ShardReaderManager::open("articles".to_string(), 0, engine.clone()).unwrap();
        (engine, readers)
    }

    fn doc(id: &str) -> StoredDocument {
        StoredDocument {
            unique_id: id.to_string(),
            timestamp: 1,
            document: Document::new().with_field("title", FieldValue::String("x".to_string())),
            metadata: Metadata::default(),
        }
    }

    #[test]
    fn test_refresh_is_idempotent_without_commits() {
        let (_engine, readers) = open_pair();
        assert!(!readers.refresh_if_needed().unwrap());
        assert!(!readers.refresh_if_needed().unwrap());
    }

    #[test]
    fn test_acquired_snapshot_is_stable_across_refresh() {
        let (engine, readers) = open_pair();

        let held = readers.acquire();
        assert_eq!(held.doc_count().unwrap(), 0);

        engine.index_document(doc("1")).unwrap();
        engine.commit().unwrap();
        assert!(readers.refresh_if_needed().unwrap());

        // The held snapshot still sees the old state; a fresh acquire sees
        // the commit.
        assert_eq!(held.doc_count().unwrap(), 0);
        assert_eq!(readers.acquire().doc_count().unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "acquire on unloaded shard")]
    fn test_acquire_after_close_panics() {
        let (_engine, readers) = open_pair();
        readers.close();
        let _ = readers.acquire();
    }
}
