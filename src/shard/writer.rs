//! Shard write management
//!
//! Owns the single mutable writer of a shard's engine state and the
//! commit cadence bookkeeping: a mutation counter forces a commit every
//! `shard_commit_interval` writes, and idle commits catch shards whose
//! write rate is too low to ever hit the counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tracing::info;

use crate::engine::EngineShard;
use crate::types::{IndexSettings, StoredDocument};
use crate::Result;

pub struct ShardWriteManager {
    index_name: String,
    shard_number: u32,
    engine: Arc<dyn EngineShard>,
    settings: RwLock<IndexSettings>,
    /// Mutations since the shard was loaded
    counter: AtomicU64,
    last_commit: Mutex<Option<Instant>>,
    last_change: Mutex<Option<Instant>>,
}

impl ShardWriteManager {
    pub fn new(settings: IndexSettings, shard_number: u32, engine: Arc<dyn EngineShard>) -> Self {
        Self {
            index_name: settings.index_name.clone(),
            shard_number,
            engine,
            settings: RwLock::new(settings),
            counter: AtomicU64::new(0),
            last_commit: Mutex::new(None),
            last_change: Mutex::new(None),
        }
    }

    pub fn index_document(&self, doc: StoredDocument) -> Result<()> {
        self.engine.index_document(doc)
    }

    pub fn delete_document(&self, unique_id: &str) -> Result<()> {
        self.engine.delete_document(unique_id)
    }

    /// Record a mutation; returns true when the mutation counter crossed
    /// the commit interval and the caller must force a commit now.
    pub fn mark_changed_check_if_commit_needed(&self) -> bool {
        let mut last_change = self.last_change.lock().expect("writer state poisoned");
        *last_change = Some(Instant::now());
        drop(last_change);

        let count = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let interval = self.settings.read().expect("settings poisoned").shard_commit_interval;
        interval > 0 && count % interval == 0
    }

    /// True when writes have gone idle with uncommitted changes pending.
    pub fn needs_idle_commit(&self) -> bool {
        let idle_secs = self
            .settings
            .read()
            .expect("settings poisoned")
            .idle_time_without_commit_secs;
        if idle_secs == 0 {
            return false;
        }

        let last_change = *self.last_change.lock().expect("writer state poisoned");
        let Some(changed_at) = last_change else {
            return false;
        };

        if changed_at.elapsed().as_secs() < idle_secs {
            return false;
        }

        let last_commit = *self.last_commit.lock().expect("writer state poisoned");
        match last_commit {
            None => true,
            Some(committed_at) => changed_at > committed_at,
        }
    }

    /// Durably persist writer state.
    pub fn commit(&self) -> Result<()> {
        info!(
            index = %self.index_name,
            shard = self.shard_number,
            "committing shard"
        );
        let now = Instant::now();
        self.engine.commit()?;
        let mut last_commit = self.last_commit.lock().expect("writer state poisoned");
        *last_commit = Some(now);
        Ok(())
    }

    /// Compact to at most `max_segments` segments. Callers commit after.
    pub fn force_merge(&self, max_segments: u32) -> Result<()> {
        let mut last_change = self.last_change.lock().expect("writer state poisoned");
        *last_change = Some(Instant::now());
        drop(last_change);
        self.engine.force_merge(max_segments)
    }

    pub fn delete_all(&self) -> Result<()> {
        self.engine.delete_all()
    }

    pub fn update_settings(&self, settings: IndexSettings) {
        let mut current = self.settings.write().expect("settings poisoned");
        *current = settings;
    }

    pub fn close(&self) -> Result<()> {
        self.engine.close()
    }
}
