use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::engine::types::{AssetPair, MarketBar};
use crate::persist::types::{Checkpoint, LedgerCommit, PersistError, PersistResult};
use crate::persist::CheckpointStore;

#[derive(Debug, Default)]
struct MemoryInner {
    checkpoint: Option<Checkpoint>,
    bars: BTreeMap<(AssetPair, DateTime<Utc>), MarketBar>,
    commits: usize,
    fail_commits: bool,
}

/// In-process store. Clones share state, so a test can keep a handle while
/// the scanner owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.inner.lock().checkpoint.clone()
    }

    pub fn commits(&self) -> usize {
        self.inner.lock().commits
    }

    /// Make every following commit fail with an I/O error.
    pub fn fail_commits(&self, fail: bool) {
        self.inner.lock().fail_commits = fail;
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryStore {
    async fn load_checkpoint(&self) -> PersistResult<Option<Checkpoint>> {
        Ok(self.inner.lock().checkpoint.clone())
    }

    async fn commit(&mut self, commit: &LedgerCommit) -> PersistResult<()> {
        let mut inner = self.inner.lock();
        if inner.fail_commits {
            return Err(PersistError::Io("memory store commits disabled".into()));
        }
        for bar in &commit.closed_bars {
            inner.bars.insert((bar.pair.clone(), bar.bucket_start), bar.clone());
        }
        inner.checkpoint = Some(commit.checkpoint.clone());
        inner.commits += 1;
        Ok(())
    }

    async fn closed_bars(&self, pair: Option<&AssetPair>) -> PersistResult<Vec<MarketBar>> {
        Ok(self
            .inner
            .lock()
            .bars
            .values()
            .filter(|bar| pair.map_or(true, |p| &bar.pair == p))
            .cloned()
            .collect())
    }
}
