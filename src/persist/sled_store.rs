use std::path::Path;

use tracing::{debug, info};

use crate::engine::types::{AssetPair, MarketBar};
use crate::persist::codec::{bar_from_json, bar_key, bar_prefix, bar_to_json, checkpoint_from_json, checkpoint_to_json, CHECKPOINT_KEY};
use crate::persist::types::{Checkpoint, LedgerCommit, PersistResult};
use crate::persist::CheckpointStore;

const TREE_NAME: &str = "xrpl_market_data";

/// Embedded checkpoint store. Closed bars and the checkpoint share one tree so
/// a ledger's changes land in a single atomic batch. Clones share the tree,
/// so a reader handle sees the writer's commits.
#[derive(Clone)]
pub struct SledStore {
    _db: sled::Db,
    tree: sled::Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let db = sled::open(path.as_ref())?;
        let tree = db.open_tree(TREE_NAME)?;
        info!(path = %path.as_ref().display(), entries = tree.len(), "Opened sled store");
        Ok(Self { _db: db, tree })
    }

    /// Throwaway store, deleted on drop.
    pub fn temporary() -> PersistResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { _db: db, tree })
    }
}

#[async_trait::async_trait]
impl CheckpointStore for SledStore {
    async fn load_checkpoint(&self) -> PersistResult<Option<Checkpoint>> {
        self.tree
            .get(CHECKPOINT_KEY)?
            .map(|bytes| checkpoint_from_json(&bytes))
            .transpose()
    }

    async fn commit(&mut self, commit: &LedgerCommit) -> PersistResult<()> {
        let mut batch = sled::Batch::default();
        for bar in &commit.closed_bars {
            // same key on replay, so re-committing a ledger overwrites instead of duplicating
            batch.insert(bar_key(&bar.pair, bar.bucket_start), bar_to_json(bar)?);
        }
        batch.insert(CHECKPOINT_KEY, checkpoint_to_json(&commit.checkpoint)?);

        self.tree.apply_batch(batch)?;
        self.tree.flush_async().await?;
        debug!(
            ledger = commit.checkpoint.cursor.last_processed_index,
            closed = commit.closed_bars.len(),
            "Committed ledger"
        );
        Ok(())
    }

    async fn closed_bars(&self, pair: Option<&AssetPair>) -> PersistResult<Vec<MarketBar>> {
        self.tree
            .scan_prefix(bar_prefix(pair))
            .values()
            .map(|value| bar_from_json(&value?))
            .collect()
    }
}
