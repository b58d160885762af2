pub mod types;
pub use types::*;
pub mod checkpoint;
pub mod codec;
pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use async_trait::async_trait;

use crate::engine::types::{AssetPair, MarketBar};

/// Durable scan progress. `commit` must be atomic: after a crash either the
/// whole ledger commit is visible or none of it is.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_checkpoint(&self) -> PersistResult<Option<Checkpoint>>;
    async fn commit(&mut self, commit: &LedgerCommit) -> PersistResult<()>;
    /// Closed bars ordered by pair then bucket, optionally for one pair only.
    async fn closed_bars(&self, pair: Option<&AssetPair>) -> PersistResult<Vec<MarketBar>>;
}
