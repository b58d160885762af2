use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::types::{AssetPair, MarketBar};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("serialization failure: {0}")]
    Serialization(String),
    #[error("format mismatch: {0}")]
    FormatMismatch(String),
    #[error("{0}")]
    Other(String),
}

impl From<sled::Error> for PersistError {
    fn from(e: sled::Error) -> Self {
        PersistError::Io(e.to_string())
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Scan progress. Index and hash always move together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCursor {
    pub last_processed_index: u32,
    pub last_processed_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedMark {
    pub pair: AssetPair,
    pub bucket_start: DateTime<Utc>,
}

/// Everything needed to resume: the cursor plus the mutable part of the table
/// as it stood right after the cursor's ledger was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub cursor: LedgerCursor,
    pub open_bars: Vec<MarketBar>,
    pub last_closed: Vec<ClosedMark>,
}

/// One ledger's worth of durable changes, written atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCommit {
    pub checkpoint: Checkpoint,
    pub closed_bars: Vec<MarketBar>,
}
