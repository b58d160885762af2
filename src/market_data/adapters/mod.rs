// Shared trait + types for ledger data sources

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Timeouts, connection resets, overloaded node. Worth retrying.
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    /// Malformed response, unsupported request, ledger outside history. Never retried.
    #[error("permanent protocol error: {0}")]
    PermanentProtocol(String),
    #[error("giving up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::TransientNetwork(_))
    }
}

/// A transaction exactly as the node returned it. Never mutated after fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTransaction {
    pub hash: String,
    pub ledger_index: u32,
    /// Close time of the containing ledger, when known.
    pub timestamp: Option<DateTime<Utc>>,
    pub tx: Value,
    pub meta: Option<Value>,
}

impl RawTransaction {
    /// Position of the transaction inside its ledger, from the metadata.
    pub fn transaction_index(&self) -> Option<u64> {
        self.meta.as_ref()?.get("TransactionIndex")?.as_u64()
    }
}

/// One validated ledger and its transactions in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerBatch {
    pub index: u32,
    pub hash: String,
    pub parent_hash: String,
    pub close_time: DateTime<Utc>,
    pub transactions: Vec<RawTransaction>,
}

#[async_trait::async_trait]
pub trait LedgerSource: Send + Sync {
    async fn fetch_ledger(&self, index: u32) -> Result<LedgerBatch, FetchError>;
    async fn latest_validated_index(&self) -> Result<u32, FetchError>;
}

pub mod retry;
pub mod xrpl;
pub mod xrpl_types;
