// Source: rippled JSON-RPC `ledger` and `account_tx` responses (API v1 and v2)

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::RawTransaction;

/// Seconds between the Unix epoch and the ledger epoch (2000-01-01T00:00:00Z).
pub const RIPPLE_EPOCH_OFFSET: i64 = 946_684_800;

pub fn ripple_time_to_utc(ripple_secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(ripple_secs).ok()?.checked_add(RIPPLE_EPOCH_OFFSET)?;
    DateTime::from_timestamp(secs, 0)
}

/// v1 returns indices as strings, v2 as numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LedgerIndex {
    Number(u32),
    Text(String),
}

impl LedgerIndex {
    pub fn value(&self) -> Option<u32> {
        match self {
            LedgerIndex::Number(n) => Some(*n),
            LedgerIndex::Text(s) => s.parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LedgerResult {
    pub ledger: LedgerHeader,
    #[serde(default)]
    pub validated: bool,
}

#[derive(Debug, Deserialize)]
pub struct LedgerHeader {
    pub ledger_hash: String,
    pub ledger_index: LedgerIndex,
    pub parent_hash: String,
    pub close_time: u64,
    #[serde(default)]
    pub transactions: Vec<Value>,
}

/// `ledger` with `ledger_index: "validated"` and no transactions.
#[derive(Debug, Deserialize)]
pub struct ValidatedLedgerResult {
    #[serde(default)]
    pub ledger_index: Option<LedgerIndex>,
    #[serde(default)]
    pub ledger: Option<ValidatedLedgerHeader>,
}

#[derive(Debug, Deserialize)]
pub struct ValidatedLedgerHeader {
    pub ledger_index: LedgerIndex,
}

#[derive(Debug, Deserialize)]
pub struct AccountTxResult {
    #[serde(default)]
    pub transactions: Vec<Value>,
    #[serde(default)]
    pub marker: Option<Value>,
}

/// Split one transaction entry into (tx, meta, hash) whatever the API shape:
/// v2 `{tx_json, meta, hash}`, v1 account_tx `{tx, meta}`, or v1 expanded
/// ledger entries with inline fields and `metaData`.
pub fn split_entry(mut entry: Value, ledger_index: u32, timestamp: Option<DateTime<Utc>>) -> RawTransaction {
    let outer_hash = entry.get("hash").and_then(Value::as_str).map(str::to_string);
    let outer_index = entry.get("ledger_index").and_then(Value::as_u64);
    let outer_time = entry
        .get("close_time_iso")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    let tx_field = take_field(&mut entry, &["tx_json", "tx"]);
    let meta = take_field(&mut entry, &["meta", "metaData"]);
    let tx = tx_field.unwrap_or(entry);

    let hash = outer_hash
        .or_else(|| tx.get("hash").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();
    let ledger_index = outer_index
        .or_else(|| tx.get("ledger_index").and_then(Value::as_u64))
        .and_then(|i| u32::try_from(i).ok())
        .unwrap_or(ledger_index);
    let timestamp = timestamp
        .or_else(|| tx.get("date").and_then(Value::as_u64).and_then(ripple_time_to_utc))
        .or(outer_time);

    RawTransaction { hash, ledger_index, timestamp, tx, meta }
}

fn take_field(entry: &mut Value, names: &[&str]) -> Option<Value> {
    let object = entry.as_object_mut()?;
    names.iter().find_map(|name| object.remove(*name))
}
