
use chrono::{DateTime, Utc};

use crate::engine::types::{AssetPair, MarketBar};
use crate::persist::types::{Checkpoint, PersistError, PersistResult, CHECKPOINT_SCHEMA_VERSION};

pub const CHECKPOINT_KEY: &[u8] = b"checkpoint";
const BAR_PREFIX: &[u8] = b"bar\0";

/// Convert a checkpoint into JSON bytes
pub fn checkpoint_to_json(checkpoint: &Checkpoint) -> PersistResult<Vec<u8>> {
    serde_json::to_vec(checkpoint).map_err(|e| PersistError::Serialization(e.to_string()))
}

/// Parse checkpoint JSON read back from the store.
pub fn checkpoint_from_json(bytes: &[u8]) -> PersistResult<Checkpoint> {
    let checkpoint: Checkpoint =
        serde_json::from_slice(bytes).map_err(|e| PersistError::FormatMismatch(e.to_string()))?;
    if checkpoint.version != CHECKPOINT_SCHEMA_VERSION {
        return Err(PersistError::FormatMismatch(format!("unknown checkpoint schema {}", checkpoint.version)));
    }
    Ok(checkpoint)
}

pub fn bar_to_json(bar: &MarketBar) -> PersistResult<Vec<u8>> {
    serde_json::to_vec(bar).map_err(|e| PersistError::Serialization(e.to_string()))
}

pub fn bar_from_json(bytes: &[u8]) -> PersistResult<MarketBar> {
    serde_json::from_slice(bytes).map_err(|e| PersistError::FormatMismatch(e.to_string()))
}

/// `bar\0<pair>\0<bucket>`; the bucket is big-endian with the sign bit
/// flipped so byte order matches time order.
pub fn bar_key(pair: &AssetPair, bucket_start: DateTime<Utc>) -> Vec<u8> {
    let mut key = bar_prefix(Some(pair));
    let ordered = (bucket_start.timestamp() as u64) ^ (1u64 << 63);
    key.extend_from_slice(&ordered.to_be_bytes());
    key
}

pub fn bar_prefix(pair: Option<&AssetPair>) -> Vec<u8> {
    let mut key = BAR_PREFIX.to_vec();
    if let Some(pair) = pair {
        key.extend_from_slice(pair.to_string().as_bytes());
        key.push(0);
    }
    key
}
