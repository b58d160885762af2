//! Pure conversions between the in-memory `MarketTable` and the serializable checkpoint types.
//!
//! This file MUST NOT talk to the store. Only struct <-> struct mapping lives here.

use crate::engine::table::MarketTable;
use crate::persist::types::{
    Checkpoint, ClosedMark, LedgerCommit, LedgerCursor, PersistError, PersistResult, CHECKPOINT_SCHEMA_VERSION,
};

/// Capture the table state after `cursor`'s ledger, together with the bars
/// that ledger closed.
pub fn commit_from_table(table: &mut MarketTable, cursor: LedgerCursor) -> LedgerCommit {
    let checkpoint = Checkpoint {
        version: CHECKPOINT_SCHEMA_VERSION,
        cursor,
        open_bars: table.open_bars(),
        last_closed: table
            .last_closed()
            .into_iter()
            .map(|(pair, bucket_start)| ClosedMark { pair, bucket_start })
            .collect(),
    };
    LedgerCommit { checkpoint, closed_bars: table.drain_closed() }
}

/// Rebuild a table from a checkpoint. Closed bars stay in the store.
pub fn apply_to_table(table: &mut MarketTable, checkpoint: &Checkpoint) -> PersistResult<()> {
    if checkpoint.version != CHECKPOINT_SCHEMA_VERSION {
        return Err(PersistError::FormatMismatch(format!(
            "checkpoint schema {} (expected {})",
            checkpoint.version, CHECKPOINT_SCHEMA_VERSION
        )));
    }
    let last_closed = checkpoint
        .last_closed
        .iter()
        .map(|mark| (mark.pair.clone(), mark.bucket_start))
        .collect();
    table.restore(checkpoint.open_bars.clone(), last_closed);
    Ok(())
}
