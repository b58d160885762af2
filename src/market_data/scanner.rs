// Ledger scanner: drives the fetch -> normalize -> table -> commit loop, one ledger at a time

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{stream, StreamExt};
use hdrhistogram::Histogram;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::table::{sort_rows, BarRow, MarketTable};
use crate::engine::types::{MarketBar, TableError, TxType};
use crate::market_data::adapters::{FetchError, LedgerBatch, LedgerSource};
use crate::market_data::normaliser::{NormaliseError, Normaliser};
use crate::persist::checkpoint::{apply_to_table, commit_from_table};
use crate::persist::{CheckpointStore, LedgerCursor, PersistError};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Normalise(#[from] NormaliseError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("ledger {index} has parent {parent_hash}, expected {expected}")]
    ChainDiscontinuity { index: u32, expected: String, parent_hash: String },
    #[error("invalid scanner configuration: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Fetching { index: u32 },
    Normalizing { index: u32 },
    Committed { index: u32 },
    Stalled { index: u32, reason: String },
}

impl ScanState {
    pub fn is_stalled(&self) -> bool {
        matches!(self, ScanState::Stalled { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub start_ledger_index: Option<u32>,
    pub end_ledger_index: Option<u32>,
    /// Ledgers fetched ahead of the one being committed.
    pub prefetch_depth: usize,
    /// Event types folded into bars.
    pub bar_tx_types: Vec<TxType>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            start_ledger_index: None,
            end_ledger_index: None,
            prefetch_depth: 4,
            bar_tx_types: TxType::TRADES.to_vec(),
        }
    }
}

/// Read-only view published after every commit: the open bars plus the bars
/// that commit closed, ordered by pair then bucket. Earlier closed bars are
/// read from the store.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub state: ScanState,
    pub cursor: Option<LedgerCursor>,
    pub rows: Vec<BarRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchLatency {
    pub samples: u64,
    pub p50_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub state: ScanState,
    pub cursor: Option<LedgerCursor>,
    pub ledgers_committed: u64,
    pub events_normalized: u64,
    pub events_filtered: u64,
    pub malformed_skipped: u64,
    pub out_of_range_skipped: u64,
    pub bars_closed: u64,
    pub fetch_latency: FetchLatency,
}

impl ScanReport {
    pub fn is_stalled(&self) -> bool {
        self.state.is_stalled()
    }
}

#[derive(Debug, Default)]
struct ScanCounters {
    ledgers_committed: u64,
    events_normalized: u64,
    events_filtered: u64,
    malformed_skipped: u64,
    out_of_range_skipped: u64,
    bars_closed: u64,
}

pub struct Scanner<S, P> {
    source: Arc<S>,
    store: P,
    normaliser: Normaliser,
    table: MarketTable,
    config: ScannerConfig,
    cursor: Option<LedgerCursor>,
    state: ScanState,
    counters: ScanCounters,
    latency: Histogram<u64>,
    snapshot_tx: watch::Sender<PipelineSnapshot>,
}

impl<S, P> Scanner<S, P>
where
    S: LedgerSource + 'static,
    P: CheckpointStore,
{
    pub fn new(
        source: Arc<S>,
        store: P,
        normaliser: Normaliser,
        table: MarketTable,
        config: ScannerConfig,
    ) -> Result<Self, ScanError> {
        if config.prefetch_depth == 0 {
            return Err(ScanError::Configuration("prefetch_depth must be at least 1".into()));
        }
        if let (Some(start), Some(end)) = (config.start_ledger_index, config.end_ledger_index) {
            if start > end {
                return Err(ScanError::Configuration(format!("start ledger {} is after end ledger {}", start, end)));
            }
        }
        let latency = Histogram::new_with_bounds(1, 60 * 60 * 1000, 3)
            .map_err(|e| ScanError::Configuration(format!("latency histogram: {}", e)))?;
        let (snapshot_tx, _) = watch::channel(PipelineSnapshot { state: ScanState::Idle, cursor: None, rows: Vec::new() });

        Ok(Self {
            source,
            store,
            normaliser,
            table,
            config,
            cursor: None,
            state: ScanState::Idle,
            counters: ScanCounters::default(),
            latency,
            snapshot_tx,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn cursor(&self) -> Option<&LedgerCursor> {
        self.cursor.as_ref()
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn table(&self) -> &MarketTable {
        &self.table
    }

    pub fn store(&self) -> &P {
        &self.store
    }

    /// Load the last checkpoint and rebuild the table from it.
    pub async fn resume(&mut self) -> Result<Option<LedgerCursor>, ScanError> {
        match self.store.load_checkpoint().await? {
            Some(checkpoint) => {
                apply_to_table(&mut self.table, &checkpoint)?;
                info!(
                    ledger = checkpoint.cursor.last_processed_index,
                    open_bars = checkpoint.open_bars.len(),
                    "Resuming from checkpoint"
                );
                metrics::gauge!("xrpl_md_cursor_index").set(f64::from(checkpoint.cursor.last_processed_index));
                self.cursor = Some(checkpoint.cursor);
            }
            None => info!("No checkpoint found, starting fresh"),
        }
        self.publish(&[]);
        Ok(self.cursor.clone())
    }

    async fn scan_range(&self) -> Result<(u32, u32), ScanError> {
        let mut latest = None;
        let start = match (&self.cursor, self.config.start_ledger_index) {
            (Some(cursor), _) => cursor
                .last_processed_index
                .checked_add(1)
                .ok_or_else(|| ScanError::Configuration("cursor is at the last possible ledger".into()))?,
            (None, Some(start)) => start,
            (None, None) => {
                let index = self.source.latest_validated_index().await?;
                latest = Some(index);
                index
            }
        };
        let end = match (self.config.end_ledger_index, latest) {
            (Some(end), _) => end,
            (None, Some(index)) => index,
            (None, None) => self.source.latest_validated_index().await?,
        };
        Ok((start, end))
    }

    /// Scan until the end of the range, a stall, or `shutdown` resolving.
    /// The ledger being applied when shutdown fires is always committed first.
    #[instrument(skip_all)]
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> ScanReport {
        let (start, end) = match self.scan_range().await {
            Ok(range) => range,
            Err(e) => {
                let index = self.cursor.as_ref().map_or(0, |c| c.last_processed_index.saturating_add(1));
                self.stall(index, &e).await;
                return self.report();
            }
        };
        if start > end {
            info!(start, end, "Nothing to scan");
            return self.report();
        }
        info!(start, end, prefetch = self.config.prefetch_depth, "Starting ledger scan");

        let source = Arc::clone(&self.source);
        let mut fetches = stream::iter(start..=end)
            .map(move |index| {
                let source = Arc::clone(&source);
                async move {
                    let started = Instant::now();
                    let result = source.fetch_ledger(index).await;
                    (index, result, started.elapsed())
                }
            })
            .buffered(self.config.prefetch_depth);

        tokio::pin!(shutdown);
        self.state = ScanState::Fetching { index: start };
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(cursor = ?self.cursor.as_ref().map(|c| c.last_processed_index), "Shutdown requested, stopping scan");
                    break;
                }
                next = fetches.next() => next,
            };
            let Some((index, fetched, elapsed)) = next else { break };
            self.record_latency(elapsed);

            let outcome = match fetched {
                Ok(batch) => self.apply_ledger(batch).await,
                Err(e) => Err(ScanError::from(e)),
            };
            if let Err(e) = outcome {
                self.stall(index, &e).await;
                break;
            }
            if index < end {
                self.state = ScanState::Fetching { index: index + 1 };
            }
        }
        self.report()
    }

    /// Normalize and commit one ledger. The cursor moves only after the store
    /// accepted the commit.
    #[instrument(level = "debug", skip_all, fields(ledger = batch.index))]
    async fn apply_ledger(&mut self, batch: LedgerBatch) -> Result<(), ScanError> {
        let index = batch.index;
        if let Some(cursor) = &self.cursor {
            if batch.parent_hash != cursor.last_processed_hash {
                return Err(ScanError::ChainDiscontinuity {
                    index,
                    expected: cursor.last_processed_hash.clone(),
                    parent_hash: batch.parent_hash,
                });
            }
        }

        self.state = ScanState::Normalizing { index };
        let tx_count = batch.transactions.len();
        for raw in batch.transactions {
            match self.normaliser.normalize(raw) {
                Ok(Some(event)) => {
                    self.counters.events_normalized += 1;
                    metrics::counter!("xrpl_md_events_normalized_total").increment(1);
                    if self.config.bar_tx_types.contains(&event.tx_type) {
                        self.table.ingest(&event)?;
                    }
                }
                Ok(None) => self.counters.events_filtered += 1,
                Err(e @ NormaliseError::AmountOutOfRange { .. }) => {
                    warn!(ledger = index, error = %e, "Skipping transaction with out-of-range amount");
                    self.counters.out_of_range_skipped += 1;
                    metrics::counter!("xrpl_md_amount_out_of_range_total").increment(1);
                }
                Err(e @ NormaliseError::MalformedTransaction { .. }) => {
                    warn!(ledger = index, error = %e, "Skipping malformed transaction");
                    self.counters.malformed_skipped += 1;
                    metrics::counter!("xrpl_md_malformed_skipped_total").increment(1);
                }
            }
        }
        self.table.close_elapsed(batch.close_time);

        let cursor = LedgerCursor { last_processed_index: index, last_processed_hash: batch.hash };
        let commit = commit_from_table(&mut self.table, cursor.clone());
        self.store.commit(&commit).await?;

        self.counters.ledgers_committed += 1;
        self.counters.bars_closed += commit.closed_bars.len() as u64;
        self.cursor = Some(cursor);
        self.state = ScanState::Committed { index };
        metrics::counter!("xrpl_md_ledgers_committed_total").increment(1);
        metrics::gauge!("xrpl_md_cursor_index").set(f64::from(index));
        debug!(ledger = index, txs = tx_count, closed = commit.closed_bars.len(), "Committed ledger");
        self.publish(&commit.closed_bars);
        Ok(())
    }

    fn record_latency(&mut self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.latency.saturating_record(ms.max(1));
        metrics::histogram!("xrpl_md_fetch_latency_ms").record(elapsed.as_secs_f64() * 1000.0);
    }

    /// Stop at `index` and put the table back to the last commit, so the
    /// snapshot and a later `run` never see a half-applied ledger.
    async fn stall(&mut self, index: u32, e: &ScanError) {
        error!(ledger = index, error = %e, "Scan stalled");
        self.state = ScanState::Stalled { index, reason: e.to_string() };
        if let Err(reload) = self.reload_table().await {
            error!(error = %reload, "Could not reload the table from the last checkpoint");
        }
        self.publish(&[]);
    }

    async fn reload_table(&mut self) -> Result<(), ScanError> {
        match self.store.load_checkpoint().await? {
            Some(checkpoint) => apply_to_table(&mut self.table, &checkpoint)?,
            None => self.table.restore(Vec::new(), Vec::new()),
        }
        Ok(())
    }

    fn publish(&self, closed: &[MarketBar]) {
        let mut rows = self.table.open_rows();
        rows.extend(closed.iter().cloned().map(BarRow::closed));
        sort_rows(&mut rows);
        self.snapshot_tx.send_replace(PipelineSnapshot {
            state: self.state.clone(),
            cursor: self.cursor.clone(),
            rows,
        });
    }

    pub fn report(&self) -> ScanReport {
        let fetch_latency = if self.latency.is_empty() {
            FetchLatency::default()
        } else {
            FetchLatency {
                samples: self.latency.len(),
                p50_ms: self.latency.value_at_quantile(0.5),
                p99_ms: self.latency.value_at_quantile(0.99),
                max_ms: self.latency.max(),
            }
        };
        ScanReport {
            state: self.state.clone(),
            cursor: self.cursor.clone(),
            ledgers_committed: self.counters.ledgers_committed,
            events_normalized: self.counters.events_normalized,
            events_filtered: self.counters.events_filtered,
            malformed_skipped: self.counters.malformed_skipped,
            out_of_range_skipped: self.counters.out_of_range_skipped,
            bars_closed: self.counters.bars_closed,
            fetch_latency,
        }
    }
}
