use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use crate::engine::types::{AssetPair, MarketBar, NormalizedEvent, TableError};

/// A bar as handed to downstream readers; `closed` bars never change again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarRow {
    #[serde(flatten)]
    pub bar: MarketBar,
    pub closed: bool,
}

impl BarRow {
    pub fn open(bar: MarketBar) -> Self {
        Self { bar, closed: false }
    }

    pub fn closed(bar: MarketBar) -> Self {
        Self { bar, closed: true }
    }
}

/// Orders rows by pair, then bucket.
pub fn sort_rows(rows: &mut [BarRow]) {
    rows.sort_by(|a, b| (&a.bar.pair, a.bar.bucket_start).cmp(&(&b.bar.pair, b.bar.bucket_start)));
}

/// Time-bucketed OHLCV table, one open bar per asset pair.
///
/// Events must arrive in non-decreasing timestamp order per pair. Closed bars
/// are append-only; only the open bar of a pair is ever mutated. The table
/// keeps no closed history: closed bars leave through `drain_closed` into the
/// store, and only the last closed bucket per pair stays behind to reject
/// late events.
#[derive(Debug, Clone)]
pub struct MarketTable {
    bucket_width: i64,
    open: AHashMap<AssetPair, MarketBar>,
    last_closed: AHashMap<AssetPair, DateTime<Utc>>,
    // closed since the last drain, waiting to be committed
    pending: Vec<MarketBar>,
}

impl MarketTable {
    pub fn new(bucket_width_secs: i64) -> Result<Self, TableError> {
        if bucket_width_secs <= 0 {
            return Err(TableError::InvalidBucketWidth(bucket_width_secs));
        }
        debug!(bucket_width_secs, "Initialized market table");
        Ok(Self {
            bucket_width: bucket_width_secs,
            open: AHashMap::new(),
            last_closed: AHashMap::new(),
            pending: Vec::new(),
        })
    }

    pub fn bucket_width_secs(&self) -> i64 {
        self.bucket_width
    }

    /// `floor(ts / width) * width`, floored towards negative infinity.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let rem = ts.timestamp().rem_euclid(self.bucket_width);
        ts - Duration::seconds(rem) - Duration::nanoseconds(i64::from(ts.timestamp_subsec_nanos()))
    }

    fn bucket_end(&self, bucket_start: DateTime<Utc>) -> DateTime<Utc> {
        bucket_start + Duration::seconds(self.bucket_width)
    }

    /// Fold one event into the open bar of its pair. Returns the bar that was
    /// closed because the event opened a later bucket, if any.
    #[instrument(level = "trace", skip(self, event), fields(ledger = event.ledger_index, tx = %event.tx_hash))]
    pub fn ingest(&mut self, event: &NormalizedEvent) -> Result<Option<MarketBar>, TableError> {
        let pair = event.pair();
        let bucket = self.bucket_start(event.timestamp);

        if let Some(open) = self.open.get(&pair) {
            if event.timestamp < open.bucket_start {
                let error = TableError::OutOfOrderEvent {
                    pair: pair.to_string(),
                    event_time: event.timestamp,
                    open_bucket_start: open.bucket_start,
                };
                warn!(error = %error, "Rejecting event");
                return Err(error);
            }
        } else if let Some(last) = self.last_closed.get(&pair) {
            if bucket <= *last {
                let error = TableError::OutOfOrderEvent {
                    pair: pair.to_string(),
                    event_time: event.timestamp,
                    open_bucket_start: self.bucket_end(*last),
                };
                warn!(error = %error, "Rejecting event for closed bucket");
                return Err(error);
            }
        }

        if let Some(bar) = self.open.get_mut(&pair) {
            if bar.bucket_start == bucket {
                bar.high = bar.high.max(event.price);
                bar.low = bar.low.min(event.price);
                bar.close = event.price;
                bar.volume += event.amount;
                bar.trade_count += 1;
                trace!(pair = %pair, price = %event.price, trades = bar.trade_count, "Updated open bar");
                return Ok(None);
            }
        }

        let fresh = MarketBar {
            pair: pair.clone(),
            bucket_start: bucket,
            open: event.price,
            high: event.price,
            low: event.price,
            close: event.price,
            volume: event.amount,
            trade_count: 1,
        };
        trace!(pair = %pair, bucket = %bucket, "Opened bar");
        let previous = self.open.insert(pair, fresh);
        Ok(previous.map(|bar| self.finalize(bar)))
    }

    /// Close every open bar whose bucket ended at or before `now`.
    pub fn close_elapsed(&mut self, now: DateTime<Utc>) -> Vec<MarketBar> {
        let mut expired: Vec<AssetPair> = self
            .open
            .iter()
            .filter(|(_, bar)| self.bucket_end(bar.bucket_start) <= now)
            .map(|(pair, _)| pair.clone())
            .collect();
        expired.sort();

        let mut closed = Vec::with_capacity(expired.len());
        for pair in expired {
            if let Some(bar) = self.open.remove(&pair) {
                closed.push(self.finalize(bar));
            }
        }
        closed
    }

    fn finalize(&mut self, bar: MarketBar) -> MarketBar {
        debug!(pair = %bar.pair, bucket = %bar.bucket_start, trades = bar.trade_count, "Closed bar");
        metrics::counter!("xrpl_md_bars_closed_total").increment(1);
        self.last_closed.insert(bar.pair.clone(), bar.bucket_start);
        self.pending.push(bar.clone());
        bar
    }

    /// Bars closed since the previous call, in closing order.
    pub fn drain_closed(&mut self) -> Vec<MarketBar> {
        std::mem::take(&mut self.pending)
    }

    pub fn open_bar(&self, pair: &AssetPair) -> Option<&MarketBar> {
        self.open.get(pair)
    }

    pub fn open_bars(&self) -> Vec<MarketBar> {
        let mut bars: Vec<MarketBar> = self.open.values().cloned().collect();
        bars.sort_by(|a, b| a.pair.cmp(&b.pair));
        bars
    }

    pub fn last_closed(&self) -> Vec<(AssetPair, DateTime<Utc>)> {
        let mut marks: Vec<(AssetPair, DateTime<Utc>)> =
            self.last_closed.iter().map(|(p, t)| (p.clone(), *t)).collect();
        marks.sort();
        marks
    }

    /// Open bars as rows, ordered by pair.
    pub fn open_rows(&self) -> Vec<BarRow> {
        self.open_bars().into_iter().map(BarRow::open).collect()
    }

    /// Reload state persisted by an earlier run. Anything not yet drained is
    /// discarded.
    pub fn restore(&mut self, open: Vec<MarketBar>, last_closed: Vec<(AssetPair, DateTime<Utc>)>) {
        self.open.clear();
        self.last_closed.clear();
        self.pending.clear();

        for (pair, bucket) in last_closed {
            self.last_closed.insert(pair, bucket);
        }
        for bar in open {
            self.open.insert(bar.pair.clone(), bar);
        }
        debug!(open = self.open.len(), closed_pairs = self.last_closed.len(), "Restored market table");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{AssetId, TxType};
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn usd() -> AssetId {
        AssetId::issued("USD", "rvYAfWj5gh67oV6fW32ZzP3Aw4Eubs59B")
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn payment(ts: DateTime<Utc>, price: Decimal) -> NormalizedEvent {
        NormalizedEvent {
            timestamp: ts,
            ledger_index: 1,
            tx_hash: "AB".into(),
            tx_type: TxType::Payment,
            base_asset: AssetId::native(),
            quote_asset: usd(),
            amount: dec!(10),
            price,
            account: "rPEPPER7kfTD9w2To4CQk6UCfuHM9c6GDY".into(),
        }
    }

    #[test]
    fn test_rejects_non_positive_width() {
        assert_eq!(MarketTable::new(0).unwrap_err(), TableError::InvalidBucketWidth(0));
    }

    #[test]
    fn test_bucket_start_floors() {
        let table = MarketTable::new(60).unwrap();
        assert_eq!(table.bucket_start(at(10, 0, 59)), at(10, 0, 0));
        assert_eq!(table.bucket_start(at(10, 1, 0)), at(10, 1, 0));
    }

    #[test]
    fn test_three_payments_two_bars() {
        let mut table = MarketTable::new(60).unwrap();
        assert_eq!(table.ingest(&payment(at(10, 0, 5), dec!(1.00))).unwrap(), None);
        assert_eq!(table.ingest(&payment(at(10, 0, 40), dec!(1.02))).unwrap(), None);
        let closed = table.ingest(&payment(at(10, 1, 10), dec!(0.98))).unwrap().unwrap();

        assert_eq!(closed.bucket_start, at(10, 0, 0));
        assert_eq!(closed.open, dec!(1.00));
        assert_eq!(closed.high, dec!(1.02));
        assert_eq!(closed.low, dec!(1.00));
        assert_eq!(closed.close, dec!(1.02));
        assert_eq!(closed.volume, dec!(20));
        assert_eq!(closed.trade_count, 2);

        let pair = AssetPair::new(AssetId::native(), usd());
        let open = table.open_bar(&pair).unwrap();
        assert_eq!(open.bucket_start, at(10, 1, 0));
        assert_eq!((open.open, open.high, open.low, open.close), (dec!(0.98), dec!(0.98), dec!(0.98), dec!(0.98)));
        assert_eq!(open.trade_count, 1);

        assert_eq!(table.open_rows().len(), 1);
        assert_eq!(table.drain_closed(), vec![closed]);
        assert!(table.drain_closed().is_empty());
    }

    #[test]
    fn test_out_of_order_leaves_open_bar_untouched() {
        let mut table = MarketTable::new(60).unwrap();
        table.ingest(&payment(at(10, 1, 10), dec!(0.98))).unwrap();
        let pair = AssetPair::new(AssetId::native(), usd());
        let before = table.open_bar(&pair).cloned();

        let err = table.ingest(&payment(at(10, 0, 50), dec!(5))).unwrap_err();
        assert!(matches!(err, TableError::OutOfOrderEvent { open_bucket_start, .. } if open_bucket_start == at(10, 1, 0)));
        assert_eq!(table.open_bar(&pair).cloned(), before);
    }

    #[test]
    fn test_closed_bucket_never_reopened() {
        let mut table = MarketTable::new(60).unwrap();
        table.ingest(&payment(at(10, 0, 5), dec!(1))).unwrap();
        let closed = table.close_elapsed(at(10, 1, 0));
        assert_eq!(closed.len(), 1);

        // same bucket as the one just closed
        let err = table.ingest(&payment(at(10, 0, 30), dec!(1))).unwrap_err();
        assert!(matches!(err, TableError::OutOfOrderEvent { .. }));

        table.ingest(&payment(at(10, 1, 30), dec!(2))).unwrap();
        assert_eq!(table.open_bars().len(), 1);
        assert_eq!(table.drain_closed().len(), 1);
    }

    #[test]
    fn test_close_elapsed_keeps_current_bucket_open() {
        let mut table = MarketTable::new(60).unwrap();
        table.ingest(&payment(at(10, 0, 5), dec!(1))).unwrap();
        assert!(table.close_elapsed(at(10, 0, 59)).is_empty());
        assert_eq!(table.open_bars().len(), 1);
    }

    #[test]
    fn test_restore_round_trips_state() {
        let mut table = MarketTable::new(60).unwrap();
        table.ingest(&payment(at(10, 0, 5), dec!(1))).unwrap();
        table.ingest(&payment(at(10, 1, 5), dec!(2))).unwrap();

        let mut restored = MarketTable::new(60).unwrap();
        restored.restore(table.open_bars(), table.last_closed());
        assert_eq!(restored.open_rows(), table.open_rows());
        assert_eq!(restored.last_closed(), table.last_closed());
        assert!(restored.drain_closed().is_empty());
        assert!(restored.ingest(&payment(at(10, 0, 30), dec!(1))).is_err());
    }

    #[test]
    fn test_memory_bounded_by_pairs_not_bars() {
        let mut table = MarketTable::new(60).unwrap();
        for minute in 0..500 {
            table.ingest(&payment(at(10, 0, 0) + Duration::minutes(minute), dec!(1))).unwrap();
            table.drain_closed();
        }
        assert_eq!(table.open_bars().len(), 1);
        assert_eq!(table.last_closed().len(), 1);
        assert_eq!(table.last_closed()[0].1, at(10, 0, 0) + Duration::minutes(498));
    }

    proptest! {
        #[test]
        fn prop_bar_bounds_hold(prices in proptest::collection::vec(1u32..100_000, 1..40)) {
            let mut table = MarketTable::new(60).unwrap();
            let mut bars = Vec::new();
            for (i, p) in prices.iter().enumerate() {
                let ts = at(10, 0, 0) + Duration::seconds(i as i64);
                bars.extend(table.ingest(&payment(ts, Decimal::new(i64::from(*p), 4))).unwrap());
            }
            bars.extend(table.open_bars());
            for bar in bars {
                prop_assert!(bar.low <= bar.open && bar.open <= bar.high);
                prop_assert!(bar.low <= bar.close && bar.close <= bar.high);
                prop_assert!(bar.low <= bar.high);
            }
        }

        #[test]
        fn prop_bucket_starts_strictly_increase(gaps in proptest::collection::vec(0i64..200, 1..40)) {
            let mut table = MarketTable::new(60).unwrap();
            let mut ts = at(10, 0, 0);
            for gap in gaps {
                ts = ts + Duration::seconds(gap);
                table.ingest(&payment(ts, dec!(1))).unwrap();
            }
            let starts: Vec<_> = table
                .drain_closed()
                .into_iter()
                .chain(table.open_bars())
                .map(|bar| bar.bucket_start)
                .collect();
            prop_assert!(starts.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
