// CSV output for the notebook side: one flat row per bar or event

use std::fs::File;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::engine::table::BarRow;
use crate::engine::types::NormalizedEvent;
use crate::market_data::reserves::ReserveSample;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
struct BarRecord<'a> {
    pair: String,
    bucket_start: DateTime<Utc>,
    open: &'a Decimal,
    high: &'a Decimal,
    low: &'a Decimal,
    close: &'a Decimal,
    volume: &'a Decimal,
    trade_count: u64,
    closed: bool,
}

#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    timestamp: DateTime<Utc>,
    ledger_index: u32,
    tx_hash: &'a str,
    tx_type: &'static str,
    base_asset: String,
    quote_asset: String,
    amount: &'a Decimal,
    price: &'a Decimal,
    account: &'a str,
}

#[derive(Debug, Serialize)]
struct ReserveRecord<'a> {
    timestamp: DateTime<Utc>,
    ledger_index: u32,
    tx_hash: &'a str,
    pool: &'a str,
    base_asset: String,
    quote_asset: String,
    base_reserve: &'a Decimal,
    quote_reserve: &'a Decimal,
    price: &'a Decimal,
}

pub fn write_bars<W: Write>(out: W, rows: &[BarRow]) -> Result<usize, ExportError> {
    let mut writer = csv::Writer::from_writer(out);
    for row in rows {
        let bar = &row.bar;
        writer.serialize(BarRecord {
            pair: bar.pair.to_string(),
            bucket_start: bar.bucket_start,
            open: &bar.open,
            high: &bar.high,
            low: &bar.low,
            close: &bar.close,
            volume: &bar.volume,
            trade_count: bar.trade_count,
            closed: row.closed,
        })?;
    }
    writer.flush()?;
    Ok(rows.len())
}

pub fn write_events<W: Write>(out: W, events: &[NormalizedEvent]) -> Result<usize, ExportError> {
    let mut writer = csv::Writer::from_writer(out);
    for event in events {
        writer.serialize(EventRecord {
            timestamp: event.timestamp,
            ledger_index: event.ledger_index,
            tx_hash: &event.tx_hash,
            tx_type: event.tx_type.as_str(),
            base_asset: event.base_asset.to_string(),
            quote_asset: event.quote_asset.to_string(),
            amount: &event.amount,
            price: &event.price,
            account: &event.account,
        })?;
    }
    writer.flush()?;
    Ok(events.len())
}

pub fn write_reserves<W: Write>(out: W, samples: &[ReserveSample]) -> Result<usize, ExportError> {
    let mut writer = csv::Writer::from_writer(out);
    for sample in samples {
        writer.serialize(ReserveRecord {
            timestamp: sample.timestamp,
            ledger_index: sample.ledger_index,
            tx_hash: &sample.tx_hash,
            pool: &sample.pool,
            base_asset: sample.base_asset.to_string(),
            quote_asset: sample.quote_asset.to_string(),
            base_reserve: &sample.base_reserve,
            quote_reserve: &sample.quote_reserve,
            price: &sample.price,
        })?;
    }
    writer.flush()?;
    Ok(samples.len())
}

pub fn write_bars_file(path: &Path, rows: &[BarRow]) -> Result<usize, ExportError> {
    write_bars(File::create(path)?, rows)
}

pub fn write_events_file(path: &Path, events: &[NormalizedEvent]) -> Result<usize, ExportError> {
    write_events(File::create(path)?, events)
}

pub fn write_reserves_file(path: &Path, samples: &[ReserveSample]) -> Result<usize, ExportError> {
    write_reserves(File::create(path)?, samples)
}
