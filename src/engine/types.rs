use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Issuer recorded for the native currency. This is ACCOUNT_ZERO, the address
/// the ledger itself uses when XRP has to be expressed as an issued asset.
pub const NATIVE_ISSUER: &str = "rrrrrrrrrrrrrrrrrrrrrhoLvTp";
pub const NATIVE_CURRENCY: &str = "XRP";

/// Canonical (issuer, currency) identity of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId {
    pub currency: String,
    pub issuer: String,
}

impl AssetId {
    pub fn native() -> Self {
        Self { currency: NATIVE_CURRENCY.to_string(), issuer: NATIVE_ISSUER.to_string() }
    }

    pub fn issued(currency: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self { currency: currency.into(), issuer: issuer.into() }
    }

    pub fn is_native(&self) -> bool {
        self.issuer == NATIVE_ISSUER && self.currency == NATIVE_CURRENCY
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_native() {
            write!(f, "{}", NATIVE_CURRENCY)
        } else {
            write!(f, "{}.{}", self.currency, self.issuer)
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid asset `{0}`: expected `XRP` or `CURRENCY.issuer`")]
pub struct ParseAssetError(pub String);

impl FromStr for AssetId {
    type Err = ParseAssetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case(NATIVE_CURRENCY) {
            return Ok(Self::native());
        }
        match s.rsplit_once('.') {
            Some((currency, issuer)) if !currency.is_empty() && issuer.starts_with('r') => {
                Ok(Self::issued(currency, issuer))
            }
            _ => Err(ParseAssetError(s.to_string())),
        }
    }
}

/// A market, quoted as `base/quote`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetPair {
    pub base: AssetId,
    pub quote: AssetId,
}

impl AssetPair {
    pub fn new(base: AssetId, quote: AssetId) -> Self {
        Self { base, quote }
    }
}

impl fmt::Display for AssetPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for AssetPair {
    type Err = ParseAssetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s.split_once('/').ok_or_else(|| ParseAssetError(s.to_string()))?;
        Ok(Self { base: base.parse()?, quote: quote.parse()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxType {
    Payment,
    AmmDeposit,
    AmmWithdraw,
    AmmSwap,
    OfferCreate,
    OfferCancel,
}

impl TxType {
    pub const TRADES: [TxType; 3] = [TxType::Payment, TxType::AmmSwap, TxType::OfferCreate];

    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Payment => "Payment",
            TxType::AmmDeposit => "AmmDeposit",
            TxType::AmmWithdraw => "AmmWithdraw",
            TxType::AmmSwap => "AmmSwap",
            TxType::OfferCreate => "OfferCreate",
            TxType::OfferCancel => "OfferCancel",
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One market-relevant ledger transaction in uniform shape.
/// `price` is quote units per base unit, `amount` is in base units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub timestamp: DateTime<Utc>,
    pub ledger_index: u32,
    pub tx_hash: String,
    pub tx_type: TxType,
    pub base_asset: AssetId,
    pub quote_asset: AssetId,
    pub amount: Decimal,
    pub price: Decimal,
    pub account: String,
}

impl NormalizedEvent {
    pub fn pair(&self) -> AssetPair {
        AssetPair::new(self.base_asset.clone(), self.quote_asset.clone())
    }
}

/// OHLCV row for one (pair, bucket).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketBar {
    pub pair: AssetPair,
    pub bucket_start: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("out of order event for {pair}: {event_time} is before open bucket {open_bucket_start}")]
    OutOfOrderEvent {
        pair: String,
        event_time: DateTime<Utc>,
        open_bucket_start: DateTime<Utc>,
    },
    #[error("bucket width must be positive, got {0}s")]
    InvalidBucketWidth(i64),
}
