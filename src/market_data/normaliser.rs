//! Convert raw ledger transactions into uniform `NormalizedEvent`s.
//!
//! Classification goes through a closed set of serde variants keyed on
//! `TransactionType`. Anything outside that set, failed transactions and
//! transfers without a price produce no event. Trades are priced from what
//! metadata shows actually changed hands: `SendMax`, `TakerGets` and
//! `TakerPays` are limits, not fills. Structural problems inside a supported
//! type are reported as `MalformedTransaction` for the caller to log and
//! skip; amounts the decimal type cannot hold as `AmountOutOfRange`.

use ahash::AHashSet;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{instrument, trace};

use crate::engine::types::{AssetId, NormalizedEvent, TxType};
use crate::market_data::adapters::RawTransaction;
use crate::market_data::asset::{
    asset_of_issue, parse_drops, to_asset_amount, AmountError, AssetAmount, WireAmount, WireIssue,
};
use crate::market_data::metadata::{
    affected_nodes, balance_changes, entry_type, fields, is_amm_root, net_change, pool_reserves, BalanceChange,
};
use crate::market_data::reserves::ReserveSample;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormaliseError {
    #[error("malformed transaction {hash}: {reason}")]
    MalformedTransaction { hash: String, reason: String },
    #[error("transaction {hash}: amount {value} outside the decimal range")]
    AmountOutOfRange { hash: String, value: String },
}

/// Why a transaction could not be turned into an event, before the hash is attached.
enum Reject {
    Malformed(String),
    OutOfRange(String),
}

impl From<String> for Reject {
    fn from(reason: String) -> Self {
        Reject::Malformed(reason)
    }
}

impl From<AmountError> for Reject {
    fn from(e: AmountError) -> Self {
        match e {
            AmountError::Invalid(reason) => Reject::Malformed(reason),
            AmountError::OutOfRange(value) => Reject::OutOfRange(value),
        }
    }
}

impl Reject {
    fn with_hash(self, hash: &str) -> NormaliseError {
        match self {
            Reject::Malformed(reason) => NormaliseError::MalformedTransaction { hash: hash.to_string(), reason },
            Reject::OutOfRange(value) => NormaliseError::AmountOutOfRange { hash: hash.to_string(), value },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "TransactionType")]
enum LedgerTx {
    Payment(PaymentTx),
    OfferCreate(OfferCreateTx),
    OfferCancel(OfferCancelTx),
    #[serde(rename = "AMMDeposit")]
    AmmDeposit(AmmLiquidityTx),
    #[serde(rename = "AMMWithdraw")]
    AmmWithdraw(AmmLiquidityTx),
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PaymentTx {
    account: String,
    destination: String,
    #[serde(default)]
    amount: Option<WireAmount>,
    #[serde(default)]
    deliver_max: Option<WireAmount>,
    #[serde(default)]
    send_max: Option<WireAmount>,
    #[serde(default)]
    fee: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OfferCreateTx {
    account: String,
    taker_gets: WireAmount,
    taker_pays: WireAmount,
    #[serde(default)]
    fee: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OfferCancelTx {
    account: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AmmLiquidityTx {
    account: String,
    asset: WireIssue,
    asset2: WireIssue,
    #[serde(default)]
    amount: Option<WireAmount>,
    #[serde(default)]
    amount2: Option<WireAmount>,
}

/// Two legs of a priced event before base/quote orientation.
struct Draft {
    tx_type: TxType,
    account: String,
    counterparty: Option<String>,
    legs: (AssetAmount, AssetAmount),
}

#[derive(Debug, Clone, Default)]
pub struct Normaliser {
    /// Earlier entries win the quote side.
    quote_preference: Vec<AssetId>,
    /// When non-empty, only transactions touching one of these accounts pass.
    market_accounts: AHashSet<String>,
}

impl Normaliser {
    pub fn new(quote_preference: Vec<AssetId>, market_accounts: Vec<String>) -> Self {
        Self { quote_preference, market_accounts: market_accounts.into_iter().collect() }
    }

    #[instrument(level = "trace", skip_all, fields(tx = %raw.hash, ledger = raw.ledger_index))]
    pub fn normalize(&self, raw: RawTransaction) -> Result<Option<NormalizedEvent>, NormaliseError> {
        let RawTransaction { hash, ledger_index, timestamp, tx, meta } = raw;

        if !succeeded(meta.as_ref()) {
            trace!("Skipping failed transaction");
            return Ok(None);
        }

        let parsed: LedgerTx = serde_json::from_value(tx)
            .map_err(|e| NormaliseError::MalformedTransaction { hash: hash.clone(), reason: e.to_string() })?;
        let draft = self.draft(parsed, meta.as_ref()).map_err(|r| r.with_hash(&hash))?;
        let Some(draft) = draft else {
            trace!("No market event");
            return Ok(None);
        };

        if !self.market_accounts.is_empty() && !self.touches_market(&draft, meta.as_ref()) {
            trace!("Outside tracked market accounts");
            return Ok(None);
        }

        let (a, b) = draft.legs;
        if a.asset == b.asset {
            trace!(asset = %a.asset, "Same-asset transfer, no price");
            return Ok(None);
        }
        let (base, quote) = self.orient(a, b);
        let malformed = |reason: String| NormaliseError::MalformedTransaction { hash: hash.clone(), reason };
        if base.value <= Decimal::ZERO || quote.value <= Decimal::ZERO {
            return Err(malformed(format!("non-positive amount {} / {}", base.value, quote.value)));
        }
        let price = quote
            .value
            .checked_div(base.value)
            .ok_or_else(|| Reject::OutOfRange(format!("{} / {}", quote.value, base.value)).with_hash(&hash))?
            .normalize();
        let timestamp = timestamp.ok_or_else(|| malformed("no ledger close time".to_string()))?;

        Ok(Some(NormalizedEvent {
            timestamp,
            ledger_index,
            tx_hash: hash.clone(),
            tx_type: draft.tx_type,
            base_asset: base.asset,
            quote_asset: quote.asset,
            amount: base.value,
            price,
            account: draft.account,
        }))
    }

    fn draft(&self, parsed: LedgerTx, meta: Option<&Value>) -> Result<Option<Draft>, Reject> {
        match parsed {
            LedgerTx::Unsupported => Ok(None),
            LedgerTx::Payment(p) => payment(p, meta),
            LedgerTx::OfferCreate(o) => offer_fill(o, meta),
            LedgerTx::OfferCancel(c) => Ok(cancelled_offer(&c.account, meta)?
                .map(|legs| Draft { tx_type: TxType::OfferCancel, account: c.account, counterparty: None, legs })),
            LedgerTx::AmmDeposit(a) => liquidity(TxType::AmmDeposit, a),
            LedgerTx::AmmWithdraw(a) => liquidity(TxType::AmmWithdraw, a),
        }
    }

    /// Pool reserves after `raw` applied, oriented and priced like events.
    /// `None` for failed transactions and transactions that do not move both
    /// sides of an AMM pool.
    pub fn reserve_sample(&self, raw: &RawTransaction) -> Result<Option<ReserveSample>, NormaliseError> {
        let Some(meta) = raw.meta.as_ref() else {
            return Ok(None);
        };
        if !succeeded(Some(meta)) {
            return Ok(None);
        }
        let Some(reserves) = pool_reserves(meta).map_err(|e| Reject::from(e).with_hash(&raw.hash))? else {
            return Ok(None);
        };
        if !self.market_accounts.is_empty() && !self.market_accounts.contains(&reserves.pool) {
            return Ok(None);
        }
        let (base, quote) = self.orient(reserves.first, reserves.second);
        let price = quote
            .value
            .checked_div(base.value)
            .ok_or_else(|| Reject::OutOfRange(format!("{} / {}", quote.value, base.value)).with_hash(&raw.hash))?
            .normalize();
        let timestamp = raw.timestamp.ok_or_else(|| NormaliseError::MalformedTransaction {
            hash: raw.hash.clone(),
            reason: "no ledger close time".to_string(),
        })?;
        Ok(Some(ReserveSample {
            timestamp,
            ledger_index: raw.ledger_index,
            tx_hash: raw.hash.clone(),
            pool: reserves.pool,
            base_asset: base.asset,
            quote_asset: quote.asset,
            base_reserve: base.value,
            quote_reserve: quote.value,
            price,
        }))
    }

    /// Returns (base, quote).
    fn orient(&self, a: AssetAmount, b: AssetAmount) -> (AssetAmount, AssetAmount) {
        let rank = |asset: &AssetId| self.quote_preference.iter().position(|q| q == asset);
        match (rank(&a.asset), rank(&b.asset)) {
            (Some(ra), Some(rb)) if ra <= rb => (b, a),
            (Some(_), Some(_)) => (a, b),
            (Some(_), None) => (b, a),
            (None, Some(_)) => (a, b),
            (None, None) if a.asset > b.asset => (b, a),
            (None, None) => (a, b),
        }
    }

    fn touches_market(&self, draft: &Draft, meta: Option<&Value>) -> bool {
        if self.market_accounts.contains(&draft.account) {
            return true;
        }
        if draft.counterparty.as_ref().is_some_and(|c| self.market_accounts.contains(c)) {
            return true;
        }
        meta.map_or(false, |m| {
            affected_nodes(m)
                .filter(|(_, node)| entry_type(node) == Some("AccountRoot"))
                .filter_map(|(_, node)| fields(node)?.get("Account")?.as_str())
                .any(|account| self.market_accounts.contains(account))
        })
    }
}

/// Transactions without metadata are taken as applied.
fn succeeded(meta: Option<&Value>) -> bool {
    meta.and_then(|m| m.get("TransactionResult"))
        .and_then(Value::as_str)
        .map_or(true, |result| result == "tesSUCCESS")
}

/// Signed change of `account`'s `asset` balance with the fee put back, so
/// XRP moved by the trade itself is what remains.
fn executed(changes: &[BalanceChange], account: &str, asset: &AssetId, fee: Decimal) -> Result<Decimal, Reject> {
    let change = net_change(changes, account, asset)?;
    if !asset.is_native() {
        return Ok(change);
    }
    change
        .checked_add(fee)
        .ok_or_else(|| Reject::OutOfRange(format!("{} + fee {}", change, fee)))
}

fn fee_of(fee: Option<&str>) -> Result<Decimal, Reject> {
    Ok(fee.map(parse_drops).transpose()?.unwrap_or(Decimal::ZERO))
}

fn payment(p: PaymentTx, meta: Option<&Value>) -> Result<Option<Draft>, Reject> {
    let delivered_meta = meta
        .and_then(|m| m.get("delivered_amount").or_else(|| m.get("DeliveredAmount")))
        .filter(|v| v.as_str() != Some("unavailable"))
        .map(|v| WireAmount::deserialize(v).map_err(|e| format!("bad delivered_amount: {}", e)))
        .transpose()?;
    let delivered = delivered_meta
        .or(p.deliver_max)
        .or(p.amount)
        .ok_or_else(|| "payment without Amount".to_string())?;
    let delivered = to_asset_amount(&delivered)?;
    // no SendMax means the sender paid in the delivered asset
    let Some(send_max) = p.send_max else {
        return Ok(None);
    };
    let limit = to_asset_amount(&send_max)?;
    if limit.asset == delivered.asset {
        return Ok(None);
    }

    let meta = meta.ok_or_else(|| "cross-currency payment without metadata".to_string())?;
    let changes = balance_changes(meta)?;
    let spent = -executed(&changes, &p.account, &limit.asset, fee_of(p.fee.as_deref())?)?;
    if spent > limit.value {
        return Err(format!("spent {} {} above SendMax {}", spent, limit.asset, limit.value).into());
    }
    Ok(Some(Draft {
        tx_type: swap_or(TxType::Payment, Some(meta)),
        account: p.account,
        counterparty: Some(p.destination),
        legs: (AssetAmount { asset: limit.asset, value: spent }, delivered),
    }))
}

/// The part of an OfferCreate that crossed when it was placed. An offer that
/// only rested on the book traded nothing and yields no event; its later
/// fills show up in the transactions that consume it.
fn offer_fill(o: OfferCreateTx, meta: Option<&Value>) -> Result<Option<Draft>, Reject> {
    let gets = to_asset_amount(&o.taker_gets)?;
    let pays = to_asset_amount(&o.taker_pays)?;
    let Some(meta) = meta else {
        return Ok(None);
    };
    let changes = balance_changes(meta)?;
    let fee = fee_of(o.fee.as_deref())?;
    let given = -executed(&changes, &o.account, &gets.asset, fee)?;
    let received = executed(&changes, &o.account, &pays.asset, fee)?;
    if given <= Decimal::ZERO || received <= Decimal::ZERO {
        trace!(account = %o.account, "Offer placed without crossing");
        return Ok(None);
    }
    Ok(Some(Draft {
        tx_type: swap_or(TxType::OfferCreate, Some(meta)),
        account: o.account,
        counterparty: None,
        legs: (AssetAmount { asset: gets.asset, value: given }, AssetAmount { asset: pays.asset, value: received }),
    }))
}

fn liquidity(tx_type: TxType, a: AmmLiquidityTx) -> Result<Option<Draft>, Reject> {
    let (Some(amount), Some(amount2)) = (a.amount, a.amount2) else {
        // single-sided or LP-token-only operations carry no price
        return Ok(None);
    };
    let first = to_asset_amount(&amount)?;
    let second = to_asset_amount(&amount2)?;
    let pool = (asset_of_issue(&a.asset)?, asset_of_issue(&a.asset2)?);
    let matches_pool = (first.asset == pool.0 && second.asset == pool.1) || (first.asset == pool.1 && second.asset == pool.0);
    if !matches_pool {
        return Err(format!("amounts {} / {} do not match pool {} / {}", first.asset, second.asset, pool.0, pool.1).into());
    }
    Ok(Some(Draft { tx_type, account: a.account, counterparty: None, legs: (first, second) }))
}

fn cancelled_offer(account: &str, meta: Option<&Value>) -> Result<Option<(AssetAmount, AssetAmount)>, Reject> {
    let Some(meta) = meta else {
        return Ok(None);
    };
    let offer = affected_nodes(meta)
        .filter(|(kind, node)| *kind == "DeletedNode" && entry_type(node) == Some("Offer"))
        .filter_map(|(_, node)| node.get("FinalFields"))
        .find(|f| f.get("Account").and_then(Value::as_str) == Some(account));
    let Some(offer) = offer else {
        return Ok(None);
    };
    let leg = |name: &str| -> Result<AssetAmount, Reject> {
        let raw = offer.get(name).ok_or_else(|| format!("cancelled offer without {}", name))?;
        let wire = WireAmount::deserialize(raw).map_err(|e| format!("bad {}: {}", name, e))?;
        Ok(to_asset_amount(&wire)?)
    };
    Ok(Some((leg("TakerGets")?, leg("TakerPays")?)))
}

fn swap_or(default: TxType, meta: Option<&Value>) -> TxType {
    if meta.map_or(false, |m| affected_nodes(m).any(|(_, node)| is_amm_root(node))) {
        TxType::AmmSwap
    } else {
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use serde_json::json;

    const ISSUER: &str = "rhub8VRN55s94qWKDv6jmDy1pUykJzF3wq";
    const TRADER: &str = "rPEPPER7kfTD9w2To4CQk6UCfuHM9c6GDY";
    const POOL: &str = "rhWTXC2m2gGGA9WozUaoMm6kLAVPb1tcS3";
    const NEUTRAL: &str = "rrrrrrrrrrrrrrrrrrrrBZbvji";

    fn usd() -> AssetId {
        AssetId::issued("USD", ISSUER)
    }

    fn usd_amount(value: &str) -> Value {
        json!({"currency": "USD", "issuer": ISSUER, "value": value})
    }

    fn close() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 5).unwrap()
    }

    fn raw(tx: Value, meta: Value) -> RawTransaction {
        RawTransaction { hash: "H1".into(), ledger_index: 42, timestamp: Some(close()), tx, meta: Some(meta) }
    }

    fn success() -> Value {
        json!({"TransactionResult": "tesSUCCESS", "TransactionIndex": 0, "AffectedNodes": []})
    }

    fn applied(nodes: Vec<Value>) -> Value {
        json!({"TransactionResult": "tesSUCCESS", "TransactionIndex": 0, "AffectedNodes": nodes})
    }

    fn xrp_balance(account: &str, before: u64, after: u64) -> Value {
        json!({"ModifiedNode": {"LedgerEntryType": "AccountRoot",
            "FinalFields": {"Account": account, "Balance": after.to_string()},
            "PreviousFields": {"Balance": before.to_string()}}})
    }

    /// Trust line with `holder` on the low side, so its balance is the holder's.
    fn holding(holder: &str, issuer: &str, currency: &str, before: &str, after: &str) -> Value {
        json!({"ModifiedNode": {"LedgerEntryType": "RippleState",
            "FinalFields": {
                "Balance": {"currency": currency, "issuer": NEUTRAL, "value": after},
                "LowLimit": {"currency": currency, "issuer": holder, "value": "1000000"},
                "HighLimit": {"currency": currency, "issuer": issuer, "value": "0"}},
            "PreviousFields": {"Balance": {"currency": currency, "issuer": NEUTRAL, "value": before}}}})
    }

    fn pool_root(drops: u64) -> Value {
        json!({"ModifiedNode": {"LedgerEntryType": "AccountRoot",
            "FinalFields": {"Account": POOL, "AMMID": "AB12", "Balance": drops.to_string()},
            "PreviousFields": {"Balance": "1"}}})
    }

    fn normaliser() -> Normaliser {
        Normaliser::new(vec![AssetId::native()], vec![])
    }

    fn assert_event(event: &NormalizedEvent, tx_type: TxType, price: Decimal, amount: Decimal) {
        assert_eq!(event.tx_type, tx_type);
        assert_eq!(event.base_asset, usd());
        assert_eq!(event.quote_asset, AssetId::native());
        assert_eq!(event.price, price);
        assert_eq!(event.amount, amount);
        assert_eq!(event.timestamp, close());
        assert_eq!(event.ledger_index, 42);
    }

    #[test]
    fn test_payment_priced_from_executed_spend() {
        // willing to pay up to 1000 XRP, the path only needed 100
        let tx = json!({"TransactionType": "Payment", "Account": TRADER, "Destination": TRADER,
            "Amount": usd_amount("60"), "SendMax": "1000000000", "Fee": "12"});
        let mut meta = applied(vec![
            xrp_balance(TRADER, 500_000_000, 399_999_988),
            holding(TRADER, ISSUER, "USD", "0", "50"),
        ]);
        meta["delivered_amount"] = usd_amount("50");
        let event = normaliser().normalize(raw(tx, meta)).unwrap().unwrap();
        assert_event(&event, TxType::Payment, dec!(2), dec!(50));
        assert_eq!(event.account, TRADER);
    }

    #[test]
    fn test_payment_spending_issued_currency() {
        let tx = json!({"TransactionType": "Payment", "Account": TRADER, "Destination": POOL,
            "Amount": "10000000", "SendMax": {"currency": "EUR", "issuer": ISSUER, "value": "30"}, "Fee": "10"});
        let mut meta = applied(vec![xrp_balance(TRADER, 100_000_000, 99_999_990), holding(TRADER, ISSUER, "EUR", "70", "50")]);
        meta["delivered_amount"] = json!("10000000");
        let event = normaliser().normalize(raw(tx, meta)).unwrap().unwrap();
        assert_eq!(event.base_asset, AssetId::issued("EUR", ISSUER));
        assert_eq!(event.quote_asset, AssetId::native());
        // 20 EUR spent for 10 XRP delivered
        assert_eq!(event.price, dec!(0.5));
        assert_eq!(event.amount, dec!(20));
    }

    #[test]
    fn test_spend_above_send_max_is_malformed() {
        let tx = json!({"TransactionType": "Payment", "Account": TRADER, "Destination": TRADER,
            "Amount": usd_amount("50"), "SendMax": "10000000"});
        let meta = applied(vec![xrp_balance(TRADER, 500_000_000, 400_000_000), holding(TRADER, ISSUER, "USD", "0", "50")]);
        let err = normaliser().normalize(raw(tx, meta)).unwrap_err();
        assert!(matches!(err, NormaliseError::MalformedTransaction { ref reason, .. } if reason.contains("SendMax")));
    }

    #[test]
    fn test_payment_through_pool_is_swap() {
        let tx = json!({"TransactionType": "Payment", "Account": TRADER, "Destination": TRADER,
            "DeliverMax": usd_amount("10"), "SendMax": "90000000", "Fee": "15"});
        let meta = applied(vec![
            pool_root(1_025_000_000),
            xrp_balance(TRADER, 100_000_000, 74_999_985),
            holding(TRADER, ISSUER, "USD", "0", "10"),
        ]);
        let event = normaliser().normalize(raw(tx, meta)).unwrap().unwrap();
        assert_event(&event, TxType::AmmSwap, dec!(2.5), dec!(10));
    }

    #[test]
    fn test_offer_create_priced_from_fill() {
        // asked 2 XRP per USD for 50 USD, 20 USD crossed at 1.9
        let tx = json!({"TransactionType": "OfferCreate", "Account": TRADER,
            "TakerGets": "100000000", "TakerPays": usd_amount("50"), "Fee": "12"});
        let meta = applied(vec![
            xrp_balance(TRADER, 500_000_000, 461_999_988),
            holding(TRADER, ISSUER, "USD", "5", "25"),
            json!({"CreatedNode": {"LedgerEntryType": "Offer", "NewFields": {
                "Account": TRADER, "TakerGets": "62000000", "TakerPays": usd_amount("30")}}}),
        ]);
        let event = normaliser().normalize(raw(tx, meta)).unwrap().unwrap();
        assert_event(&event, TxType::OfferCreate, dec!(1.9), dec!(20));
    }

    #[test]
    fn test_resting_offer_is_not_a_trade() {
        let tx = json!({"TransactionType": "OfferCreate", "Account": TRADER,
            "TakerGets": "1000000", "TakerPays": usd_amount("1000000"), "Fee": "12"});
        let meta = applied(vec![
            xrp_balance(TRADER, 500_000_000, 499_999_988),
            json!({"CreatedNode": {"LedgerEntryType": "Offer", "NewFields": {
                "Account": TRADER, "TakerGets": "1000000", "TakerPays": usd_amount("1000000")}}}),
        ]);
        assert_eq!(normaliser().normalize(raw(tx, meta)).unwrap(), None);
    }

    #[test]
    fn test_offer_cancel_uses_deleted_offer() {
        let tx = json!({"TransactionType": "OfferCancel", "Account": TRADER, "OfferSequence": 7});
        let meta = applied(vec![json!({"DeletedNode": {"LedgerEntryType": "Offer", "FinalFields": {
            "Account": TRADER, "TakerGets": usd_amount("4"), "TakerPays": "6000000"}}})]);
        let event = normaliser().normalize(raw(tx, meta)).unwrap().unwrap();
        assert_event(&event, TxType::OfferCancel, dec!(1.5), dec!(4));
    }

    #[test]
    fn test_offer_cancel_without_offer_is_filtered() {
        let tx = json!({"TransactionType": "OfferCancel", "Account": TRADER, "OfferSequence": 7});
        assert_eq!(normaliser().normalize(raw(tx, success())).unwrap(), None);
    }

    #[test]
    fn test_amm_deposit_and_withdraw() {
        for (kind, expected) in [("AMMDeposit", TxType::AmmDeposit), ("AMMWithdraw", TxType::AmmWithdraw)] {
            let tx = json!({"TransactionType": kind, "Account": TRADER,
                "Asset": {"currency": "XRP"}, "Asset2": {"currency": "USD", "issuer": ISSUER},
                "Amount": "30000000", "Amount2": usd_amount("20")});
            let event = normaliser().normalize(raw(tx, success())).unwrap().unwrap();
            assert_event(&event, expected, dec!(1.5), dec!(20));
        }
    }

    #[test]
    fn test_single_sided_deposit_is_filtered() {
        let tx = json!({"TransactionType": "AMMDeposit", "Account": TRADER,
            "Asset": {"currency": "XRP"}, "Asset2": {"currency": "USD", "issuer": ISSUER},
            "Amount": "30000000"});
        assert_eq!(normaliser().normalize(raw(tx, success())).unwrap(), None);
    }

    #[test]
    fn test_deposit_amounts_must_match_pool() {
        let tx = json!({"TransactionType": "AMMDeposit", "Account": TRADER,
            "Asset": {"currency": "XRP"}, "Asset2": {"currency": "EUR", "issuer": ISSUER},
            "Amount": "30000000", "Amount2": usd_amount("20")});
        assert!(normaliser().normalize(raw(tx, success())).is_err());
    }

    #[test]
    fn test_filtered_outcomes() {
        let settings = json!({"TransactionType": "AccountSet", "Account": TRADER});
        assert_eq!(normaliser().normalize(raw(settings, success())).unwrap(), None);

        let transfer = json!({"TransactionType": "Payment", "Account": TRADER, "Destination": POOL, "Amount": "1000"});
        assert_eq!(normaliser().normalize(raw(transfer, success())).unwrap(), None);

        let failed = json!({"TransactionType": "OfferCreate", "Account": TRADER,
            "TakerGets": "100", "TakerPays": usd_amount("1")});
        let meta = json!({"TransactionResult": "tecUNFUNDED_OFFER"});
        assert_eq!(normaliser().normalize(raw(failed, meta)).unwrap(), None);
    }

    #[test]
    fn test_malformed_offer_reports_hash() {
        let tx = json!({"TransactionType": "OfferCreate", "Account": TRADER, "TakerGets": "100"});
        let err = normaliser().normalize(raw(tx, success())).unwrap_err();
        assert!(matches!(err, NormaliseError::MalformedTransaction { ref hash, .. } if hash == "H1"));
    }

    #[test]
    fn test_payment_without_sent_side_change_is_malformed() {
        let tx = json!({"TransactionType": "Payment", "Account": TRADER, "Destination": TRADER,
            "Amount": usd_amount("5"), "SendMax": "10000000"});
        let meta = applied(vec![holding(TRADER, ISSUER, "USD", "0", "5")]);
        assert!(matches!(
            normaliser().normalize(raw(tx, meta)),
            Err(NormaliseError::MalformedTransaction { .. })
        ));
    }

    #[test]
    fn test_out_of_range_amount_is_reported_apart() {
        let tx = json!({"TransactionType": "OfferCreate", "Account": TRADER,
            "TakerGets": "100000000", "TakerPays": usd_amount("1e96")});
        let err = normaliser().normalize(raw(tx, success())).unwrap_err();
        assert_eq!(err, NormaliseError::AmountOutOfRange { hash: "H1".into(), value: "1e96".into() });

        let tx = json!({"TransactionType": "Payment", "Account": TRADER, "Destination": TRADER,
            "Amount": usd_amount("1"), "SendMax": "1000000"});
        let mut meta = applied(vec![]);
        meta["delivered_amount"] = usd_amount("-9999999999999999e80");
        assert!(matches!(normaliser().normalize(raw(tx, meta)), Err(NormaliseError::AmountOutOfRange { .. })));
    }

    #[test]
    fn test_orientation_without_preference_is_stable() {
        let eur = json!({"currency": "EUR", "issuer": ISSUER, "value": "2"});
        let forward = json!({"TransactionType": "OfferCreate", "Account": TRADER, "TakerGets": usd_amount("4"), "TakerPays": eur.clone()});
        let backward = json!({"TransactionType": "OfferCreate", "Account": TRADER, "TakerGets": eur, "TakerPays": usd_amount("4")});
        let sold_usd = applied(vec![holding(TRADER, ISSUER, "USD", "10", "6"), holding(TRADER, ISSUER, "EUR", "0", "2")]);
        let sold_eur = applied(vec![holding(TRADER, ISSUER, "USD", "6", "10"), holding(TRADER, ISSUER, "EUR", "2", "0")]);
        let n = Normaliser::default();
        let a = n.normalize(raw(forward, sold_usd)).unwrap().unwrap();
        let b = n.normalize(raw(backward, sold_eur)).unwrap().unwrap();
        assert_eq!(a.pair(), b.pair());
        assert_eq!(a.base_asset.currency, "EUR");
        assert_eq!(a.price, dec!(2));
        assert_eq!(b.price, dec!(2));
    }

    #[test]
    fn test_market_account_filter() {
        let tx = json!({"TransactionType": "OfferCreate", "Account": TRADER,
            "TakerGets": "100000000", "TakerPays": usd_amount("50")});
        let fill = vec![xrp_balance(TRADER, 500_000_000, 400_000_000), holding(TRADER, ISSUER, "USD", "0", "50")];
        let through_pool = fill.iter().cloned().chain([pool_root(2_000_000_000)]).collect();
        let tracked = Normaliser::new(vec![AssetId::native()], vec![POOL.to_string()]);
        assert_eq!(tracked.normalize(raw(tx.clone(), applied(fill))).unwrap(), None);
        assert!(tracked.normalize(raw(tx, applied(through_pool))).unwrap().is_some());
    }

    #[test]
    fn test_reserve_sample_from_pool_balances() {
        let tx = json!({"TransactionType": "Payment", "Account": TRADER, "Destination": TRADER,
            "Amount": usd_amount("10"), "SendMax": "30000000"});
        // pool is the high side of its USD line
        let pool_usd = json!({"ModifiedNode": {"LedgerEntryType": "RippleState",
            "FinalFields": {
                "Balance": {"currency": "USD", "issuer": NEUTRAL, "value": "-400"},
                "LowLimit": {"currency": "USD", "issuer": ISSUER, "value": "0"},
                "HighLimit": {"currency": "USD", "issuer": POOL, "value": "0"}},
            "PreviousFields": {"Balance": {"currency": "USD", "issuer": NEUTRAL, "value": "-410"}}}});
        let meta = applied(vec![pool_root(1_000_000_000), pool_usd]);
        let sample = normaliser().reserve_sample(&raw(tx, meta)).unwrap().unwrap();
        assert_eq!(sample.pool, POOL);
        assert_eq!(sample.base_asset, usd());
        assert_eq!(sample.quote_asset, AssetId::native());
        assert_eq!((sample.base_reserve, sample.quote_reserve), (dec!(400), dec!(1000)));
        assert_eq!(sample.price, dec!(2.5));
        assert_eq!(sample.timestamp, close());
    }

    #[test]
    fn test_no_reserve_sample_without_pool() {
        let tx = json!({"TransactionType": "AccountSet", "Account": TRADER});
        assert_eq!(normaliser().reserve_sample(&raw(tx.clone(), success())).unwrap(), None);
        let failed = json!({"TransactionResult": "tecPATH_DRY", "AffectedNodes": [pool_root(1_000_000)]});
        assert_eq!(normaliser().reserve_sample(&raw(tx, failed)).unwrap(), None);
    }
}
