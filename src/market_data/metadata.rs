//! Reading transaction metadata: what actually moved, as opposed to what a
//! transaction asked for.
//!
//! Balances come from `AffectedNodes`. An AccountRoot carries the account's
//! XRP in drops. A RippleState carries one trust line's balance from the low
//! account's side: a positive value means the low account holds currency
//! issued by the high account, so the high side sees the negated change.

use rust_decimal::Decimal;
use serde_json::Value;

use crate::engine::types::AssetId;
use crate::market_data::asset::{issued_asset, parse_decimal, parse_drops, AmountError, AssetAmount};

/// One account's holding of one asset changed by `delta` (post minus pre).
/// `delta` is `None` when a balance lies outside the decimal range; that only
/// matters to callers asking about this account and asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceChange {
    pub account: String,
    pub asset: AssetId,
    pub delta: Option<Decimal>,
}

/// Holdings of an AMM pool account after the transaction applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReserves {
    pub pool: String,
    pub first: AssetAmount,
    pub second: AssetAmount,
}

/// (`CreatedNode` | `ModifiedNode` | `DeletedNode`, inner node) pairs.
pub fn affected_nodes(meta: &Value) -> impl Iterator<Item = (&str, &Value)> {
    meta.get("AffectedNodes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|wrapper| wrapper.as_object()?.iter().next().map(|(kind, node)| (kind.as_str(), node)))
}

/// Post-transaction fields of a node.
pub fn fields(node: &Value) -> Option<&Value> {
    node.get("FinalFields").or_else(|| node.get("NewFields"))
}

pub fn entry_type(node: &Value) -> Option<&str> {
    node.get("LedgerEntryType").and_then(Value::as_str)
}

/// An AMM pool is an AccountRoot carrying `AMMID`.
pub fn is_amm_root(node: &Value) -> bool {
    entry_type(node) == Some("AccountRoot") && fields(node).map_or(false, |f| f.get("AMMID").is_some())
}

pub fn balance_changes(meta: &Value) -> Result<Vec<BalanceChange>, AmountError> {
    let mut changes = Vec::new();
    for (kind, node) in affected_nodes(meta) {
        match entry_type(node) {
            Some("AccountRoot") => {
                let Some(account) = fields(node).and_then(|f| f.get("Account")).and_then(Value::as_str) else {
                    continue;
                };
                if let Some(delta) = in_range(balance_delta(kind, node, drops_balance))? {
                    changes.push(BalanceChange { account: account.to_string(), asset: AssetId::native(), delta });
                }
            }
            Some("RippleState") => {
                let Some(line) = fields(node) else { continue };
                let (Some(low), Some(high), Some(currency)) =
                    (limit_account(line, "LowLimit"), limit_account(line, "HighLimit"), line_currency(line))
                else {
                    continue;
                };
                if let Some(delta) = in_range(balance_delta(kind, node, line_balance))? {
                    changes.push(BalanceChange { account: low.to_string(), asset: issued_asset(currency, high)?, delta });
                    changes.push(BalanceChange {
                        account: high.to_string(),
                        asset: issued_asset(currency, low)?,
                        delta: delta.map(|d| -d),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(changes)
}

/// Net change of `account`'s holding of `asset`. An account issuing `asset`
/// itself sees it across every trust line in that currency.
pub fn net_change(changes: &[BalanceChange], account: &str, asset: &AssetId) -> Result<Decimal, AmountError> {
    let own_issue = !asset.is_native() && asset.issuer == account;
    changes
        .iter()
        .filter(|c| c.account == account)
        .filter(|c| c.asset == *asset || (own_issue && !c.asset.is_native() && c.asset.currency == asset.currency))
        .try_fold(Decimal::ZERO, |sum, c| {
            c.delta
                .and_then(|delta| sum.checked_add(delta))
                .ok_or_else(|| AmountError::OutOfRange(format!("{} balance of {}", asset, account)))
        })
}

/// Keeps an out-of-range balance as an unknown change instead of failing the
/// whole transaction; `Ok(None)` still means nothing moved.
fn in_range(delta: Result<Option<Decimal>, AmountError>) -> Result<Option<Option<Decimal>>, AmountError> {
    match delta {
        Ok(delta) => Ok(delta.map(Some)),
        Err(AmountError::OutOfRange(_)) => Ok(Some(None)),
        Err(e) => Err(e),
    }
}

/// Reserves of the AMM pool a transaction touched, read from post-transaction
/// fields. `None` unless the metadata shows exactly two positive holdings;
/// an untouched side of the pool does not appear in metadata.
pub fn pool_reserves(meta: &Value) -> Result<Option<PoolReserves>, AmountError> {
    let Some(root) = affected_nodes(meta).map(|(_, node)| node).find(|node| is_amm_root(node)) else {
        return Ok(None);
    };
    let Some(pool) = fields(root).and_then(|f| f.get("Account")).and_then(Value::as_str) else {
        return Ok(None);
    };

    let mut holdings = Vec::new();
    if let Some(balance) = fields(root).and_then(|f| f.get("Balance")) {
        let value = drops_balance(balance)?;
        if value > Decimal::ZERO {
            holdings.push(AssetAmount { asset: AssetId::native(), value });
        }
    }
    for (kind, node) in affected_nodes(meta) {
        if kind == "DeletedNode" || entry_type(node) != Some("RippleState") {
            continue;
        }
        let Some(line) = fields(node) else { continue };
        let (Some(low), Some(high), Some(currency)) =
            (limit_account(line, "LowLimit"), limit_account(line, "HighLimit"), line_currency(line))
        else {
            continue;
        };
        if low != pool && high != pool {
            continue;
        }
        let Some(balance) = line.get("Balance") else { continue };
        let value = line_balance(balance)?;
        // LP token lines are issued by the pool and show up negative here
        let holding = if low == pool {
            AssetAmount { asset: issued_asset(currency, high)?, value }
        } else {
            AssetAmount { asset: issued_asset(currency, low)?, value: -value }
        };
        if holding.value > Decimal::ZERO {
            holdings.push(holding);
        }
    }

    holdings.sort_by(|a, b| a.asset.cmp(&b.asset));
    holdings.dedup_by(|a, b| a.asset == b.asset);
    match <[AssetAmount; 2]>::try_from(holdings) {
        Ok([first, second]) => Ok(Some(PoolReserves { pool: pool.to_string(), first, second })),
        Err(_) => Ok(None),
    }
}

/// `None` when the balance did not move.
fn balance_delta(
    kind: &str,
    node: &Value,
    read: fn(&Value) -> Result<Decimal, AmountError>,
) -> Result<Option<Decimal>, AmountError> {
    let after = fields(node).and_then(|f| f.get("Balance")).map(read).transpose()?.unwrap_or(Decimal::ZERO);
    let before = match kind {
        "CreatedNode" => Decimal::ZERO,
        _ => match node.get("PreviousFields").and_then(|p| p.get("Balance")) {
            Some(balance) => read(balance)?,
            None => return Ok(None),
        },
    };
    let delta = after
        .checked_sub(before)
        .ok_or_else(|| AmountError::OutOfRange(format!("{} - {}", after, before)))?;
    Ok((!delta.is_zero()).then_some(delta))
}

fn drops_balance(balance: &Value) -> Result<Decimal, AmountError> {
    balance
        .as_str()
        .ok_or_else(|| AmountError::Invalid(format!("AccountRoot balance is not a drop string: {}", balance)))
        .and_then(parse_drops)
}

fn line_balance(balance: &Value) -> Result<Decimal, AmountError> {
    balance
        .get("value")
        .and_then(Value::as_str)
        .ok_or_else(|| AmountError::Invalid(format!("trust line balance without value: {}", balance)))
        .and_then(parse_decimal)
}

fn limit_account<'a>(line: &'a Value, side: &str) -> Option<&'a str> {
    line.get(side)?.get("issuer")?.as_str()
}

fn line_currency(line: &Value) -> Option<&str> {
    line.get("Balance")?.get("currency")?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    const ISSUER: &str = "rhub8VRN55s94qWKDv6jmDy1pUykJzF3wq";
    const TRADER: &str = "rPEPPER7kfTD9w2To4CQk6UCfuHM9c6GDY";
    const POOL: &str = "rhWTXC2m2gGGA9WozUaoMm6kLAVPb1tcS3";
    const NEUTRAL: &str = "rrrrrrrrrrrrrrrrrrrrBZbvji";

    fn root(account: &str, before: &str, after: &str) -> Value {
        json!({"ModifiedNode": {"LedgerEntryType": "AccountRoot",
            "FinalFields": {"Account": account, "Balance": after},
            "PreviousFields": {"Balance": before}}})
    }

    fn line(low: &str, high: &str, currency: &str, before: &str, after: &str) -> Value {
        json!({"ModifiedNode": {"LedgerEntryType": "RippleState",
            "FinalFields": {
                "Balance": {"currency": currency, "issuer": NEUTRAL, "value": after},
                "LowLimit": {"currency": currency, "issuer": low, "value": "0"},
                "HighLimit": {"currency": currency, "issuer": high, "value": "1000000"}},
            "PreviousFields": {"Balance": {"currency": currency, "issuer": NEUTRAL, "value": before}}}})
    }

    fn meta(nodes: Vec<Value>) -> Value {
        json!({"TransactionResult": "tesSUCCESS", "AffectedNodes": nodes})
    }

    fn usd() -> AssetId {
        AssetId::issued("USD", ISSUER)
    }

    #[test]
    fn test_account_root_delta_in_xrp() {
        let changes = balance_changes(&meta(vec![root(TRADER, "500000000", "399999988")])).unwrap();
        assert_eq!(net_change(&changes, TRADER, &AssetId::native()).unwrap(), dec!(-100.000012));
    }

    #[test]
    fn test_trust_line_sides_see_opposite_changes() {
        // trader is the high side: balance going more negative means the trader gained
        let changes = balance_changes(&meta(vec![line(ISSUER, TRADER, "USD", "-10", "-60")])).unwrap();
        assert_eq!(net_change(&changes, TRADER, &usd()).unwrap(), dec!(50));
        assert_eq!(net_change(&changes, ISSUER, &AssetId::issued("USD", TRADER)).unwrap(), dec!(-50));
    }

    #[test]
    fn test_issuer_sees_own_currency_across_lines() {
        let other = "rLHzPsX6oXkzU2qL12kHCH8G8cnZv1rBJh";
        let changes = balance_changes(&meta(vec![
            line(TRADER, ISSUER, "USD", "0", "20"),
            line(other, ISSUER, "USD", "5", "0"),
        ]))
        .unwrap();
        assert_eq!(net_change(&changes, ISSUER, &usd()).unwrap(), dec!(-15));
    }

    #[test]
    fn test_untouched_balance_is_not_a_change() {
        let node = json!({"ModifiedNode": {"LedgerEntryType": "AccountRoot",
            "FinalFields": {"Account": TRADER, "Balance": "100", "Sequence": 8},
            "PreviousFields": {"Sequence": 7}}});
        assert!(balance_changes(&meta(vec![node])).unwrap().is_empty());
    }

    #[test]
    fn test_out_of_range_line_only_fails_its_own_account() {
        let other = "rLHzPsX6oXkzU2qL12kHCH8G8cnZv1rBJh";
        let changes = balance_changes(&meta(vec![
            root(TRADER, "500000000", "400000000"),
            line(other, ISSUER, "USD", "0", "1e90"),
        ]))
        .unwrap();
        assert_eq!(net_change(&changes, TRADER, &AssetId::native()).unwrap(), dec!(-100));
        assert!(matches!(net_change(&changes, other, &usd()), Err(AmountError::OutOfRange(_))));
    }

    #[test]
    fn test_created_line_starts_from_zero() {
        let node = json!({"CreatedNode": {"LedgerEntryType": "RippleState", "NewFields": {
            "Balance": {"currency": "USD", "issuer": NEUTRAL, "value": "7"},
            "LowLimit": {"currency": "USD", "issuer": TRADER, "value": "100"},
            "HighLimit": {"currency": "USD", "issuer": ISSUER, "value": "0"}}}});
        let changes = balance_changes(&meta(vec![node])).unwrap();
        assert_eq!(net_change(&changes, TRADER, &usd()).unwrap(), dec!(7));
    }

    #[test]
    fn test_pool_reserves_after_swap() {
        let pool_root = json!({"ModifiedNode": {"LedgerEntryType": "AccountRoot",
            "FinalFields": {"Account": POOL, "AMMID": "AB12", "Balance": "2000000000"},
            "PreviousFields": {"Balance": "1900000000"}}});
        // pool is the high side of its USD line; the LP token line is issued by the pool
        let reserves = pool_reserves(&meta(vec![
            pool_root,
            line(ISSUER, POOL, "USD", "-1050", "-1000"),
            line(TRADER, POOL, "03930D02208264E2E40EC1B0C09E4DB96EE197B1", "10", "10"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(reserves.pool, POOL);
        let sides = [reserves.first, reserves.second];
        assert!(sides.contains(&AssetAmount { asset: AssetId::native(), value: dec!(2000) }));
        assert!(sides.contains(&AssetAmount { asset: usd(), value: dec!(1000) }));
    }

    #[test]
    fn test_pool_reserves_need_both_sides() {
        let pool_root = json!({"ModifiedNode": {"LedgerEntryType": "AccountRoot",
            "FinalFields": {"Account": POOL, "AMMID": "AB12", "Balance": "2000000000"}}});
        assert_eq!(pool_reserves(&meta(vec![pool_root])).unwrap(), None);
        assert_eq!(pool_reserves(&meta(vec![root(TRADER, "1", "2")])).unwrap(), None);
    }
}
