//! Currency code decoding and exact amount parsing for ledger wire values.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::engine::types::{AssetId, NATIVE_CURRENCY};

/// 1 XRP = 10^6 drops.
pub const DROPS_SCALE: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("{0}")]
    Invalid(String),
    /// Well-formed number that `Decimal` cannot hold. Issued values reach
    /// 1e96 on the ledger, far past 96-bit mantissa range.
    #[error("amount `{0}` is outside the decimal range")]
    OutOfRange(String),
}

/// An amount as it appears on the wire: a drop string for XRP, an object for
/// issued currencies.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WireAmount {
    Drops(String),
    Issued { currency: String, issuer: String, value: String },
}

/// Asset reference without a value (`Asset`/`Asset2` on AMM transactions).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WireIssue {
    pub currency: String,
    #[serde(default)]
    pub issuer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetAmount {
    pub asset: AssetId,
    pub value: Decimal,
}

/// Decode a currency code into its display symbol.
///
/// Three character codes pass through. 160-bit codes arrive as 40 hex
/// characters: the standard layout (leading zero byte, ISO code in bytes
/// 12..15) yields that code, anything else is read as UTF-8 with the zero
/// padding trimmed. Undecodable codes are kept as upper-case hex.
pub fn decode_currency(code: &str) -> String {
    if code.len() != 40 {
        return code.to_string();
    }
    let bytes = match decode_hex(code) {
        Some(bytes) => bytes,
        None => return code.to_string(),
    };
    if bytes.iter().all(|b| *b == 0) {
        return NATIVE_CURRENCY.to_string();
    }
    if bytes[0] == 0 {
        let iso = &bytes[12..15];
        let rest_zero = bytes[1..12].iter().chain(&bytes[15..]).all(|b| *b == 0);
        if rest_zero && iso.iter().all(|b| b.is_ascii_alphanumeric()) {
            return String::from_utf8_lossy(iso).into_owned();
        }
    }
    let trimmed: &[u8] = {
        let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        &bytes[..end]
    };
    match std::str::from_utf8(trimmed) {
        Ok(s) if !s.is_empty() && !s.contains('\0') && s.chars().all(|c| !c.is_control()) => s.to_string(),
        _ => code.to_ascii_uppercase(),
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| s.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

/// Parse a decimal string without going through binary floating point.
/// Accepts plain (`"12.5"`) and scientific (`"1234567890123456e-20"`) forms.
pub fn parse_decimal(s: &str) -> Result<Decimal, AmountError> {
    let s = s.trim();
    let parsed = if s.contains(['e', 'E']) {
        Decimal::from_scientific(s)
    } else {
        Decimal::from_str(s)
    };
    parsed.map(|d| d.normalize()).map_err(|e| {
        if is_numeric(s) {
            AmountError::OutOfRange(s.to_string())
        } else {
            AmountError::Invalid(format!("invalid decimal `{}`: {}", s, e))
        }
    })
}

/// Drops are an integer count; the result carries an exact scale of 6.
pub fn parse_drops(s: &str) -> Result<Decimal, AmountError> {
    let s = s.trim();
    match s.parse::<i64>() {
        Ok(drops) => Ok(Decimal::from_i128_with_scale(i128::from(drops), DROPS_SCALE).normalize()),
        Err(_) if !s.is_empty() && s.strip_prefix('-').unwrap_or(s).bytes().all(|b| b.is_ascii_digit()) => {
            Err(AmountError::OutOfRange(s.to_string()))
        }
        Err(_) => Err(AmountError::Invalid(format!("invalid drops amount `{}`", s))),
    }
}

/// Syntactically a number: sign, digits with an optional point, optional exponent.
fn is_numeric(s: &str) -> bool {
    let unsigned = s.strip_prefix(['-', '+']).unwrap_or(s);
    let (mantissa, exponent) = match unsigned.split_once(['e', 'E']) {
        Some((m, e)) => (m, Some(e)),
        None => (unsigned, None),
    };
    let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    let mantissa_ok = !(int.is_empty() && frac.is_empty()) && digits(int) && digits(frac);
    let exponent_ok = exponent.map_or(true, |e| {
        let e = e.strip_prefix(['-', '+']).unwrap_or(e);
        !e.is_empty() && digits(e)
    });
    mantissa_ok && exponent_ok
}

pub fn asset_of_issue(issue: &WireIssue) -> Result<AssetId, AmountError> {
    match &issue.issuer {
        None if issue.currency == NATIVE_CURRENCY => Ok(AssetId::native()),
        None => Err(AmountError::Invalid(format!("issued currency `{}` without issuer", issue.currency))),
        Some(issuer) => issued_asset(&issue.currency, issuer),
    }
}

pub fn issued_asset(currency: &str, issuer: &str) -> Result<AssetId, AmountError> {
    let symbol = decode_currency(currency);
    if symbol == NATIVE_CURRENCY {
        return Err(AmountError::Invalid(format!("issued amount claims native currency (issuer {})", issuer)));
    }
    Ok(AssetId::issued(symbol, issuer))
}

pub fn to_asset_amount(amount: &WireAmount) -> Result<AssetAmount, AmountError> {
    match amount {
        WireAmount::Drops(drops) => Ok(AssetAmount { asset: AssetId::native(), value: parse_drops(drops)? }),
        WireAmount::Issued { currency, issuer, value } => Ok(AssetAmount {
            asset: issued_asset(currency, issuer)?,
            value: parse_decimal(value)?,
        }),
    }
}
