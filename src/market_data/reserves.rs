// AMM pool reserve series: post-trade pool balances and the price they imply

use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::engine::types::AssetId;

/// Pool holdings after one transaction. `price` is quote reserve per base
/// reserve, the same orientation as `NormalizedEvent::price`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveSample {
    pub timestamp: DateTime<Utc>,
    pub ledger_index: u32,
    pub tx_hash: String,
    pub pool: String,
    pub base_asset: AssetId,
    pub quote_asset: AssetId,
    pub base_reserve: Decimal,
    pub quote_reserve: Decimal,
    pub price: Decimal,
}

/// Keep at most one sample per `min_gap` per pool: a sample is dropped when
/// the last kept one for its pool is less than `min_gap` older. Input must be
/// in time order. A zero gap keeps everything.
pub fn thin(samples: impl IntoIterator<Item = ReserveSample>, min_gap: Duration) -> Vec<ReserveSample> {
    let mut last_kept: AHashMap<String, DateTime<Utc>> = AHashMap::new();
    samples
        .into_iter()
        .filter(|sample| {
            let keep = last_kept
                .get(&sample.pool)
                .map_or(true, |last| sample.timestamp - *last >= min_gap);
            if keep {
                last_kept.insert(sample.pool.clone(), sample.timestamp);
            }
            keep
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn sample(pool: &str, minute: u32) -> ReserveSample {
        ReserveSample {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
            ledger_index: 1000 + minute,
            tx_hash: format!("T{}", minute),
            pool: pool.into(),
            base_asset: AssetId::issued("USD", "rhub8VRN55s94qWKDv6jmDy1pUykJzF3wq"),
            quote_asset: AssetId::native(),
            base_reserve: dec!(400),
            quote_reserve: dec!(1000),
            price: dec!(2.5),
        }
    }

    fn minutes(samples: &[ReserveSample]) -> Vec<u32> {
        samples.iter().map(|s| s.ledger_index - 1000).collect()
    }

    #[test]
    fn test_thin_keeps_one_per_interval() {
        let samples = [0, 5, 9, 10, 31, 40].map(|m| sample("rPool", m));
        let kept = thin(samples, Duration::minutes(10));
        assert_eq!(minutes(&kept), vec![0, 10, 31]);
    }

    #[test]
    fn test_thin_tracks_pools_separately() {
        let samples = vec![sample("rA", 0), sample("rB", 1), sample("rA", 2), sample("rB", 20)];
        let kept = thin(samples, Duration::minutes(10));
        assert_eq!(kept.iter().map(|s| s.pool.as_str()).collect::<Vec<_>>(), vec!["rA", "rB", "rB"]);
    }

    #[test]
    fn test_zero_gap_keeps_everything() {
        let samples = vec![sample("rPool", 0), sample("rPool", 0), sample("rPool", 1)];
        assert_eq!(thin(samples, Duration::zero()).len(), 3);
    }
}
