use crate::domain::market::{Candle, OhlcvSeries};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A repair or rejection performed on a loaded series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DataIssue {
    SwappedHighLow { index: usize },
    NegativeVolumeZeroed { index: usize },
    ForwardFilledPrice { index: usize },
    DuplicateTimestampDropped { index: usize },
    ResortedByTimestamp,
    GapExceedsLimit { index: usize, missing_bars: i64 },
    Uncorrectable { reason: String },
}

/// Outcome of validating one series. `series` is the repaired series; when
/// `uncorrectable` is set the caller must downgrade the ticker instead of
/// trading on it.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub issues: Vec<DataIssue>,
    pub uncorrectable: Option<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty() && self.uncorrectable.is_none()
    }
}

/// Validates and repairs an OHLCV series in place.
///
/// Repairs applied where safe: swap inverted high/low, zero negative volume,
/// forward-fill non-positive prices from the previous close, sort by
/// timestamp, drop duplicate timestamps. Gaps wider than `max_gap_bars`
/// intervals are flagged but kept. A series whose first candle is unusable
/// cannot be repaired.
pub struct OhlcvValidator {
    pub max_gap_bars: i64,
}

impl Default for OhlcvValidator {
    fn default() -> Self {
        Self { max_gap_bars: 3 }
    }
}

impl OhlcvValidator {
    pub fn validate(&self, series: &mut OhlcvSeries) -> ValidationReport {
        let mut issues = Vec::new();

        if series.candles.is_empty() {
            return ValidationReport {
                issues,
                uncorrectable: Some("empty series".to_string()),
            };
        }

        // Order and duplicates first so index-based repairs see a stable view.
        if !series.candles.is_sorted_by_key(|c| c.ts) {
            series.candles.sort_by_key(|c| c.ts);
            issues.push(DataIssue::ResortedByTimestamp);
        }
        let mut seen_dup = false;
        let before = series.candles.len();
        series.candles.dedup_by_key(|c| c.ts);
        if series.candles.len() != before {
            seen_dup = true;
        }
        if seen_dup {
            issues.push(DataIssue::DuplicateTimestampDropped {
                index: series.candles.len(),
            });
        }

        if !candle_usable(&series.candles[0]) {
            warn!(
                "OhlcvValidator: {} first candle unusable, cannot repair",
                series.ticker
            );
            return ValidationReport {
                issues,
                uncorrectable: Some("first candle has no valid price".to_string()),
            };
        }

        let interval = series.interval.duration();
        let mut prev_close = series.candles[0].close;
        let mut prev_ts = series.candles[0].ts;

        for i in 0..series.candles.len() {
            let candle = &mut series.candles[i];

            if candle.volume < Decimal::ZERO {
                candle.volume = Decimal::ZERO;
                issues.push(DataIssue::NegativeVolumeZeroed { index: i });
            }

            if i > 0 && !candle_usable(candle) {
                // Flat bar at the previous close stands in for the broken one.
                candle.open = prev_close;
                candle.high = prev_close;
                candle.low = prev_close;
                candle.close = prev_close;
                issues.push(DataIssue::ForwardFilledPrice { index: i });
            }

            if candle.low > candle.high {
                std::mem::swap(&mut candle.low, &mut candle.high);
                issues.push(DataIssue::SwappedHighLow { index: i });
            }

            if i > 0 {
                let gap = candle.ts - prev_ts;
                let missing = gap.num_seconds() / interval.num_seconds().max(1) - 1;
                if missing > self.max_gap_bars {
                    issues.push(DataIssue::GapExceedsLimit {
                        index: i,
                        missing_bars: missing,
                    });
                }
            }

            prev_close = candle.close;
            prev_ts = candle.ts;
        }

        if !issues.is_empty() {
            warn!(
                "OhlcvValidator: {} repaired with {} issue(s)",
                series.ticker,
                issues.len()
            );
        }

        ValidationReport {
            issues,
            uncorrectable: None,
        }
    }
}

fn candle_usable(candle: &Candle) -> bool {
    candle.open > Decimal::ZERO
        && candle.high > Decimal::ZERO
        && candle.low > Decimal::ZERO
        && candle.close > Decimal::ZERO
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Interval;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn candle(day: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            ts: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::days(day),
            open: Decimal::try_from(open).unwrap(),
            high: Decimal::try_from(high).unwrap(),
            low: Decimal::try_from(low).unwrap(),
            close: Decimal::try_from(close).unwrap(),
            volume: Decimal::try_from(volume).unwrap(),
        }
    }

    fn series(candles: Vec<Candle>) -> OhlcvSeries {
        OhlcvSeries::new("KRW-TEST", Interval::Day, candles)
    }

    #[test]
    fn test_swaps_inverted_high_low() {
        let mut s = series(vec![candle(0, 100.0, 95.0, 105.0, 100.0, 10.0)]);
        let report = OhlcvValidator::default().validate(&mut s);
        assert_eq!(s.candles[0].high, dec!(105.0));
        assert_eq!(s.candles[0].low, dec!(95.0));
        assert!(matches!(
            report.issues[0],
            DataIssue::SwappedHighLow { index: 0 }
        ));
    }

    #[test]
    fn test_zeroes_negative_volume() {
        let mut s = series(vec![candle(0, 100.0, 105.0, 95.0, 100.0, -5.0)]);
        let report = OhlcvValidator::default().validate(&mut s);
        assert_eq!(s.candles[0].volume, Decimal::ZERO);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_sorts_and_dedupes() {
        let mut s = series(vec![
            candle(2, 100.0, 105.0, 95.0, 100.0, 1.0),
            candle(0, 100.0, 105.0, 95.0, 100.0, 1.0),
            candle(2, 101.0, 106.0, 96.0, 101.0, 1.0),
        ]);
        let report = OhlcvValidator::default().validate(&mut s);
        assert_eq!(s.candles.len(), 2);
        assert!(s.candles[0].ts < s.candles[1].ts);
        assert!(report.issues.contains(&DataIssue::ResortedByTimestamp));
    }

    #[test]
    fn test_validate_is_idempotent() {
        let mut s = series(vec![
            candle(0, 100.0, 95.0, 105.0, 100.0, -1.0),
            candle(1, 100.0, 105.0, 95.0, 100.0, 1.0),
        ]);
        let validator = OhlcvValidator::default();
        validator.validate(&mut s);
        let again = validator.validate(&mut s);
        assert!(again.is_clean(), "second pass found {:?}", again.issues);
    }

    #[test]
    fn test_flags_large_gap() {
        let mut s = series(vec![
            candle(0, 100.0, 105.0, 95.0, 100.0, 1.0),
            candle(10, 100.0, 105.0, 95.0, 100.0, 1.0),
        ]);
        let report = OhlcvValidator::default().validate(&mut s);
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, DataIssue::GapExceedsLimit { .. })));
    }

    #[test]
    fn test_empty_series_uncorrectable() {
        let mut s = series(vec![]);
        let report = OhlcvValidator::default().validate(&mut s);
        assert!(report.uncorrectable.is_some());
    }
}
