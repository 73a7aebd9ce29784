//! Per-bar indicator arithmetic.
//!
//! Two shapes live here. [`IndicatorSet`] is the vectorised engine used by the
//! backtester and the rule strategy: every column is a `Vec<f64>` sharing the
//! bar index of the source series, computed once in O(N). Warmup positions are
//! `NaN`. Indexing by bar position (never by timestamp) makes look-ahead
//! impossible by construction; the Donchian column only ever reads bars
//! `[i-N, i-1]`.
//!
//! [`IndicatorSnapshot`] is the latest-value bundle fed to the AI payload,
//! produced by streaming the series through `ta` indicators.

use crate::domain::market::OhlcvSeries;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use ta::Next;
use ta::indicators::{
    AverageTrueRange, BollingerBands, ExponentialMovingAverage,
    MovingAverageConvergenceDivergence, RelativeStrengthIndex, SimpleMovingAverage,
};

pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 {
        return out;
    }
    for i in (window - 1)..values.len() {
        let slice = &values[i + 1 - window..=i];
        out[i] = slice.iter().sum::<f64>() / window as f64;
    }
    out
}

/// Sample standard deviation (n-1 denominator) over a rolling window.
pub fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window < 2 {
        return out;
    }
    for i in (window - 1)..values.len() {
        let slice = &values[i + 1 - window..=i];
        let mean = slice.iter().sum::<f64>() / window as f64;
        let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (window - 1) as f64;
        out[i] = var.sqrt();
    }
    out
}

pub fn rolling_max(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 {
        return out;
    }
    for i in (window - 1)..values.len() {
        out[i] = values[i + 1 - window..=i]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
    }
    out
}

pub fn rolling_min(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 {
        return out;
    }
    for i in (window - 1)..values.len() {
        out[i] = values[i + 1 - window..=i]
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
    }
    out
}

/// True range per bar; bar 0 falls back to high-low.
fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());
    for i in 0..high.len() {
        let hl = high[i] - low[i];
        let range = if i == 0 {
            hl
        } else {
            hl.max((high[i] - close[i - 1]).abs())
                .max((low[i] - close[i - 1]).abs())
        };
        tr.push(range);
    }
    tr
}

pub fn atr_series(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    rolling_mean(&true_range(high, low, close), period)
}

pub fn rsi_series(close: &[f64], period: usize) -> Vec<f64> {
    let n = close.len();
    let mut gains = vec![f64::NAN; n];
    let mut losses = vec![f64::NAN; n];
    for i in 1..n {
        let delta = close[i] - close[i - 1];
        gains[i] = delta.max(0.0);
        losses[i] = (-delta).max(0.0);
    }
    let gain_ma = rolling_mean(&gains, period);
    let loss_ma = rolling_mean(&losses, period);
    gain_ma
        .iter()
        .zip(loss_ma.iter())
        .map(|(g, l)| {
            // 0/0 stays NaN, gain/0 saturates to 100, matching pandas.
            let rs = g / l;
            100.0 - 100.0 / (1.0 + rs)
        })
        .collect()
}

pub struct DirectionalIndex {
    pub plus_di: Vec<f64>,
    pub minus_di: Vec<f64>,
    pub adx: Vec<f64>,
}

pub fn adx_series(high: &[f64], low: &[f64], close: &[f64], period: usize) -> DirectionalIndex {
    let n = high.len();
    let tr = true_range(high, low, close);
    let mut plus_dm = vec![f64::NAN; n];
    let mut minus_dm = vec![f64::NAN; n];
    for i in 1..n {
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        let (mut p, mut m) = (up.max(0.0), down.max(0.0));
        // Only the larger directional move counts for the bar.
        if p > m {
            m = 0.0;
        } else {
            p = 0.0;
        }
        plus_dm[i] = p;
        minus_dm[i] = m;
    }

    let atr = rolling_mean(&tr, period);
    let plus_ma = rolling_mean(&plus_dm, period);
    let minus_ma = rolling_mean(&minus_dm, period);

    let mut plus_di = vec![f64::NAN; n];
    let mut minus_di = vec![f64::NAN; n];
    let mut dx = vec![f64::NAN; n];
    for i in 0..n {
        if atr[i].is_finite() && atr[i] > 0.0 {
            plus_di[i] = 100.0 * plus_ma[i] / atr[i];
            minus_di[i] = 100.0 * minus_ma[i] / atr[i];
            let denom = plus_di[i] + minus_di[i];
            if denom > 0.0 {
                dx[i] = 100.0 * (plus_di[i] - minus_di[i]).abs() / denom;
            }
        }
    }

    DirectionalIndex {
        plus_di,
        minus_di,
        adx: rolling_mean(&dx, period),
    }
}

pub fn obv_series(close: &[f64], volume: &[f64]) -> Vec<f64> {
    let mut obv = Vec::with_capacity(close.len());
    if close.is_empty() {
        return obv;
    }
    obv.push(volume[0]);
    for i in 1..close.len() {
        let prev = obv[i - 1];
        let next = if close[i] > close[i - 1] {
            prev + volume[i]
        } else if close[i] < close[i - 1] {
            prev - volume[i]
        } else {
            prev
        };
        obv.push(next);
    }
    obv
}

/// Precomputed columns for the volatility-breakout strategy. Parallel arrays
/// indexed by bar position of the source series.
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,

    pub sma20: Vec<f64>,
    pub bb_upper: Vec<f64>,
    pub bb_lower: Vec<f64>,
    pub bb_width: Vec<f64>,
    pub bb_width_ma20: Vec<f64>,
    pub vol_ma20: Vec<f64>,
    pub trend_ma: Vec<f64>,
    pub atr: Vec<f64>,
    pub adx: Vec<f64>,
    pub rsi: Vec<f64>,
    pub obv: Vec<f64>,
    pub obv_ma5: Vec<f64>,
    pub obv_ma20: Vec<f64>,
    /// Rolling max of high over the Donchian period, current bar excluded.
    pub donchian_high: Vec<f64>,
    /// Noise-driven K, clipped to [0.3, 0.7].
    pub dynamic_k: Vec<f64>,
}

impl IndicatorSet {
    pub fn compute(series: &OhlcvSeries, trend_ma_period: usize, donchian_period: usize) -> Self {
        let to_f64 = |d: rust_decimal::Decimal| d.to_f64().unwrap_or(f64::NAN);
        let open: Vec<f64> = series.candles.iter().map(|c| to_f64(c.open)).collect();
        let high: Vec<f64> = series.candles.iter().map(|c| to_f64(c.high)).collect();
        let low: Vec<f64> = series.candles.iter().map(|c| to_f64(c.low)).collect();
        let close: Vec<f64> = series.candles.iter().map(|c| to_f64(c.close)).collect();
        let volume: Vec<f64> = series.candles.iter().map(|c| to_f64(c.volume)).collect();
        let n = close.len();

        let sma20 = rolling_mean(&close, 20);
        let std20 = rolling_std(&close, 20);
        let mut bb_upper = vec![f64::NAN; n];
        let mut bb_lower = vec![f64::NAN; n];
        let mut bb_width = vec![f64::NAN; n];
        for i in 0..n {
            bb_upper[i] = sma20[i] + 2.0 * std20[i];
            bb_lower[i] = sma20[i] - 2.0 * std20[i];
            if sma20[i].is_finite() && sma20[i] != 0.0 {
                bb_width[i] = (bb_upper[i] - bb_lower[i]) / sma20[i];
            }
        }
        let bb_width_ma20 = rolling_mean(&bb_width, 20);

        let vol_ma20 = rolling_mean(&volume, 20);
        let trend_ma = rolling_mean(&close, trend_ma_period);
        let atr = atr_series(&high, &low, &close, 14);
        let adx = adx_series(&high, &low, &close, 14).adx;
        let rsi = rsi_series(&close, 14);

        let obv = obv_series(&close, &volume);
        let obv_ma5 = rolling_mean(&obv, 5);
        let obv_ma20 = rolling_mean(&obv, 20);

        // Previous-bar rolling max: shift the window back one bar so the
        // breakout test never sees the bar it is deciding on.
        let high_max = rolling_max(&high, donchian_period);
        let mut donchian_high = vec![f64::NAN; n];
        for i in 1..n {
            donchian_high[i] = high_max[i - 1];
        }

        let mut noise = vec![f64::NAN; n];
        for i in 0..n {
            let range = high[i] - low[i];
            if range > 0.0 {
                noise[i] = 1.0 - (open[i] - close[i]).abs() / range;
            }
        }
        let dynamic_k: Vec<f64> = rolling_mean(&noise, 20)
            .into_iter()
            .map(|v| v.clamp(0.3, 0.7))
            .collect();

        Self {
            open,
            high,
            low,
            close,
            volume,
            sma20,
            bb_upper,
            bb_lower,
            bb_width,
            bb_width_ma20,
            vol_ma20,
            trend_ma,
            atr,
            adx,
            rsi,
            obv,
            obv_ma5,
            obv_ma20,
            donchian_high,
            dynamic_k,
        }
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    /// ATR at `i` with the strategy's 2% fallback during warmup.
    pub fn atr_or_fallback(&self, i: usize) -> f64 {
        let v = self.atr.get(i).copied().unwrap_or(f64::NAN);
        if v.is_finite() { v } else { self.close[i] * 0.02 }
    }
}

/// Latest indicator values for the AI payload and reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub ma5: Option<f64>,
    pub ma20: Option<f64>,
    pub ma60: Option<f64>,
    pub ema12: Option<f64>,
    pub ema26: Option<f64>,
    pub rsi14: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
    pub bb_width_pct: Option<f64>,
    pub atr14: Option<f64>,
    pub adx14: Option<f64>,
    pub plus_di: Option<f64>,
    pub minus_di: Option<f64>,
    pub obv: Option<f64>,
    pub obv_change_pct: Option<f64>,
    pub cci20: Option<f64>,
    pub mfi14: Option<f64>,
    pub williams_r14: Option<f64>,
    pub stoch_k: Option<f64>,
    pub stoch_d: Option<f64>,
    pub keltner_upper: Option<f64>,
    pub keltner_middle: Option<f64>,
    pub keltner_lower: Option<f64>,
    pub volume_ratio: Option<f64>,
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

impl IndicatorSnapshot {
    pub fn from_series(series: &OhlcvSeries) -> Self {
        let mut snapshot = IndicatorSnapshot::default();
        if series.candles.len() < 2 {
            return snapshot;
        }
        let closes = series.closes_f64();
        let to_f64 = |d: rust_decimal::Decimal| d.to_f64().unwrap_or(f64::NAN);
        let high: Vec<f64> = series.candles.iter().map(|c| to_f64(c.high)).collect();
        let low: Vec<f64> = series.candles.iter().map(|c| to_f64(c.low)).collect();
        let volume: Vec<f64> = series.candles.iter().map(|c| to_f64(c.volume)).collect();
        let n = closes.len();

        // Single streaming pass over closes.
        let mut ma5 = SimpleMovingAverage::new(5).expect("valid period");
        let mut ma20 = SimpleMovingAverage::new(20).expect("valid period");
        let mut ma60 = SimpleMovingAverage::new(60).expect("valid period");
        let mut ema12 = ExponentialMovingAverage::new(12).expect("valid period");
        let mut ema26 = ExponentialMovingAverage::new(26).expect("valid period");
        let mut rsi = RelativeStrengthIndex::new(14).expect("valid period");
        let mut macd = MovingAverageConvergenceDivergence::new(12, 26, 9).expect("valid periods");
        let mut atr = AverageTrueRange::new(14).expect("valid period");
        let mut bb = BollingerBands::new(20, 2.0).expect("valid period");

        for (i, price) in closes.iter().enumerate() {
            let ma5_v = ma5.next(*price);
            let ma20_v = ma20.next(*price);
            let ma60_v = ma60.next(*price);
            let ema12_v = ema12.next(*price);
            let ema26_v = ema26.next(*price);
            let rsi_v = rsi.next(*price);
            let macd_v = macd.next(*price);
            let atr_v = atr.next(*price);
            let bb_v = bb.next(*price);
            if i + 1 == n {
                if n >= 5 {
                    snapshot.ma5 = finite(ma5_v);
                }
                if n >= 20 {
                    snapshot.ma20 = finite(ma20_v);
                    snapshot.bb_upper = finite(bb_v.upper);
                    snapshot.bb_middle = finite(bb_v.average);
                    snapshot.bb_lower = finite(bb_v.lower);
                    if bb_v.average != 0.0 {
                        snapshot.bb_width_pct =
                            finite((bb_v.upper - bb_v.lower) / bb_v.average * 100.0);
                    }
                }
                if n >= 60 {
                    snapshot.ma60 = finite(ma60_v);
                }
                snapshot.ema12 = finite(ema12_v);
                snapshot.ema26 = finite(ema26_v);
                snapshot.rsi14 = finite(rsi_v);
                snapshot.macd = finite(macd_v.macd);
                snapshot.macd_signal = finite(macd_v.signal);
                snapshot.macd_histogram = finite(macd_v.histogram);
                snapshot.atr14 = finite(atr_v);
            }
        }

        let di = adx_series(&high, &low, &closes, 14);
        snapshot.adx14 = di.adx.last().copied().and_then(finite);
        snapshot.plus_di = di.plus_di.last().copied().and_then(finite);
        snapshot.minus_di = di.minus_di.last().copied().and_then(finite);

        let obv = obv_series(&closes, &volume);
        snapshot.obv = obv.last().copied().and_then(finite);
        if n >= 2 && obv[n - 2] != 0.0 {
            snapshot.obv_change_pct = finite((obv[n - 1] - obv[n - 2]) / obv[n - 2] * 100.0);
        }

        // Typical-price family.
        let tp: Vec<f64> = (0..n).map(|i| (high[i] + low[i] + closes[i]) / 3.0).collect();
        if n >= 20 {
            let tp_ma = rolling_mean(&tp, 20);
            let mut mad = f64::NAN;
            if let Some(mean) = tp_ma.last().copied().filter(|v| v.is_finite()) {
                mad = tp[n - 20..].iter().map(|v| (v - mean).abs()).sum::<f64>() / 20.0;
            }
            if mad.is_finite() && mad > 0.0 {
                snapshot.cci20 = finite((tp[n - 1] - tp_ma[n - 1]) / (0.015 * mad));
            }
        }
        if n >= 15 {
            let mut pos_flow = 0.0;
            let mut neg_flow = 0.0;
            for i in (n - 14)..n {
                let raw = tp[i] * volume[i];
                if tp[i] > tp[i - 1] {
                    pos_flow += raw;
                } else if tp[i] < tp[i - 1] {
                    neg_flow += raw;
                }
            }
            if neg_flow > 0.0 {
                snapshot.mfi14 = finite(100.0 - 100.0 / (1.0 + pos_flow / neg_flow));
            } else if pos_flow > 0.0 {
                snapshot.mfi14 = Some(100.0);
            }
        }
        if n >= 14 {
            let hh = high[n - 14..].iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let ll = low[n - 14..].iter().copied().fold(f64::INFINITY, f64::min);
            if hh > ll {
                snapshot.williams_r14 = finite(-100.0 * (hh - closes[n - 1]) / (hh - ll));
                let k_series = rolling_stoch_k(&high, &low, &closes, 14);
                snapshot.stoch_k = k_series.last().copied().and_then(finite);
                snapshot.stoch_d = rolling_mean(&k_series, 3).last().copied().and_then(finite);
            }
        }
        if n >= 20 {
            let mid = rolling_mean(&closes, 20);
            let atr20 = atr_series(&high, &low, &closes, 20);
            if let (Some(m), Some(a)) = (
                mid.last().copied().filter(|v| v.is_finite()),
                atr20.last().copied().filter(|v| v.is_finite()),
            ) {
                snapshot.keltner_middle = Some(m);
                snapshot.keltner_upper = Some(m + 2.0 * a);
                snapshot.keltner_lower = Some(m - 2.0 * a);
            }

            let vol_ma = rolling_mean(&volume, 20);
            if let Some(v) = vol_ma.last().copied().filter(|v| v.is_finite() && *v > 0.0) {
                snapshot.volume_ratio = finite(volume[n - 1] / v);
            }
        }

        snapshot
    }
}

fn rolling_stoch_k(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let hh = rolling_max(high, period);
    let ll = rolling_min(low, period);
    (0..close.len())
        .map(|i| {
            let span = hh[i] - ll[i];
            if span.is_finite() && span > 0.0 {
                100.0 * (close[i] - ll[i]) / span
            } else {
                f64::NAN
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::{Candle, Interval};
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    fn series(bars: &[(f64, f64, f64, f64, f64)]) -> OhlcvSeries {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let candles = bars
            .iter()
            .enumerate()
            .map(|(i, (o, h, l, c, v))| Candle {
                ts: base + Duration::days(i as i64),
                open: Decimal::try_from(*o).unwrap(),
                high: Decimal::try_from(*h).unwrap(),
                low: Decimal::try_from(*l).unwrap(),
                close: Decimal::try_from(*c).unwrap(),
                volume: Decimal::try_from(*v).unwrap(),
            })
            .collect();
        OhlcvSeries::new("KRW-TEST", Interval::Day, candles)
    }

    fn flat_series(len: usize, price: f64) -> OhlcvSeries {
        let bars: Vec<_> = (0..len)
            .map(|_| (price, price, price, price, 100.0))
            .collect();
        series(&bars)
    }

    #[test]
    fn test_rolling_mean_warmup_is_nan() {
        let out = rolling_mean(&[1.0, 2.0, 3.0, 4.0], 3);
        assert!(out[0].is_nan() && out[1].is_nan());
        assert!((out[2] - 2.0).abs() < 1e-12);
        assert!((out[3] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_bb_width_zero_for_constant_series() {
        let set = IndicatorSet::compute(&flat_series(30, 100.0), 20, 20);
        let width = set.bb_width[29];
        assert!((width - 0.0).abs() < 1e-12, "width was {}", width);
    }

    #[test]
    fn test_donchian_excludes_current_bar() {
        // 20 flat bars at high=100, then a spike bar. The Donchian column at
        // the spike bar must still report the old high.
        let mut bars: Vec<_> = (0..20).map(|_| (100.0, 100.0, 100.0, 100.0, 1.0)).collect();
        bars.push((100.0, 120.0, 100.0, 119.0, 1.0));
        let set = IndicatorSet::compute(&series(&bars), 20, 20);
        assert!((set.donchian_high[20] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_constant_series_has_no_donchian_breakout() {
        let set = IndicatorSet::compute(&flat_series(40, 100.0), 20, 20);
        for i in 20..40 {
            assert!(set.close[i] <= set.donchian_high[i]);
        }
    }

    #[test]
    fn test_obv_accumulates_with_price_direction() {
        let s = series(&[
            (100.0, 101.0, 99.0, 100.0, 10.0),
            (100.0, 102.0, 99.0, 101.0, 20.0),
            (101.0, 102.0, 98.0, 99.0, 5.0),
            (99.0, 100.0, 98.0, 99.0, 7.0),
        ]);
        let set = IndicatorSet::compute(&s, 20, 20);
        assert_eq!(set.obv, vec![10.0, 30.0, 25.0, 25.0]);
    }

    #[test]
    fn test_dynamic_k_clipped() {
        // Doji bars (open == close) have noise ratio 1.0; K must clip at 0.7.
        let bars: Vec<_> = (0..25).map(|_| (100.0, 105.0, 95.0, 100.0, 1.0)).collect();
        let set = IndicatorSet::compute(&series(&bars), 20, 20);
        assert!((set.dynamic_k[24] - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_saturates_at_100_for_monotone_rise() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let rsi = rsi_series(&closes, 14);
        assert!((rsi[29] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_populates_core_fields() {
        let bars: Vec<_> = (0..80)
            .map(|i| {
                let p = 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.1;
                (p, p + 1.0, p - 1.0, p + 0.2, 50.0 + (i % 7) as f64)
            })
            .collect();
        let snapshot = IndicatorSnapshot::from_series(&series(&bars));
        assert!(snapshot.ma20.is_some());
        assert!(snapshot.rsi14.is_some());
        assert!(snapshot.macd.is_some());
        assert!(snapshot.atr14.is_some());
        assert!(snapshot.adx14.is_some());
        assert!(snapshot.stoch_k.is_some());
        assert!(snapshot.keltner_upper.is_some());
        assert!(snapshot.volume_ratio.is_some());
    }
}
