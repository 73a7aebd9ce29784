//! Volatility-breakout rule strategy.
//!
//! A pure function of history + portfolio: no I/O, no AI. Entries pass four
//! AND-joined gates (trend filter, squeeze, breakout, volume/OBV); exits apply
//! five rules in priority order. Indicators are precomputed once per series
//! via [`IndicatorSet`], so a whole-backtest pass stays O(N).

use crate::config::StrategyOptions;
use crate::domain::indicators::IndicatorSet;
use crate::domain::market::{Orderbook, OhlcvSeries};
use crate::domain::trading::portfolio::Portfolio;
use crate::domain::trading::{
    EntryReason, ExitTrigger, Signal, SignalAction, SignalReason,
};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

// Position sizing bounds.
const MIN_RISK_PCT: f64 = 0.015;
const MAX_RISK_PCT: f64 = 0.05;

// Exit rule constants.
const FAKEOUT_THRESHOLD_BARS: usize = 3;
const FAKEOUT_PRICE_DROP: f64 = 0.98;
const ADX_WEAKENING_RATIO: f64 = 0.8;
const ADX_WEAK_TREND: f64 = 20.0;
const TIMEOUT_MIN_PROFIT: f64 = 0.02;

// Stop/target distance in ATR multiples. Breakout trading keeps the stop
// short: a failed breakout is an immediate exit.
const STOP_LOSS_ATR_MULT: f64 = 2.0;
const TAKE_PROFIT_ATR_MULT: f64 = 3.0;

const MIN_TREND_MA_PERIOD: usize = 20;
const SLIPPAGE_WARN_PCT: f64 = 0.01;

#[derive(Debug, Clone)]
struct TrackedPosition {
    entry_price: f64,
    stop_loss: f64,
    take_profit: f64,
    entry_bar_index: usize,
}

/// Orderbook fill simulation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlippageInfo {
    pub actual_avg_price: f64,
    pub slippage_amount: f64,
    pub slippage_pct: f64,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitFill {
    pub order_num: usize,
    pub filled_size: f64,
    pub avg_price: f64,
    pub slippage_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitExecution {
    pub filled_orders: Vec<SplitFill>,
    pub avg_execution_price: f64,
    pub total_slippage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Ask,
    Bid,
}

pub struct BreakoutStrategy {
    pub ticker: String,
    config: StrategyOptions,
    indicators: Option<IndicatorSet>,
    tracked: Option<TrackedPosition>,
}

impl BreakoutStrategy {
    pub fn new(ticker: impl Into<String>, config: StrategyOptions) -> Self {
        let mut config = config;
        config.trend_ma_period = config.trend_ma_period.max(MIN_TREND_MA_PERIOD);
        Self {
            ticker: ticker.into(),
            config,
            indicators: None,
            tracked: None,
        }
    }

    pub fn config(&self) -> &StrategyOptions {
        &self.config
    }

    /// Precompute every indicator column for `series`. Must be called before
    /// `generate_signal`; a refreshed series requires a new call.
    pub fn prepare_indicators(&mut self, series: &OhlcvSeries) {
        self.indicators = Some(IndicatorSet::compute(
            series,
            self.config.trend_ma_period,
            self.config.donchian_period,
        ));
        self.tracked = None;
    }

    pub fn indicators(&self) -> Option<&IndicatorSet> {
        self.indicators.as_ref()
    }

    /// Signal for the bar at `bar_index`, seeing only bars `0..=bar_index`.
    ///
    /// The portfolio is the source of truth for whether a position exists;
    /// the strategy only tracks entry bar and stop/target levels between
    /// calls. Deterministic: identical history + config produce identical
    /// signals.
    pub fn generate_signal(&mut self, bar_index: usize, portfolio: &Portfolio) -> Option<Signal> {
        let ind = self.indicators.as_ref()?;
        if bar_index >= ind.len() || bar_index + 1 < self.config.donchian_period + 5 {
            return None;
        }

        let close = ind.close[bar_index];
        let has_position = portfolio.has_position(&self.ticker);

        if has_position {
            if self.tracked.is_none() {
                let position = &portfolio.positions[&self.ticker];
                let entry = position.entry_price.to_f64().unwrap_or(close);
                self.tracked = Some(TrackedPosition {
                    entry_price: entry,
                    stop_loss: position
                        .stop_loss
                        .and_then(|d| d.to_f64())
                        .unwrap_or(entry * 0.98),
                    take_profit: position
                        .take_profit
                        .and_then(|d| d.to_f64())
                        .unwrap_or(entry * 1.03),
                    entry_bar_index: position.entry_bar_index.unwrap_or(bar_index),
                });
            }
        } else {
            self.tracked = None;
        }

        if has_position {
            if let Some(signal) = self.check_exits(bar_index) {
                return Some(signal);
            }
            return None;
        }

        self.check_entry(bar_index)
    }

    // ---------------------------------------------------------------
    // Exits, priority order: stop-loss, fakeout, take-profit, trend
    // weakening, timeout.
    // ---------------------------------------------------------------
    fn check_exits(&mut self, i: usize) -> Option<Signal> {
        let ind = self.indicators.as_ref()?;
        let tracked = self.tracked.clone()?;
        let close = ind.close[i];
        let hold_bars = i.saturating_sub(tracked.entry_bar_index);

        if close <= tracked.stop_loss {
            return Some(self.exit_signal(
                close,
                ExitTrigger::StopLoss,
                format!("close {:.0} <= stop {:.0}", close, tracked.stop_loss),
            ));
        }

        if hold_bars <= FAKEOUT_THRESHOLD_BARS {
            let threshold = tracked.entry_price * FAKEOUT_PRICE_DROP;
            if close < threshold {
                return Some(self.exit_signal(
                    close,
                    ExitTrigger::Fakeout,
                    format!(
                        "drop right after entry ({:.0} < {:.0}, {} bars held)",
                        close, threshold, hold_bars
                    ),
                ));
            }
        }

        if close >= tracked.take_profit {
            return Some(self.exit_signal(
                close,
                ExitTrigger::TakeProfit,
                format!("close {:.0} >= target {:.0}", close, tracked.take_profit),
            ));
        }

        if i >= 1 {
            let adx = ind.adx[i];
            let prev_adx = ind.adx[i - 1];
            if adx.is_finite()
                && prev_adx.is_finite()
                && adx < prev_adx * ADX_WEAKENING_RATIO
                && adx < ADX_WEAK_TREND
            {
                return Some(self.exit_signal(
                    close,
                    ExitTrigger::TrendWeakening,
                    format!("ADX fell to {:.1} ({:.1} prev)", adx, prev_adx),
                ));
            }
        }

        let profit = if tracked.entry_price > 0.0 {
            (close - tracked.entry_price) / tracked.entry_price
        } else {
            0.0
        };
        if hold_bars > self.config.timeout_bars && profit < TIMEOUT_MIN_PROFIT {
            return Some(self.exit_signal(
                close,
                ExitTrigger::Timeout,
                format!(
                    "{} bars held, profit {:.2}% below minimum",
                    hold_bars,
                    profit * 100.0
                ),
            ));
        }

        None
    }

    fn exit_signal(&mut self, close: f64, trigger: ExitTrigger, detail: String) -> Signal {
        self.tracked = None;
        Signal {
            action: SignalAction::Sell,
            price: Decimal::from_f64(close).unwrap_or_default(),
            size: None,
            stop_loss: None,
            take_profit: None,
            reason: SignalReason::Exit { trigger, detail },
        }
    }

    // ---------------------------------------------------------------
    // Entry: four AND-joined gates.
    // ---------------------------------------------------------------
    fn check_entry(&mut self, i: usize) -> Option<Signal> {
        let ind = self.indicators.as_ref()?;
        let close = ind.close[i];

        let trend_reason = if self.config.trend_filter_enabled {
            if !self.gate0_trend(ind, i) {
                return None;
            }
            format!("above MA{}", self.config.trend_ma_period)
        } else {
            "trend filter disabled".to_string()
        };

        let (squeeze_ok, squeeze_reason) = self.gate1_squeeze(ind, i);
        let k = if self.config.use_dynamic_k {
            let dk = ind.dynamic_k[i];
            if dk.is_finite() { dk } else { self.config.k_value }
        } else {
            self.config.k_value
        };
        let (breakout_ok, strong, breakout_reason) = self.gate2_breakout(ind, i, k);
        let (volume_ok, volume_reason) = self.gate3_volume(ind, i);

        if !(squeeze_ok && breakout_ok && volume_ok) {
            return None;
        }

        let atr = ind.atr_or_fallback(i);
        let stop_loss = close - STOP_LOSS_ATR_MULT * atr;
        let take_profit = close + TAKE_PROFIT_ATR_MULT * atr;

        self.tracked = Some(TrackedPosition {
            entry_price: close,
            stop_loss,
            take_profit,
            entry_bar_index: i,
        });

        Some(Signal {
            action: SignalAction::Buy,
            price: Decimal::from_f64(close)?,
            size: None,
            stop_loss: Decimal::from_f64(stop_loss),
            take_profit: Decimal::from_f64(take_profit),
            reason: SignalReason::Entry(EntryReason {
                trend: trend_reason,
                squeeze: squeeze_reason,
                breakout: breakout_reason,
                volume: volume_reason,
                strong_breakout: strong,
            }),
        })
    }

    /// Gate 0: only take breakouts above the long moving average. Dead-cat
    /// bounces in a downtrend fail here before anything else is looked at.
    fn gate0_trend(&self, ind: &IndicatorSet, i: usize) -> bool {
        if i + 1 < self.config.trend_ma_period {
            return true;
        }
        let ma = ind.trend_ma[i];
        if !ma.is_finite() {
            return true;
        }
        ind.close[i] > ma
    }

    /// Gate 1: was there compression just before the breakout bar? The
    /// breakout bar itself already widens the bands, so the current width is
    /// never compared.
    fn gate1_squeeze(&self, ind: &IndicatorSet, i: usize) -> (bool, String) {
        if i + 1 < 20 {
            return (false, "insufficient data".to_string());
        }
        let avg_width = if ind.bb_width_ma20[i].is_finite() {
            ind.bb_width_ma20[i]
        } else {
            let window = &ind.bb_width[i + 1 - 20..=i];
            let finite: Vec<f64> = window.iter().copied().filter(|v| v.is_finite()).collect();
            if finite.is_empty() {
                return (false, "band width unavailable".to_string());
            }
            finite.iter().sum::<f64>() / finite.len() as f64
        };

        if i >= 9 {
            let recent_min = ind.bb_width[i - 9..=i]
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .fold(f64::INFINITY, f64::min);
            if recent_min < avg_width * 0.8 {
                return (
                    true,
                    format!("strong squeeze (min width {:.4} < 80% of avg)", recent_min),
                );
            }
        }

        if i >= 2 {
            let prev = ind.bb_width[i - 1];
            let prev2 = ind.bb_width[i - 2];
            if (prev.is_finite() && prev < avg_width) || (prev2.is_finite() && prev2 < avg_width) {
                return (
                    true,
                    format!("pre-breakout squeeze (width {:.4} < avg {:.4})", prev, avg_width),
                );
            }
        }

        if i >= 1 {
            let prev_adx = ind.adx[i - 1];
            if prev_adx.is_finite() && prev_adx < 25.0 {
                return (true, format!("range-bound ADX ({:.1} < 25)", prev_adx));
            }
        }

        (false, "no squeeze, volatility already expanded".to_string())
    }

    /// Gate 2: Donchian break of the previous 20-bar high, or a Larry
    /// Williams range breakout over the prior bar.
    fn gate2_breakout(&self, ind: &IndicatorSet, i: usize, k: f64) -> (bool, bool, String) {
        let close = ind.close[i];

        let donchian = ind.donchian_high[i];
        if donchian.is_finite() && close > donchian {
            let strength = (close - donchian) / donchian;
            let strong = strength > 0.01;
            let label = if strong { "strong" } else { "weak" };
            return (
                true,
                strong,
                format!(
                    "{} Donchian break (+{:.2}%, {:.0} > {:.0})",
                    label,
                    strength * 100.0,
                    close,
                    donchian
                ),
            );
        }

        if i >= 1 {
            let prev_close = ind.close[i - 1];
            let prev_range = ind.high[i - 1] - ind.low[i - 1];
            let level = prev_close + prev_range * k;
            if close > level {
                return (
                    true,
                    false,
                    format!("range breakout (K={:.2}, {:.0} > {:.0})", k, close, level),
                );
            }
        }

        (false, false, "no breakout".to_string())
    }

    /// Gate 3: breakout volume or OBV accumulation. A price-up/OBV-down
    /// divergence fails the gate outright.
    fn gate3_volume(&self, ind: &IndicatorSet, i: usize) -> (bool, String) {
        if i + 1 < 21 {
            return (false, "insufficient data".to_string());
        }

        // Divergence veto first: rising price on falling OBV is distribution.
        if i >= 4 {
            let price_trend = ind.close[i] - ind.close[i - 4];
            let obv_trend = ind.obv[i] - ind.obv[i - 4];
            if price_trend > 0.0 && obv_trend < 0.0 {
                return (false, "price/OBV divergence (weak rally)".to_string());
            }
        }

        // Average volume up to yesterday; the breakout bar must not feed its
        // own baseline.
        let avg_prev = ind.volume[i - 20..i].iter().sum::<f64>() / 20.0;
        let volume = ind.volume[i];
        if avg_prev > 0.0 && volume > avg_prev * self.config.volume_multiplier {
            return (
                true,
                format!(
                    "volume surge ({:.0} > {:.0} x {})",
                    volume, avg_prev, self.config.volume_multiplier
                ),
            );
        }

        let obv = ind.obv[i];
        let ma5 = ind.obv_ma5[i];
        let ma20 = ind.obv_ma20[i];
        if obv.is_finite() && ma5.is_finite() && ma20.is_finite() {
            if obv > ma20 && ma5 > ma20 {
                return (
                    true,
                    format!("OBV golden cross above baseline (OBV {:.0} > MA20 {:.0})", obv, ma20),
                );
            }
            if i >= 5 {
                let slope = ind.obv[i] - ind.obv[i - 5];
                if obv > ma20 && slope > 0.0 {
                    return (
                        true,
                        format!("OBV accumulation (slope {:+.0} over 5 bars)", slope),
                    );
                }
            }
        }

        (false, "insufficient volume".to_string())
    }

    /// Clear per-backtest state while keeping the prepared indicators.
    pub fn reset(&mut self) {
        self.tracked = None;
    }

    // ---------------------------------------------------------------
    // Sizing
    // ---------------------------------------------------------------

    /// Risk-based position size in base units.
    ///
    /// `risk_amount = equity * risk_per_trade`; price risk to the stop is
    /// clamped to [1.5%, 5%] of price; the result is clamped to
    /// [min_position_size, max_position_size] of equity. A stop-less signal
    /// falls back to `fallback_position_pct` of equity.
    pub fn calculate_position_size(&self, signal: &Signal, portfolio: &Portfolio) -> Decimal {
        let equity = portfolio.equity().to_f64().unwrap_or(0.0);
        let price = signal.price.to_f64().unwrap_or(0.0);
        if equity <= 0.0 || price <= 0.0 {
            return Decimal::ZERO;
        }

        let size = match signal.stop_loss.and_then(|d| d.to_f64()) {
            Some(stop) if stop > 0.0 => {
                let mut price_risk = price - stop;
                let mut risk_pct = price_risk / price;
                if risk_pct < MIN_RISK_PCT {
                    price_risk = price * MIN_RISK_PCT;
                    risk_pct = MIN_RISK_PCT;
                }
                if risk_pct > MAX_RISK_PCT {
                    price_risk = price * MAX_RISK_PCT;
                }
                let risk_amount = equity * self.config.risk_per_trade;
                let mut size = risk_amount / price_risk;

                let max_size = equity * self.config.max_position_size / price;
                size = size.min(max_size);
                let min_size = equity * self.config.min_position_size / price;
                size = size.max(min_size);
                size
            }
            _ => equity * self.config.fallback_position_pct / price,
        };

        Decimal::from_f64(size)
            .map(|d| d.round_dp(8))
            .unwrap_or(Decimal::ZERO)
    }

    // ---------------------------------------------------------------
    // Orderbook slippage & split orders
    // ---------------------------------------------------------------

    /// Walk the book to fill `order_size`, returning the volume-weighted fill
    /// price and slippage against `expected_price`. Residual size beyond the
    /// book fills at the worst listed level.
    pub fn calculate_slippage(
        &self,
        side: BookSide,
        expected_price: f64,
        order_size: f64,
        orderbook: &Orderbook,
    ) -> SlippageInfo {
        let levels = match side {
            BookSide::Ask => &orderbook.asks,
            BookSide::Bid => &orderbook.bids,
        };

        if levels.is_empty() {
            let slippage_pct = 0.001;
            let actual = match side {
                BookSide::Ask => expected_price * (1.0 + slippage_pct),
                BookSide::Bid => expected_price * (1.0 - slippage_pct),
            };
            return SlippageInfo {
                actual_avg_price: actual,
                slippage_amount: (actual - expected_price).abs() * order_size,
                slippage_pct,
                warning: Some("empty orderbook, assuming 0.1% slippage".to_string()),
            };
        }

        let mut remaining = order_size;
        let mut cost = 0.0;
        let mut filled = 0.0;
        let mut last_price = expected_price;
        for level in levels {
            if remaining <= 0.0 {
                break;
            }
            let price = level.price.to_f64().unwrap_or(expected_price);
            let volume = level.volume.to_f64().unwrap_or(0.0);
            let take = remaining.min(volume);
            cost += take * price;
            filled += take;
            remaining -= take;
            last_price = price;
        }
        if remaining > 0.0 {
            cost += remaining * last_price;
            filled += remaining;
        }

        let actual = if filled > 0.0 { cost / filled } else { expected_price };
        let slippage = (actual - expected_price).abs();
        let slippage_pct = if expected_price > 0.0 {
            slippage / expected_price
        } else {
            0.0
        };
        let warning = (slippage_pct > SLIPPAGE_WARN_PCT)
            .then(|| format!("slippage {:.2}% above 1% tolerance", slippage_pct * 100.0));

        SlippageInfo {
            actual_avg_price: actual,
            slippage_amount: slippage * order_size,
            slippage_pct,
            warning,
        }
    }

    /// How many chunks to split an order into, based on the top-5 average
    /// level volume. 1 means no split; otherwise clamped to [2, 10].
    pub fn calculate_optimal_splits(
        &self,
        order_size: f64,
        orderbook: &Orderbook,
        side: BookSide,
    ) -> usize {
        let levels = match side {
            BookSide::Ask => &orderbook.asks,
            BookSide::Bid => &orderbook.bids,
        };
        if levels.is_empty() {
            return 1;
        }
        let top: Vec<f64> = levels
            .iter()
            .take(5)
            .map(|l| l.volume.to_f64().unwrap_or(0.0))
            .collect();
        let avg = top.iter().sum::<f64>() / top.len() as f64;
        if avg > 0.0 && order_size > avg {
            ((order_size / avg) as usize).clamp(2, 10)
        } else {
            1
        }
    }

    /// Equal-size chunks, at most `total_size / min_chunk_size` of them.
    pub fn split_order(&self, total_size: f64, num_splits: usize, min_chunk_size: f64) -> Vec<f64> {
        let mut splits = num_splits;
        if min_chunk_size > 0.0 {
            splits = splits.min((total_size / min_chunk_size) as usize);
        }
        let splits = splits.max(1);
        vec![total_size / splits as f64; splits]
    }

    /// Simulate the sequential execution of a split order against the book.
    pub fn simulate_split_execution(
        &self,
        total_size: f64,
        num_splits: usize,
        orderbook: &Orderbook,
        side: BookSide,
    ) -> SplitExecution {
        let chunks = self.split_order(total_size, num_splits, 0.0);
        let expected_price = match side {
            BookSide::Ask => orderbook.asks.first(),
            BookSide::Bid => orderbook.bids.first(),
        }
        .map(|l| l.price.to_f64().unwrap_or(0.0))
        .unwrap_or(0.0);

        let mut filled_orders = Vec::with_capacity(chunks.len());
        let mut cost = 0.0;
        let mut filled = 0.0;
        for (idx, chunk) in chunks.iter().enumerate() {
            let info = self.calculate_slippage(side, expected_price, *chunk, orderbook);
            filled_orders.push(SplitFill {
                order_num: idx + 1,
                filled_size: *chunk,
                avg_price: info.actual_avg_price,
                slippage_pct: info.slippage_pct,
            });
            cost += chunk * info.actual_avg_price;
            filled += chunk;
        }

        let avg = if filled > 0.0 { cost / filled } else { expected_price };
        let total_slippage = if expected_price > 0.0 {
            (avg - expected_price).abs() / expected_price
        } else {
            0.0
        };
        SplitExecution {
            filled_orders,
            avg_execution_price: avg,
            total_slippage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::{Candle, Interval, OrderbookLevel};
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn candle(i: usize, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            ts: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::days(i as i64),
            open: Decimal::try_from(open).unwrap(),
            high: Decimal::try_from(high).unwrap(),
            low: Decimal::try_from(low).unwrap(),
            close: Decimal::try_from(close).unwrap(),
            volume: Decimal::try_from(volume).unwrap(),
        }
    }

    /// 60 quiet bars around 100, then a breakout bar: open 100, high 104,
    /// close 103.5, volume twice the baseline.
    fn breakout_series() -> OhlcvSeries {
        let mut candles = Vec::new();
        for i in 0..60 {
            // Tiny alternation keeps the band width finite but narrow.
            let wiggle: f64 = if i % 2 == 0 { 0.2 } else { -0.2 };
            candles.push(candle(
                i,
                100.0,
                100.5 + wiggle.max(0.0),
                99.5 + wiggle.min(0.0),
                100.0 + wiggle * 0.5,
                1000.0,
            ));
        }
        candles.push(candle(60, 100.0, 104.0, 100.0, 103.5, 2000.0));
        OhlcvSeries::new("KRW-TEST", Interval::Day, candles)
    }

    fn strategy() -> BreakoutStrategy {
        BreakoutStrategy::new("KRW-TEST", StrategyOptions::default())
    }

    #[test]
    fn test_clean_breakout_emits_buy_with_atr_stops() {
        let series = breakout_series();
        let mut strat = strategy();
        strat.prepare_indicators(&series);
        let portfolio = Portfolio::new(dec!(10000000));

        let signal = strat
            .generate_signal(series.len() - 1, &portfolio)
            .expect("breakout bar should signal");
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.price, dec!(103.5));

        let atr = strat.indicators().unwrap().atr_or_fallback(series.len() - 1);
        let stop = signal.stop_loss.unwrap().to_f64().unwrap();
        let take = signal.take_profit.unwrap().to_f64().unwrap();
        assert!((stop - (103.5 - 2.0 * atr)).abs() < 1e-9);
        assert!((take - (103.5 + 3.0 * atr)).abs() < 1e-9);

        match &signal.reason {
            SignalReason::Entry(reason) => {
                assert!(reason.breakout.contains("Donchian"));
                assert!(reason.volume.contains("volume surge"));
            }
            other => panic!("expected entry reason, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_volume_fails_volume_gate() {
        let mut series = breakout_series();
        for c in &mut series.candles {
            c.volume = Decimal::ZERO;
        }
        let mut strat = strategy();
        strat.prepare_indicators(&series);
        let portfolio = Portfolio::new(dec!(10000000));
        assert!(strat.generate_signal(series.len() - 1, &portfolio).is_none());
    }

    #[test]
    fn test_trend_filter_blocks_below_ma() {
        // Downtrend into a bounce: close below the 50-bar MA.
        let mut candles = Vec::new();
        for i in 0..60 {
            let p = 200.0 - i as f64 * 2.0;
            candles.push(candle(i, p, p + 1.0, p - 1.0, p, 1000.0));
        }
        candles.push(candle(60, 80.0, 95.0, 80.0, 94.0, 5000.0));
        let series = OhlcvSeries::new("KRW-TEST", Interval::Day, candles);

        let mut strat = strategy();
        strat.prepare_indicators(&series);
        let portfolio = Portfolio::new(dec!(10000000));
        assert!(strat.generate_signal(series.len() - 1, &portfolio).is_none());
    }

    #[test]
    fn test_fakeout_exit_fires_before_take_profit_check() {
        // Entry at 100 on bar 60, closes 99.5 then 97.8: two bars held and
        // 97.8 < 100 * 0.98, so the fakeout rule must fire.
        let mut candles = breakout_series().candles;
        candles.push(candle(61, 100.0, 100.2, 99.0, 99.5, 900.0));
        candles.push(candle(62, 99.5, 100.0, 97.0, 97.8, 900.0));
        let series = OhlcvSeries::new("KRW-TEST", Interval::Day, candles);

        let mut strat = strategy();
        strat.prepare_indicators(&series);

        let mut portfolio = Portfolio::new(dec!(10000000));
        portfolio
            .open_position(
                "KRW-TEST",
                dec!(10),
                dec!(100),
                dec!(0),
                Utc::now(),
                Some(60),
                Some(dec!(90)), // stop far below so stop-loss rule stays quiet
                Some(dec!(200)),
            )
            .unwrap();

        let signal = strat
            .generate_signal(62, &portfolio)
            .expect("fakeout should fire");
        assert_eq!(signal.reason.exit_trigger(), Some(ExitTrigger::Fakeout));
    }

    #[test]
    fn test_signals_are_deterministic() {
        let series = breakout_series();
        let portfolio = Portfolio::new(dec!(10000000));
        let mut a = strategy();
        let mut b = strategy();
        a.prepare_indicators(&series);
        b.prepare_indicators(&series);
        for i in 0..series.len() {
            assert_eq!(a.generate_signal(i, &portfolio), b.generate_signal(i, &portfolio));
        }
    }

    #[test]
    fn test_position_size_respects_caps() {
        let strat = strategy();
        let portfolio = Portfolio::new(dec!(10000000));

        // 2% stop distance -> risk-based sizing.
        let signal = Signal {
            action: SignalAction::Buy,
            price: dec!(100),
            size: None,
            stop_loss: Some(dec!(98)),
            take_profit: Some(dec!(106)),
            reason: SignalReason::Exit {
                trigger: ExitTrigger::StopLoss,
                detail: String::new(),
            },
        };
        let size = strat.calculate_position_size(&signal, &portfolio).to_f64().unwrap();
        // risk = 200_000, price risk = 2 -> raw 100_000 units, capped at 30%
        // of equity = 30_000 units.
        assert!((size - 30000.0).abs() < 1.0, "size {}", size);

        // No stop -> fallback 10% of equity.
        let mut no_stop = signal.clone();
        no_stop.stop_loss = None;
        let size = strat.calculate_position_size(&no_stop, &portfolio).to_f64().unwrap();
        assert!((size - 10000.0).abs() < 1.0, "size {}", size);
    }

    fn deep_book() -> Orderbook {
        Orderbook {
            ticker: "KRW-TEST".to_string(),
            ts: Utc::now(),
            bids: vec![],
            asks: vec![
                OrderbookLevel { price: dec!(100), volume: dec!(5) },
                OrderbookLevel { price: dec!(101), volume: dec!(5) },
                OrderbookLevel { price: dec!(102), volume: dec!(5) },
                OrderbookLevel { price: dec!(103), volume: dec!(5) },
                OrderbookLevel { price: dec!(104), volume: dec!(5) },
            ],
        }
    }

    #[test]
    fn test_slippage_walks_the_book() {
        let strat = strategy();
        let info = strat.calculate_slippage(BookSide::Ask, 100.0, 10.0, &deep_book());
        // 5 @ 100 + 5 @ 101 = avg 100.5.
        assert!((info.actual_avg_price - 100.5).abs() < 1e-9);
        assert!(info.warning.is_none());
    }

    #[test]
    fn test_split_order_never_worse_than_single() {
        let strat = strategy();
        let book = deep_book();
        let single = strat.calculate_slippage(BookSide::Ask, 100.0, 20.0, &book);
        let splits = strat.calculate_optimal_splits(20.0, &book, BookSide::Ask);
        assert!(splits >= 2);
        let split = strat.simulate_split_execution(20.0, splits, &book, BookSide::Ask);
        assert!(split.total_slippage <= single.slippage_pct + 1e-12);
    }
}
