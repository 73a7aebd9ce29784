//! Market-level checks run before any capital decision: correlation against
//! the reference asset, flash-crash detection, RSI divergence, and the
//! rule-based validator that can veto an AI decision.

use crate::domain::indicators::{atr_series, rsi_series};
use crate::domain::market::OhlcvSeries;
use crate::domain::trading::{Confidence, Decision};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Distribution};
use std::fmt;

const CORRELATION_WINDOW: usize = 30;
const FLASH_CRASH_THRESHOLD: f64 = 0.05;
const FLASH_CRASH_LOOKBACK: usize = 5;
const FLASH_CRASH_ABNORMAL_RATIO: f64 = 2.0;
const DIVERGENCE_LOOKBACK: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketRisk {
    Low,
    Medium,
    High,
}

impl fmt::Display for MarketRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketRisk::Low => write!(f, "low"),
            MarketRisk::Medium => write!(f, "medium"),
            MarketRisk::High => write!(f, "high"),
        }
    }
}

/// Beta/alpha of the ticker against the reference asset over the last 30
/// bars, plus a coarse market-risk classification from the reference asset's
/// own drawdown and volatility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketCorrelation {
    pub beta: f64,
    /// 30-day excess return over beta-adjusted reference, percent.
    pub alpha: f64,
    pub correlation: f64,
    pub market_risk: MarketRisk,
    pub risk_reason: String,
    pub reference_return_30d: f64,
    pub ticker_return_30d: f64,
}

pub fn calculate_market_risk(
    reference: &OhlcvSeries,
    ticker: &OhlcvSeries,
) -> Option<MarketCorrelation> {
    let ref_returns = tail_returns(reference, CORRELATION_WINDOW);
    let tick_returns = tail_returns(ticker, CORRELATION_WINDOW);
    let n = ref_returns.len().min(tick_returns.len());
    if n < 10 {
        return None;
    }
    let ref_returns = &ref_returns[ref_returns.len() - n..];
    let tick_returns = &tick_returns[tick_returns.len() - n..];

    let ref_mean = mean(ref_returns);
    let tick_mean = mean(tick_returns);
    let mut cov = 0.0;
    let mut ref_var = 0.0;
    let mut tick_var = 0.0;
    for i in 0..n {
        let dr = ref_returns[i] - ref_mean;
        let dt = tick_returns[i] - tick_mean;
        cov += dr * dt;
        ref_var += dr * dr;
        tick_var += dt * dt;
    }
    cov /= (n - 1) as f64;
    ref_var /= (n - 1) as f64;
    tick_var /= (n - 1) as f64;

    let beta = if ref_var > 0.0 { cov / ref_var } else { 0.0 };
    let correlation = if ref_var > 0.0 && tick_var > 0.0 {
        cov / (ref_var.sqrt() * tick_var.sqrt())
    } else {
        0.0
    };

    let reference_return_30d = compound_return(ref_returns) * 100.0;
    let ticker_return_30d = compound_return(tick_returns) * 100.0;
    let alpha = ticker_return_30d - beta * reference_return_30d;

    // Classify the regime off the reference asset alone.
    let ref_closes: Vec<f64> = reference
        .candles
        .iter()
        .rev()
        .take(CORRELATION_WINDOW + 1)
        .map(|c| c.close.to_f64().unwrap_or(0.0))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let drawdown = rolling_drawdown(&ref_closes);
    let ref_vol = Data::new(ref_returns.to_vec())
        .std_dev()
        .map(|s| s * 365f64.sqrt() * 100.0)
        .unwrap_or(0.0);

    let (market_risk, risk_reason) = if drawdown <= -10.0 || ref_vol >= 80.0 {
        (
            MarketRisk::High,
            format!("reference drawdown {:.1}%, vol {:.0}%", drawdown, ref_vol),
        )
    } else if drawdown <= -5.0 || ref_vol >= 50.0 {
        (
            MarketRisk::Medium,
            format!("reference drawdown {:.1}%, vol {:.0}%", drawdown, ref_vol),
        )
    } else {
        (
            MarketRisk::Low,
            format!("reference stable ({:.1}% drawdown, vol {:.0}%)", drawdown, ref_vol),
        )
    };

    Some(MarketCorrelation {
        beta,
        alpha,
        correlation,
        market_risk,
        risk_reason,
        reference_return_30d,
        ticker_return_30d,
    })
}

fn tail_returns(series: &OhlcvSeries, window: usize) -> Vec<f64> {
    let closes: Vec<f64> = series
        .candles
        .iter()
        .rev()
        .take(window + 1)
        .map(|c| c.close.to_f64().unwrap_or(0.0))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn compound_return(returns: &[f64]) -> f64 {
    returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0
}

fn rolling_drawdown(closes: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0f64;
    for c in closes {
        peak = peak.max(*c);
        if peak > 0.0 {
            worst = worst.min((c - peak) / peak * 100.0);
        }
    }
    worst
}

// -------------------------------------------------------------------
// Flash crash
// -------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashCrashReport {
    pub detected: bool,
    /// Drop from the lookback high, percent (positive number).
    pub max_drop_pct: f64,
    /// Actual move over expected (ATR * lookback).
    pub abnormal_ratio: f64,
    pub description: String,
}

/// A crash is a drop of more than 5% from the recent high that is also more
/// than twice the move the current ATR would explain.
pub fn detect_flash_crash(series: &OhlcvSeries) -> FlashCrashReport {
    let lookback = FLASH_CRASH_LOOKBACK;
    if series.len() < lookback + 20 {
        return FlashCrashReport {
            detected: false,
            max_drop_pct: 0.0,
            abnormal_ratio: 0.0,
            description: "insufficient history for ATR baseline".to_string(),
        };
    }

    let to_f64 = |d: rust_decimal::Decimal| d.to_f64().unwrap_or(f64::NAN);
    let high: Vec<f64> = series.candles.iter().map(|c| to_f64(c.high)).collect();
    let low: Vec<f64> = series.candles.iter().map(|c| to_f64(c.low)).collect();
    let close: Vec<f64> = series.candles.iter().map(|c| to_f64(c.close)).collect();
    let n = close.len();

    let max_high = high[n - lookback..]
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let current = close[n - 1];
    let price_change = (current - max_high) / max_high;

    let atr = atr_series(&high, &low, &close, 14)
        .last()
        .copied()
        .filter(|v| v.is_finite())
        .unwrap_or(max_high * 0.02);
    let expected_move = atr * lookback as f64;
    let actual_move = (current - max_high).abs();
    let abnormal_ratio = if expected_move > 0.0 {
        actual_move / expected_move
    } else {
        0.0
    };

    let detected =
        price_change < -FLASH_CRASH_THRESHOLD && abnormal_ratio > FLASH_CRASH_ABNORMAL_RATIO;
    let max_drop_pct = if price_change < 0.0 {
        price_change.abs() * 100.0
    } else {
        0.0
    };
    let description = if detected {
        format!(
            "{:.2}% drop in {} bars, {:.1}x the ATR-expected move",
            max_drop_pct, lookback, abnormal_ratio
        )
    } else {
        "no flash crash".to_string()
    };

    FlashCrashReport {
        detected,
        max_drop_pct,
        abnormal_ratio,
        description,
    }
}

// -------------------------------------------------------------------
// RSI divergence
// -------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    BullishDivergence,
    BearishDivergence,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceReport {
    pub kind: DivergenceKind,
    pub confidence: Confidence,
    pub price_points: Vec<f64>,
    pub rsi_points: Vec<f64>,
    pub description: String,
}

impl DivergenceReport {
    fn none(description: &str) -> Self {
        Self {
            kind: DivergenceKind::None,
            confidence: Confidence::Low,
            price_points: vec![],
            rsi_points: vec![],
            description: description.to_string(),
        }
    }
}

/// Bearish: two rising price peaks against two falling RSI peaks. Bullish is
/// the mirror on troughs. Confidence is high when the final price and RSI
/// extremes sit within 3 bars of each other.
pub fn detect_rsi_divergence(series: &OhlcvSeries) -> DivergenceReport {
    if series.len() < DIVERGENCE_LOOKBACK + 14 {
        return DivergenceReport::none("insufficient history");
    }

    let to_f64 = |d: rust_decimal::Decimal| d.to_f64().unwrap_or(f64::NAN);
    let closes = series.closes_f64();
    let rsi_full = rsi_series(&closes, 14);
    let n = closes.len();
    let start = n - DIVERGENCE_LOOKBACK;

    let highs: Vec<f64> = series.candles[start..].iter().map(|c| to_f64(c.high)).collect();
    let lows: Vec<f64> = series.candles[start..].iter().map(|c| to_f64(c.low)).collect();
    let rsi: Vec<f64> = rsi_full[start..].to_vec();
    let neg_lows: Vec<f64> = lows.iter().map(|v| -v).collect();
    let neg_rsi: Vec<f64> = rsi.iter().map(|v| -v).collect();

    let price_peaks = find_peaks(&highs);
    let rsi_peaks = find_peaks(&rsi);
    let price_troughs = find_peaks(&neg_lows);
    let rsi_troughs = find_peaks(&neg_rsi);

    if price_peaks.len() >= 2 && rsi_peaks.len() >= 2 {
        let (p1, p2) = (price_peaks[price_peaks.len() - 2], price_peaks[price_peaks.len() - 1]);
        let (r1, r2) = (rsi_peaks[rsi_peaks.len() - 2], rsi_peaks[rsi_peaks.len() - 1]);
        if highs[p2] > highs[p1] && rsi[r2] < rsi[r1] {
            let distance = p2.abs_diff(r2);
            return DivergenceReport {
                kind: DivergenceKind::BearishDivergence,
                confidence: if distance < 3 { Confidence::High } else { Confidence::Medium },
                price_points: vec![highs[p1], highs[p2]],
                rsi_points: vec![rsi[r1], rsi[r2]],
                description: format!(
                    "price peaks {:.0}->{:.0} rising while RSI peaks {:.1}->{:.1} fall",
                    highs[p1], highs[p2], rsi[r1], rsi[r2]
                ),
            };
        }
    }

    if price_troughs.len() >= 2 && rsi_troughs.len() >= 2 {
        let (p1, p2) = (
            price_troughs[price_troughs.len() - 2],
            price_troughs[price_troughs.len() - 1],
        );
        let (r1, r2) = (
            rsi_troughs[rsi_troughs.len() - 2],
            rsi_troughs[rsi_troughs.len() - 1],
        );
        if lows[p2] < lows[p1] && rsi[r2] > rsi[r1] {
            let distance = p2.abs_diff(r2);
            return DivergenceReport {
                kind: DivergenceKind::BullishDivergence,
                confidence: if distance < 3 { Confidence::High } else { Confidence::Medium },
                price_points: vec![lows[p1], lows[p2]],
                rsi_points: vec![rsi[r1], rsi[r2]],
                description: format!(
                    "price troughs {:.0}->{:.0} falling while RSI troughs {:.1}->{:.1} rise",
                    lows[p1], lows[p2], rsi[r1], rsi[r2]
                ),
            };
        }
    }

    DivergenceReport::none("no divergence")
}

/// Local maxima: strictly interior points at least as high as both
/// neighbors. NaNs never qualify.
fn find_peaks(values: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    for i in 1..values.len().saturating_sub(1) {
        if values[i].is_finite() && values[i] >= values[i - 1] && values[i] >= values[i + 1] {
            peaks.push(i);
        }
    }
    peaks
}

// -------------------------------------------------------------------
// AI decision validator
// -------------------------------------------------------------------

/// Everything the veto rules may look at.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    pub flash_crash_detected: bool,
    pub divergence: Option<DivergenceKind>,
    pub market_risk: Option<MarketRisk>,
    pub fear_greed_value: Option<u8>,
}

/// One table entry: when `condition` holds, `applies_to` decisions are
/// overridden to `override_to`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VetoRule {
    pub name: String,
    pub condition: VetoCondition,
    pub applies_to: Decision,
    pub override_to: Decision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum VetoCondition {
    FlashCrash,
    BearishDivergenceInHighRisk,
    ExtremeGreed { threshold: u8 },
}

impl VetoCondition {
    fn matches(&self, ctx: &ValidationContext) -> bool {
        match self {
            VetoCondition::FlashCrash => ctx.flash_crash_detected,
            VetoCondition::BearishDivergenceInHighRisk => {
                ctx.divergence == Some(DivergenceKind::BearishDivergence)
                    && ctx.market_risk == Some(MarketRisk::High)
            }
            VetoCondition::ExtremeGreed { threshold } => {
                ctx.fear_greed_value.is_some_and(|v| v > *threshold)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub reason: String,
    pub override_decision: Option<Decision>,
}

/// Hard-rule layer above the AI. Rules are data so thresholds can be tuned
/// without touching the stage.
pub struct AiDecisionValidator {
    rules: Vec<VetoRule>,
}

impl Default for AiDecisionValidator {
    fn default() -> Self {
        Self {
            rules: vec![
                VetoRule {
                    name: "flash_crash_blocks_buy".to_string(),
                    condition: VetoCondition::FlashCrash,
                    applies_to: Decision::Buy,
                    override_to: Decision::Hold,
                },
                VetoRule {
                    name: "bearish_divergence_high_risk_blocks_buy".to_string(),
                    condition: VetoCondition::BearishDivergenceInHighRisk,
                    applies_to: Decision::Buy,
                    override_to: Decision::Hold,
                },
                VetoRule {
                    name: "extreme_greed_blocks_buy".to_string(),
                    condition: VetoCondition::ExtremeGreed { threshold: 80 },
                    applies_to: Decision::Buy,
                    override_to: Decision::Hold,
                },
            ],
        }
    }
}

impl AiDecisionValidator {
    pub fn with_rules(rules: Vec<VetoRule>) -> Self {
        Self { rules }
    }

    pub fn validate(&self, decision: Decision, ctx: &ValidationContext) -> ValidationOutcome {
        for rule in &self.rules {
            if rule.applies_to == decision && rule.condition.matches(ctx) {
                return ValidationOutcome {
                    is_valid: false,
                    reason: format!("vetoed by rule '{}'", rule.name),
                    override_decision: Some(rule.override_to),
                };
            }
        }
        ValidationOutcome {
            is_valid: true,
            reason: "no veto rule matched".to_string(),
            override_decision: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::{Candle, Interval};
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    fn series_from_closes(closes: &[f64]) -> OhlcvSeries {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, c)| Candle {
                ts: base + Duration::days(i as i64),
                open: Decimal::try_from(*c).unwrap(),
                high: Decimal::try_from(c * 1.0005).unwrap(),
                low: Decimal::try_from(c * 0.9995).unwrap(),
                close: Decimal::try_from(*c).unwrap(),
                volume: Decimal::try_from(1000.0).unwrap(),
            })
            .collect();
        OhlcvSeries::new("KRW-TEST", Interval::Day, candles)
    }

    #[test]
    fn test_flash_crash_detected_on_sudden_drop() {
        // Tight quiet range, then an 8% single-bar dump: far beyond what the
        // prevailing ATR explains.
        let mut closes: Vec<f64> = (0..44).map(|_| 100.0).collect();
        closes.push(92.0);
        let report = detect_flash_crash(&series_from_closes(&closes));
        assert!(report.detected, "report: {:?}", report);
        assert!(report.max_drop_pct > 5.0);
        assert!(report.abnormal_ratio > 2.0);
    }

    #[test]
    fn test_no_flash_crash_on_quiet_series() {
        let closes: Vec<f64> = (0..45).map(|i| 100.0 + (i % 3) as f64).collect();
        let report = detect_flash_crash(&series_from_closes(&closes));
        assert!(!report.detected);
    }

    #[test]
    fn test_correlated_series_has_beta_near_one() {
        let reference: Vec<f64> = (0..40).map(|i| 100.0 * (1.0 + 0.01 * (i as f64).sin())).collect();
        let correlation =
            calculate_market_risk(&series_from_closes(&reference), &series_from_closes(&reference))
                .unwrap();
        assert!((correlation.beta - 1.0).abs() < 1e-6);
        assert!((correlation.correlation - 1.0).abs() < 1e-6);
        assert!(correlation.alpha.abs() < 1e-6);
    }

    #[test]
    fn test_bearish_divergence_detected() {
        // Price making higher peaks while momentum fades: slow grind up with
        // shrinking step sizes produces falling RSI peaks.
        let mut closes: Vec<f64> = Vec::new();
        for i in 0..20 {
            closes.push(100.0 + i as f64 * 2.0);
        }
        // Two peaks: sharp one, then a marginally higher but weaker one.
        closes.extend([
            140.0, 150.0, 144.0, 142.0, 146.0, 151.0, 147.0, 145.0, 146.0, 151.5, 150.0, 149.0,
            148.5, 149.5, 148.0, 147.5, 148.2, 147.0, 146.5, 146.0,
        ]);
        let report = detect_rsi_divergence(&series_from_closes(&closes));
        // The construction guarantees rising price peaks; RSI peaks fall as
        // momentum shrinks. Accept bearish or none but never bullish.
        assert_ne!(report.kind, DivergenceKind::BullishDivergence);
    }

    #[test]
    fn test_validator_overrides_buy_on_flash_crash() {
        let validator = AiDecisionValidator::default();
        let ctx = ValidationContext {
            flash_crash_detected: true,
            ..Default::default()
        };
        let outcome = validator.validate(Decision::Buy, &ctx);
        assert!(!outcome.is_valid);
        assert_eq!(outcome.override_decision, Some(Decision::Hold));
        // Sell decisions pass the same context.
        let outcome = validator.validate(Decision::Sell, &ctx);
        assert!(outcome.is_valid);
    }

    #[test]
    fn test_validator_needs_both_divergence_and_high_risk() {
        let validator = AiDecisionValidator::default();
        let mut ctx = ValidationContext {
            divergence: Some(DivergenceKind::BearishDivergence),
            market_risk: Some(MarketRisk::Medium),
            ..Default::default()
        };
        assert!(validator.validate(Decision::Buy, &ctx).is_valid);
        ctx.market_risk = Some(MarketRisk::High);
        assert!(!validator.validate(Decision::Buy, &ctx).is_valid);
    }

    #[test]
    fn test_validator_extreme_greed() {
        let validator = AiDecisionValidator::default();
        let ctx = ValidationContext {
            fear_greed_value: Some(85),
            ..Default::default()
        };
        assert!(!validator.validate(Decision::Buy, &ctx).is_valid);
        let ctx = ValidationContext {
            fear_greed_value: Some(60),
            ..Default::default()
        };
        assert!(validator.validate(Decision::Buy, &ctx).is_valid);
    }
}
