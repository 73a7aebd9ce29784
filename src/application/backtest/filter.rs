//! Two-gate backtest qualification.
//!
//! The research gate is loose enough to let the AI reviewer see candidates
//! worth discussing; the trading gate authorises real capital. Both tiers run
//! the same table-driven checks against [`GateThresholds`] records, and every
//! candidate additionally has to clear the expectancy filter: a combination
//! of win rate, reward/risk, and round-trip cost with negative expected value
//! is rejected no matter how the individual metrics look.

use crate::application::backtest::performance::PerformanceMetrics;
use crate::config::{FilterThresholds, GateThresholds};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Per-check pass/fail map, keyed by check name.
pub type FilterResults = BTreeMap<String, bool>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectancyReport {
    /// Win probability, 0..1.
    pub win_rate: f64,
    /// Reward/risk ratio R = avg_win / |avg_loss|.
    pub reward_risk: f64,
    /// Round-trip cost expressed in R units.
    pub cost_r: f64,
    /// Net expectancy per trade, in R units.
    pub net: f64,
    /// Minimum acceptable R for this win rate and cost.
    pub r_min: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateReport {
    pub research: FilterResults,
    pub trading: FilterResults,
    pub research_pass: bool,
    pub trading_pass: bool,
    pub expectancy: ExpectancyReport,
    /// Research-pass without trading-pass: reportable, never buyable.
    pub researchable_only: bool,
    pub reason: String,
}

impl GateReport {
    /// Authorised for real capital.
    pub fn tradeable(&self) -> bool {
        self.trading_pass && self.expectancy.passed
    }
}

pub struct TwoGateFilter {
    thresholds: FilterThresholds,
    /// Round-trip cost as a fraction (commission + slippage, both sides).
    cost_pct: f64,
}

impl TwoGateFilter {
    pub fn new(thresholds: FilterThresholds, cost_pct: f64) -> Self {
        Self {
            thresholds,
            cost_pct,
        }
    }

    pub fn evaluate(&self, metrics: &PerformanceMetrics) -> GateReport {
        let research = check_gate(metrics, &self.thresholds.research);
        let trading = check_gate(metrics, &self.thresholds.trading);
        let research_pass = research.values().all(|v| *v);
        let trading_pass = trading.values().all(|v| *v);
        let expectancy = self.check_expectancy(metrics);

        let trading_pass = trading_pass && expectancy.passed;
        let research_pass = research_pass && expectancy.passed;
        let researchable_only = research_pass && !trading_pass;

        let reason = if trading_pass {
            format!(
                "return {:.1}%, profit factor {:.2}, sharpe {:.2}",
                metrics.total_return, metrics.profit_factor, metrics.sharpe_ratio
            )
        } else if !expectancy.passed {
            format!(
                "negative expectancy (net {:.3}R, need R >= {:.2})",
                expectancy.net, expectancy.r_min
            )
        } else {
            let failed: Vec<&str> = trading
                .iter()
                .filter(|(_, ok)| !**ok)
                .map(|(name, _)| name.as_str())
                .collect();
            format!("below trading gate: {}", failed.join(", "))
        };

        GateReport {
            research,
            trading,
            research_pass,
            trading_pass,
            expectancy,
            researchable_only,
            reason,
        }
    }

    /// `net = p*R - (1-p) - cost_R` must be positive, where costs are scaled
    /// by the average loss so cheap stops do not hide expensive fees.
    fn check_expectancy(&self, metrics: &PerformanceMetrics) -> ExpectancyReport {
        let p = (metrics.win_rate / 100.0).clamp(0.0, 1.0);
        let avg_loss = metrics
            .avg_loss_pct
            .abs()
            .max(self.thresholds.expectancy_min_avg_loss);
        // A loss-free sample has no measured risk; cap R instead of letting
        // a zero denominator veto it.
        let reward_risk = if metrics.avg_loss.abs() > 0.0 {
            metrics.avg_win / metrics.avg_loss.abs()
        } else if metrics.avg_win > 0.0 {
            10.0
        } else {
            0.0
        };
        let cost_r = self.cost_pct / avg_loss;
        let net = p * reward_risk - (1.0 - p) - cost_r;
        let r_min = if p > 0.0 {
            ((1.0 - p) + cost_r + self.thresholds.expectancy_margin) / p
        } else {
            f64::INFINITY
        };
        ExpectancyReport {
            win_rate: p,
            reward_risk,
            cost_r,
            net,
            r_min,
            passed: net > 0.0,
        }
    }
}

fn check_gate(metrics: &PerformanceMetrics, gate: &GateThresholds) -> FilterResults {
    let mut results = FilterResults::new();
    let mut put = |name: &str, ok: bool| {
        results.insert(name.to_string(), ok);
    };
    put("total_return", metrics.total_return >= gate.min_total_return);
    put("win_rate", metrics.win_rate >= gate.min_win_rate);
    put("profit_factor", metrics.profit_factor >= gate.min_profit_factor);
    put("sharpe_ratio", metrics.sharpe_ratio >= gate.min_sharpe_ratio);
    put("sortino_ratio", metrics.sortino_ratio >= gate.min_sortino_ratio);
    put("calmar_ratio", metrics.calmar_ratio >= gate.min_calmar_ratio);
    put("max_drawdown", metrics.max_drawdown.abs() <= gate.max_drawdown);
    put(
        "max_consecutive_losses",
        metrics.max_consecutive_losses <= gate.max_consecutive_losses,
    );
    put("volatility", metrics.volatility <= gate.max_volatility);
    put("min_trades", metrics.total_trades >= gate.min_trades);
    put(
        "avg_win_loss_ratio",
        metrics.avg_win_loss_ratio() >= gate.min_avg_win_loss_ratio,
    );
    put(
        "avg_holding_hours",
        metrics.avg_holding_hours <= gate.max_avg_holding_hours,
    );
    results
}

/// Per-scan-cycle metrics cache keyed by (ticker, config hash). Guarantees
/// the expensive backtest runs at most once per key per scan; the whole cache
/// is dropped when the scan ends.
#[derive(Default)]
pub struct MetricsCache {
    inner: Mutex<HashMap<(String, String), PerformanceMetrics>>,
}

impl MetricsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ticker: &str, config_hash: &str) -> Option<PerformanceMetrics> {
        self.inner
            .lock()
            .expect("metrics cache poisoned")
            .get(&(ticker.to_string(), config_hash.to_string()))
            .cloned()
    }

    pub fn insert(&self, ticker: &str, config_hash: &str, metrics: PerformanceMetrics) {
        self.inner
            .lock()
            .expect("metrics cache poisoned")
            .insert((ticker.to_string(), config_hash.to_string()), metrics);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("metrics cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Interval;

    fn strong_metrics() -> PerformanceMetrics {
        let mut m = PerformanceMetrics::empty(Interval::Day);
        m.total_return = 25.0;
        m.win_rate = 45.0;
        m.profit_factor = 2.0;
        m.sharpe_ratio = 1.2;
        m.sortino_ratio = 1.5;
        m.calmar_ratio = 1.0;
        m.max_drawdown = -12.0;
        m.max_consecutive_losses = 3;
        m.volatility = 40.0;
        m.total_trades = 40;
        m.avg_win = 60.0;
        m.avg_loss = -40.0;
        m.avg_win_pct = 0.05;
        m.avg_loss_pct = -0.033;
        m.avg_holding_hours = 48.0;
        m
    }

    fn filter() -> TwoGateFilter {
        // 0.05% commission + 0.01% slippage, both sides.
        TwoGateFilter::new(FilterThresholds::default(), 0.0012)
    }

    #[test]
    fn test_strong_metrics_pass_both_gates() {
        let report = filter().evaluate(&strong_metrics());
        assert!(report.research_pass);
        assert!(report.trading_pass);
        assert!(report.tradeable());
        assert!(!report.researchable_only);
    }

    #[test]
    fn test_research_only_candidate_is_not_buyable() {
        let mut m = strong_metrics();
        m.total_return = 10.0; // above research (8), below trading (12)
        let report = filter().evaluate(&m);
        assert!(report.research_pass);
        assert!(!report.trading_pass);
        assert!(report.researchable_only);
        assert!(!report.tradeable());
    }

    #[test]
    fn test_expectancy_vetoes_marginal_combination() {
        // Spec scenario: p=0.33, R=1.0 -> net is negative regardless of the
        // individual gate values.
        let mut m = strong_metrics();
        m.total_return = 20.0;
        m.win_rate = 33.0;
        m.profit_factor = 1.3;
        m.sharpe_ratio = 0.6;
        m.max_drawdown = -10.0;
        m.total_trades = 40;
        m.avg_win = 5.0;
        m.avg_loss = -5.0;
        m.avg_win_pct = 0.05;
        m.avg_loss_pct = -0.05;
        let report = filter().evaluate(&m);
        assert!(!report.expectancy.passed);
        assert!(report.expectancy.net < 0.0);
        assert!(!report.trading_pass);
        assert!(!report.research_pass);
        assert!(!report.tradeable());
    }

    #[test]
    fn test_r_min_grows_as_win_rate_falls() {
        let f = filter();
        let mut m = strong_metrics();
        m.win_rate = 50.0;
        let high_p = f.evaluate(&m).expectancy.r_min;
        m.win_rate = 30.0;
        let low_p = f.evaluate(&m).expectancy.r_min;
        assert!(low_p > high_p);
    }

    #[test]
    fn test_metrics_cache_round_trip() {
        let cache = MetricsCache::new();
        assert!(cache.get("KRW-BTC", "abc").is_none());
        cache.insert("KRW-BTC", "abc", strong_metrics());
        assert!(cache.get("KRW-BTC", "abc").is_some());
        assert!(cache.get("KRW-BTC", "other-config").is_none());
        assert_eq!(cache.len(), 1);
    }
}
