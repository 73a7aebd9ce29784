//! Backtest performance metrics.
//!
//! Volatility, Sharpe, and Sortino are annualised from the source interval so
//! a 15-minute backtest and a daily one gate on the same units.

use crate::domain::market::Interval;
use crate::domain::trading::Trade;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Distribution};

const RISK_FREE_RATE: f64 = 0.02;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Percent over the whole run.
    pub total_return: f64,
    pub total_trades: usize,
    pub final_equity: f64,

    /// Annualised, percent.
    pub volatility: f64,
    /// Peak-to-trough, negative percent.
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,

    /// Percent of closed trades.
    pub win_rate: f64,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Mean win/loss in quote currency.
    pub avg_win: f64,
    pub avg_loss: f64,
    /// Mean win/loss as a fraction of entry notional.
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub profit_factor: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,

    pub avg_holding_hours: f64,
    pub total_commission: f64,

    pub interval: Interval,
    pub annualization_factor: f64,
}

impl PerformanceMetrics {
    pub fn empty(interval: Interval) -> Self {
        Self {
            total_return: 0.0,
            total_trades: 0,
            final_equity: 0.0,
            volatility: 0.0,
            max_drawdown: 0.0,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            calmar_ratio: 0.0,
            win_rate: 0.0,
            winning_trades: 0,
            losing_trades: 0,
            avg_win: 0.0,
            avg_loss: 0.0,
            avg_win_pct: 0.0,
            avg_loss_pct: 0.0,
            profit_factor: 0.0,
            max_consecutive_wins: 0,
            max_consecutive_losses: 0,
            avg_holding_hours: 0.0,
            total_commission: 0.0,
            interval,
            annualization_factor: interval.annualization_factor(),
        }
    }

    /// Average win over average loss magnitude; 0 when no losses.
    pub fn avg_win_loss_ratio(&self) -> f64 {
        let loss = self.avg_loss.abs();
        if loss > 0.0 { self.avg_win / loss } else { 0.0 }
    }

    pub fn calculate(
        equity_curve: &[f64],
        trades: &[Trade],
        initial_capital: f64,
        interval: Interval,
    ) -> Self {
        let mut metrics = Self::empty(interval);
        let Some(last) = equity_curve.last().copied() else {
            return metrics;
        };
        let factor = interval.annualization_factor();
        metrics.final_equity = last;
        if initial_capital > 0.0 {
            metrics.total_return = (last - initial_capital) / initial_capital * 100.0;
        }

        let returns: Vec<f64> = equity_curve
            .windows(2)
            .filter(|w| w[0] != 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();

        if returns.len() > 1 {
            let data = Data::new(returns.clone());
            if let Some(std) = data.std_dev() {
                metrics.volatility = std * factor.sqrt() * 100.0;
            }
            metrics.sharpe_ratio = sharpe(&returns, factor);
            metrics.sortino_ratio = sortino(&returns, factor);
        }

        metrics.max_drawdown = max_drawdown(equity_curve);
        if metrics.max_drawdown != 0.0 {
            metrics.calmar_ratio = metrics.total_return / metrics.max_drawdown.abs();
        }

        metrics.total_trades = trades.len();
        let pnl_of = |t: &Trade| t.pnl.to_f64().unwrap_or(0.0);
        let notional_of = |t: &Trade| (t.entry_price * t.size).to_f64().unwrap_or(0.0);

        let wins: Vec<&Trade> = trades.iter().filter(|t| pnl_of(t) > 0.0).collect();
        let losses: Vec<&Trade> = trades.iter().filter(|t| pnl_of(t) < 0.0).collect();
        metrics.winning_trades = wins.len();
        metrics.losing_trades = losses.len();
        if !trades.is_empty() {
            metrics.win_rate = wins.len() as f64 / trades.len() as f64 * 100.0;
            metrics.avg_holding_hours =
                trades.iter().map(|t| t.holding_hours()).sum::<f64>() / trades.len() as f64;
        }
        if !wins.is_empty() {
            metrics.avg_win = wins.iter().map(|t| pnl_of(t)).sum::<f64>() / wins.len() as f64;
            metrics.avg_win_pct = mean_pct(&wins, pnl_of, notional_of);
        }
        if !losses.is_empty() {
            metrics.avg_loss = losses.iter().map(|t| pnl_of(t)).sum::<f64>() / losses.len() as f64;
            metrics.avg_loss_pct = mean_pct(&losses, pnl_of, notional_of);
        }

        let gross_profit: f64 = wins.iter().map(|t| pnl_of(t)).sum();
        let gross_loss: f64 = losses.iter().map(|t| pnl_of(t)).sum::<f64>().abs();
        metrics.profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        metrics.max_consecutive_wins = max_streak(trades, |t| pnl_of(t) > 0.0);
        metrics.max_consecutive_losses = max_streak(trades, |t| pnl_of(t) < 0.0);
        metrics.total_commission = trades
            .iter()
            .map(|t| t.commission.to_f64().unwrap_or(0.0))
            .sum();

        metrics
    }
}

fn mean_pct(
    trades: &[&Trade],
    pnl_of: impl Fn(&Trade) -> f64,
    notional_of: impl Fn(&Trade) -> f64,
) -> f64 {
    let pcts: Vec<f64> = trades
        .iter()
        .filter(|t| notional_of(t) > 0.0)
        .map(|t| pnl_of(t) / notional_of(t))
        .collect();
    if pcts.is_empty() {
        0.0
    } else {
        pcts.iter().sum::<f64>() / pcts.len() as f64
    }
}

fn sharpe(returns: &[f64], factor: f64) -> f64 {
    let rf_per_bar = RISK_FREE_RATE / factor;
    let excess: Vec<f64> = returns.iter().map(|r| r - rf_per_bar).collect();
    let data = Data::new(excess);
    match (data.mean(), data.std_dev()) {
        (Some(mean), Some(std)) if std > 0.0 => mean / std * factor.sqrt(),
        _ => 0.0,
    }
}

fn sortino(returns: &[f64], factor: f64) -> f64 {
    let rf_per_bar = RISK_FREE_RATE / factor;
    let excess: Vec<f64> = returns.iter().map(|r| r - rf_per_bar).collect();
    let downside: Vec<f64> = excess.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.len() < 2 {
        return 0.0;
    }
    let mean = excess.iter().sum::<f64>() / excess.len() as f64;
    let downside_std = Data::new(downside).std_dev().unwrap_or(0.0);
    if downside_std > 0.0 {
        mean / downside_std * factor.sqrt()
    } else {
        0.0
    }
}

/// Most negative peak-to-trough move, in percent (<= 0).
fn max_drawdown(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0f64;
    for value in equity_curve {
        peak = peak.max(*value);
        if peak > 0.0 {
            let dd = (value - peak) / peak * 100.0;
            worst = worst.min(dd);
        }
    }
    worst
}

fn max_streak(trades: &[Trade], predicate: impl Fn(&Trade) -> bool) -> usize {
    let mut best = 0;
    let mut current = 0;
    for trade in trades {
        if predicate(trade) {
            current += 1;
            best = best.max(current);
        } else {
            current = 0;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn trade(pnl: Decimal, entry: Decimal, size: Decimal, hours: i64) -> Trade {
        let now = Utc::now();
        Trade {
            id: Uuid::new_v4(),
            ticker: "KRW-TEST".to_string(),
            size,
            entry_price: entry,
            exit_price: entry,
            entry_time: now,
            exit_time: now + chrono::Duration::hours(hours),
            pnl,
            commission: dec!(10),
            exit_trigger: None,
        }
    }

    #[test]
    fn test_total_return_and_drawdown() {
        let curve = vec![100.0, 110.0, 99.0, 120.0];
        let metrics = PerformanceMetrics::calculate(&curve, &[], 100.0, Interval::Day);
        assert!((metrics.total_return - 20.0).abs() < 1e-9);
        // Peak 110 -> trough 99 = -10%.
        assert!((metrics.max_drawdown + 10.0).abs() < 1e-9);
        assert!(metrics.calmar_ratio > 0.0);
    }

    #[test]
    fn test_trade_statistics() {
        let trades = vec![
            trade(dec!(100), dec!(1000), dec!(1), 2),
            trade(dec!(-50), dec!(1000), dec!(1), 4),
            trade(dec!(-50), dec!(1000), dec!(1), 4),
            trade(dec!(200), dec!(1000), dec!(1), 6),
        ];
        let metrics =
            PerformanceMetrics::calculate(&[100.0, 101.0], &trades, 100.0, Interval::Day);
        assert_eq!(metrics.total_trades, 4);
        assert!((metrics.win_rate - 50.0).abs() < 1e-9);
        assert!((metrics.avg_win - 150.0).abs() < 1e-9);
        assert!((metrics.avg_loss + 50.0).abs() < 1e-9);
        assert!((metrics.profit_factor - 3.0).abs() < 1e-9);
        assert_eq!(metrics.max_consecutive_losses, 2);
        assert!((metrics.avg_holding_hours - 4.0).abs() < 1e-9);
        assert!((metrics.avg_win_loss_ratio() - 3.0).abs() < 1e-9);
        // 150 / 1000 notional = 15%.
        assert!((metrics.avg_win_pct - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_flat_curve_has_zero_sharpe() {
        let curve = vec![100.0; 50];
        let metrics = PerformanceMetrics::calculate(&curve, &[], 100.0, Interval::Day);
        assert_eq!(metrics.sharpe_ratio, 0.0);
        assert_eq!(metrics.volatility, 0.0);
    }

    #[test]
    fn test_annualization_follows_interval() {
        let metrics = PerformanceMetrics::empty(Interval::Minute60);
        assert_eq!(metrics.annualization_factor, 8760.0);
    }
}
