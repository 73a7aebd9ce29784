//! Structured bot configuration.
//!
//! Defaults reproduce the shipped behavior; a TOML file overrides any subset
//! of fields, and a handful of environment variables override the file for
//! deploy-time switches. Threshold tables are data, not code: the two-gate
//! backtest filter and the score weights live here so they can be tuned
//! without touching the filter logic.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use std::path::{Path, PathBuf};

use crate::domain::market::Interval;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Fallback ticker when scanning is disabled or finds nothing.
    pub ticker: String,
    pub quote_currency: String,
    /// Reference asset for market correlation (beta/alpha).
    pub reference_ticker: String,
    /// Directory holding the on-disk OHLCV cache.
    pub data_dir: PathBuf,
    pub trading: TradingModeOptions,
    pub scanner: ScannerOptions,
    pub strategy: StrategyOptions,
    pub backtest: BacktestOptions,
    pub filters: FilterThresholds,
    pub score_weights: ScoreWeights,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            ticker: "KRW-ETH".to_string(),
            quote_currency: "KRW".to_string(),
            reference_ticker: "KRW-BTC".to_string(),
            data_dir: PathBuf::from("./data/historical"),
            trading: TradingModeOptions::default(),
            scanner: ScannerOptions::default(),
            strategy: StrategyOptions::default(),
            backtest: BacktestOptions::default(),
            filters: FilterThresholds::default(),
            score_weights: ScoreWeights::default(),
        }
    }
}

impl BotConfig {
    /// Defaults, overlaid with the TOML file at `path` when it exists, then
    /// with environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", p.display()))?
            }
            _ => BotConfig::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(ticker) = env::var("BREAKWATER_TICKER") {
            self.ticker = ticker;
        }
        if let Ok(dir) = env::var("BREAKWATER_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(flag) = env::var("BREAKWATER_ENABLE_SCANNING") {
            self.scanner.enable_scanning = flag == "1" || flag.eq_ignore_ascii_case("true");
        }
    }

    /// Hash over everything that changes backtest semantics. Keys the
    /// per-scan metrics cache so a config change never reuses stale metrics.
    pub fn backtest_config_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.backtest.commission.to_string());
        hasher.update(self.backtest.slippage.to_string());
        hasher.update(self.backtest.interval.tag());
        hasher.update(self.backtest.days.to_string());
        hasher.update(self.backtest.execute_on_next_open.to_string());
        hasher.update(self.backtest.use_intrabar_stops.to_string());
        let strategy = &self.strategy;
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            strategy.risk_per_trade,
            strategy.max_position_size,
            strategy.donchian_period,
            strategy.volume_multiplier,
            strategy.k_value,
            strategy.use_dynamic_k,
            strategy.trend_filter_enabled,
            strategy.trend_ma_period,
        ));
        hex::encode(hasher.finalize())
    }
}

/// Portfolio-level risk parameters. Loss limits are negative percentages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingModeOptions {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub daily_loss_limit_pct: f64,
    pub weekly_loss_limit_pct: f64,
    pub min_trade_interval_hours: u64,
    pub max_positions: usize,
    /// Positions below this quote value are ignored by the snapshot.
    pub min_position_value: Decimal,
    /// Share of total capital kept uninvested.
    pub reserve_ratio: f64,
    /// Hard cap on one coin's share of total capital.
    pub max_allocation_per_coin: f64,
    /// Whole-pipeline deadline per tick.
    pub tick_deadline_secs: u64,
    /// Profit level at which the evaluator may escalate to the AI reviewer
    /// for a partial exit.
    pub partial_exit_trigger_pct: f64,
    pub partial_exit_ratio: f64,
    pub ai_review_enabled: bool,
}

impl Default for TradingModeOptions {
    fn default() -> Self {
        Self {
            stop_loss_pct: -5.0,
            take_profit_pct: 10.0,
            daily_loss_limit_pct: -10.0,
            weekly_loss_limit_pct: -15.0,
            min_trade_interval_hours: 4,
            max_positions: 3,
            min_position_value: dec!(10000),
            reserve_ratio: 0.1,
            max_allocation_per_coin: 0.4,
            tick_deadline_secs: 180,
            partial_exit_trigger_pct: 10.0,
            partial_exit_ratio: 0.5,
            ai_review_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerOptions {
    pub enable_scanning: bool,
    pub liquidity_top_n: usize,
    /// Minimum 24h traded value in quote currency.
    pub min_volume_quote: Decimal,
    pub backtest_top_n: usize,
    pub ai_top_n: usize,
    pub final_select_n: usize,
    pub enable_sector_diversification: bool,
    pub one_per_sector: bool,
    pub exclude_unknown_sector: bool,
    /// History window kept in the local cache, in years.
    pub sync_years: u32,
    /// Cache entries older than this are purged.
    pub max_years: u32,
    pub max_concurrent_sync: usize,
    pub per_ticker_sync_timeout_secs: u64,
    pub bulk_sync_timeout_secs: u64,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
            enable_scanning: true,
            liquidity_top_n: 10,
            min_volume_quote: dec!(10000000000),
            backtest_top_n: 5,
            ai_top_n: 5,
            final_select_n: 2,
            enable_sector_diversification: true,
            one_per_sector: true,
            exclude_unknown_sector: false,
            sync_years: 2,
            max_years: 3,
            max_concurrent_sync: 3,
            per_ticker_sync_timeout_secs: 60,
            bulk_sync_timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyOptions {
    /// Share of equity risked per trade.
    pub risk_per_trade: f64,
    pub max_position_size: f64,
    pub min_position_size: f64,
    /// Used when a signal carries no stop-loss.
    pub fallback_position_pct: f64,
    pub donchian_period: usize,
    pub volume_multiplier: f64,
    pub k_value: f64,
    pub use_dynamic_k: bool,
    pub trend_filter_enabled: bool,
    pub trend_ma_period: usize,
    pub timeout_bars: usize,
}

impl Default for StrategyOptions {
    fn default() -> Self {
        Self {
            risk_per_trade: 0.02,
            max_position_size: 0.3,
            min_position_size: 0.05,
            fallback_position_pct: 0.1,
            donchian_period: 20,
            volume_multiplier: 1.5,
            k_value: 0.5,
            use_dynamic_k: false,
            trend_filter_enabled: true,
            trend_ma_period: 50,
            timeout_bars: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestOptions {
    pub use_local_data: bool,
    /// Trailing window of history fed to the backtester, in bars.
    pub days: usize,
    pub interval: Interval,
    pub initial_capital: Decimal,
    pub commission: Decimal,
    pub slippage: Decimal,
    /// Fill signals at the next bar's open instead of the signal bar's close.
    pub execute_on_next_open: bool,
    /// Let stop-loss/take-profit fill inside the bar at the level price.
    pub use_intrabar_stops: bool,
    pub use_split_orders: bool,
}

impl Default for BacktestOptions {
    fn default() -> Self {
        Self {
            use_local_data: true,
            days: 730,
            interval: Interval::Day,
            initial_capital: dec!(10000000),
            commission: dec!(0.0005),
            slippage: dec!(0.0001),
            execute_on_next_open: true,
            use_intrabar_stops: false,
            use_split_orders: false,
        }
    }
}

/// One tier of the two-gate backtest filter. All values are minimums unless
/// the name says `max`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateThresholds {
    pub min_total_return: f64,
    pub min_win_rate: f64,
    pub min_profit_factor: f64,
    pub min_sharpe_ratio: f64,
    pub min_sortino_ratio: f64,
    pub min_calmar_ratio: f64,
    pub max_drawdown: f64,
    pub max_consecutive_losses: usize,
    pub max_volatility: f64,
    pub min_trades: usize,
    pub min_avg_win_loss_ratio: f64,
    pub max_avg_holding_hours: f64,
}

impl GateThresholds {
    pub fn research() -> Self {
        Self {
            min_total_return: 8.0,
            min_win_rate: 30.0,
            min_profit_factor: 1.3,
            min_sharpe_ratio: 0.4,
            min_sortino_ratio: 0.5,
            min_calmar_ratio: 0.25,
            max_drawdown: 30.0,
            max_consecutive_losses: 8,
            max_volatility: 100.0,
            min_trades: 20,
            min_avg_win_loss_ratio: 1.0,
            max_avg_holding_hours: 336.0,
        }
    }

    pub fn trading() -> Self {
        Self {
            min_total_return: 12.0,
            min_win_rate: 35.0,
            min_profit_factor: 1.5,
            min_sharpe_ratio: 0.7,
            min_sortino_ratio: 0.9,
            min_calmar_ratio: 0.5,
            max_drawdown: 25.0,
            max_consecutive_losses: 6,
            max_volatility: 75.0,
            min_trades: 25,
            min_avg_win_loss_ratio: 1.2,
            max_avg_holding_hours: 240.0,
        }
    }
}

impl Default for GateThresholds {
    fn default() -> Self {
        GateThresholds::trading()
    }
}

/// Both gate tiers plus the expectancy safety margin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterThresholds {
    pub research: GateThresholds,
    pub trading: GateThresholds,
    /// Safety margin `m` in the minimum reward/risk bound.
    pub expectancy_margin: f64,
    /// Floor for the average loss used in the cost ratio, as a fraction.
    pub expectancy_min_avg_loss: f64,
}

impl Default for FilterThresholds {
    fn default() -> Self {
        Self {
            research: GateThresholds::research(),
            trading: GateThresholds::trading(),
            expectancy_margin: 0.05,
            expectancy_min_avg_loss: 0.002,
        }
    }
}

/// Weights of the scanner's composite backtest score. Normalised at use so a
/// hand-edited table that no longer sums to 1.0 cannot skew scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub total_return: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub sharpe: f64,
    pub drawdown: f64,
    pub sortino: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            total_return: 0.20,
            win_rate: 0.10,
            profit_factor: 0.20,
            sharpe: 0.25,
            drawdown: 0.15,
            sortino: 0.10,
        }
    }
}

impl ScoreWeights {
    pub fn normalized(&self) -> ScoreWeights {
        let sum = self.total_return
            + self.win_rate
            + self.profit_factor
            + self.sharpe
            + self.drawdown
            + self.sortino;
        if sum <= 0.0 {
            return ScoreWeights::default();
        }
        ScoreWeights {
            total_return: self.total_return / sum,
            win_rate: self.win_rate / sum,
            profit_factor: self.profit_factor / sum,
            sharpe: self.sharpe / sum,
            drawdown: self.drawdown / sum,
            sortino: self.sortino / sum,
        }
    }
}
