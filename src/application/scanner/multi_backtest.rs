//! Parallel per-ticker backtests for the scanner.
//!
//! Backtesting is CPU-bound, so the fan-out runs on the rayon pool inside a
//! `spawn_blocking` to keep the async runtime responsive. Metrics are cached
//! per (ticker, config hash) for the lifetime of one scan cycle; a ticker is
//! never backtested twice in the same scan.

use crate::application::backtest::{
    Backtester, Grade, MetricsCache, PerformanceMetrics, TwoGateFilter,
};
use crate::application::backtest::filter::{FilterResults, GateReport};
use crate::application::scanner::data_sync::HistoricalDataSync;
use crate::application::strategy::BreakoutStrategy;
use crate::config::BotConfig;
use crate::domain::market::CoinInfo;
use rayon::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

const MIN_HISTORY_ROWS: usize = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestScore {
    pub ticker: String,
    pub symbol: String,
    pub passed: bool,
    /// Composite 0..100.
    pub score: f64,
    pub grade: Grade,
    pub metrics: Option<PerformanceMetrics>,
    pub filter_results: FilterResults,
    pub gate: Option<GateReport>,
    pub reason: String,
    pub coin_info: Option<CoinInfo>,
}

impl BacktestScore {
    fn failed(ticker: &str, reason: impl Into<String>, coin_info: Option<CoinInfo>) -> Self {
        Self {
            ticker: ticker.to_string(),
            symbol: symbol_of(ticker),
            passed: false,
            score: 0.0,
            grade: Grade::Fail,
            metrics: None,
            filter_results: FilterResults::new(),
            gate: None,
            reason: reason.into(),
            coin_info,
        }
    }
}

fn symbol_of(ticker: &str) -> String {
    ticker.split('-').next_back().unwrap_or(ticker).to_string()
}

pub struct MultiCoinBacktest {
    config: Arc<BotConfig>,
    data_sync: Arc<HistoricalDataSync>,
    cache: Arc<MetricsCache>,
    config_hash: String,
}

impl MultiCoinBacktest {
    pub fn new(
        config: Arc<BotConfig>,
        data_sync: Arc<HistoricalDataSync>,
        cache: Arc<MetricsCache>,
    ) -> Self {
        let config_hash = config.backtest_config_hash();
        Self {
            config,
            data_sync,
            cache,
            config_hash,
        }
    }

    /// Backtest every ticker, score and grade the results, return the top-N
    /// by score (pass or fail; callers filter on `passed`).
    pub async fn run_parallel_backtest(
        &self,
        tickers: Vec<String>,
        coin_infos: HashMap<String, CoinInfo>,
        top_n: usize,
    ) -> Vec<BacktestScore> {
        info!("MultiCoinBacktest: backtesting {} tickers", tickers.len());

        // File reads happen up front; the rayon pool only sees pure CPU work.
        let mut loaded = Vec::with_capacity(tickers.len());
        for ticker in tickers {
            let coin_info = coin_infos.get(&ticker).cloned();
            match self.data_sync.load(&ticker, self.config.backtest.interval) {
                Ok(Some(series)) if series.len() >= MIN_HISTORY_ROWS => {
                    loaded.push((ticker, Some(series), coin_info));
                }
                Ok(Some(series)) => {
                    loaded.push((
                        ticker.clone(),
                        None,
                        coin_info,
                    ));
                    warn!(
                        "MultiCoinBacktest: {} has only {} rows, need {}",
                        ticker,
                        series.len(),
                        MIN_HISTORY_ROWS
                    );
                }
                Ok(None) => loaded.push((ticker, None, coin_info)),
                Err(e) => {
                    warn!("MultiCoinBacktest: load failed: {}", e);
                    loaded.push((ticker, None, coin_info));
                }
            }
        }

        let config = self.config.clone();
        let cache = self.cache.clone();
        let config_hash = self.config_hash.clone();

        let mut results = tokio::task::spawn_blocking(move || {
            loaded
                .into_par_iter()
                .map(|(ticker, series, coin_info)| {
                    let Some(series) = series else {
                        return BacktestScore::failed(
                            &ticker,
                            "insufficient local history",
                            coin_info,
                        );
                    };
                    score_one(&config, &cache, &config_hash, &ticker, series, coin_info)
                })
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_n);

        let passed = results.iter().filter(|r| r.passed).count();
        info!("MultiCoinBacktest: {}/{} passed the trading gate", passed, results.len());
        results
    }
}

fn score_one(
    config: &BotConfig,
    cache: &MetricsCache,
    config_hash: &str,
    ticker: &str,
    series: crate::domain::market::OhlcvSeries,
    coin_info: Option<CoinInfo>,
) -> BacktestScore {
    let metrics = match cache.get(ticker, config_hash) {
        Some(metrics) => metrics,
        None => {
            let series = series.tail(config.backtest.days);
            let strategy = BreakoutStrategy::new(ticker, config.strategy.clone());
            let result = match Backtester::new(strategy, series, config.backtest.clone()).run() {
                Ok(r) => r,
                Err(e) => return BacktestScore::failed(ticker, e.to_string(), coin_info),
            };
            cache.insert(ticker, config_hash, result.metrics.clone());
            result.metrics
        }
    };

    let cost_pct = ((config.backtest.commission + config.backtest.slippage)
        * rust_decimal::Decimal::TWO)
        .to_f64()
        .unwrap_or(0.0012);
    let gate = TwoGateFilter::new(config.filters.clone(), cost_pct).evaluate(&metrics);
    let passed = gate.tradeable();
    let score = composite_score(config, &metrics);
    let grade = Grade::from_score(score, passed);

    BacktestScore {
        ticker: ticker.to_string(),
        symbol: symbol_of(ticker),
        passed,
        score,
        grade,
        filter_results: gate.trading.clone(),
        reason: gate.reason.clone(),
        gate: Some(gate),
        metrics: Some(metrics),
        coin_info,
    }
}

/// Weighted sum of normalised metrics, 0..100. Sharpe carries the heaviest
/// weight; drawdown scores inversely.
fn composite_score(config: &BotConfig, metrics: &PerformanceMetrics) -> f64 {
    let weights = config.score_weights.normalized();

    let return_score = (metrics.total_return * 3.33).clamp(0.0, 100.0);
    let win_rate_score = ((metrics.win_rate - 30.0) * 3.33).clamp(0.0, 100.0);
    let pf_score = ((metrics.profit_factor - 1.0) * 50.0).clamp(0.0, 100.0);
    let sharpe_score = (metrics.sharpe_ratio * 50.0).clamp(0.0, 100.0);
    let sortino_score = (metrics.sortino_ratio * 40.0).clamp(0.0, 100.0);
    let dd_score = (100.0 - metrics.max_drawdown.abs() * 5.0).max(0.0);

    let score = return_score * weights.total_return
        + win_rate_score * weights.win_rate
        + pf_score * weights.profit_factor
        + sharpe_score * weights.sharpe
        + dd_score * weights.drawdown
        + sortino_score * weights.sortino;
    (score * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Interval;

    fn metrics(total_return: f64, sharpe: f64, drawdown: f64) -> PerformanceMetrics {
        let mut m = PerformanceMetrics::empty(Interval::Day);
        m.total_return = total_return;
        m.win_rate = 45.0;
        m.profit_factor = 2.0;
        m.sharpe_ratio = sharpe;
        m.sortino_ratio = sharpe * 1.2;
        m.max_drawdown = drawdown;
        m
    }

    #[test]
    fn test_composite_score_orders_better_metrics_higher() {
        let config = BotConfig::default();
        let strong = composite_score(&config, &metrics(30.0, 1.5, -8.0));
        let weak = composite_score(&config, &metrics(10.0, 0.5, -25.0));
        assert!(strong > weak);
        assert!(strong <= 100.0 && weak >= 0.0);
    }

    #[test]
    fn test_composite_score_caps_infinite_profit_factor() {
        let config = BotConfig::default();
        let mut m = metrics(20.0, 1.0, -10.0);
        m.profit_factor = f64::INFINITY;
        let score = composite_score(&config, &m);
        assert!(score.is_finite());
        assert!(score <= 100.0);
    }

    #[test]
    fn test_grade_thresholds() {
        assert_eq!(Grade::from_score(75.0, true), Grade::StrongPass);
        assert_eq!(Grade::from_score(55.0, true), Grade::WeakPass);
        assert_eq!(Grade::from_score(90.0, false), Grade::Fail);
    }

    #[tokio::test]
    async fn test_metrics_computed_once_per_ticker_per_scan() {
        use crate::infrastructure::paper::PaperExchange;
        use crate::application::scanner::data_sync::HistoricalDataSync;
        use chrono::{Duration, TimeZone, Utc};
        use rust_decimal::Decimal;

        let dir = tempfile::tempdir().unwrap();
        let exchange = Arc::new(PaperExchange::builder().build());
        let data_sync = Arc::new(
            HistoricalDataSync::new(exchange, dir.path(), 2, 3, 60, 180).unwrap(),
        );

        // Seed a cache file directly.
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let candles = (0..120)
            .map(|i| crate::domain::market::Candle {
                ts: base + Duration::days(i),
                open: Decimal::from(100),
                high: Decimal::from(101),
                low: Decimal::from(99),
                close: Decimal::from(100),
                volume: Decimal::from(1000),
            })
            .collect();
        data_sync
            .save(&crate::domain::market::OhlcvSeries::new(
                "KRW-BTC",
                Interval::Day,
                candles,
            ))
            .unwrap();

        let cache = Arc::new(MetricsCache::new());
        let backtest = MultiCoinBacktest::new(
            Arc::new(BotConfig::default()),
            data_sync,
            cache.clone(),
        );

        let tickers = vec!["KRW-BTC".to_string()];
        backtest
            .run_parallel_backtest(tickers.clone(), HashMap::new(), 5)
            .await;
        assert_eq!(cache.len(), 1);
        backtest.run_parallel_backtest(tickers, HashMap::new(), 5).await;
        // Still a single cache entry: the second pass reused it.
        assert_eq!(cache.len(), 1);
    }
}
