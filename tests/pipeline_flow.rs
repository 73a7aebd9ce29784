//! End-to-end pipeline scenarios over the paper exchange.

use breakwater::application::pipeline::{
    Ports, SkipReason, TickContext, TickOutcome, create_hybrid_pipeline,
};
use breakwater::application::position::PortfolioManager;
use breakwater::application::risk_management::RiskManager;
use breakwater::application::scanner::HistoricalDataSync;
use breakwater::config::{BotConfig, GateThresholds};
use breakwater::domain::market::{Candle, CoinInfo, Interval, OhlcvSeries};
use breakwater::domain::ports::ExchangePort;
use breakwater::domain::trading::{Decision, ExitTrigger};
use breakwater::infrastructure::idempotency::InMemoryIdempotencyStore;
use breakwater::infrastructure::paper::PaperExchange;
use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn candle(i: usize, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
    Candle {
        ts: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::days(i as i64),
        open: Decimal::try_from(open).unwrap(),
        high: Decimal::try_from(high).unwrap(),
        low: Decimal::try_from(low).unwrap(),
        close: Decimal::try_from(close).unwrap(),
        volume: Decimal::try_from(volume).unwrap(),
    }
}

/// Repeated accumulation/breakout/pump cycles, ending on a fresh breakout
/// bar. Produces a profitable rule backtest and a live buy signal on the
/// final bar.
fn pump_cycle_series(ticker: &str, cycles: usize) -> OhlcvSeries {
    let mut candles = Vec::new();
    let mut level = 100.0;
    let mut i = 0;
    for _ in 0..cycles {
        for k in 0..24 {
            let wiggle = if k % 2 == 0 { 0.002 } else { -0.002 } * level;
            candles.push(candle(
                i,
                level,
                level + wiggle.abs(),
                level - wiggle.abs(),
                level + wiggle * 0.5,
                1000.0,
            ));
            i += 1;
        }
        // Breakout bar: 4% over the range high on triple volume.
        let breakout_close = level * 1.04;
        candles.push(candle(i, level, level * 1.045, level, breakout_close, 3200.0));
        i += 1;
        // Pump bars carry the price through the take-profit level.
        let mut price = breakout_close;
        for _ in 0..4 {
            let next = price * 1.025;
            candles.push(candle(i, price, next * 1.003, price * 0.998, next, 1600.0));
            price = next;
            i += 1;
        }
        level = price;
    }
    // Final accumulation block plus a breakout bar with nothing after it, so
    // the most recent bar carries a live entry signal.
    for k in 0..24 {
        let wiggle = if k % 2 == 0 { 0.002 } else { -0.002 } * level;
        candles.push(candle(
            i,
            level,
            level + wiggle.abs(),
            level - wiggle.abs(),
            level + wiggle * 0.5,
            1000.0,
        ));
        i += 1;
    }
    candles.push(candle(i, level, level * 1.045, level, level * 1.04, 3200.0));
    OhlcvSeries::new(ticker, Interval::Day, candles)
}

fn permissive_config() -> BotConfig {
    let mut config = BotConfig::default();
    let mut open = GateThresholds::research();
    open.min_total_return = 0.1;
    open.min_win_rate = 1.0;
    open.min_profit_factor = 0.0;
    open.min_sharpe_ratio = 0.0;
    open.min_sortino_ratio = 0.0;
    open.min_calmar_ratio = 0.0;
    open.max_drawdown = 100.0;
    open.max_consecutive_losses = 100;
    open.max_volatility = 10_000.0;
    open.min_trades = 1;
    open.min_avg_win_loss_ratio = 0.0;
    open.max_avg_holding_hours = 100_000.0;
    config.filters.research = open.clone();
    config.filters.trading = open;
    config
}

struct Harness {
    config: Arc<BotConfig>,
    exchange: Arc<PaperExchange>,
    ports: Ports,
    risk: Arc<RiskManager>,
    portfolio_manager: Arc<PortfolioManager>,
    data_sync: Arc<HistoricalDataSync>,
    _tmp: tempfile::TempDir,
}

fn harness(config: BotConfig, exchange: PaperExchange) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config;
    config.data_dir = tmp.path().to_path_buf();
    let config = Arc::new(config);
    let exchange = Arc::new(exchange);
    let risk = Arc::new(RiskManager::new(config.trading.clone()));
    let portfolio_manager = Arc::new(PortfolioManager::new(
        exchange.clone(),
        risk.clone(),
        config.trading.clone(),
        config.quote_currency.clone(),
    ));
    let data_sync = Arc::new(
        HistoricalDataSync::new(
            exchange.clone(),
            config.data_dir.clone(),
            config.scanner.sync_years,
            config.scanner.max_years,
            config.scanner.per_ticker_sync_timeout_secs,
            config.scanner.bulk_sync_timeout_secs,
        )
        .unwrap(),
    );
    let ports = Ports {
        exchange: exchange.clone(),
        ai: None,
        market_data: None,
        idempotency: Arc::new(InMemoryIdempotencyStore::new()),
    };
    Harness {
        config,
        exchange,
        ports,
        risk,
        portfolio_manager,
        data_sync,
        _tmp: tmp,
    }
}

fn context(h: &Harness) -> TickContext {
    TickContext::new(
        h.config.ticker.clone(),
        h.config.clone(),
        h.ports.clone(),
        h.risk.clone(),
        h.portfolio_manager.clone(),
    )
}

#[tokio::test]
async fn circuit_breaker_day_blocks_everything() {
    let h = harness(
        BotConfig::default(),
        PaperExchange::builder().quote_balance(dec!(10000000)).build(),
    );
    // Accumulated daily pnl breaches the -10% limit.
    h.risk.record_trade(-11.0, Utc::now());

    let pipeline = create_hybrid_pipeline(&h.config, h.data_sync.clone());
    let mut ctx = context(&h);
    let result = pipeline.execute(&mut ctx).await;

    assert_eq!(
        result.outcome,
        TickOutcome::Exit { trigger: ExitTrigger::CircuitBreaker }
    );
    assert_eq!(result.decision, Decision::Hold);
    // No downstream stage ran: nothing was collected.
    assert!(ctx.chart.is_none());
    assert!(ctx.scan_result.is_none());
}

#[tokio::test]
async fn management_stop_loss_exits_and_records_pnl() {
    // Entry at 50,000,000; current price 47,400,000 is a -5.2% move, past
    // the -5% stop.
    let exchange = PaperExchange::builder()
        .quote_balance(dec!(1000000))
        .with_holding("ETH", dec!(0.1), dec!(50000000))
        .with_price("KRW-ETH", dec!(47400000))
        .build();
    let h = harness(BotConfig::default(), exchange);

    let pipeline = create_hybrid_pipeline(&h.config, h.data_sync.clone());
    let mut ctx = context(&h);
    let result = pipeline.execute(&mut ctx).await;

    assert_eq!(
        result.outcome,
        TickOutcome::Exit { trigger: ExitTrigger::StopLoss }
    );
    assert_eq!(result.decision, Decision::Sell);

    // The position is gone and the realised loss landed in the daily
    // accumulator.
    let eth = h.exchange.get_balance("ETH").await.unwrap();
    assert_eq!(eth.total, Decimal::ZERO);
    let circuit = h.risk.check_circuit_breaker(Utc::now());
    assert!(circuit.daily_pnl_pct < -5.0);

    // After a management exit no buy happened in the same tick.
    assert!(ctx.trade_receipt.is_none());
}

#[tokio::test]
async fn fakeout_exit_fires_within_three_candles() {
    let exchange = PaperExchange::builder()
        .quote_balance(dec!(1000000))
        .with_holding("ETH", dec!(1), dec!(100000))
        .with_price("KRW-ETH", dec!(97800))
        .build();
    let h = harness(BotConfig::default(), exchange);
    // Entered two hours ago: 2 candles held, -2.2% adverse move.
    h.portfolio_manager.record_entry(
        "KRW-ETH",
        Some(dec!(90000)),
        Some(dec!(120000)),
        Utc::now() - Duration::hours(2),
    );

    let pipeline = create_hybrid_pipeline(&h.config, h.data_sync.clone());
    let mut ctx = context(&h);
    let result = pipeline.execute(&mut ctx).await;

    assert_eq!(
        result.outcome,
        TickOutcome::Exit { trigger: ExitTrigger::Fakeout }
    );
}

#[tokio::test]
async fn insufficient_capital_skips_cleanly() {
    let exchange = PaperExchange::builder().quote_balance(dec!(5000)).build();
    let h = harness(BotConfig::default(), exchange);

    let pipeline = create_hybrid_pipeline(&h.config, h.data_sync.clone());
    let mut ctx = context(&h);
    let result = pipeline.execute(&mut ctx).await;

    assert_eq!(
        result.outcome,
        TickOutcome::Skip { reason: SkipReason::InsufficientCapital }
    );
    assert_eq!(result.decision, Decision::Hold);
}

#[tokio::test]
async fn scanner_rewrites_ticker_and_buys_the_winner() {
    let series = pump_cycle_series("KRW-NEO", 10);
    let summaries = vec![CoinInfo {
        ticker: "KRW-NEO".to_string(),
        symbol: "NEO".to_string(),
        current_price: series.last().unwrap().close,
        volume_24h: dec!(1000000),
        quote_volume_24h: dec!(50000000000),
        change_rate_24h: 4.0,
        high_24h: series.last().unwrap().high,
        low_24h: series.last().unwrap().low,
        volatility_7d: None,
    }];
    let exchange = PaperExchange::builder()
        .quote_balance(dec!(10000000))
        .with_series(series.clone())
        .with_summaries(summaries)
        .build();

    let h = harness(permissive_config(), exchange);
    // Seed the local cache the scanner's backtest reads from.
    h.data_sync.save(&series).unwrap();

    let pipeline = create_hybrid_pipeline(&h.config, h.data_sync.clone());
    let mut ctx = context(&h);
    let result = pipeline.execute(&mut ctx).await;

    // The fallback ticker was replaced by the scanned winner.
    assert_eq!(ctx.ticker, "KRW-NEO");
    let scan = ctx.scan_result.as_ref().expect("scan ran");
    assert_eq!(scan.selected_coins.len(), 1);
    assert!(scan.backtest_passed >= 1);

    // The rule gates fired on the final breakout bar and the buy executed.
    assert_eq!(
        result.outcome,
        TickOutcome::Success { decision: Decision::Buy },
        "reason: {}",
        result.reason
    );
    let neo = h.exchange.get_balance("NEO").await.unwrap();
    assert!(neo.total > Decimal::ZERO, "no position opened");
    let cash = h.exchange.get_balance("KRW").await.unwrap();
    assert!(cash.total < dec!(10000000), "no cash was spent");

    // The entry was recorded with the strategy's protective levels.
    let meta = h.portfolio_manager.meta_for("KRW-NEO");
    assert!(meta.stop_loss.is_some());
    assert!(meta.take_profit.is_some());
}

#[tokio::test]
async fn scan_without_candidates_skips_with_summary() {
    // Liquid markets exist but none have local history, so every backtest
    // downgrades and nothing is selected.
    let summaries = vec![CoinInfo {
        ticker: "KRW-XYZ".to_string(),
        symbol: "XYZ".to_string(),
        current_price: dec!(1000),
        volume_24h: dec!(1000),
        quote_volume_24h: dec!(50000000000),
        change_rate_24h: 0.0,
        high_24h: dec!(1010),
        low_24h: dec!(990),
        volatility_7d: None,
    }];
    let exchange = PaperExchange::builder()
        .quote_balance(dec!(10000000))
        .with_summaries(summaries)
        .build();
    let h = harness(BotConfig::default(), exchange);

    let pipeline = create_hybrid_pipeline(&h.config, h.data_sync.clone());
    let mut ctx = context(&h);
    let result = pipeline.execute(&mut ctx).await;

    assert_eq!(
        result.outcome,
        TickOutcome::Skip { reason: SkipReason::NoCandidate }
    );
}
