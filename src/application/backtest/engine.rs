//! Bar-loop backtesting engine.
//!
//! Two execution models: `next_open` fills a bar-`t` signal at the open of
//! bar `t+1`; `intrabar_stops` additionally lets stop-loss and take-profit
//! fill inside the bar at the level price when the bar's low/high crosses it.
//! Slippage is either a fixed percentage per side or an orderbook walk;
//! commission applies symmetrically on both sides.

use crate::application::strategy::{BookSide, BreakoutStrategy};
use crate::config::BacktestOptions;
use crate::domain::market::{OhlcvSeries, Orderbook};
use crate::domain::trading::portfolio::Portfolio;
use crate::domain::trading::{ExitTrigger, Signal, SignalAction, Trade};
use anyhow::{Result, bail};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum SlippageModel {
    /// Fixed fraction per side.
    Percentage { buy: Decimal, sell: Decimal },
    /// Walk a static book snapshot; fall back to `default_slippage` without one.
    Orderbook {
        book: Option<Orderbook>,
        default_slippage: Decimal,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlippageStats {
    pub total_slippage_amount: f64,
    pub avg_slippage_pct: f64,
    pub num_orders: usize,
}

#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub ticker: String,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub equity_curve: Vec<f64>,
    pub trades: Vec<Trade>,
    pub metrics: super::performance::PerformanceMetrics,
    pub slippage: SlippageStats,
}

struct PendingSignal {
    signal: Signal,
    signal_bar: usize,
}

pub struct Backtester {
    strategy: BreakoutStrategy,
    series: OhlcvSeries,
    options: BacktestOptions,
    slippage_model: SlippageModel,
    slippage_log: Vec<f64>,
    slippage_amount: f64,
}

impl Backtester {
    pub fn new(strategy: BreakoutStrategy, series: OhlcvSeries, options: BacktestOptions) -> Self {
        let slippage_model = SlippageModel::Percentage {
            buy: options.slippage,
            sell: options.slippage,
        };
        Self {
            strategy,
            series,
            options,
            slippage_model,
            slippage_log: Vec::new(),
            slippage_amount: 0.0,
        }
    }

    pub fn with_slippage_model(mut self, model: SlippageModel) -> Self {
        self.slippage_model = model;
        self
    }

    pub fn run(mut self) -> Result<BacktestResult> {
        if self.series.is_empty() {
            bail!("empty series for {}", self.series.ticker);
        }
        let ticker = self.series.ticker.clone();
        let mut portfolio = Portfolio::new(self.options.initial_capital);
        let mut equity_curve: Vec<f64> = Vec::with_capacity(self.series.len());
        let mut pending: Option<PendingSignal> = None;

        self.strategy.prepare_indicators(&self.series);
        let n = self.series.len();

        for i in 0..n {
            let candle = self.series.candles[i].clone();

            // 1. Fill the previous bar's signal at this bar's open.
            if let Some(p) = pending.take() {
                self.execute(&mut portfolio, &ticker, &p.signal, candle.open, i, &candle.ts);
            }

            // 2. Intrabar stop/target fills at the level price. Stop wins
            // when both levels are crossed within one bar.
            if self.options.use_intrabar_stops
                && let Some(position) = portfolio.positions.get(&ticker).cloned()
            {
                let stop_hit = position.stop_loss.filter(|s| candle.low <= *s);
                let take_hit = position.take_profit.filter(|t| candle.high >= *t);
                if let Some(level) = stop_hit {
                    self.close_at(&mut portfolio, &ticker, level, &candle.ts, ExitTrigger::StopLoss);
                    self.strategy.reset();
                } else if let Some(level) = take_hit {
                    self.close_at(&mut portfolio, &ticker, level, &candle.ts, ExitTrigger::TakeProfit);
                    self.strategy.reset();
                }
            }

            // 3. Strategy signal for this bar.
            if let Some(signal) = self.strategy.generate_signal(i, &portfolio) {
                if self.options.execute_on_next_open {
                    pending = Some(PendingSignal {
                        signal,
                        signal_bar: i,
                    });
                } else {
                    self.execute(&mut portfolio, &ticker, &signal, candle.close, i, &candle.ts);
                }
            }

            portfolio.mark(&ticker, candle.close);
            equity_curve.push(portfolio.equity().to_f64().unwrap_or(0.0));
        }

        if let Some(p) = pending {
            debug!(
                "Backtester: unfilled signal from final bar {} discarded",
                p.signal_bar
            );
        }

        let metrics = super::performance::PerformanceMetrics::calculate(
            &equity_curve,
            &portfolio.closed_trades,
            self.options.initial_capital.to_f64().unwrap_or(0.0),
            self.series.interval,
        );
        let slippage = SlippageStats {
            total_slippage_amount: self.slippage_amount,
            avg_slippage_pct: if self.slippage_log.is_empty() {
                0.0
            } else {
                self.slippage_log.iter().sum::<f64>() / self.slippage_log.len() as f64
            },
            num_orders: self.slippage_log.len(),
        };

        Ok(BacktestResult {
            ticker,
            initial_capital: self.options.initial_capital,
            final_equity: portfolio.equity(),
            equity_curve,
            trades: portfolio.closed_trades.clone(),
            metrics,
            slippage,
        })
    }

    fn execute(
        &mut self,
        portfolio: &mut Portfolio,
        ticker: &str,
        signal: &Signal,
        base_price: Decimal,
        bar_index: usize,
        ts: &chrono::DateTime<chrono::Utc>,
    ) {
        match signal.action {
            SignalAction::Buy => {
                if portfolio.has_position(ticker) {
                    return;
                }
                let size = match signal.size {
                    Some(s) => s,
                    None => self.strategy.calculate_position_size(signal, portfolio),
                };
                if size <= Decimal::ZERO {
                    return;
                }
                let (fill, slip_pct) = self.buy_fill_price(base_price, size);
                self.record_slippage(base_price, fill, size, slip_pct);
                let result = portfolio.open_position(
                    ticker,
                    size,
                    fill,
                    self.options.commission,
                    *ts,
                    Some(bar_index),
                    signal.stop_loss,
                    signal.take_profit,
                );
                if let Err(e) = result {
                    // Underfunded entries are skipped, not fatal.
                    warn!("Backtester: buy skipped at bar {}: {}", bar_index, e);
                }
            }
            SignalAction::Sell | SignalAction::Close => {
                let Some(position) = portfolio.positions.get(ticker).cloned() else {
                    return;
                };
                let (fill, slip_pct) = self.fill_price(BookSide::Bid, base_price, position.amount);
                self.record_slippage(base_price, fill, position.amount, slip_pct);
                let trigger = signal.reason.exit_trigger();
                if let Err(e) = portfolio.close_position(
                    ticker,
                    fill,
                    self.options.commission,
                    *ts,
                    trigger,
                ) {
                    warn!("Backtester: sell failed at bar {}: {}", bar_index, e);
                }
            }
        }
    }

    fn close_at(
        &mut self,
        portfolio: &mut Portfolio,
        ticker: &str,
        level: Decimal,
        ts: &chrono::DateTime<chrono::Utc>,
        trigger: ExitTrigger,
    ) {
        let Some(position) = portfolio.positions.get(ticker).cloned() else {
            return;
        };
        let (fill, slip_pct) = self.fill_price(BookSide::Bid, level, position.amount);
        self.record_slippage(level, fill, position.amount, slip_pct);
        if let Err(e) = portfolio.close_position(ticker, fill, self.options.commission, *ts, Some(trigger))
        {
            warn!("Backtester: intrabar close failed: {}", e);
        }
    }

    /// Buy fill; splits the order across the book when configured and the
    /// book is deep enough to make splitting worthwhile.
    fn buy_fill_price(&self, price: Decimal, size: Decimal) -> (Decimal, f64) {
        if self.options.use_split_orders
            && let SlippageModel::Orderbook { book: Some(book), .. } = &self.slippage_model
        {
            let size_f64 = size.to_f64().unwrap_or(0.0);
            let splits = self
                .strategy
                .calculate_optimal_splits(size_f64, book, BookSide::Ask);
            if splits > 1 {
                let execution =
                    self.strategy
                        .simulate_split_execution(size_f64, splits, book, BookSide::Ask);
                return (
                    Decimal::from_f64(execution.avg_execution_price).unwrap_or(price),
                    execution.total_slippage,
                );
            }
        }
        self.fill_price(BookSide::Ask, price, size)
    }

    /// Slippage-adjusted fill price for one side.
    fn fill_price(&self, side: BookSide, price: Decimal, size: Decimal) -> (Decimal, f64) {
        match &self.slippage_model {
            SlippageModel::Percentage { buy, sell } => {
                let rate = match side {
                    BookSide::Ask => *buy,
                    BookSide::Bid => *sell,
                };
                let fill = match side {
                    BookSide::Ask => price * (Decimal::ONE + rate),
                    BookSide::Bid => price * (Decimal::ONE - rate),
                };
                (fill, rate.to_f64().unwrap_or(0.0))
            }
            SlippageModel::Orderbook {
                book,
                default_slippage,
            } => match book {
                Some(book) => {
                    let info = self.strategy.calculate_slippage(
                        side,
                        price.to_f64().unwrap_or(0.0),
                        size.to_f64().unwrap_or(0.0),
                        book,
                    );
                    if let Some(warning) = &info.warning {
                        warn!("Backtester: {}", warning);
                    }
                    (
                        Decimal::from_f64(info.actual_avg_price).unwrap_or(price),
                        info.slippage_pct,
                    )
                }
                None => {
                    let rate = *default_slippage;
                    let fill = match side {
                        BookSide::Ask => price * (Decimal::ONE + rate),
                        BookSide::Bid => price * (Decimal::ONE - rate),
                    };
                    (fill, rate.to_f64().unwrap_or(0.0))
                }
            },
        }
    }

    fn record_slippage(&mut self, expected: Decimal, fill: Decimal, size: Decimal, pct: f64) {
        self.slippage_log.push(pct);
        self.slippage_amount += ((fill - expected).abs() * size).to_f64().unwrap_or(0.0);
    }
}
