//! Hybrid risk-check stage: portfolio snapshot, circuit breakers, mode
//! arbitration, inline position management, and (in ENTRY mode) the
//! multi-coin scan that may rewrite the tick's ticker.

use crate::application::ai::EntryAnalyzer;
use crate::application::pipeline::{
    PipelineStage, SkipReason, StageResult, TickContext, TickOutcome,
};
use crate::application::position::{
    MarketSnapshot, PositionActionType, PositionEvaluator,
};
use crate::application::scanner::{
    CoinSelector, HistoricalDataSync, LiquidityScanner, MultiCoinBacktest,
};
use crate::domain::indicators::adx_series;
use crate::domain::market::Interval;
use crate::domain::trading::{Decision, PortfolioPosition, TradingMode};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

pub struct HybridRiskCheckStage {
    scanning_enabled: bool,
    data_sync: Arc<HistoricalDataSync>,
}

impl HybridRiskCheckStage {
    pub fn new(scanning_enabled: bool, data_sync: Arc<HistoricalDataSync>) -> Self {
        Self {
            scanning_enabled,
            data_sync,
        }
    }

    async fn handle_management(
        &self,
        ctx: &mut TickContext,
    ) -> Result<Option<StageResult>> {
        let status = ctx.portfolio_status.clone().expect("snapshot taken");
        let evaluator = PositionEvaluator::new(ctx.config.trading.clone());
        info!(
            "HybridRiskCheck: managing {} position(s)",
            status.positions.len()
        );

        for position in &status.positions {
            let market = self.collect_market_snapshot(ctx, position).await;
            let action = evaluator.evaluate(position, &market, ctx.tick_time);
            info!(
                "HybridRiskCheck: [{}] {:?} ({})",
                position.symbol, action.action, action.reason
            );

            match action.action {
                PositionActionType::Exit => {
                    let trigger = action.trigger.expect("exit carries a trigger");
                    let Some(receipt) = self.sell_position(ctx, position, None).await? else {
                        // An identical sell already went through this minute.
                        continue;
                    };
                    let pnl_pct = position.profit_rate();
                    ctx.risk.record_trade(pnl_pct, ctx.tick_time);
                    ctx.portfolio_manager.record_exit(&position.ticker);

                    let data = json!({
                        "ticker": position.ticker,
                        "trigger": trigger.to_string(),
                        "pnl": position.profit_loss(),
                        "pnl_pct": pnl_pct,
                        "amount": position.amount,
                        "price": position.current_price,
                        "receipt": receipt,
                    });
                    return Ok(Some(StageResult::exit(
                        TickOutcome::Exit { trigger },
                        Decision::Sell,
                        action.reason,
                        data,
                    )));
                }
                PositionActionType::PartialExit => {
                    // The evaluator only escalates here after the trailing
                    // rule found nothing to raise, so declining the partial
                    // exit leaves the stop already trailed.
                    if self.confirm_partial_exit(ctx, position).await {
                        let amount = position.amount
                            * rust_decimal::Decimal::try_from(action.exit_ratio)
                                .unwrap_or(rust_decimal::Decimal::new(5, 1));
                        if let Some(receipt) = self.sell_position(ctx, position, Some(amount)).await? {
                            ctx.risk.record_trade(
                                position.profit_rate() * action.exit_ratio,
                                ctx.tick_time,
                            );
                            info!(
                                "HybridRiskCheck: partial exit {} of {} filled ({})",
                                amount, position.ticker, receipt.order_id
                            );
                        }
                    }
                }
                PositionActionType::AdjustStop => {
                    if let Some(stop) = action.new_stop_loss {
                        ctx.portfolio_manager.raise_stop(&position.ticker, stop);
                    }
                }
                PositionActionType::Hold => {}
            }
        }

        Ok(None)
    }

    /// Per-ticker market context for the evaluator: hourly ADX and an
    /// hourly-candle holding count. Fetch failures degrade to defaults.
    async fn collect_market_snapshot(
        &self,
        ctx: &TickContext,
        position: &PortfolioPosition,
    ) -> MarketSnapshot {
        let mut snapshot = MarketSnapshot {
            holding_candles: Some(position.holding_hours(ctx.tick_time).floor() as usize),
            ..Default::default()
        };

        match ctx
            .ports
            .exchange
            .get_ohlcv(&position.ticker, Interval::Minute60, 50)
            .await
        {
            Ok(series) if series.len() >= 30 => {
                let to_f64 = |d: rust_decimal::Decimal| d.to_f64().unwrap_or(f64::NAN);
                let high: Vec<f64> = series.candles.iter().map(|c| to_f64(c.high)).collect();
                let low: Vec<f64> = series.candles.iter().map(|c| to_f64(c.low)).collect();
                let close: Vec<f64> = series.candles.iter().map(|c| to_f64(c.close)).collect();
                let adx = adx_series(&high, &low, &close, 14).adx;
                let n = adx.len();
                snapshot.current_adx = adx.get(n - 1).copied().filter(|v| v.is_finite());
                if n >= 2 {
                    snapshot.prev_adx = adx.get(n - 2).copied().filter(|v| v.is_finite());
                }
            }
            Ok(_) => {}
            Err(e) => warn!(
                "HybridRiskCheck: market data for {} unavailable: {}",
                position.ticker, e
            ),
        }
        snapshot
    }

    /// Idempotency-guarded sell. `Ok(None)` means an identical order was
    /// already submitted within the TTL and this one was suppressed.
    async fn sell_position(
        &self,
        ctx: &TickContext,
        position: &PortfolioPosition,
        amount: Option<rust_decimal::Decimal>,
    ) -> Result<Option<crate::domain::trading::TradeReceipt>> {
        let key = order_key(&position.ticker, ctx.tick_time, Decision::Sell);
        let ttl = chrono::Duration::hours(ctx.config.trading.min_trade_interval_hours as i64);
        if ctx.ports.idempotency.check_key(&key).await? {
            warn!("HybridRiskCheck: duplicate sell suppressed for {}", position.ticker);
            return Ok(None);
        }
        let receipt = ctx
            .ports
            .exchange
            .execute_sell(&position.ticker, amount, &key)
            .await?;
        ctx.ports.idempotency.mark_key(&key, ttl).await?;
        Ok(Some(receipt))
    }

    /// Ask the reviewer whether to take partial profits. Errors and absent
    /// AI ports both mean "no".
    async fn confirm_partial_exit(&self, ctx: &TickContext, position: &PortfolioPosition) -> bool {
        let Some(ai) = &ctx.ports.ai else {
            return false;
        };
        let system = "You manage an open crypto spot position. Decide whether to \
                      take partial profits now. Respond with JSON only.";
        let user = format!(
            "Position {}: entry {:.0}, current {:.0}, profit {:+.2}%, held {:.1}h.\n\
             Should half the position be sold to lock in profit? \
             Answer {{\"partial_exit\": true|false, \"reason\": \"...\"}}.",
            position.ticker,
            position.avg_buy_price,
            position.current_price,
            position.profit_rate(),
            position.holding_hours(ctx.tick_time),
        );
        let schema = json!({
            "type": "object",
            "required": ["partial_exit"],
            "properties": {
                "partial_exit": {"type": "boolean"},
                "reason": {"type": "string"}
            }
        });
        match ai.complete(system, &user, &schema).await {
            Ok(value) => value
                .get("partial_exit")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            Err(e) => {
                warn!("HybridRiskCheck: partial-exit review failed: {}", e);
                false
            }
        }
    }

    async fn handle_entry(&self, ctx: &mut TickContext) -> Result<StageResult> {
        let status = ctx.portfolio_status.clone().expect("snapshot taken");

        let available = status.available_capital;
        if available < ctx.config.trading.min_position_value {
            return Ok(StageResult::skip(
                SkipReason::InsufficientCapital,
                format!("available capital {} below minimum", available),
                json!({ "available_capital": available }),
            ));
        }

        let frequency = ctx.risk.check_trade_frequency(ctx.tick_time);
        ctx.frequency_check = Some(frequency.clone());
        if !frequency.allowed {
            return Ok(StageResult::skip(
                SkipReason::FrequencyThrottle,
                frequency.reason.clone(),
                serde_json::to_value(&frequency)?,
            ));
        }

        if !self.scanning_enabled {
            info!("HybridRiskCheck: scanning disabled, fixed ticker {}", ctx.ticker);
            return Ok(StageResult::proceed(format!(
                "entry mode with fixed ticker {}",
                ctx.ticker
            )));
        }

        let held = status.held_tickers();
        match self.run_scan(ctx, &held).await {
            Ok(scan) => {
                let summary = json!({
                    "liquidity_scanned": scan.liquidity_scanned,
                    "backtest_passed": scan.backtest_passed,
                    "ai_analyzed": scan.ai_analyzed,
                    "selected": scan.selected_coins.len(),
                    "duration_secs": scan.duration_secs,
                });
                let top = scan.selected_coins.first().cloned();
                ctx.scan_result = Some(scan);
                match top {
                    Some(coin) => {
                        info!(
                            "HybridRiskCheck: scanner picked {} ({:.1}, {})",
                            coin.symbol, coin.final_score, coin.final_grade
                        );
                        ctx.ticker = coin.ticker.clone();
                        Ok(StageResult::proceed(format!(
                            "scanner selected {}",
                            coin.ticker
                        )))
                    }
                    None => Ok(StageResult::skip(
                        SkipReason::NoCandidate,
                        "scan found no entry candidate",
                        json!({ "scan_summary": summary }),
                    )),
                }
            }
            Err(e) => {
                warn!("HybridRiskCheck: scan failed, falling back to {}: {}", ctx.ticker, e);
                Ok(StageResult::proceed(format!(
                    "scan failed, fallback ticker {}",
                    ctx.ticker
                )))
            }
        }
    }

    async fn run_scan(
        &self,
        ctx: &TickContext,
        exclude: &[String],
    ) -> Result<crate::application::scanner::ScanResult> {
        let config = ctx.config.clone();
        let liquidity = LiquidityScanner::new(
            ctx.ports.exchange.clone(),
            config.scanner.min_volume_quote,
        );
        let multi_backtest = MultiCoinBacktest::new(
            config.clone(),
            self.data_sync.clone(),
            ctx.metrics_cache.clone(),
        );
        // The AI reviews only the final ticker in the analysis stage; the
        // scan itself stays rule-based unless a reviewer is configured for it.
        let analyzer = if config.scanner.ai_top_n > 0 {
            ctx.ports.ai.clone().map(EntryAnalyzer::new)
        } else {
            None
        };
        let selector = CoinSelector::new(
            liquidity,
            self.data_sync.clone(),
            multi_backtest,
            analyzer,
            config.scanner.clone(),
            config.quote_currency.clone(),
            config.backtest.interval,
        );
        selector.select_coins(exclude).await
    }
}

#[async_trait]
impl PipelineStage for HybridRiskCheckStage {
    fn name(&self) -> &'static str {
        "HybridRiskCheck"
    }

    async fn execute(&self, ctx: &mut TickContext) -> Result<StageResult> {
        // 1. Portfolio snapshot.
        let status = ctx
            .portfolio_manager
            .get_portfolio_status(ctx.tick_time)
            .await?;
        info!(
            "HybridRiskCheck: mode {}, {} position(s), cash {}",
            status.trading_mode, status.position_count, status.quote_balance
        );
        ctx.trading_mode = Some(status.trading_mode);
        ctx.portfolio_status = Some(status.clone());

        // 2. Portfolio-level circuit breaker.
        let circuit = ctx.risk.check_circuit_breaker(ctx.tick_time);
        ctx.circuit_check = Some(circuit.clone());
        if !circuit.allowed || status.trading_mode == TradingMode::Blocked {
            return Ok(StageResult::exit(
                TickOutcome::Exit {
                    trigger: crate::domain::trading::ExitTrigger::CircuitBreaker,
                },
                Decision::Hold,
                circuit.reason.clone(),
                serde_json::to_value(&circuit)?,
            ));
        }

        // 3. Mode dispatch. Held positions are always managed first; spare
        // slots then fall through to entry.
        if !status.positions.is_empty() {
            if let Some(result) = self.handle_management(ctx).await? {
                return Ok(result);
            }
            if !status.can_open_new_position {
                return Ok(StageResult::skip(
                    SkipReason::MaxPositions,
                    "positions managed, no free slot",
                    json!({ "position_count": status.position_count }),
                ));
            }
            info!("HybridRiskCheck: free slot available, switching to entry");
        }

        self.handle_entry(ctx).await
    }
}

/// Deterministic order key: same ticker, minute, and decision always produce
/// the same key, so a retried tick cannot double-submit.
pub fn order_key(ticker: &str, tick_time: DateTime<Utc>, decision: Decision) -> String {
    let minute = tick_time.format("%Y-%m-%dT%H:%M");
    let mut hasher = Sha256::new();
    hasher.update(ticker.as_bytes());
    hasher.update(b"|");
    hasher.update(minute.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(decision.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_order_key_is_deterministic_per_minute() {
        let t1 = Utc.with_ymd_and_hms(2025, 5, 1, 10, 30, 5).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 5, 1, 10, 30, 55).unwrap();
        let t3 = Utc.with_ymd_and_hms(2025, 5, 1, 10, 31, 0).unwrap();

        assert_eq!(
            order_key("KRW-BTC", t1, Decision::Buy),
            order_key("KRW-BTC", t2, Decision::Buy)
        );
        assert_ne!(
            order_key("KRW-BTC", t1, Decision::Buy),
            order_key("KRW-BTC", t3, Decision::Buy)
        );
        assert_ne!(
            order_key("KRW-BTC", t1, Decision::Buy),
            order_key("KRW-BTC", t1, Decision::Sell)
        );
        assert_ne!(
            order_key("KRW-BTC", t1, Decision::Buy),
            order_key("KRW-ETH", t1, Decision::Buy)
        );
    }
}
