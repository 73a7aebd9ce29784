//! Execution stage: turn the validated decision into exchange orders.
//!
//! Every order carries a deterministic idempotency key derived from
//! (ticker, tick minute, decision); the ledger rejects duplicates inside the
//! TTL, so a crashed-and-retried tick can never double-submit.

use crate::application::pipeline::hybrid_stage::order_key;
use crate::application::pipeline::{
    PipelineStage, SkipReason, StageResult, TickContext, TickOutcome,
};
use crate::application::strategy::BreakoutStrategy;
use crate::domain::errors::ErrorClass;
use crate::domain::trading::portfolio::Portfolio;
use crate::domain::trading::{Decision, Signal, SignalAction, SignalReason, EntryReason};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

#[derive(Default)]
pub struct ExecutionStage;

impl ExecutionStage {
    pub fn new() -> Self {
        Self
    }

    async fn execute_buy(&self, ctx: &mut TickContext) -> Result<StageResult> {
        if ctx.position_detail.is_some() {
            // One position per ticker; a second buy is never placed.
            return Ok(self.finish(ctx, Decision::Hold, "already holding, buy ignored"));
        }
        let Some(status) = ctx.current_status.clone() else {
            return Ok(StageResult::stop(
                ErrorClass::Precondition,
                "execution requires current status",
            ));
        };

        // Size off the rule signal when there is one; otherwise a stop-less
        // synthetic signal falls back to the fixed position fraction.
        let signal = ctx.rule_signal.clone().filter(|s| s.action == SignalAction::Buy);
        let signal = signal.unwrap_or_else(|| Signal {
            action: SignalAction::Buy,
            price: status.current_price,
            size: None,
            stop_loss: None,
            take_profit: None,
            reason: SignalReason::Entry(EntryReason {
                trend: String::new(),
                squeeze: String::new(),
                breakout: "ai_decision".to_string(),
                volume: String::new(),
                strong_breakout: false,
            }),
        });

        let equity = ctx
            .portfolio_status
            .as_ref()
            .map(|s| s.quote_balance + s.total_current_value)
            .unwrap_or(status.quote_balance);
        let strategy = BreakoutStrategy::new(&ctx.ticker, ctx.config.strategy.clone());
        let size = strategy.calculate_position_size(&signal, &Portfolio::new(equity));
        let mut quote_amount = (size * signal.price).round_dp(0);

        // Never spend past the entry budget or the actual cash balance.
        if let Some(portfolio) = &ctx.portfolio_status {
            quote_amount = quote_amount.min(portfolio.available_capital);
        }
        quote_amount = quote_amount.min(status.quote_balance);
        if quote_amount < ctx.config.trading.min_position_value {
            return Ok(StageResult::skip(
                SkipReason::InsufficientCapital,
                format!("buy budget {} below minimum position value", quote_amount),
                json!({ "quote_amount": quote_amount }),
            ));
        }

        let key = order_key(&ctx.ticker, ctx.tick_time, Decision::Buy);
        let ttl = chrono::Duration::hours(ctx.config.trading.min_trade_interval_hours as i64);
        if ctx.ports.idempotency.check_key(&key).await? {
            warn!("Execution: duplicate buy suppressed for {}", ctx.ticker);
            return Ok(StageResult::skip(
                SkipReason::FrequencyThrottle,
                "duplicate buy suppressed by idempotency ledger",
                json!({ "idempotency_key": key }),
            ));
        }

        let receipt = ctx
            .ports
            .exchange
            .execute_buy(&ctx.ticker, quote_amount, &key)
            .await?;
        ctx.ports.idempotency.mark_key(&key, ttl).await?;
        ctx.portfolio_manager.record_entry(
            &ctx.ticker,
            signal.stop_loss,
            signal.take_profit,
            ctx.tick_time,
        );
        ctx.risk.note_trade_time(ctx.tick_time);
        info!(
            "Execution: bought {} for {} at {} (stop {:?}, take {:?})",
            receipt.amount, ctx.ticker, receipt.price, signal.stop_loss, signal.take_profit
        );
        ctx.trade_receipt = Some(receipt);

        Ok(self.finish(ctx, Decision::Buy, "buy executed"))
    }

    async fn execute_sell(&self, ctx: &mut TickContext) -> Result<StageResult> {
        let Some(position) = ctx.position_detail.clone() else {
            return Ok(self.finish(ctx, Decision::Hold, "sell without position, ignored"));
        };

        let key = order_key(&ctx.ticker, ctx.tick_time, Decision::Sell);
        let ttl = chrono::Duration::hours(ctx.config.trading.min_trade_interval_hours as i64);
        if ctx.ports.idempotency.check_key(&key).await? {
            warn!("Execution: duplicate sell suppressed for {}", ctx.ticker);
            return Ok(StageResult::skip(
                SkipReason::FrequencyThrottle,
                "duplicate sell suppressed by idempotency ledger",
                json!({ "idempotency_key": key }),
            ));
        }

        let receipt = ctx
            .ports
            .exchange
            .execute_sell(&ctx.ticker, None, &key)
            .await?;
        ctx.ports.idempotency.mark_key(&key, ttl).await?;

        let pnl_pct = position.profit_rate();
        ctx.risk.record_trade(pnl_pct, ctx.tick_time);
        ctx.risk.note_trade_time(ctx.tick_time);
        ctx.portfolio_manager.record_exit(&ctx.ticker);
        info!(
            "Execution: sold {} at {} ({:+.2}%)",
            ctx.ticker, receipt.price, pnl_pct
        );
        ctx.trade_receipt = Some(receipt);

        Ok(self.finish(ctx, Decision::Sell, "sell executed"))
    }

    /// Rich tick report, whatever the decision was.
    fn finish(&self, ctx: &TickContext, decision: Decision, message: &str) -> StageResult {
        let review = ctx.ai_review.as_ref();
        let data = json!({
            "ticker": ctx.ticker,
            "decision": decision,
            "confidence": review.map(|r| r.confidence),
            "reason": review.map(|r| r.reason.clone()),
            "validation": ctx.validation,
            "risk_checks": {
                "circuit_breaker": ctx.circuit_check,
                "frequency_check": ctx.frequency_check,
            },
            "price": ctx.current_status.as_ref().map(|s| s.current_price),
            "amount": ctx.trade_receipt.as_ref().map(|r| r.amount),
            "total": ctx.trade_receipt.as_ref().map(|r| r.total),
            "fee": ctx.trade_receipt.as_ref().map(|r| r.fee),
            "order_id": ctx.trade_receipt.as_ref().map(|r| r.order_id.clone()),
            "flash_crash": ctx.flash_crash,
            "rsi_divergence": ctx.rsi_divergence,
            "backtest": ctx.gate_report.as_ref().map(|g| json!({
                "trading_pass": g.trading_pass,
                "research_pass": g.research_pass,
                "reason": g.reason,
            })),
            "scan_summary": ctx.scan_result.as_ref().map(|s| json!({
                "liquidity_scanned": s.liquidity_scanned,
                "backtest_passed": s.backtest_passed,
                "ai_analyzed": s.ai_analyzed,
                "selected": s.selected_coins.len(),
            })),
        });
        StageResult::exit(
            TickOutcome::Success { decision },
            decision,
            message.to_string(),
            data,
        )
    }
}

#[async_trait]
impl PipelineStage for ExecutionStage {
    fn name(&self) -> &'static str {
        "Execution"
    }

    async fn execute(&self, ctx: &mut TickContext) -> Result<StageResult> {
        let decision = ctx
            .ai_review
            .as_ref()
            .map(|r| r.decision)
            .unwrap_or(Decision::Hold);

        match decision {
            Decision::Buy => self.execute_buy(ctx).await,
            Decision::Sell => self.execute_sell(ctx).await,
            Decision::Hold => {
                info!("Execution: hold, no order for {}", ctx.ticker);
                Ok(self.finish(ctx, Decision::Hold, "hold, no order placed"))
            }
        }
    }
}
