//! Analysis stage: regime flags, anomaly detectors, the two-gate backtest
//! filter, rule-signal synthesis, AI review, and the hard-rule validator.
//!
//! Each layer can short-circuit the pipeline; a candidate that fails the
//! trading gate never reaches the AI, let alone execution.

use crate::application::ai::{EntryAnalyzer, EntryReview, ReviewPayload};
use crate::application::analysis::{
    AiDecisionValidator, ValidationContext, calculate_market_risk, detect_flash_crash,
    detect_rsi_divergence,
};
use crate::application::backtest::{Backtester, Grade, PerformanceMetrics, TwoGateFilter};
use crate::application::pipeline::{
    PipelineStage, SkipReason, StageResult, TickContext, TickOutcome,
};
use crate::application::scanner::HistoricalDataSync;
use crate::application::strategy::BreakoutStrategy;
use crate::domain::errors::ErrorClass;
use crate::domain::market::OhlcvSeries;
use crate::domain::trading::portfolio::Portfolio;
use crate::domain::trading::{Confidence, Decision, SignalAction};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub struct AnalysisStage {
    data_sync: Arc<HistoricalDataSync>,
    validator: AiDecisionValidator,
}

impl AnalysisStage {
    pub fn new(data_sync: Arc<HistoricalDataSync>) -> Self {
        Self {
            data_sync,
            validator: AiDecisionValidator::default(),
        }
    }

    /// Full local history when the cache has it, otherwise the tick's chart.
    fn history_for(&self, ctx: &TickContext) -> Option<OhlcvSeries> {
        let interval = ctx.config.backtest.interval;
        if ctx.config.backtest.use_local_data
            && let Ok(Some(series)) = self.data_sync.load(&ctx.ticker, interval)
            && series.len() >= 30
        {
            return Some(series);
        }
        ctx.chart.as_ref().map(|c| c.day.clone())
    }

    /// Metrics for the quick filter, via the per-scan cache.
    fn gate_metrics(&self, ctx: &TickContext, history: &OhlcvSeries) -> Result<PerformanceMetrics> {
        let config_hash = ctx.config.backtest_config_hash();
        if let Some(metrics) = ctx.metrics_cache.get(&ctx.ticker, &config_hash) {
            return Ok(metrics);
        }
        let series = history.tail(ctx.config.backtest.days);
        let strategy = BreakoutStrategy::new(&ctx.ticker, ctx.config.strategy.clone());
        let result = Backtester::new(strategy, series, ctx.config.backtest.clone()).run()?;
        ctx.metrics_cache
            .insert(&ctx.ticker, &config_hash, result.metrics.clone());
        Ok(result.metrics)
    }
}

#[async_trait]
impl PipelineStage for AnalysisStage {
    fn name(&self) -> &'static str {
        "Analysis"
    }

    async fn execute(&self, ctx: &mut TickContext) -> Result<StageResult> {
        let Some(chart) = ctx.chart.clone() else {
            return Ok(StageResult::stop(
                ErrorClass::Precondition,
                "analysis requires collected chart data",
            ));
        };

        // 1. Market correlation and regime flags.
        if let Some(reference) = &chart.reference_day {
            ctx.market_correlation = calculate_market_risk(reference, &chart.day);
            if let Some(correlation) = &ctx.market_correlation {
                info!(
                    "Analysis: beta {:.2}, corr {:.2}, market risk {}",
                    correlation.beta, correlation.correlation, correlation.market_risk
                );
            }
        } else {
            warn!("Analysis: no reference chart, skipping correlation");
        }

        // 2. Flash crash.
        let flash_crash = detect_flash_crash(&chart.day);
        if flash_crash.detected {
            warn!("Analysis: flash crash: {}", flash_crash.description);
        }
        ctx.flash_crash = Some(flash_crash);

        // 3. RSI divergence.
        let divergence = detect_rsi_divergence(&chart.day);
        info!("Analysis: divergence {:?} ({})", divergence.kind, divergence.confidence);
        ctx.rsi_divergence = Some(divergence);

        // 4. Two-gate backtest filter on full local history.
        let Some(history) = self.history_for(ctx) else {
            return Ok(StageResult::skip(
                SkipReason::NoSignal,
                "no usable history for the quick filter",
                serde_json::Value::Null,
            ));
        };
        let metrics = self.gate_metrics(ctx, &history)?;
        let cost_pct = ((ctx.config.backtest.commission + ctx.config.backtest.slippage)
            * rust_decimal::Decimal::TWO)
            .to_f64()
            .unwrap_or(0.0012);
        let gate = TwoGateFilter::new(ctx.config.filters.clone(), cost_pct).evaluate(&metrics);
        ctx.backtest_metrics = Some(metrics.clone());
        ctx.gate_report = Some(gate.clone());

        if !gate.tradeable() {
            let reason = if gate.researchable_only {
                format!("researchable only, not tradeable: {}", gate.reason)
            } else {
                format!("backtest gate failed: {}", gate.reason)
            };
            info!("Analysis: {}", reason);
            return Ok(StageResult::exit(
                TickOutcome::Skip {
                    reason: SkipReason::NoCandidate,
                },
                Decision::Hold,
                reason,
                json!({
                    "gate": gate,
                    "researchable_only": gate.researchable_only,
                }),
            ));
        }

        // 5. Rule signal for the current bar (entry only; positions are
        // managed upstream by the hybrid stage).
        let holding = ctx.position_detail.is_some();
        if !holding {
            let mut strategy = BreakoutStrategy::new(&ctx.ticker, ctx.config.strategy.clone());
            strategy.prepare_indicators(&history);
            let equity = ctx
                .portfolio_status
                .as_ref()
                .map(|s| s.quote_balance + s.total_current_value)
                .unwrap_or_default();
            let shadow = Portfolio::new(equity);
            ctx.rule_signal = strategy.generate_signal(history.len() - 1, &shadow);
        }

        // 6. AI review.
        let grade = Grade::from_score(
            ctx.scan_result
                .as_ref()
                .and_then(|s| s.selected_coins.first())
                .map(|c| c.backtest.score)
                .unwrap_or(50.0),
            true,
        );
        let review = match &ctx.ports.ai {
            Some(ai) => {
                let payload = ReviewPayload {
                    ticker: ctx.ticker.clone(),
                    current_price: ctx
                        .current_status
                        .as_ref()
                        .and_then(|s| s.current_price.to_f64()),
                    quote_balance: ctx
                        .current_status
                        .as_ref()
                        .and_then(|s| s.quote_balance.to_f64()),
                    indicators: ctx.indicator_snapshot.clone(),
                    orderbook: ctx.orderbook_summary.clone(),
                    fear_greed: ctx.fear_greed.clone(),
                    market_correlation: ctx
                        .market_correlation
                        .as_ref()
                        .map(serde_json::to_value)
                        .transpose()?,
                    flash_crash: ctx.flash_crash.as_ref().map(serde_json::to_value).transpose()?,
                    rsi_divergence: ctx
                        .rsi_divergence
                        .as_ref()
                        .map(serde_json::to_value)
                        .transpose()?,
                    backtest_metrics: ctx.backtest_metrics.clone(),
                    gate_report: ctx.gate_report.clone(),
                    rule_signal: ctx.rule_signal.as_ref().map(serde_json::to_value).transpose()?,
                };
                let analyzer = EntryAnalyzer::new(ai.clone());
                match analyzer.analyze_entry(&payload, grade).await {
                    Ok(review) => review,
                    Err(e) => {
                        return Ok(StageResult::stop(
                            ErrorClass::Transient,
                            format!("AI review failed: {}", e),
                        ));
                    }
                }
            }
            None => {
                // No AI port: trade purely on the rule signal.
                let mut review = EntryReview::from_grade_only(&ctx.ticker, grade);
                if !holding
                    && ctx
                        .rule_signal
                        .as_ref()
                        .is_some_and(|s| s.action == SignalAction::Buy)
                {
                    review.decision = Decision::Buy;
                    review.confidence = Confidence::Medium;
                    review.reason = "rule gates passed (AI disabled)".to_string();
                }
                review
            }
        };
        info!(
            "Analysis: review {} ({}) for {}",
            review.decision, review.confidence, ctx.ticker
        );

        // 7. Hard-rule validation of the decision.
        let validation_ctx = ValidationContext {
            flash_crash_detected: ctx.flash_crash.as_ref().is_some_and(|f| f.detected),
            divergence: ctx.rsi_divergence.as_ref().map(|d| d.kind),
            market_risk: ctx.market_correlation.as_ref().map(|c| c.market_risk),
            fear_greed_value: ctx.fear_greed.as_ref().map(|f| f.value),
        };
        let outcome = self.validator.validate(review.decision, &validation_ctx);
        let mut review = review;
        if let Some(override_decision) = outcome.override_decision {
            warn!(
                "Analysis: decision {} overridden to {} ({})",
                review.decision, override_decision, outcome.reason
            );
            review.decision = override_decision;
            review.confidence = Confidence::Low;
            review.reason = format!("{} [validator: {}]", review.reason, outcome.reason);
        }
        ctx.validation = Some(outcome);
        ctx.ai_review = Some(review);

        Ok(StageResult::proceed("analysis complete"))
    }
}
