//! Trading pipeline: stage contract, shared tick context, and orchestrator.
//!
//! A pipeline is an ordered list of stages run once per tick. Stages mutate
//! the shared [`TickContext`]; outputs are written once and never reverted.
//! A stage ends the tick by returning `Skip` (clean no-trade), `Exit` (the
//! tick's outcome is this stage's payload), or `Stop` (failure). Errors never
//! escape the orchestrator: a stage that returns `Err` is converted through
//! its own `handle_error`.

pub mod analysis_stage;
pub mod data_collection_stage;
pub mod execution_stage;
pub mod hybrid_stage;

pub use analysis_stage::AnalysisStage;
pub use data_collection_stage::DataCollectionStage;
pub use execution_stage::ExecutionStage;
pub use hybrid_stage::HybridRiskCheckStage;

use crate::application::ai::EntryReview;
use crate::application::analysis::{
    DivergenceReport, FlashCrashReport, MarketCorrelation, ValidationOutcome,
};
use crate::application::backtest::{GateReport, MetricsCache, PerformanceMetrics};
use crate::application::position::PortfolioManager;
use crate::application::risk_management::{CircuitCheck, FrequencyCheck, RiskManager};
use crate::application::scanner::ScanResult;
use crate::config::BotConfig;
use crate::domain::errors::ErrorClass;
use crate::domain::indicators::IndicatorSnapshot;
use crate::domain::market::{FearGreedIndex, OhlcvSeries, Orderbook, OrderbookSummary};
use crate::domain::ports::{AiPort, ExchangePort, IdempotencyPort, MarketDataPort};
use crate::domain::trading::{
    Confidence, Decision, ExitTrigger, PortfolioPosition, PortfolioStatus, Signal, TradeReceipt,
    TradingMode,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared port handles. Stages hold references, never ownership, and never
/// mutate the ports.
#[derive(Clone)]
pub struct Ports {
    pub exchange: Arc<dyn ExchangePort>,
    pub ai: Option<Arc<dyn AiPort>>,
    pub market_data: Option<Arc<dyn MarketDataPort>>,
    pub idempotency: Arc<dyn IdempotencyPort>,
}

/// Chart data collected for the tick's ticker.
#[derive(Debug, Clone)]
pub struct ChartBundle {
    pub day: OhlcvSeries,
    pub minute60: Option<OhlcvSeries>,
    pub minute15: Option<OhlcvSeries>,
    pub reference_day: Option<OhlcvSeries>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentStatus {
    pub quote_balance: Decimal,
    pub base_balance: Decimal,
    pub current_price: Decimal,
}

/// Per-tick mutable state. Owned by the tick; fields are populated in
/// pipeline order.
pub struct TickContext {
    pub ticker: String,
    pub tick_time: DateTime<Utc>,
    pub config: Arc<BotConfig>,
    pub ports: Ports,
    pub risk: Arc<RiskManager>,
    pub portfolio_manager: Arc<PortfolioManager>,
    /// Backtest metrics cache for this tick's scan cycle.
    pub metrics_cache: Arc<MetricsCache>,

    pub portfolio_status: Option<PortfolioStatus>,
    pub trading_mode: Option<TradingMode>,
    pub circuit_check: Option<CircuitCheck>,
    pub frequency_check: Option<FrequencyCheck>,
    pub scan_result: Option<ScanResult>,

    pub chart: Option<ChartBundle>,
    pub orderbook: Option<Orderbook>,
    pub orderbook_summary: Option<OrderbookSummary>,
    pub current_status: Option<CurrentStatus>,
    pub fear_greed: Option<FearGreedIndex>,
    pub indicator_snapshot: Option<IndicatorSnapshot>,
    pub position_detail: Option<PortfolioPosition>,

    pub market_correlation: Option<MarketCorrelation>,
    pub flash_crash: Option<FlashCrashReport>,
    pub rsi_divergence: Option<DivergenceReport>,
    pub gate_report: Option<GateReport>,
    pub backtest_metrics: Option<PerformanceMetrics>,
    pub rule_signal: Option<Signal>,
    pub ai_review: Option<EntryReview>,
    pub validation: Option<ValidationOutcome>,

    pub trade_receipt: Option<TradeReceipt>,
}

impl TickContext {
    pub fn new(
        ticker: impl Into<String>,
        config: Arc<BotConfig>,
        ports: Ports,
        risk: Arc<RiskManager>,
        portfolio_manager: Arc<PortfolioManager>,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            tick_time: Utc::now(),
            config,
            ports,
            risk,
            portfolio_manager,
            metrics_cache: Arc::new(MetricsCache::new()),
            portfolio_status: None,
            trading_mode: None,
            circuit_check: None,
            frequency_check: None,
            scan_result: None,
            chart: None,
            orderbook: None,
            orderbook_summary: None,
            current_status: None,
            fear_greed: None,
            indicator_snapshot: None,
            position_detail: None,
            market_correlation: None,
            flash_crash: None,
            rsi_divergence: None,
            gate_report: None,
            backtest_metrics: None,
            rule_signal: None,
            ai_review: None,
            validation: None,
            trade_receipt: None,
        }
    }
}

/// What a stage asks the orchestrator to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageAction {
    Continue,
    Skip,
    Stop,
    Exit,
}

/// Clean no-trade reasons, surfaced in the outcome taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientCapital,
    NoCandidate,
    FrequencyThrottle,
    MaxPositions,
    NoSignal,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::InsufficientCapital => "insufficient_capital",
            SkipReason::NoCandidate => "no_candidate",
            SkipReason::FrequencyThrottle => "frequency_throttle",
            SkipReason::MaxPositions => "max_positions",
            SkipReason::NoSignal => "no_signal",
        };
        write!(f, "{}", s)
    }
}

/// Taxonomy of a finished tick, rendered as
/// `completed/success/<decision>`, `completed/skip/<reason>`,
/// `completed/exit/<trigger>`, or `failed/<stage>/<class>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TickOutcome {
    Success { decision: Decision },
    Skip { reason: SkipReason },
    Exit { trigger: ExitTrigger },
    Failure { stage: String, class: ErrorClass },
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickOutcome::Success { decision } => write!(f, "completed/success/{}", decision),
            TickOutcome::Skip { reason } => write!(f, "completed/skip/{}", reason),
            TickOutcome::Exit { trigger } => write!(f, "completed/exit/{}", trigger),
            TickOutcome::Failure { stage, class } => write!(f, "failed/{}/{}", stage, class),
        }
    }
}

/// Result of one stage invocation.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub success: bool,
    pub action: StageAction,
    /// Set when the stage ends the pipeline with a definite outcome.
    pub outcome: Option<TickOutcome>,
    pub decision: Option<Decision>,
    pub message: String,
    pub data: serde_json::Value,
    pub error_class: Option<ErrorClass>,
}

impl StageResult {
    pub fn proceed(message: impl Into<String>) -> Self {
        Self {
            success: true,
            action: StageAction::Continue,
            outcome: None,
            decision: None,
            message: message.into(),
            data: serde_json::Value::Null,
            error_class: None,
        }
    }

    pub fn skip(reason: SkipReason, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            action: StageAction::Skip,
            outcome: Some(TickOutcome::Skip { reason }),
            decision: Some(Decision::Hold),
            message: message.into(),
            data,
            error_class: None,
        }
    }

    pub fn exit(
        outcome: TickOutcome,
        decision: Decision,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            success: true,
            action: StageAction::Exit,
            outcome: Some(outcome),
            decision: Some(decision),
            message: message.into(),
            data,
            error_class: None,
        }
    }

    pub fn stop(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            success: false,
            action: StageAction::Stop,
            outcome: None,
            decision: Some(Decision::Hold),
            message: message.into(),
            data: serde_json::Value::Null,
            error_class: Some(class),
        }
    }
}

/// Capability set each stage implements. No inheritance: the orchestrator
/// only ever sees this trait.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap precondition; returning false skips the stage silently.
    fn pre_execute(&self, _ctx: &TickContext) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut TickContext) -> Result<StageResult>;

    /// Post-processing hook; default is a no-op.
    fn post_execute(&self, _ctx: &mut TickContext, _result: &StageResult) {}

    /// Convert a raised error into a failure result. Raising out of a stage
    /// is a bug; this is the containment boundary.
    fn handle_error(&self, error: &anyhow::Error) -> StageResult {
        StageResult::stop(
            ErrorClass::Fatal,
            format!("{} stage error: {}", self.name(), error),
        )
    }
}

/// Outcome of a whole tick, suitable for logging and notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickResult {
    pub ticker: String,
    pub outcome: TickOutcome,
    pub decision: Decision,
    pub confidence: Confidence,
    pub reason: String,
    pub data: serde_json::Value,
}

pub struct TradingPipeline {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl TradingPipeline {
    pub fn new(stages: Vec<Box<dyn PipelineStage>>) -> Self {
        Self { stages }
    }

    /// Run the pipeline under the configured tick deadline.
    pub async fn execute(&self, ctx: &mut TickContext) -> TickResult {
        let deadline = std::time::Duration::from_secs(ctx.config.trading.tick_deadline_secs);
        let ticker = ctx.ticker.clone();
        match tokio::time::timeout(deadline, self.run(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                error!("Pipeline: tick deadline expired after {:?}", deadline);
                TickResult {
                    ticker,
                    outcome: TickOutcome::Failure {
                        stage: "pipeline".to_string(),
                        class: ErrorClass::Transient,
                    },
                    decision: Decision::Hold,
                    confidence: Confidence::Low,
                    reason: format!("tick deadline expired after {:?}", deadline),
                    data: serde_json::Value::Null,
                }
            }
        }
    }

    async fn run(&self, ctx: &mut TickContext) -> TickResult {
        info!("Pipeline: tick start for {}", ctx.ticker);

        for stage in &self.stages {
            if !stage.pre_execute(ctx) {
                info!("Pipeline: {} skipped (pre_execute)", stage.name());
                continue;
            }

            info!("Pipeline: running {}", stage.name());
            let result = match stage.execute(ctx).await {
                Ok(result) => result,
                Err(e) => {
                    error!("Pipeline: {} raised: {:#}", stage.name(), e);
                    stage.handle_error(&e)
                }
            };
            stage.post_execute(ctx, &result);

            if !result.success || result.action == StageAction::Stop {
                warn!("Pipeline: {} failed: {}", stage.name(), result.message);
                return TickResult {
                    ticker: ctx.ticker.clone(),
                    outcome: TickOutcome::Failure {
                        stage: stage.name().to_string(),
                        class: result.error_class.unwrap_or(ErrorClass::Fatal),
                    },
                    decision: Decision::Hold,
                    confidence: Confidence::Low,
                    reason: result.message,
                    data: result.data,
                };
            }

            match result.action {
                StageAction::Continue => continue,
                StageAction::Skip | StageAction::Exit => {
                    let decision = result.decision.unwrap_or(Decision::Hold);
                    let outcome = result
                        .outcome
                        .unwrap_or(TickOutcome::Success { decision });
                    info!("Pipeline: {} ended the tick: {}", stage.name(), outcome);
                    return TickResult {
                        ticker: ctx.ticker.clone(),
                        outcome,
                        decision,
                        confidence: ctx
                            .ai_review
                            .as_ref()
                            .map(|r| r.confidence)
                            .unwrap_or(Confidence::Medium),
                        reason: result.message,
                        data: result.data,
                    };
                }
                StageAction::Stop => unreachable!("handled above"),
            }
        }

        // All stages ran to completion without an explicit exit.
        let decision = ctx
            .ai_review
            .as_ref()
            .map(|r| r.decision)
            .unwrap_or(Decision::Hold);
        TickResult {
            ticker: ctx.ticker.clone(),
            outcome: TickOutcome::Success { decision },
            decision,
            confidence: ctx
                .ai_review
                .as_ref()
                .map(|r| r.confidence)
                .unwrap_or(Confidence::Medium),
            reason: "pipeline completed".to_string(),
            data: serde_json::Value::Null,
        }
    }
}

/// The full 4-stage hybrid pipeline: mode arbitration (with scanning),
/// data collection, analysis, execution.
pub fn create_hybrid_pipeline(
    config: &BotConfig,
    data_sync: Arc<crate::application::scanner::HistoricalDataSync>,
) -> TradingPipeline {
    TradingPipeline::new(vec![
        Box::new(HybridRiskCheckStage::new(
            config.scanner.enable_scanning,
            data_sync.clone(),
        )),
        Box::new(DataCollectionStage::new()),
        Box::new(AnalysisStage::new(data_sync)),
        Box::new(ExecutionStage::new()),
    ])
}

/// Degenerate variant that never scans: the configured ticker is traded as-is.
pub fn create_single_ticker_pipeline(
    data_sync: Arc<crate::application::scanner::HistoricalDataSync>,
) -> TradingPipeline {
    TradingPipeline::new(vec![
        Box::new(HybridRiskCheckStage::new(false, data_sync.clone())),
        Box::new(DataCollectionStage::new()),
        Box::new(AnalysisStage::new(data_sync)),
        Box::new(ExecutionStage::new()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_taxonomy_rendering() {
        assert_eq!(
            TickOutcome::Success { decision: Decision::Buy }.to_string(),
            "completed/success/buy"
        );
        assert_eq!(
            TickOutcome::Skip { reason: SkipReason::InsufficientCapital }.to_string(),
            "completed/skip/insufficient_capital"
        );
        assert_eq!(
            TickOutcome::Exit { trigger: ExitTrigger::StopLoss }.to_string(),
            "completed/exit/stop_loss"
        );
        assert_eq!(
            TickOutcome::Failure {
                stage: "analysis".to_string(),
                class: ErrorClass::Fatal
            }
            .to_string(),
            "failed/analysis/fatal"
        );
    }

    #[test]
    fn test_stage_result_constructors() {
        let result = StageResult::skip(
            SkipReason::NoCandidate,
            "nothing to trade",
            serde_json::Value::Null,
        );
        assert!(result.success);
        assert_eq!(result.action, StageAction::Skip);
        assert_eq!(result.decision, Some(Decision::Hold));

        let result = StageResult::stop(ErrorClass::DataQuality, "broken candles");
        assert!(!result.success);
        assert_eq!(result.error_class, Some(ErrorClass::DataQuality));
    }
}
