//! AI review adapter: prompt assembly, the strict-JSON response contract, and
//! the entry score derived from a parsed review.
//!
//! The reviewer is prompted as a risk hunter: its job is to find reasons to
//! block the trade, and to approve only when it cannot. All hard overrides
//! happen after the review in [`crate::application::analysis::AiDecisionValidator`];
//! nothing here is load-bearing for safety.

use crate::application::backtest::{GateReport, Grade, PerformanceMetrics};
use crate::domain::indicators::IndicatorSnapshot;
use crate::domain::market::{FearGreedIndex, OrderbookSummary};
use crate::domain::ports::AiPort;
use crate::domain::trading::{Confidence, Decision};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Parsed and scored AI entry review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryReview {
    pub ticker: String,
    pub decision: Decision,
    pub confidence: Confidence,
    /// Composite 0..100, combining the AI verdict with the backtest grade.
    pub score: f64,
    pub reason: String,
    pub rejection_reasons: Vec<String>,
    pub key_indicators: Vec<String>,
    pub safety_conditions_met: BTreeMap<String, bool>,
    pub risk_conditions_detected: BTreeMap<String, bool>,
    pub backtest_grade: Grade,
    pub ai_used: bool,
}

impl EntryReview {
    /// Stand-in review when the AI port is absent: neutral hold with a score
    /// estimated from the backtest grade alone.
    pub fn from_grade_only(ticker: &str, grade: Grade) -> Self {
        let score = match grade {
            Grade::StrongPass => 70.0,
            Grade::WeakPass => 50.0,
            Grade::Fail => 30.0,
        };
        Self {
            ticker: ticker.to_string(),
            decision: Decision::Hold,
            confidence: Confidence::Medium,
            score,
            reason: "AI review disabled; grade-derived score".to_string(),
            rejection_reasons: vec![],
            key_indicators: vec![],
            safety_conditions_met: BTreeMap::new(),
            risk_conditions_detected: BTreeMap::new(),
            backtest_grade: grade,
            ai_used: false,
        }
    }
}

/// Raw JSON shape the model must return.
#[derive(Debug, Deserialize)]
struct RawReview {
    decision: String,
    #[serde(default)]
    confidence: Option<String>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    rejection_reasons: Vec<String>,
    #[serde(default)]
    key_indicators: Vec<String>,
    #[serde(default)]
    safety_conditions_met: BTreeMap<String, bool>,
    #[serde(default)]
    risk_conditions_detected: BTreeMap<String, bool>,
}

pub fn response_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["decision", "confidence", "reason"],
        "properties": {
            "decision": { "type": "string", "enum": ["buy", "sell", "hold"] },
            "confidence": { "type": "string", "enum": ["high", "medium", "low"] },
            "reason": { "type": "string" },
            "rejection_reasons": { "type": "array", "items": { "type": "string" } },
            "key_indicators": { "type": "array", "items": { "type": "string" } },
            "safety_conditions_met": { "type": "object", "additionalProperties": { "type": "boolean" } },
            "risk_conditions_detected": { "type": "object", "additionalProperties": { "type": "boolean" } }
        }
    })
}

/// Everything the prompt builder may cite.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReviewPayload {
    pub ticker: String,
    pub current_price: Option<f64>,
    pub quote_balance: Option<f64>,
    pub indicators: Option<IndicatorSnapshot>,
    pub orderbook: Option<OrderbookSummary>,
    pub fear_greed: Option<FearGreedIndex>,
    pub market_correlation: Option<serde_json::Value>,
    pub flash_crash: Option<serde_json::Value>,
    pub rsi_divergence: Option<serde_json::Value>,
    pub backtest_metrics: Option<PerformanceMetrics>,
    pub gate_report: Option<GateReport>,
    pub rule_signal: Option<serde_json::Value>,
}

pub struct EntryAnalyzer {
    port: Arc<dyn AiPort>,
}

impl EntryAnalyzer {
    pub fn new(port: Arc<dyn AiPort>) -> Self {
        Self { port }
    }

    pub async fn analyze_entry(
        &self,
        payload: &ReviewPayload,
        backtest_grade: Grade,
    ) -> Result<EntryReview> {
        let system = build_system_prompt(&payload.ticker, backtest_grade, payload);
        let user = build_user_prompt(payload)?;
        let raw = self
            .port
            .complete(&system, &user, &response_schema())
            .await
            .context("AI review request failed")?;
        parse_review(&payload.ticker, &raw, backtest_grade)
    }
}

pub fn parse_review(
    ticker: &str,
    raw: &serde_json::Value,
    backtest_grade: Grade,
) -> Result<EntryReview> {
    let parsed: RawReview =
        serde_json::from_value(raw.clone()).context("AI response did not match schema")?;

    let decision = match parsed.decision.to_lowercase().as_str() {
        "buy" => Decision::Buy,
        "sell" => Decision::Sell,
        _ => Decision::Hold,
    };
    let confidence = match parsed.confidence.as_deref() {
        Some("high") => Confidence::High,
        Some("low") => Confidence::Low,
        _ => Confidence::Medium,
    };

    let score = entry_score(
        decision,
        confidence,
        backtest_grade,
        parsed.rejection_reasons.len(),
        parsed.safety_conditions_met.values().filter(|v| **v).count(),
        parsed.risk_conditions_detected.values().filter(|v| **v).count(),
    );

    Ok(EntryReview {
        ticker: ticker.to_string(),
        decision,
        confidence,
        score,
        reason: parsed.reason,
        rejection_reasons: parsed.rejection_reasons,
        key_indicators: parsed.key_indicators,
        safety_conditions_met: parsed.safety_conditions_met,
        risk_conditions_detected: parsed.risk_conditions_detected,
        backtest_grade,
        ai_used: true,
    })
}

/// 0..100 composite: base 50, adjusted by verdict, confidence, backtest
/// grade, rejection count, and the safety/risk flag tallies.
fn entry_score(
    decision: Decision,
    confidence: Confidence,
    grade: Grade,
    rejections: usize,
    safety_met: usize,
    risks_detected: usize,
) -> f64 {
    let mut score: f64 = 50.0;
    score += match decision {
        Decision::Buy => 15.0,
        _ => -20.0,
    };
    score += match confidence {
        Confidence::High => 10.0,
        Confidence::Medium => 0.0,
        Confidence::Low => -10.0,
    };
    score += match grade {
        Grade::StrongPass => 15.0,
        Grade::WeakPass => 5.0,
        Grade::Fail => -15.0,
    };
    score -= rejections as f64 * 5.0;
    score += safety_met as f64 * 3.0;
    score -= risks_detected as f64 * 8.0;
    score.clamp(0.0, 100.0)
}

fn build_system_prompt(ticker: &str, grade: Grade, payload: &ReviewPayload) -> String {
    let metrics_block = payload
        .backtest_metrics
        .as_ref()
        .map(|m| {
            format!(
                "- total return: {:.2}%\n- win rate: {:.2}%\n- sharpe: {:.2}\n- profit factor: {:.2}\n- max drawdown: {:.2}%",
                m.total_return, m.win_rate, m.sharpe_ratio, m.profit_factor, m.max_drawdown
            )
        })
        .unwrap_or_else(|| "- no backtest metrics available".to_string());

    format!(
        "You are a risk hunter reviewing a proposed crypto spot entry.\n\
         Your job is to actively look for reasons to BLOCK this trade; approve\n\
         it only when you cannot find a convincing one. Past performance does\n\
         not guarantee future results, and a regime change invalidates any\n\
         backtest.\n\n\
         ## Situation\n\
         - ticker: {ticker}\n\
         - position: none (new entry under review)\n\
         - strategy: volatility breakout\n\n\
         ## Backtest ({grade})\n\
         {metrics_block}\n\n\
         ## Risk conditions (any one means HOLD)\n\
         1. reference-asset crash risk (market_risk = high)\n\
         2. bearish RSI divergence\n\
         3. flash crash detected\n\
         4. extreme greed (fear/greed above 75)\n\
         5. volume not confirming price\n\n\
         ## Safety conditions (all required for BUY)\n\
         1. orderbook not stacked against the entry\n\
         2. clear trend (ADX above 25)\n\
         3. breakout volume above 1.5x average\n\n\
         Respond with JSON only, matching the provided schema exactly."
    )
}

fn build_user_prompt(payload: &ReviewPayload) -> Result<String> {
    let mut sections = Vec::new();
    sections.push(format!("## Entry review request: {}", payload.ticker));

    if let Some(price) = payload.current_price {
        sections.push(format!("### Current price\n{:.0}", price));
    }
    if let Some(balance) = payload.quote_balance {
        sections.push(format!("### Quote balance\n{:.0}", balance));
    }
    if let Some(signal) = &payload.rule_signal {
        sections.push(format!(
            "### Rule gates\n{}\nThe rules passed, but a breakout can still be a fakeout.",
            serde_json::to_string_pretty(signal)?
        ));
    }
    if let Some(indicators) = &payload.indicators {
        sections.push(format!(
            "### Technical indicators\n{}",
            serde_json::to_string_pretty(indicators)?
        ));
    }
    if let Some(orderbook) = &payload.orderbook {
        sections.push(format!(
            "### Orderbook\n{}",
            serde_json::to_string_pretty(orderbook)?
        ));
    }
    if let Some(fear_greed) = &payload.fear_greed {
        sections.push(format!(
            "### Fear/greed\n{}/100 ({})",
            fear_greed.value, fear_greed.classification
        ));
    }
    if let Some(correlation) = &payload.market_correlation {
        sections.push(format!(
            "### Market correlation\n{}",
            serde_json::to_string_pretty(correlation)?
        ));
    }
    if let Some(flash_crash) = &payload.flash_crash {
        sections.push(format!(
            "### Flash crash\n{}",
            serde_json::to_string_pretty(flash_crash)?
        ));
    }
    if let Some(divergence) = &payload.rsi_divergence {
        sections.push(format!(
            "### RSI divergence\n{}",
            serde_json::to_string_pretty(divergence)?
        ));
    }
    if let Some(gate) = &payload.gate_report {
        sections.push(format!(
            "### Backtest gates\ntrading pass: {}, research pass: {}, expectancy net: {:.3}R",
            gate.trading_pass, gate.research_pass, gate.expectancy.net
        ));
    }

    sections.push("### Task\nDecide buy or hold for this entry. JSON only.".to_string());
    Ok(sections.join("\n\n"))
}
