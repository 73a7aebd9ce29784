//! Multi-coin scanner: liquidity scan, sector diversification, data sync,
//! parallel backtest, and final selection.

pub mod data_sync;
pub mod liquidity;
pub mod multi_backtest;
pub mod sectors;

pub use data_sync::{HistoricalDataSync, SyncOutcome, SyncStatus};
pub use liquidity::LiquidityScanner;
pub use multi_backtest::{BacktestScore, MultiCoinBacktest};
pub use sectors::{CoinSector, SectorDiversifier, coin_sector};

use crate::application::ai::{EntryAnalyzer, EntryReview, ReviewPayload};
use crate::application::backtest::Grade;
use crate::config::ScannerOptions;
use crate::domain::market::CoinInfo;
use crate::domain::trading::{Confidence, Decision};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Final verdict for a scanned coin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalGrade {
    #[serde(rename = "STRONG BUY")]
    StrongBuy,
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "WEAK BUY")]
    WeakBuy,
    #[serde(rename = "HOLD")]
    Hold,
    #[serde(rename = "FAIL")]
    Fail,
}

impl fmt::Display for FinalGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinalGrade::StrongBuy => "STRONG BUY",
            FinalGrade::Buy => "BUY",
            FinalGrade::WeakBuy => "WEAK BUY",
            FinalGrade::Hold => "HOLD",
            FinalGrade::Fail => "FAIL",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinCandidate {
    pub ticker: String,
    pub symbol: String,
    pub coin_info: Option<CoinInfo>,
    pub backtest: BacktestScore,
    pub review: Option<EntryReview>,
    pub final_score: f64,
    pub final_grade: FinalGrade,
    pub selected: bool,
    pub selection_reason: String,
}

impl CoinCandidate {
    pub fn is_ready_for_entry(&self) -> bool {
        self.selected
            && self
                .review
                .as_ref()
                .is_none_or(|r| r.decision == Decision::Buy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub scan_time: DateTime<Utc>,
    pub liquidity_scanned: usize,
    pub backtest_passed: usize,
    pub ai_analyzed: usize,
    pub candidates: Vec<CoinCandidate>,
    pub selected_coins: Vec<CoinCandidate>,
    pub all_backtest_scores: Vec<BacktestScore>,
    pub duration_secs: f64,
}

impl ScanResult {
    fn empty(scan_time: DateTime<Utc>) -> Self {
        Self {
            scan_time,
            liquidity_scanned: 0,
            backtest_passed: 0,
            ai_analyzed: 0,
            candidates: vec![],
            selected_coins: vec![],
            all_backtest_scores: vec![],
            duration_secs: 0.0,
        }
    }
}

/// Orchestrates the five scan phases.
pub struct CoinSelector {
    liquidity: LiquidityScanner,
    diversifier: SectorDiversifier,
    data_sync: Arc<HistoricalDataSync>,
    multi_backtest: MultiCoinBacktest,
    analyzer: Option<EntryAnalyzer>,
    options: ScannerOptions,
    quote_currency: String,
    backtest_interval: crate::domain::market::Interval,
}

impl CoinSelector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        liquidity: LiquidityScanner,
        data_sync: Arc<HistoricalDataSync>,
        multi_backtest: MultiCoinBacktest,
        analyzer: Option<EntryAnalyzer>,
        options: ScannerOptions,
        quote_currency: impl Into<String>,
        backtest_interval: crate::domain::market::Interval,
    ) -> Self {
        let diversifier =
            SectorDiversifier::new(options.one_per_sector, options.exclude_unknown_sector);
        Self {
            liquidity,
            diversifier,
            data_sync,
            multi_backtest,
            analyzer,
            options,
            quote_currency: quote_currency.into(),
            backtest_interval,
        }
    }

    pub async fn select_coins(&self, exclude_tickers: &[String]) -> Result<ScanResult> {
        let scan_time = Utc::now();
        let started = std::time::Instant::now();

        // Phase 1: liquidity.
        let top_coins = self
            .liquidity
            .scan_top_coins(&self.quote_currency, self.options.liquidity_top_n, true)
            .await?;
        let mut coins: Vec<CoinInfo> = top_coins
            .into_iter()
            .filter(|c| !exclude_tickers.contains(&c.ticker))
            .collect();
        info!(
            "CoinSelector: {} liquid candidates after excluding held coins",
            coins.len()
        );
        if coins.is_empty() {
            return Ok(ScanResult::empty(scan_time));
        }

        // Phase 2: sector diversification.
        if self.options.enable_sector_diversification {
            let before = coins.len();
            coins = self
                .diversifier
                .select_diversified(&coins, self.options.liquidity_top_n);
            info!("CoinSelector: sector diversification {} -> {}", before, coins.len());
        }
        if coins.is_empty() {
            return Ok(ScanResult::empty(scan_time));
        }
        let liquidity_scanned = coins.len();

        // Phase 3: data sync. Failures downgrade individual tickers only.
        let tickers: Vec<String> = coins.iter().map(|c| c.ticker.clone()).collect();
        let statuses = self
            .data_sync
            .sync_multiple(
                &tickers,
                self.backtest_interval,
                Some(self.options.sync_years),
                self.options.max_concurrent_sync,
            )
            .await;
        for status in statuses.iter().filter(|s| s.outcome == SyncOutcome::Failed) {
            warn!(
                "CoinSelector: sync failed for {}: {}",
                status.ticker,
                status.error.as_deref().unwrap_or("unknown")
            );
        }

        // Phase 4: parallel backtest.
        let coin_infos: HashMap<String, CoinInfo> = coins
            .iter()
            .map(|c| (c.ticker.clone(), c.clone()))
            .collect();
        let scores = self
            .multi_backtest
            .run_parallel_backtest(tickers, coin_infos, self.options.backtest_top_n)
            .await;
        let passed: Vec<&BacktestScore> = scores.iter().filter(|s| s.passed).collect();
        let backtest_passed = passed.len();
        if passed.is_empty() {
            let mut result = ScanResult::empty(scan_time);
            result.liquidity_scanned = liquidity_scanned;
            result.all_backtest_scores = scores;
            result.duration_secs = started.elapsed().as_secs_f64();
            return Ok(result);
        }

        // Phase 5a: AI review of the surviving candidates.
        let mut candidates = Vec::new();
        let mut ai_analyzed = 0;
        for score in passed.iter().take(self.options.ai_top_n.max(1)) {
            let review = match &self.analyzer {
                Some(analyzer) => {
                    let payload = ReviewPayload {
                        ticker: score.ticker.clone(),
                        backtest_metrics: score.metrics.clone(),
                        gate_report: score.gate.clone(),
                        ..Default::default()
                    };
                    match analyzer.analyze_entry(&payload, score.grade).await {
                        Ok(review) => {
                            ai_analyzed += 1;
                            Some(review)
                        }
                        Err(e) => {
                            warn!("CoinSelector: AI review failed for {}: {}", score.ticker, e);
                            None
                        }
                    }
                }
                None => None,
            };
            candidates.push(self.build_candidate((*score).clone(), review));
        }

        // Phase 5b: final selection.
        let mut selectable: Vec<CoinCandidate> =
            candidates.iter().filter(|c| c.selected).cloned().collect();
        selectable.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        selectable.truncate(self.options.final_select_n);
        for coin in &selectable {
            info!(
                "CoinSelector: selected {} ({:.1}, {})",
                coin.symbol, coin.final_score, coin.final_grade
            );
        }

        Ok(ScanResult {
            scan_time,
            liquidity_scanned,
            backtest_passed,
            ai_analyzed,
            candidates,
            selected_coins: selectable,
            all_backtest_scores: scores,
            duration_secs: started.elapsed().as_secs_f64(),
        })
    }

    fn build_candidate(&self, backtest: BacktestScore, review: Option<EntryReview>) -> CoinCandidate {
        let final_score = final_score(&backtest, review.as_ref());
        let final_grade = final_grade(&backtest, review.as_ref(), final_score);
        let selected = should_select(&backtest, review.as_ref(), final_score);
        let selection_reason = selection_reason(&backtest, review.as_ref(), selected);
        CoinCandidate {
            ticker: backtest.ticker.clone(),
            symbol: backtest.symbol.clone(),
            coin_info: backtest.coin_info.clone(),
            backtest,
            review,
            final_score,
            final_grade,
            selected,
            selection_reason,
        }
    }
}

/// Backtest score at weight 0.6, AI score at 0.4. Without a review the AI
/// component defaults by grade (70/50/30).
fn final_score(backtest: &BacktestScore, review: Option<&EntryReview>) -> f64 {
    let ai_score = match review {
        Some(r) => r.score,
        None => match backtest.grade {
            Grade::StrongPass => 70.0,
            Grade::WeakPass => 50.0,
            Grade::Fail => 30.0,
        },
    };
    ((backtest.score * 0.6 + ai_score * 0.4) * 10.0).round() / 10.0
}

fn final_grade(backtest: &BacktestScore, review: Option<&EntryReview>, score: f64) -> FinalGrade {
    if !backtest.passed {
        return FinalGrade::Fail;
    }
    match review {
        Some(r) => {
            if r.decision != Decision::Buy {
                FinalGrade::Hold
            } else if r.confidence == Confidence::High && score >= 70.0 {
                FinalGrade::StrongBuy
            } else if matches!(r.confidence, Confidence::High | Confidence::Medium)
                && score >= 50.0
            {
                FinalGrade::Buy
            } else {
                FinalGrade::WeakBuy
            }
        }
        None => {
            if backtest.grade == Grade::StrongPass {
                FinalGrade::Buy
            } else {
                FinalGrade::WeakBuy
            }
        }
    }
}

fn should_select(backtest: &BacktestScore, review: Option<&EntryReview>, score: f64) -> bool {
    if !backtest.passed {
        return false;
    }
    if let Some(r) = review
        && r.decision != Decision::Buy
    {
        return false;
    }
    score >= 50.0
}

fn selection_reason(
    backtest: &BacktestScore,
    review: Option<&EntryReview>,
    selected: bool,
) -> String {
    if !selected {
        if !backtest.passed {
            return format!("backtest gate failed: {}", backtest.reason);
        }
        if let Some(r) = review
            && r.decision != Decision::Buy
        {
            return format!("AI vetoed: {}", r.reason);
        }
        return "composite score below 50".to_string();
    }
    match review {
        Some(r) => format!("backtest {} + AI {} confidence", backtest.grade, r.confidence),
        None => format!("backtest {}", backtest.grade),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::backtest::filter::FilterResults;

    fn score(passed: bool, value: f64, grade: Grade) -> BacktestScore {
        BacktestScore {
            ticker: "KRW-SOL".to_string(),
            symbol: "SOL".to_string(),
            passed,
            score: value,
            grade,
            metrics: None,
            filter_results: FilterResults::new(),
            gate: None,
            reason: "test".to_string(),
            coin_info: None,
        }
    }

    fn review(decision: Decision, confidence: Confidence, ai_score: f64) -> EntryReview {
        let mut r = EntryReview::from_grade_only("KRW-SOL", Grade::StrongPass);
        r.decision = decision;
        r.confidence = confidence;
        r.score = ai_score;
        r.ai_used = true;
        r
    }

    #[test]
    fn test_final_score_weights() {
        let bt = score(true, 80.0, Grade::StrongPass);
        let r = review(Decision::Buy, Confidence::High, 90.0);
        // 80 * 0.6 + 90 * 0.4 = 84
        assert!((final_score(&bt, Some(&r)) - 84.0).abs() < 1e-9);
        // Without AI: 80 * 0.6 + 70 * 0.4 = 76
        assert!((final_score(&bt, None) - 76.0).abs() < 1e-9);
    }

    #[test]
    fn test_ai_veto_blocks_selection() {
        let bt = score(true, 80.0, Grade::StrongPass);
        let hold = review(Decision::Hold, Confidence::High, 40.0);
        assert!(!should_select(&bt, Some(&hold), 64.0));
        assert_eq!(final_grade(&bt, Some(&hold), 64.0), FinalGrade::Hold);
    }

    #[test]
    fn test_failed_backtest_is_never_selected() {
        let bt = score(false, 90.0, Grade::Fail);
        let buy = review(Decision::Buy, Confidence::High, 95.0);
        assert!(!should_select(&bt, Some(&buy), 92.0));
        assert_eq!(final_grade(&bt, Some(&buy), 92.0), FinalGrade::Fail);
    }

    #[test]
    fn test_strong_buy_needs_high_confidence_and_score() {
        let bt = score(true, 80.0, Grade::StrongPass);
        let strong = review(Decision::Buy, Confidence::High, 90.0);
        assert_eq!(final_grade(&bt, Some(&strong), 84.0), FinalGrade::StrongBuy);
        let medium = review(Decision::Buy, Confidence::Medium, 90.0);
        assert_eq!(final_grade(&bt, Some(&medium), 84.0), FinalGrade::Buy);
        let low = review(Decision::Buy, Confidence::Low, 40.0);
        assert_eq!(final_grade(&bt, Some(&low), 45.0), FinalGrade::WeakBuy);
    }

    #[test]
    fn test_selection_ordering_is_stable() {
        // Equal inputs produce equal scores; sort is by score desc only, so
        // identical candidates keep their relative order.
        let bt = score(true, 70.0, Grade::StrongPass);
        let a = final_score(&bt, None);
        let b = final_score(&bt, None);
        assert_eq!(a, b);
    }
}
