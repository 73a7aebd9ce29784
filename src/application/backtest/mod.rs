pub mod engine;
pub mod filter;
pub mod performance;

pub use engine::{BacktestResult, Backtester, SlippageModel, SlippageStats};
pub use filter::{ExpectancyReport, FilterResults, GateReport, MetricsCache, TwoGateFilter};
pub use performance::PerformanceMetrics;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scanner backtest grade. STRONG PASS requires both a passing gate report
/// and a composite score of at least 70.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "STRONG PASS")]
    StrongPass,
    #[serde(rename = "WEAK PASS")]
    WeakPass,
    #[serde(rename = "FAIL")]
    Fail,
}

impl Grade {
    pub fn from_score(score: f64, passed: bool) -> Self {
        if !passed {
            Grade::Fail
        } else if score >= 70.0 {
            Grade::StrongPass
        } else {
            Grade::WeakPass
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grade::StrongPass => write!(f, "STRONG PASS"),
            Grade::WeakPass => write!(f, "WEAK PASS"),
            Grade::Fail => write!(f, "FAIL"),
        }
    }
}
