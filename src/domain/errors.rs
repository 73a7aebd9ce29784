use rust_decimal::Decimal;
use thiserror::Error;

/// Classification of a pipeline failure, carried on the tick outcome so the
/// notification layer can distinguish retryable from fatal conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network timeout, 5xx; retried inside the port before surfacing.
    Transient,
    /// Broken OHLCV data that the validator could not repair.
    DataQuality,
    /// Missing history or ambiguous indicator state.
    Precondition,
    /// Circuit breaker, position limit, frequency throttle.
    Policy,
    /// No exchange connectivity, corrupted configuration.
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::DataQuality => "data_quality",
            ErrorClass::Precondition => "precondition",
            ErrorClass::Policy => "policy",
            ErrorClass::Fatal => "fatal",
        };
        write!(f, "{}", s)
    }
}

/// Errors related to order submission and portfolio bookkeeping
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("Insufficient funds: need {need}, available {available}")]
    InsufficientFunds { need: Decimal, available: Decimal },

    #[error("Position not found: {ticker}")]
    PositionNotFound { ticker: String },

    #[error("Invalid order: {reason}")]
    InvalidOrder { reason: String },

    #[error("Order execution failed: {reason}")]
    ExecutionFailed { reason: String },

    #[error("Duplicate order rejected by idempotency ledger: {key}")]
    DuplicateOrder { key: String },
}

/// Errors related to market data quality and connectivity
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("Chart data unavailable for {ticker}: {reason}")]
    ChartUnavailable { ticker: String, reason: String },

    #[error("Invalid market data for {ticker}: {reason}")]
    InvalidData { ticker: String, reason: String },

    #[error("Service timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    #[error("Insufficient history for {ticker}: {rows} rows, need {min_rows}")]
    InsufficientHistory {
        ticker: String,
        rows: usize,
        min_rows: usize,
    },
}

/// Risk/policy vetoes. These are expected outcomes, never bugs, and always
/// surface as a clean pipeline exit rather than an error.
#[derive(Debug, Error)]
pub enum RiskViolation {
    #[error("Daily loss limit breached: {loss_pct:.2}% <= {limit_pct:.2}%")]
    DailyLossLimit { loss_pct: f64, limit_pct: f64 },

    #[error("Weekly loss limit breached: {loss_pct:.2}% <= {limit_pct:.2}%")]
    WeeklyLossLimit { loss_pct: f64, limit_pct: f64 },

    #[error("Max positions reached: {count}/{max}")]
    MaxPositions { count: usize, max: usize },

    #[error("Trade throttled: {hours_since:.1}h since last trade (min {min_hours}h)")]
    FrequencyThrottle { hours_since: f64, min_hours: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_violation_formatting() {
        let violation = RiskViolation::DailyLossLimit {
            loss_pct: -11.0,
            limit_pct: -10.0,
        };
        let msg = violation.to_string();
        assert!(msg.contains("-11.00%"));
        assert!(msg.contains("-10.00%"));
    }

    #[test]
    fn test_error_class_display() {
        assert_eq!(ErrorClass::DataQuality.to_string(), "data_quality");
        assert_eq!(ErrorClass::Policy.to_string(), "policy");
    }
}
