pub mod portfolio;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Final per-tick trading decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Buy => write!(f, "buy"),
            Decision::Sell => write!(f, "sell"),
            Decision::Hold => write!(f, "hold"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::High => write!(f, "high"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Why a position was (or would be) closed. Closed set; new exit paths must
/// extend this enum rather than pass strings around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitTrigger {
    StopLoss,
    TakeProfit,
    TrailingStop,
    Fakeout,
    Timeout,
    TrendWeakening,
    AdxWeak,
    CircuitBreaker,
    Blocked,
}

impl fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitTrigger::StopLoss => "stop_loss",
            ExitTrigger::TakeProfit => "take_profit",
            ExitTrigger::TrailingStop => "trailing_stop",
            ExitTrigger::Fakeout => "fakeout",
            ExitTrigger::Timeout => "timeout",
            ExitTrigger::TrendWeakening => "trend_weakening",
            ExitTrigger::AdxWeak => "adx_weak",
            ExitTrigger::CircuitBreaker => "circuit_breaker",
            ExitTrigger::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Close,
}

/// Which sub-clause satisfied each entry gate, kept structured so reports and
/// AI prompts can cite the exact path taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryReason {
    pub trend: String,
    pub squeeze: String,
    pub breakout: String,
    pub volume: String,
    pub strong_breakout: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalReason {
    Entry(EntryReason),
    Exit { trigger: ExitTrigger, detail: String },
}

impl SignalReason {
    pub fn exit_trigger(&self) -> Option<ExitTrigger> {
        match self {
            SignalReason::Exit { trigger, .. } => Some(*trigger),
            SignalReason::Entry(_) => None,
        }
    }
}

/// Strategy output for one bar. A buy signal always carries stop-loss and
/// take-profit; size is filled in by the sizing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    pub price: Decimal,
    pub size: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub reason: SignalReason,
}

/// Fill report returned by the exchange port for a market order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeReceipt {
    pub order_id: String,
    pub ticker: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub total: Decimal,
    pub fee: Decimal,
    pub ts: DateTime<Utc>,
}

/// Open position inside the backtest portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub current_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub entry_commission: Decimal,
    pub entry_bar_index: Option<usize>,
}

impl Position {
    pub fn current_value(&self) -> Decimal {
        self.amount * self.current_price
    }

    pub fn profit_rate(&self) -> f64 {
        if self.entry_price <= Decimal::ZERO {
            return 0.0;
        }
        ((self.current_price - self.entry_price) / self.entry_price)
            .to_f64()
            .unwrap_or(0.0)
            * 100.0
    }
}

/// Completed round trip. Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub ticker: String,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl: Decimal,
    pub commission: Decimal,
    pub exit_trigger: Option<ExitTrigger>,
}

impl Trade {
    pub fn holding_period(&self) -> chrono::Duration {
        self.exit_time - self.entry_time
    }

    pub fn holding_hours(&self) -> f64 {
        self.holding_period().num_seconds() as f64 / 3600.0
    }

    pub fn pnl_pct(&self) -> f64 {
        let cost = self.entry_price * self.size;
        if cost <= Decimal::ZERO {
            return 0.0;
        }
        (self.pnl / cost).to_f64().unwrap_or(0.0) * 100.0
    }
}

/// Discriminator derived from portfolio state on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Entry,
    Management,
    Blocked,
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Entry => write!(f, "entry"),
            TradingMode::Management => write!(f, "management"),
            TradingMode::Blocked => write!(f, "blocked"),
        }
    }
}

/// One held coin in the live portfolio snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioPosition {
    pub ticker: String,
    pub symbol: String,
    pub amount: Decimal,
    pub avg_buy_price: Decimal,
    pub current_price: Decimal,
    pub entry_time: Option<DateTime<Utc>>,
    /// Trailing stop maintained by the position evaluator, if any.
    pub stop_loss: Option<Decimal>,
}

impl PortfolioPosition {
    pub fn current_value(&self) -> Decimal {
        self.amount * self.current_price
    }

    pub fn total_cost(&self) -> Decimal {
        self.amount * self.avg_buy_price
    }

    pub fn profit_loss(&self) -> Decimal {
        self.current_value() - self.total_cost()
    }

    pub fn profit_rate(&self) -> f64 {
        let cost = self.total_cost();
        if cost <= Decimal::ZERO {
            return 0.0;
        }
        (self.profit_loss() / cost).to_f64().unwrap_or(0.0) * 100.0
    }

    pub fn holding_hours(&self, now: DateTime<Utc>) -> f64 {
        match self.entry_time {
            Some(t) => (now - t).num_seconds() as f64 / 3600.0,
            None => 0.0,
        }
    }
}

/// Derived snapshot of the whole live portfolio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioStatus {
    pub positions: Vec<PortfolioPosition>,
    pub quote_balance: Decimal,
    pub total_invested: Decimal,
    pub total_current_value: Decimal,
    pub total_profit_loss: Decimal,
    pub total_profit_rate: f64,
    pub position_count: usize,
    pub trading_mode: TradingMode,
    pub can_open_new_position: bool,
    pub available_capital: Decimal,
    pub capital_per_position: Decimal,
}

impl PortfolioStatus {
    pub fn held_tickers(&self) -> Vec<String> {
        self.positions.iter().map(|p| p.ticker.clone()).collect()
    }

    pub fn position(&self, ticker: &str) -> Option<&PortfolioPosition> {
        self.positions.iter().find(|p| p.ticker == ticker)
    }
}
