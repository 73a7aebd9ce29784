//! Live portfolio snapshotting and per-position management rules.

pub mod evaluator;

pub use evaluator::{MarketSnapshot, PositionAction, PositionActionType, PositionEvaluator};

use crate::application::risk_management::RiskManager;
use crate::config::TradingModeOptions;
use crate::domain::ports::ExchangePort;
use crate::domain::trading::{PortfolioPosition, PortfolioStatus, TradingMode};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Bot-side metadata the exchange cannot give us: when we entered and the
/// stop/target the strategy attached to the entry.
#[derive(Debug, Clone, Default)]
pub struct PositionMeta {
    pub entry_time: Option<DateTime<Utc>>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Portfolio-level manager: builds [`PortfolioStatus`] snapshots from
/// exchange balances and tracks per-position metadata across ticks.
pub struct PortfolioManager {
    exchange: Arc<dyn ExchangePort>,
    risk: Arc<RiskManager>,
    options: TradingModeOptions,
    quote_currency: String,
    meta: Mutex<HashMap<String, PositionMeta>>,
}

impl PortfolioManager {
    pub fn new(
        exchange: Arc<dyn ExchangePort>,
        risk: Arc<RiskManager>,
        options: TradingModeOptions,
        quote_currency: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            risk,
            options,
            quote_currency: quote_currency.into(),
            meta: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_entry(
        &self,
        ticker: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        now: DateTime<Utc>,
    ) {
        self.meta.lock().expect("position meta poisoned").insert(
            ticker.to_string(),
            PositionMeta {
                entry_time: Some(now),
                stop_loss,
                take_profit,
            },
        );
    }

    pub fn record_exit(&self, ticker: &str) {
        self.meta.lock().expect("position meta poisoned").remove(ticker);
    }

    /// Raise the trailing stop; never lowers an existing one.
    pub fn raise_stop(&self, ticker: &str, new_stop: Decimal) {
        let mut meta = self.meta.lock().expect("position meta poisoned");
        let entry = meta.entry(ticker.to_string()).or_default();
        match entry.stop_loss {
            Some(existing) if existing >= new_stop => {}
            _ => {
                info!("PortfolioManager: {} stop raised to {}", ticker, new_stop);
                entry.stop_loss = Some(new_stop);
            }
        }
    }

    pub fn meta_for(&self, ticker: &str) -> PositionMeta {
        self.meta
            .lock()
            .expect("position meta poisoned")
            .get(ticker)
            .cloned()
            .unwrap_or_default()
    }

    /// Build the portfolio snapshot: balances, priced positions, totals,
    /// trading mode, and entry capital.
    pub async fn get_portfolio_status(&self, now: DateTime<Utc>) -> Result<PortfolioStatus> {
        let quote_balance = self
            .exchange
            .get_balance(&self.quote_currency)
            .await
            .map(|b| b.available)
            .unwrap_or(Decimal::ZERO);

        let balances = self.exchange.get_balances().await?;
        let mut positions: Vec<PortfolioPosition> = Vec::new();
        let mut total_invested = Decimal::ZERO;
        let mut total_current_value = Decimal::ZERO;

        for balance in balances {
            if balance.currency == self.quote_currency {
                continue;
            }
            let amount = balance.total;
            if amount <= Decimal::ZERO || balance.avg_buy_price <= Decimal::ZERO {
                continue;
            }
            let ticker = format!("{}-{}", self.quote_currency, balance.currency);
            let current_price = match self.exchange.get_current_price(&ticker).await {
                Ok(p) if p > Decimal::ZERO => p,
                Ok(_) => continue,
                Err(e) => {
                    warn!("PortfolioManager: no price for {}: {}", ticker, e);
                    continue;
                }
            };

            if amount * current_price < self.options.min_position_value {
                continue;
            }

            let meta = self.meta_for(&ticker);
            let position = PortfolioPosition {
                ticker: ticker.clone(),
                symbol: balance.currency.clone(),
                amount,
                avg_buy_price: balance.avg_buy_price,
                current_price,
                entry_time: meta.entry_time,
                stop_loss: meta.stop_loss,
            };
            total_invested += position.total_cost();
            total_current_value += position.current_value();
            positions.push(position);
        }

        let total_profit_loss = total_current_value - total_invested;
        let total_profit_rate = if total_invested > Decimal::ZERO {
            use rust_decimal::prelude::ToPrimitive;
            (total_profit_loss / total_invested).to_f64().unwrap_or(0.0) * 100.0
        } else {
            0.0
        };

        let circuit = self.risk.check_circuit_breaker(now);
        let trading_mode = if !circuit.allowed {
            TradingMode::Blocked
        } else if positions.len() < self.options.max_positions {
            TradingMode::Entry
        } else {
            TradingMode::Management
        };

        let can_open_new_position = trading_mode == TradingMode::Entry
            && quote_balance >= self.options.min_position_value;

        let total_capital = quote_balance + total_current_value;
        let available_capital =
            self.available_capital(quote_balance, total_capital);
        let remaining_slots = self.options.max_positions.saturating_sub(positions.len());
        let capital_per_position = if remaining_slots > 0 {
            available_capital / Decimal::from(remaining_slots)
        } else {
            Decimal::ZERO
        };

        Ok(PortfolioStatus {
            position_count: positions.len(),
            positions,
            quote_balance,
            total_invested,
            total_current_value,
            total_profit_loss,
            total_profit_rate,
            trading_mode,
            can_open_new_position,
            available_capital,
            capital_per_position,
        })
    }

    /// Cash past the reserve, capped by the per-coin allocation limit.
    fn available_capital(&self, quote_balance: Decimal, total_capital: Decimal) -> Decimal {
        let reserve = total_capital
            * Decimal::from_f64(self.options.reserve_ratio).unwrap_or(Decimal::ZERO);
        let max_per_coin = total_capital
            * Decimal::from_f64(self.options.max_allocation_per_coin).unwrap_or(Decimal::ONE);
        (quote_balance - reserve).min(max_per_coin).max(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_available_capital_reserve_and_cap() {
        let exchange = crate::infrastructure::paper::PaperExchange::builder()
            .quote_balance(dec!(0))
            .build();
        let manager = PortfolioManager::new(
            Arc::new(exchange),
            Arc::new(RiskManager::new(TradingModeOptions::default())),
            TradingModeOptions::default(),
            "KRW",
        );
        // cash 1_000_000, total 1_000_000: reserve 100_000 -> 900_000, but
        // the 40% per-coin cap limits it to 400_000.
        let capital = manager.available_capital(dec!(1000000), dec!(1000000));
        assert_eq!(capital, dec!(400000));
        // cash 200_000 of total 1_000_000: 200_000 - 100_000 reserve.
        let capital = manager.available_capital(dec!(200000), dec!(1000000));
        assert_eq!(capital, dec!(100000));
        // Reserve larger than cash floors at zero.
        let capital = manager.available_capital(dec!(50000), dec!(1000000));
        assert_eq!(capital, Decimal::ZERO);
    }

    #[test]
    fn test_raise_stop_never_lowers() {
        let exchange = crate::infrastructure::paper::PaperExchange::builder().build();
        let manager = PortfolioManager::new(
            Arc::new(exchange),
            Arc::new(RiskManager::new(TradingModeOptions::default())),
            TradingModeOptions::default(),
            "KRW",
        );
        manager.raise_stop("KRW-ETH", dec!(100));
        manager.raise_stop("KRW-ETH", dec!(90));
        assert_eq!(manager.meta_for("KRW-ETH").stop_loss, Some(dec!(100)));
        manager.raise_stop("KRW-ETH", dec!(110));
        assert_eq!(manager.meta_for("KRW-ETH").stop_loss, Some(dec!(110)));
    }
}
