use crate::domain::errors::TradingError;
use crate::domain::trading::{ExitTrigger, Position, Trade};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

/// Simulated portfolio used by the backtester.
///
/// Owns its positions exclusively. Cash never goes negative; a buy that the
/// balance cannot cover is rejected. Equity is cash plus marked-to-market
/// position value.
#[derive(Debug, Clone)]
pub struct Portfolio {
    pub initial_capital: Decimal,
    pub cash: Decimal,
    pub positions: HashMap<String, Position>,
    pub closed_trades: Vec<Trade>,
}

impl Portfolio {
    pub fn new(initial_capital: Decimal) -> Self {
        Self {
            initial_capital,
            cash: initial_capital,
            positions: HashMap::new(),
            closed_trades: Vec::new(),
        }
    }

    pub fn has_position(&self, ticker: &str) -> bool {
        self.positions.contains_key(ticker)
    }

    /// Marked-to-market equity at the prices last passed to `mark`.
    pub fn equity(&self) -> Decimal {
        self.cash
            + self
                .positions
                .values()
                .map(|p| p.current_value())
                .sum::<Decimal>()
    }

    /// Update the current price of a held ticker.
    pub fn mark(&mut self, ticker: &str, price: Decimal) {
        if let Some(pos) = self.positions.get_mut(ticker) {
            pos.current_price = price;
        }
    }

    /// Open a position at `price`, paying `commission_rate` on the notional.
    /// At most one position per ticker.
    pub fn open_position(
        &mut self,
        ticker: &str,
        size: Decimal,
        price: Decimal,
        commission_rate: Decimal,
        time: DateTime<Utc>,
        bar_index: Option<usize>,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<&Position, TradingError> {
        if size <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(TradingError::InvalidOrder {
                reason: format!("non-positive size {} or price {}", size, price),
            });
        }
        if self.has_position(ticker) {
            return Err(TradingError::InvalidOrder {
                reason: format!("position already open for {}", ticker),
            });
        }

        let notional = size * price;
        let commission = notional * commission_rate;
        let cost = notional + commission;
        if cost > self.cash {
            return Err(TradingError::InsufficientFunds {
                need: cost,
                available: self.cash,
            });
        }

        self.cash -= cost;
        let position = Position {
            ticker: ticker.to_string(),
            amount: size,
            entry_price: price,
            entry_time: time,
            current_price: price,
            stop_loss,
            take_profit,
            entry_commission: commission,
            entry_bar_index: bar_index,
        };
        self.positions.insert(ticker.to_string(), position);
        Ok(self.positions.get(ticker).expect("just inserted"))
    }

    /// Close the full position at `price`. Realised pnl is
    /// `size * (exit - entry) - total_commission`.
    pub fn close_position(
        &mut self,
        ticker: &str,
        price: Decimal,
        commission_rate: Decimal,
        time: DateTime<Utc>,
        exit_trigger: Option<ExitTrigger>,
    ) -> Result<Trade, TradingError> {
        let position = self
            .positions
            .remove(ticker)
            .ok_or_else(|| TradingError::PositionNotFound {
                ticker: ticker.to_string(),
            })?;

        let notional = position.amount * price;
        let exit_commission = notional * commission_rate;
        self.cash += notional - exit_commission;

        let total_commission = position.entry_commission + exit_commission;
        let pnl = position.amount * (price - position.entry_price) - total_commission;

        let trade = Trade {
            id: Uuid::new_v4(),
            ticker: ticker.to_string(),
            size: position.amount,
            entry_price: position.entry_price,
            exit_price: price,
            entry_time: position.entry_time,
            exit_time: time,
            pnl,
            commission: total_commission,
            exit_trigger,
        };
        self.closed_trades.push(trade.clone());
        Ok(trade)
    }
}
