//! In-process paper trading adapters.
//!
//! [`PaperExchange`] implements the full exchange port against in-memory
//! state with deterministic fills (fixed fee and slippage). It backs the
//! daemon's dry-run mode and every integration test. [`ScriptedAiPort`] and
//! [`StaticFearGreed`] do the same for the AI and market-data ports.

use crate::domain::market::{
    CoinInfo, FearGreedClassification, FearGreedIndex, Interval, OhlcvSeries, Orderbook,
};
use crate::domain::ports::{AiPort, BalanceInfo, ExchangePort, MarketDataPort};
use crate::domain::trading::{OrderSide, TradeReceipt};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
struct BalanceEntry {
    total: Decimal,
    locked: Decimal,
    avg_buy_price: Decimal,
}

#[derive(Default)]
struct PaperState {
    balances: HashMap<String, BalanceEntry>,
    prices: HashMap<String, Decimal>,
    series: HashMap<(String, Interval), OhlcvSeries>,
    orderbooks: HashMap<String, Orderbook>,
    summaries: Vec<CoinInfo>,
    used_keys: HashSet<String>,
    order_seq: u64,
}

pub struct PaperExchange {
    state: RwLock<PaperState>,
    quote_currency: String,
    fee_rate: Decimal,
    slippage: Decimal,
}

pub struct PaperExchangeBuilder {
    state: PaperState,
    quote_currency: String,
    fee_rate: Decimal,
    slippage: Decimal,
}

impl PaperExchange {
    pub fn builder() -> PaperExchangeBuilder {
        PaperExchangeBuilder {
            state: PaperState::default(),
            quote_currency: "KRW".to_string(),
            fee_rate: dec!(0.0005),
            slippage: dec!(0.0001),
        }
    }

    pub async fn set_price(&self, ticker: &str, price: Decimal) {
        self.state
            .write()
            .await
            .prices
            .insert(ticker.to_string(), price);
    }

    pub async fn set_balance(&self, currency: &str, total: Decimal, avg_buy_price: Decimal) {
        self.state.write().await.balances.insert(
            currency.to_string(),
            BalanceEntry {
                total,
                locked: Decimal::ZERO,
                avg_buy_price,
            },
        );
    }

    async fn price_of(&self, ticker: &str) -> Result<Decimal> {
        let state = self.state.read().await;
        if let Some(price) = state.prices.get(ticker) {
            return Ok(*price);
        }
        if let Some(series) = state.series.get(&(ticker.to_string(), Interval::Day))
            && let Some(last) = series.last()
        {
            return Ok(last.close);
        }
        bail!("no price for {}", ticker)
    }

    fn base_currency(ticker: &str) -> &str {
        ticker.split('-').next_back().unwrap_or(ticker)
    }
}

impl PaperExchangeBuilder {
    pub fn quote_balance(mut self, amount: Decimal) -> Self {
        self.state.balances.insert(
            self.quote_currency.clone(),
            BalanceEntry {
                total: amount,
                locked: Decimal::ZERO,
                avg_buy_price: Decimal::ZERO,
            },
        );
        self
    }

    pub fn with_holding(mut self, currency: &str, amount: Decimal, avg_buy_price: Decimal) -> Self {
        self.state.balances.insert(
            currency.to_string(),
            BalanceEntry {
                total: amount,
                locked: Decimal::ZERO,
                avg_buy_price,
            },
        );
        self
    }

    pub fn with_price(mut self, ticker: &str, price: Decimal) -> Self {
        self.state.prices.insert(ticker.to_string(), price);
        self
    }

    pub fn with_series(mut self, series: OhlcvSeries) -> Self {
        self.state
            .series
            .insert((series.ticker.clone(), series.interval), series);
        self
    }

    pub fn with_orderbook(mut self, book: Orderbook) -> Self {
        self.state.orderbooks.insert(book.ticker.clone(), book);
        self
    }

    pub fn with_summaries(mut self, summaries: Vec<CoinInfo>) -> Self {
        self.state.summaries = summaries;
        self
    }

    pub fn fee_rate(mut self, rate: Decimal) -> Self {
        self.fee_rate = rate;
        self
    }

    pub fn build(self) -> PaperExchange {
        PaperExchange {
            state: RwLock::new(self.state),
            quote_currency: self.quote_currency,
            fee_rate: self.fee_rate,
            slippage: self.slippage,
        }
    }
}

#[async_trait]
impl ExchangePort for PaperExchange {
    async fn get_balance(&self, currency: &str) -> Result<BalanceInfo> {
        let state = self.state.read().await;
        let entry = state.balances.get(currency).cloned().unwrap_or_default();
        Ok(BalanceInfo {
            currency: currency.to_string(),
            total: entry.total,
            available: entry.total - entry.locked,
            locked: entry.locked,
            avg_buy_price: entry.avg_buy_price,
        })
    }

    async fn get_balances(&self) -> Result<Vec<BalanceInfo>> {
        let state = self.state.read().await;
        Ok(state
            .balances
            .iter()
            .map(|(currency, entry)| BalanceInfo {
                currency: currency.clone(),
                total: entry.total,
                available: entry.total - entry.locked,
                locked: entry.locked,
                avg_buy_price: entry.avg_buy_price,
            })
            .collect())
    }

    async fn get_current_price(&self, ticker: &str) -> Result<Decimal> {
        self.price_of(ticker).await
    }

    async fn get_ohlcv(
        &self,
        ticker: &str,
        interval: Interval,
        count: usize,
    ) -> Result<OhlcvSeries> {
        let state = self.state.read().await;
        let series = state
            .series
            .get(&(ticker.to_string(), interval))
            .with_context(|| format!("no {} series for {}", interval, ticker))?;
        Ok(series.tail(count))
    }

    async fn get_ohlcv_before(
        &self,
        ticker: &str,
        interval: Interval,
        count: usize,
        to: DateTime<Utc>,
    ) -> Result<OhlcvSeries> {
        let state = self.state.read().await;
        let series = state
            .series
            .get(&(ticker.to_string(), interval))
            .with_context(|| format!("no {} series for {}", interval, ticker))?;
        let candles: Vec<_> = series
            .candles
            .iter()
            .filter(|c| c.ts < to)
            .cloned()
            .collect();
        let start = candles.len().saturating_sub(count);
        Ok(OhlcvSeries::new(ticker, interval, candles[start..].to_vec()))
    }

    async fn get_orderbook(&self, ticker: &str) -> Result<Orderbook> {
        let state = self.state.read().await;
        state
            .orderbooks
            .get(ticker)
            .cloned()
            .with_context(|| format!("no orderbook for {}", ticker))
    }

    async fn get_tradable_tickers(&self, quote: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut tickers: Vec<String> = state
            .summaries
            .iter()
            .map(|s| s.ticker.clone())
            .filter(|t| t.starts_with(quote))
            .collect();
        tickers.sort();
        tickers.dedup();
        Ok(tickers)
    }

    async fn get_ticker_summaries(&self, tickers: &[String]) -> Result<Vec<CoinInfo>> {
        let state = self.state.read().await;
        Ok(state
            .summaries
            .iter()
            .filter(|s| tickers.contains(&s.ticker))
            .cloned()
            .collect())
    }

    async fn execute_buy(
        &self,
        ticker: &str,
        quote_amount: Decimal,
        idempotency_key: &str,
    ) -> Result<TradeReceipt> {
        let price = self.price_of(ticker).await? * (Decimal::ONE + self.slippage);
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if state.used_keys.contains(idempotency_key) {
            bail!("duplicate order key {}", idempotency_key);
        }

        let quote = self.quote_currency.clone();
        let cash = state.balances.entry(quote).or_default();
        if cash.total - cash.locked < quote_amount {
            bail!(
                "insufficient {} balance: need {}, have {}",
                self.quote_currency,
                quote_amount,
                cash.total - cash.locked
            );
        }
        cash.total -= quote_amount;
        state.used_keys.insert(idempotency_key.to_string());

        let fee = quote_amount * self.fee_rate;
        let amount = ((quote_amount - fee) / price).round_dp(8);

        let base = Self::base_currency(ticker).to_string();
        let holding = state.balances.entry(base).or_default();
        let old_cost = holding.total * holding.avg_buy_price;
        holding.total += amount;
        if holding.total > Decimal::ZERO {
            holding.avg_buy_price = (old_cost + amount * price) / holding.total;
        }

        state.order_seq += 1;
        Ok(TradeReceipt {
            order_id: format!("paper-{}", state.order_seq),
            ticker: ticker.to_string(),
            side: OrderSide::Buy,
            price,
            amount,
            total: quote_amount,
            fee,
            ts: Utc::now(),
        })
    }

    async fn execute_sell(
        &self,
        ticker: &str,
        base_amount: Option<Decimal>,
        idempotency_key: &str,
    ) -> Result<TradeReceipt> {
        let price = self.price_of(ticker).await? * (Decimal::ONE - self.slippage);
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if state.used_keys.contains(idempotency_key) {
            bail!("duplicate order key {}", idempotency_key);
        }

        let base = Self::base_currency(ticker).to_string();
        let holding = state.balances.entry(base).or_default();
        let held = holding.total - holding.locked;
        let amount = base_amount.unwrap_or(held).min(held);
        if amount <= Decimal::ZERO {
            bail!("nothing to sell for {}", ticker);
        }
        holding.total -= amount;
        state.used_keys.insert(idempotency_key.to_string());
        if holding.total <= Decimal::ZERO {
            holding.avg_buy_price = Decimal::ZERO;
        }

        let proceeds = amount * price;
        let fee = proceeds * self.fee_rate;
        let quote = self.quote_currency.clone();
        let cash = state.balances.entry(quote).or_default();
        cash.total += proceeds - fee;

        state.order_seq += 1;
        Ok(TradeReceipt {
            order_id: format!("paper-{}", state.order_seq),
            ticker: ticker.to_string(),
            side: OrderSide::Sell,
            price,
            amount,
            total: proceeds,
            fee,
            ts: Utc::now(),
        })
    }
}

/// AI port returning pre-scripted responses in order, then the default.
pub struct ScriptedAiPort {
    responses: Mutex<VecDeque<serde_json::Value>>,
    default: serde_json::Value,
}

impl ScriptedAiPort {
    pub fn new(responses: Vec<serde_json::Value>, default: serde_json::Value) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            default,
        }
    }

    pub fn always(response: serde_json::Value) -> Self {
        Self::new(vec![], response)
    }
}

#[async_trait]
impl AiPort for ScriptedAiPort {
    async fn complete(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _json_schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut responses = self.responses.lock().expect("scripted responses poisoned");
        Ok(responses.pop_front().unwrap_or_else(|| self.default.clone()))
    }
}

/// Fixed fear/greed reading.
pub struct StaticFearGreed {
    pub value: u8,
}

#[async_trait]
impl MarketDataPort for StaticFearGreed {
    async fn get_fear_greed_index(&self) -> Result<FearGreedIndex> {
        Ok(FearGreedIndex {
            value: self.value,
            classification: FearGreedClassification::from_score(self.value),
            ts: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buy_then_sell_round_trip() {
        let exchange = PaperExchange::builder()
            .quote_balance(dec!(1000000))
            .with_price("KRW-ETH", dec!(100000))
            .build();

        let buy = exchange
            .execute_buy("KRW-ETH", dec!(500000), "key-buy")
            .await
            .unwrap();
        assert_eq!(buy.side, OrderSide::Buy);
        assert!(buy.amount > Decimal::ZERO);

        let cash = exchange.get_balance("KRW").await.unwrap();
        assert_eq!(cash.total, dec!(500000));
        let eth = exchange.get_balance("ETH").await.unwrap();
        assert_eq!(eth.total, buy.amount);
        assert!(eth.avg_buy_price > Decimal::ZERO);

        let sell = exchange
            .execute_sell("KRW-ETH", None, "key-sell")
            .await
            .unwrap();
        assert_eq!(sell.amount, buy.amount);
        let eth = exchange.get_balance("ETH").await.unwrap();
        assert_eq!(eth.total, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let exchange = PaperExchange::builder()
            .quote_balance(dec!(1000000))
            .with_price("KRW-ETH", dec!(100000))
            .build();

        exchange
            .execute_buy("KRW-ETH", dec!(100000), "same-key")
            .await
            .unwrap();
        let err = exchange
            .execute_buy("KRW-ETH", dec!(100000), "same-key")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        // Only one order went through.
        let cash = exchange.get_balance("KRW").await.unwrap();
        assert_eq!(cash.total, dec!(900000));
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let exchange = PaperExchange::builder()
            .quote_balance(dec!(1000))
            .with_price("KRW-ETH", dec!(100000))
            .build();
        assert!(
            exchange
                .execute_buy("KRW-ETH", dec!(5000), "key")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_scripted_ai_port_plays_in_order() {
        let port = ScriptedAiPort::new(
            vec![serde_json::json!({"decision": "buy"})],
            serde_json::json!({"decision": "hold"}),
        );
        let schema = serde_json::json!({});
        let first = port.complete("s", "u", &schema).await.unwrap();
        assert_eq!(first["decision"], "buy");
        let second = port.complete("s", "u", &schema).await.unwrap();
        assert_eq!(second["decision"], "hold");
    }
}
