use crate::domain::market::{CoinInfo, FearGreedIndex, Interval, OhlcvSeries, Orderbook};
use crate::domain::trading::TradeReceipt;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Balance of one currency on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub currency: String,
    pub total: Decimal,
    pub available: Decimal,
    pub locked: Decimal,
    pub avg_buy_price: Decimal,
}

// Need async_trait for async functions in traits

/// Single-venue spot exchange. Implementations own retry/backoff for
/// transient I/O; callers see one clean result per call. Both order calls
/// consult the idempotency ledger through the supplied key.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    async fn get_balance(&self, currency: &str) -> Result<BalanceInfo>;
    async fn get_balances(&self) -> Result<Vec<BalanceInfo>>;
    async fn get_current_price(&self, ticker: &str) -> Result<Decimal>;
    async fn get_ohlcv(&self, ticker: &str, interval: Interval, count: usize)
    -> Result<OhlcvSeries>;
    /// Page of candles strictly before `to`; used by the incremental data sync.
    async fn get_ohlcv_before(
        &self,
        ticker: &str,
        interval: Interval,
        count: usize,
        to: DateTime<Utc>,
    ) -> Result<OhlcvSeries>;
    async fn get_orderbook(&self, ticker: &str) -> Result<Orderbook>;
    /// All tradable tickers against the given quote currency (e.g. "KRW").
    async fn get_tradable_tickers(&self, quote: &str) -> Result<Vec<String>>;
    /// 24h summaries for the given tickers.
    async fn get_ticker_summaries(&self, tickers: &[String]) -> Result<Vec<CoinInfo>>;
    /// Market buy spending `quote_amount` of quote currency.
    async fn execute_buy(
        &self,
        ticker: &str,
        quote_amount: Decimal,
        idempotency_key: &str,
    ) -> Result<TradeReceipt>;
    /// Market sell of `base_amount` units, or the full balance when `None`.
    async fn execute_sell(
        &self,
        ticker: &str,
        base_amount: Option<Decimal>,
        idempotency_key: &str,
    ) -> Result<TradeReceipt>;
}

/// AI review port. The implementation enforces strict-JSON responses,
/// retries transient failures, and surfaces parse errors as `Err`.
#[async_trait]
pub trait AiPort: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        json_schema: &serde_json::Value,
    ) -> Result<serde_json::Value>;
}

/// Auxiliary market sentiment data. Optional; callers degrade gracefully.
#[async_trait]
pub trait MarketDataPort: Send + Sync {
    async fn get_fear_greed_index(&self) -> Result<FearGreedIndex>;
}

/// Deduplication ledger for order submissions. Keys live for a TTL at least
/// as long as the configured minimum trade interval.
#[async_trait]
pub trait IdempotencyPort: Send + Sync {
    /// True if the key is already marked and unexpired.
    async fn check_key(&self, key: &str) -> Result<bool>;
    async fn mark_key(&self, key: &str, ttl: chrono::Duration) -> Result<()>;
    /// Drop expired keys, returning how many were removed.
    async fn cleanup_expired(&self) -> Result<usize>;
}

/// Named mutual exclusion used by the scheduler to enforce at-most-one
/// in-flight pipeline per (bot instance, ticker).
#[async_trait]
pub trait LockPort: Send + Sync {
    /// Non-blocking acquire; false means a pipeline is already in flight and
    /// the tick must be dropped, not queued.
    async fn acquire(&self, name: &str) -> Result<bool>;
    async fn release(&self, name: &str) -> Result<()>;
    async fn is_locked(&self, name: &str) -> Result<bool>;
}
