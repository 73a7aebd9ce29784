pub mod validation;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Candle interval. Annualization factors assume a 24/7 crypto market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    Minute1,
    Minute15,
    Minute30,
    Minute60,
    Minute240,
    Day,
    Week,
}

impl Interval {
    /// Bars per year for this interval, used to annualize volatility and
    /// risk-adjusted return ratios.
    pub fn annualization_factor(self) -> f64 {
        match self {
            Interval::Minute1 => 365.0 * 24.0 * 60.0,
            Interval::Minute15 => 365.0 * 24.0 * 4.0,
            Interval::Minute30 => 365.0 * 24.0 * 2.0,
            Interval::Minute60 => 365.0 * 24.0,
            Interval::Minute240 => 365.0 * 6.0,
            Interval::Day => 365.0,
            Interval::Week => 52.0,
        }
    }

    /// Nominal bar duration.
    pub fn duration(self) -> chrono::Duration {
        match self {
            Interval::Minute1 => chrono::Duration::minutes(1),
            Interval::Minute15 => chrono::Duration::minutes(15),
            Interval::Minute30 => chrono::Duration::minutes(30),
            Interval::Minute60 => chrono::Duration::hours(1),
            Interval::Minute240 => chrono::Duration::hours(4),
            Interval::Day => chrono::Duration::days(1),
            Interval::Week => chrono::Duration::weeks(1),
        }
    }

    /// Stable tag used in cache file names and config hashes.
    pub fn tag(self) -> &'static str {
        match self {
            Interval::Minute1 => "minute1",
            Interval::Minute15 => "minute15",
            Interval::Minute30 => "minute30",
            Interval::Minute60 => "minute60",
            Interval::Minute240 => "minute240",
            Interval::Day => "day",
            Interval::Week => "week",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Single OHLCV sample. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }
}

/// Ordered candle series for one (ticker, interval).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcvSeries {
    pub ticker: String,
    pub interval: Interval,
    pub candles: Vec<Candle>,
}

impl OhlcvSeries {
    pub fn new(ticker: impl Into<String>, interval: Interval, candles: Vec<Candle>) -> Self {
        Self {
            ticker: ticker.into(),
            interval,
            candles,
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn closes_f64(&self) -> Vec<f64> {
        self.candles
            .iter()
            .map(|c| c.close.to_f64().unwrap_or(0.0))
            .collect()
    }

    /// Keep only the trailing `n` candles.
    pub fn tail(&self, n: usize) -> OhlcvSeries {
        let start = self.candles.len().saturating_sub(n);
        OhlcvSeries {
            ticker: self.ticker.clone(),
            interval: self.interval,
            candles: self.candles[start..].to_vec(),
        }
    }
}

/// One price level of an orderbook side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderbookLevel {
    pub price: Decimal,
    pub volume: Decimal,
}

/// Top-K orderbook snapshot. Asks ascending, bids descending by price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orderbook {
    pub ticker: String,
    pub ts: DateTime<Utc>,
    pub bids: Vec<OrderbookLevel>,
    pub asks: Vec<OrderbookLevel>,
}

/// Derived orderbook figures handed to the AI payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookSummary {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub bid_depth: Decimal,
    pub ask_depth: Decimal,
    /// (bid_depth - ask_depth) / (bid_depth + ask_depth), in [-1, 1].
    pub imbalance: f64,
}

impl Orderbook {
    pub fn summary(&self) -> Option<OrderbookSummary> {
        let best_bid = self.bids.first()?.price;
        let best_ask = self.asks.first()?.price;
        let bid_depth: Decimal = self.bids.iter().map(|l| l.volume).sum();
        let ask_depth: Decimal = self.asks.iter().map(|l| l.volume).sum();
        let total = bid_depth + ask_depth;
        let imbalance = if total > Decimal::ZERO {
            ((bid_depth - ask_depth) / total).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        Some(OrderbookSummary {
            best_bid,
            best_ask,
            bid_depth,
            ask_depth,
            imbalance,
        })
    }
}

/// 24h market summary for one tradable ticker, as returned by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinInfo {
    pub ticker: String,
    pub symbol: String,
    pub current_price: Decimal,
    /// 24h traded volume in base units.
    pub volume_24h: Decimal,
    /// 24h traded value in quote currency.
    pub quote_volume_24h: Decimal,
    /// Signed 24h change, percent.
    pub change_rate_24h: f64,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    /// 7-day ATR-based volatility, percent of last close. Filled by the
    /// liquidity scanner's enrichment pass.
    pub volatility_7d: Option<f64>,
}

impl CoinInfo {
    /// 24h high-low range as a percent of the current price.
    pub fn volatility_24h(&self) -> f64 {
        if self.current_price > Decimal::ZERO {
            ((self.high_24h - self.low_24h) / self.current_price)
                .to_f64()
                .unwrap_or(0.0)
                * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FearGreedClassification {
    ExtremeFear,
    Fear,
    Neutral,
    Greed,
    ExtremeGreed,
}

impl FearGreedClassification {
    pub fn from_score(value: u8) -> Self {
        match value {
            0..=24 => FearGreedClassification::ExtremeFear,
            25..=44 => FearGreedClassification::Fear,
            45..=55 => FearGreedClassification::Neutral,
            56..=75 => FearGreedClassification::Greed,
            _ => FearGreedClassification::ExtremeGreed,
        }
    }
}

impl fmt::Display for FearGreedClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FearGreedClassification::ExtremeFear => "Extreme Fear",
            FearGreedClassification::Fear => "Fear",
            FearGreedClassification::Neutral => "Neutral",
            FearGreedClassification::Greed => "Greed",
            FearGreedClassification::ExtremeGreed => "Extreme Greed",
        };
        write!(f, "{}", s)
    }
}

/// Market-wide fear/greed reading, 0..=100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FearGreedIndex {
    pub value: u8,
    pub classification: FearGreedClassification,
    pub ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, volume: Decimal) -> OrderbookLevel {
        OrderbookLevel { price, volume }
    }

    #[test]
    fn test_orderbook_summary_imbalance() {
        let book = Orderbook {
            ticker: "KRW-BTC".to_string(),
            ts: Utc::now(),
            bids: vec![level(dec!(99), dec!(3)), level(dec!(98), dec!(3))],
            asks: vec![level(dec!(101), dec!(1)), level(dec!(102), dec!(1))],
        };
        let summary = book.summary().unwrap();
        assert_eq!(summary.best_bid, dec!(99));
        assert_eq!(summary.best_ask, dec!(101));
        // (6 - 2) / 8 = 0.5
        assert!((summary.imbalance - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_fear_greed_classification_bounds() {
        assert_eq!(
            FearGreedClassification::from_score(0),
            FearGreedClassification::ExtremeFear
        );
        assert_eq!(
            FearGreedClassification::from_score(50),
            FearGreedClassification::Neutral
        );
        assert_eq!(
            FearGreedClassification::from_score(76),
            FearGreedClassification::ExtremeGreed
        );
    }

    #[test]
    fn test_interval_annualization() {
        assert_eq!(Interval::Day.annualization_factor(), 365.0);
        assert_eq!(Interval::Minute60.annualization_factor(), 8760.0);
    }
}
