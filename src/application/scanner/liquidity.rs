//! Liquidity-based market scan: 24h summaries for every tradable ticker,
//! filtered down to the most liquid non-stablecoin candidates.

use crate::domain::indicators::atr_series;
use crate::domain::market::{CoinInfo, Interval};
use crate::domain::ports::ExchangePort;
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::{info, warn};

/// Symbols that are pegged assets, never trade candidates.
const EXCLUDED_SYMBOLS: &[&str] = &["USDT", "USDC", "DAI", "BUSD", "TUSD", "PAXG", "UST"];

/// Leverage/inverse token name fragments.
const EXCLUDED_PATTERNS: &[&str] = &["2L", "2S", "3L", "3S", "UP", "DOWN"];

pub struct LiquidityScanner {
    exchange: Arc<dyn ExchangePort>,
    min_volume_quote: Decimal,
}

impl LiquidityScanner {
    pub fn new(exchange: Arc<dyn ExchangePort>, min_volume_quote: Decimal) -> Self {
        Self {
            exchange,
            min_volume_quote,
        }
    }

    /// Top-N tickers by 24h quote volume, optionally enriched with 7-day
    /// ATR volatility.
    pub async fn scan_top_coins(
        &self,
        quote: &str,
        top_n: usize,
        include_volatility: bool,
    ) -> Result<Vec<CoinInfo>> {
        let tickers = self.exchange.get_tradable_tickers(quote).await?;
        info!("LiquidityScanner: {} tradable {} markets", tickers.len(), quote);

        let summaries = self.exchange.get_ticker_summaries(&tickers).await?;
        let mut filtered: Vec<CoinInfo> = summaries
            .into_iter()
            .filter(|coin| self.passes_filter(coin))
            .collect();

        filtered.sort_by(|a, b| b.quote_volume_24h.cmp(&a.quote_volume_24h));
        filtered.truncate(top_n);
        info!(
            "LiquidityScanner: {} candidates after volume floor and exclusions",
            filtered.len()
        );

        if include_volatility {
            for coin in &mut filtered {
                match self.seven_day_volatility(&coin.ticker).await {
                    Ok(vol) => coin.volatility_7d = vol,
                    Err(e) => {
                        warn!("LiquidityScanner: volatility fetch failed for {}: {}", coin.ticker, e)
                    }
                }
            }
        }

        Ok(filtered)
    }

    fn passes_filter(&self, coin: &CoinInfo) -> bool {
        if coin.quote_volume_24h < self.min_volume_quote {
            return false;
        }
        if EXCLUDED_SYMBOLS.contains(&coin.symbol.as_str()) {
            return false;
        }
        if EXCLUDED_PATTERNS.iter().any(|p| coin.symbol.contains(p)) {
            return false;
        }
        true
    }

    /// 7-day ATR as a percent of the latest close.
    async fn seven_day_volatility(&self, ticker: &str) -> Result<Option<f64>> {
        let series = self.exchange.get_ohlcv(ticker, Interval::Day, 8).await?;
        if series.len() < 7 {
            return Ok(None);
        }
        let to_f64 = |d: Decimal| d.to_f64().unwrap_or(f64::NAN);
        let high: Vec<f64> = series.candles.iter().map(|c| to_f64(c.high)).collect();
        let low: Vec<f64> = series.candles.iter().map(|c| to_f64(c.low)).collect();
        let close: Vec<f64> = series.candles.iter().map(|c| to_f64(c.close)).collect();
        let atr = atr_series(&high, &low, &close, series.len() - 1);
        let last_close = *close.last().unwrap_or(&0.0);
        Ok(atr
            .last()
            .copied()
            .filter(|v| v.is_finite() && last_close > 0.0)
            .map(|v| v / last_close * 100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn coin(symbol: &str, quote_volume: Decimal) -> CoinInfo {
        CoinInfo {
            ticker: format!("KRW-{}", symbol),
            symbol: symbol.to_string(),
            current_price: dec!(1000),
            volume_24h: dec!(100),
            quote_volume_24h: quote_volume,
            change_rate_24h: 1.0,
            high_24h: dec!(1100),
            low_24h: dec!(900),
            volatility_7d: None,
        }
    }

    fn scanner() -> LiquidityScanner {
        let exchange = crate::infrastructure::paper::PaperExchange::builder().build();
        LiquidityScanner::new(Arc::new(exchange), dec!(10000000000))
    }

    #[test]
    fn test_filter_drops_stablecoins_and_leverage_tokens() {
        let s = scanner();
        assert!(s.passes_filter(&coin("BTC", dec!(20000000000))));
        assert!(!s.passes_filter(&coin("USDT", dec!(20000000000))));
        assert!(!s.passes_filter(&coin("ETH3L", dec!(20000000000))));
        assert!(!s.passes_filter(&coin("BTCDOWN", dec!(20000000000))));
    }

    #[test]
    fn test_filter_enforces_volume_floor() {
        let s = scanner();
        assert!(!s.passes_filter(&coin("SOL", dec!(9999999999))));
        assert!(s.passes_filter(&coin("SOL", dec!(10000000000))));
    }
}
