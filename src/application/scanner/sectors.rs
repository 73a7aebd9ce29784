//! Sector labels and diversification.
//!
//! Symbol-to-sector mapping is a static table; anything unlisted is
//! `Unknown`. Diversification keeps candidates in their incoming (liquidity)
//! order and optionally limits selection to one coin per sector so one hot
//! narrative cannot fill every slot.

use crate::domain::market::CoinInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinSector {
    Layer1,
    Layer2,
    Defi,
    Meme,
    Payment,
    Exchange,
    Infrastructure,
    Gaming,
    Ai,
    Unknown,
}

impl fmt::Display for CoinSector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoinSector::Layer1 => "layer-1",
            CoinSector::Layer2 => "layer-2",
            CoinSector::Defi => "defi",
            CoinSector::Meme => "meme",
            CoinSector::Payment => "payment",
            CoinSector::Exchange => "exchange",
            CoinSector::Infrastructure => "infrastructure",
            CoinSector::Gaming => "gaming",
            CoinSector::Ai => "ai",
            CoinSector::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

pub fn coin_sector(symbol: &str) -> CoinSector {
    match symbol {
        "BTC" | "ETH" | "SOL" | "ADA" | "AVAX" | "DOT" | "ATOM" | "NEAR" | "TRX" | "SUI"
        | "APT" | "TON" => CoinSector::Layer1,
        "MATIC" | "POL" | "ARB" | "OP" | "STRK" | "IMX" => CoinSector::Layer2,
        "UNI" | "AAVE" | "LINK" | "MKR" | "CRV" | "COMP" | "SNX" | "JUP" => CoinSector::Defi,
        "DOGE" | "SHIB" | "PEPE" | "BONK" | "WIF" | "FLOKI" => CoinSector::Meme,
        "XRP" | "XLM" | "LTC" | "BCH" => CoinSector::Payment,
        "BNB" | "CRO" | "OKB" => CoinSector::Exchange,
        "FIL" | "AR" | "GRT" | "STX" | "ICP" | "HBAR" => CoinSector::Infrastructure,
        "SAND" | "MANA" | "AXS" | "GALA" | "ENJ" => CoinSector::Gaming,
        "FET" | "RNDR" | "TAO" | "WLD" => CoinSector::Ai,
        _ => CoinSector::Unknown,
    }
}

pub struct SectorDiversifier {
    pub one_per_sector: bool,
    pub exclude_unknown: bool,
}

impl SectorDiversifier {
    pub fn new(one_per_sector: bool, exclude_unknown: bool) -> Self {
        Self {
            one_per_sector,
            exclude_unknown,
        }
    }

    /// Filter `coins` (already sorted best-first) down to a diversified set.
    pub fn select_diversified(&self, coins: &[CoinInfo], max_coins: usize) -> Vec<CoinInfo> {
        let mut taken_sectors = BTreeMap::new();
        let mut selected = Vec::new();

        for coin in coins {
            if selected.len() >= max_coins {
                break;
            }
            let sector = coin_sector(&coin.symbol);
            if self.exclude_unknown && sector == CoinSector::Unknown {
                continue;
            }
            if self.one_per_sector {
                let count = taken_sectors.entry(sector).or_insert(0usize);
                if *count >= 1 {
                    continue;
                }
                *count += 1;
            }
            selected.push(coin.clone());
        }
        selected
    }

    pub fn sector_distribution(&self, coins: &[CoinInfo]) -> BTreeMap<CoinSector, usize> {
        let mut distribution = BTreeMap::new();
        for coin in coins {
            *distribution.entry(coin_sector(&coin.symbol)).or_insert(0) += 1;
        }
        distribution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn coin(symbol: &str) -> CoinInfo {
        CoinInfo {
            ticker: format!("KRW-{}", symbol),
            symbol: symbol.to_string(),
            current_price: dec!(1000),
            volume_24h: dec!(1),
            quote_volume_24h: dec!(1),
            change_rate_24h: 0.0,
            high_24h: dec!(1),
            low_24h: dec!(1),
            volatility_7d: None,
        }
    }

    #[test]
    fn test_one_per_sector_keeps_first_seen() {
        let coins = vec![coin("BTC"), coin("ETH"), coin("DOGE"), coin("SHIB"), coin("XRP")];
        let diversifier = SectorDiversifier::new(true, false);
        let selected = diversifier.select_diversified(&coins, 10);
        let symbols: Vec<&str> = selected.iter().map(|c| c.symbol.as_str()).collect();
        // BTC wins layer-1 over ETH, DOGE wins meme over SHIB.
        assert_eq!(symbols, vec!["BTC", "DOGE", "XRP"]);
    }

    #[test]
    fn test_unknown_sector_can_be_dropped() {
        let coins = vec![coin("BTC"), coin("OBSCURECOIN")];
        let keep = SectorDiversifier::new(false, false).select_diversified(&coins, 10);
        assert_eq!(keep.len(), 2);
        let drop = SectorDiversifier::new(false, true).select_diversified(&coins, 10);
        assert_eq!(drop.len(), 1);
        assert_eq!(drop[0].symbol, "BTC");
    }

    #[test]
    fn test_distribution_counts() {
        let coins = vec![coin("BTC"), coin("ETH"), coin("DOGE")];
        let distribution = SectorDiversifier::new(true, false).sector_distribution(&coins);
        assert_eq!(distribution[&CoinSector::Layer1], 2);
        assert_eq!(distribution[&CoinSector::Meme], 1);
    }
}
