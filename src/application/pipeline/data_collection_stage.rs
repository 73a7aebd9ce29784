//! Data collection stage: everything the analysis needs for one ticker,
//! gathered in one parallel fan-out.
//!
//! The ticker's own daily chart is the only hard requirement; every other
//! source degrades gracefully with a warning.

use crate::application::pipeline::{
    ChartBundle, CurrentStatus, PipelineStage, StageResult, TickContext,
};
use crate::domain::errors::ErrorClass;
use crate::domain::indicators::IndicatorSnapshot;
use crate::domain::market::Interval;
use crate::domain::market::validation::OhlcvValidator;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, warn};

const CHART_CANDLES: usize = 200;

#[derive(Default)]
pub struct DataCollectionStage;

impl DataCollectionStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PipelineStage for DataCollectionStage {
    fn name(&self) -> &'static str {
        "DataCollection"
    }

    async fn execute(&self, ctx: &mut TickContext) -> Result<StageResult> {
        let exchange = ctx.ports.exchange.clone();
        let ticker = ctx.ticker.clone();
        let reference = ctx.config.reference_ticker.clone();

        // Independent reads fan out together.
        let (day, minute60, minute15, reference_day, orderbook, quote_balance, base_balance, price) = tokio::join!(
            exchange.get_ohlcv(&ticker, Interval::Day, CHART_CANDLES),
            exchange.get_ohlcv(&ticker, Interval::Minute60, CHART_CANDLES),
            exchange.get_ohlcv(&ticker, Interval::Minute15, CHART_CANDLES),
            exchange.get_ohlcv(&reference, Interval::Day, CHART_CANDLES),
            exchange.get_orderbook(&ticker),
            exchange.get_balance(&ctx.config.quote_currency),
            exchange.get_balance(ticker.split('-').next_back().unwrap_or(&ticker)),
            exchange.get_current_price(&ticker),
        );

        // The ticker's own daily chart is fatal when missing.
        let mut day = match day {
            Ok(series) if !series.is_empty() => series,
            Ok(_) => {
                return Ok(StageResult::stop(
                    ErrorClass::DataQuality,
                    format!("empty daily chart for {}", ticker),
                ));
            }
            Err(e) => {
                return Ok(StageResult::stop(
                    ErrorClass::Transient,
                    format!("daily chart fetch failed for {}: {}", ticker, e),
                ));
            }
        };
        let validation = OhlcvValidator::default().validate(&mut day);
        if let Some(reason) = validation.uncorrectable {
            return Ok(StageResult::stop(
                ErrorClass::DataQuality,
                format!("daily chart for {} unusable: {}", ticker, reason),
            ));
        }

        let minute60 = degrade(minute60, "60m chart");
        let minute15 = degrade(minute15, "15m chart");
        let reference_day = degrade(reference_day, "reference chart");

        // Latest indicator snapshot on the daily series.
        ctx.indicator_snapshot = Some(IndicatorSnapshot::from_series(&day));

        match orderbook {
            Ok(book) => {
                ctx.orderbook_summary = book.summary();
                ctx.orderbook = Some(book);
            }
            Err(e) => warn!("DataCollection: orderbook unavailable: {}", e),
        }

        let quote_balance = quote_balance.map(|b| b.available).unwrap_or(Decimal::ZERO);
        let base_balance = base_balance.map(|b| b.total).unwrap_or(Decimal::ZERO);
        let current_price = match price {
            Ok(p) => p,
            Err(e) => {
                return Ok(StageResult::stop(
                    ErrorClass::Transient,
                    format!("current price fetch failed for {}: {}", ticker, e),
                ));
            }
        };
        ctx.current_status = Some(CurrentStatus {
            quote_balance,
            base_balance,
            current_price,
        });

        // Fear/greed is optional by contract.
        if let Some(market_data) = &ctx.ports.market_data {
            match market_data.get_fear_greed_index().await {
                Ok(index) => {
                    info!(
                        "DataCollection: fear/greed {} ({})",
                        index.value, index.classification
                    );
                    ctx.fear_greed = Some(index);
                }
                Err(e) => warn!("DataCollection: fear/greed unavailable: {}", e),
            }
        }

        // Detailed position info when we hold this ticker.
        if let Some(status) = &ctx.portfolio_status {
            ctx.position_detail = status.position(&ticker).cloned();
        }

        ctx.chart = Some(ChartBundle {
            day,
            minute60,
            minute15,
            reference_day,
        });

        Ok(StageResult::proceed(format!(
            "collected market data for {}",
            ticker
        )))
    }
}

fn degrade(
    result: Result<crate::domain::market::OhlcvSeries>,
    label: &str,
) -> Option<crate::domain::market::OhlcvSeries> {
    match result {
        Ok(series) if !series.is_empty() => {
            let mut series = series;
            let report = OhlcvValidator::default().validate(&mut series);
            if report.uncorrectable.is_some() {
                warn!("DataCollection: {} unusable, continuing without it", label);
                None
            } else {
                Some(series)
            }
        }
        Ok(_) => None,
        Err(e) => {
            warn!("DataCollection: {} unavailable: {}", label, e);
            None
        }
    }
}
