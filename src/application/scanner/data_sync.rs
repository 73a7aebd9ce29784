//! On-disk OHLCV cache with incremental sync.
//!
//! One CSV file per (ticker, interval), rows sorted by timestamp and deduped.
//! Sync fetches only the missing tail, purges rows older than the retention
//! window, and writes atomically (temp file + rename) so readers never see a
//! torn file. Every network call is bounded by a timeout, and a failed sync
//! downgrades the ticker instead of failing the scan.

use crate::domain::market::validation::OhlcvValidator;
use crate::domain::market::{Candle, Interval, OhlcvSeries};
use crate::domain::ports::ExchangePort;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{info, warn};

const MAX_CANDLES_PER_REQUEST: usize = 200;
const API_TIMEOUT_SECS: u64 = 30;
const FETCH_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Success,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub ticker: String,
    pub outcome: SyncOutcome,
    pub rows_before: usize,
    pub rows_after: usize,
    pub rows_added: usize,
    pub error: Option<String>,
}

impl SyncStatus {
    fn failed(ticker: &str, rows_before: usize, error: impl Into<String>) -> Self {
        Self {
            ticker: ticker.to_string(),
            outcome: SyncOutcome::Failed,
            rows_before,
            rows_after: rows_before,
            rows_added: 0,
            error: Some(error.into()),
        }
    }
}

/// One cache row. Timestamps are unix seconds; prices keep their decimal
/// representation through serde.
#[derive(Debug, Serialize, Deserialize)]
struct CandleRow {
    ts: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

pub struct HistoricalDataSync {
    exchange: Arc<dyn ExchangePort>,
    data_dir: PathBuf,
    default_years: u32,
    max_years: u32,
    per_ticker_timeout: std::time::Duration,
    bulk_timeout: std::time::Duration,
}

impl HistoricalDataSync {
    pub fn new(
        exchange: Arc<dyn ExchangePort>,
        data_dir: impl Into<PathBuf>,
        default_years: u32,
        max_years: u32,
        per_ticker_timeout_secs: u64,
        bulk_timeout_secs: u64,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        Ok(Self {
            exchange,
            data_dir,
            default_years,
            max_years,
            per_ticker_timeout: std::time::Duration::from_secs(per_ticker_timeout_secs),
            bulk_timeout: std::time::Duration::from_secs(bulk_timeout_secs),
        })
    }

    pub fn data_path(&self, ticker: &str, interval: Interval) -> PathBuf {
        let symbol = ticker.split('-').next_back().unwrap_or(ticker);
        self.data_dir.join(format!("{}_{}.csv", symbol, interval.tag()))
    }

    /// Load the cached series, validated and repaired. `Ok(None)` when no
    /// cache file exists; `Err` when the file exists but is unusable.
    pub fn load(&self, ticker: &str, interval: Interval) -> Result<Option<OhlcvSeries>> {
        let path = self.data_path(ticker, interval);
        if !path.exists() {
            return Ok(None);
        }
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("opening cache {}", path.display()))?;
        let mut candles = Vec::new();
        for row in reader.deserialize() {
            let row: CandleRow = row.context("malformed cache row")?;
            let ts = Utc
                .timestamp_opt(row.ts, 0)
                .single()
                .context("invalid cache timestamp")?;
            candles.push(Candle {
                ts,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }

        let mut series = OhlcvSeries::new(ticker, interval, candles);
        let report = OhlcvValidator::default().validate(&mut series);
        if let Some(reason) = report.uncorrectable {
            anyhow::bail!("cache for {} unusable: {}", ticker, reason);
        }
        Ok(Some(series))
    }

    /// Atomic-replace write: readers either see the old file or the new one.
    pub fn save(&self, series: &OhlcvSeries) -> Result<()> {
        let path = self.data_path(&series.ticker, series.interval);
        let tmp = path.with_extension("csv.tmp");
        {
            let mut writer =
                csv::Writer::from_path(&tmp).with_context(|| format!("writing {}", tmp.display()))?;
            for candle in &series.candles {
                writer.serialize(CandleRow {
                    ts: candle.ts.timestamp(),
                    open: candle.open,
                    high: candle.high,
                    low: candle.low,
                    close: candle.close,
                    volume: candle.volume,
                })?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    /// Sync one ticker: incremental tail fetch, merge, retention purge, save.
    pub async fn sync_coin(
        &self,
        ticker: &str,
        interval: Interval,
        years: Option<u32>,
    ) -> SyncStatus {
        let years = years.unwrap_or(self.default_years);
        let existing = match self.load(ticker, interval) {
            Ok(series) => series,
            Err(e) => {
                warn!("DataSync: discarding unusable cache for {}: {}", ticker, e);
                None
            }
        };
        let rows_before = existing.as_ref().map(|s| s.len()).unwrap_or(0);

        let now = Utc::now();
        let start = match &existing {
            Some(series) if !series.is_empty() => {
                series.candles.last().unwrap().ts + interval.duration()
            }
            _ => now - Duration::days(years as i64 * 365),
        };
        if start >= now {
            return SyncStatus {
                ticker: ticker.to_string(),
                outcome: SyncOutcome::Skipped,
                rows_before,
                rows_after: rows_before,
                rows_added: 0,
                error: None,
            };
        }

        let fetched = match self.fetch_range(ticker, interval, start, now).await {
            Ok(candles) => candles,
            Err(e) => return SyncStatus::failed(ticker, rows_before, e.to_string()),
        };
        if fetched.is_empty() && rows_before == 0 {
            return SyncStatus::failed(ticker, rows_before, "no data returned");
        }

        let mut candles = existing.map(|s| s.candles).unwrap_or_default();
        candles.extend(fetched);

        let mut series = OhlcvSeries::new(ticker, interval, candles);
        let report = OhlcvValidator::default().validate(&mut series);
        if let Some(reason) = report.uncorrectable {
            return SyncStatus::failed(ticker, rows_before, reason);
        }

        // Retention purge.
        let cutoff = now - Duration::days(self.max_years as i64 * 365);
        series.candles.retain(|c| c.ts >= cutoff);

        if let Err(e) = self.save(&series) {
            return SyncStatus::failed(ticker, rows_before, e.to_string());
        }
        let rows_after = series.len();
        info!(
            "DataSync: {} now {} rows ({:+} added)",
            ticker,
            rows_after,
            rows_after as i64 - rows_before as i64
        );
        SyncStatus {
            ticker: ticker.to_string(),
            outcome: SyncOutcome::Success,
            rows_before,
            rows_after,
            rows_added: rows_after.saturating_sub(rows_before),
            error: None,
        }
    }

    /// Page backwards from `end` until `start` is covered. Each page request
    /// is retried and individually timed out.
    async fn fetch_range(
        &self,
        ticker: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let mut all: Vec<Candle> = Vec::new();
        let mut current_to = end;
        let api_timeout = std::time::Duration::from_secs(API_TIMEOUT_SECS);

        loop {
            let mut page = None;
            for attempt in 1..=FETCH_RETRIES {
                match timeout(
                    api_timeout,
                    self.exchange
                        .get_ohlcv_before(ticker, interval, MAX_CANDLES_PER_REQUEST, current_to),
                )
                .await
                {
                    Ok(Ok(series)) => {
                        page = Some(series);
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!("DataSync: fetch {} failed (attempt {}): {}", ticker, attempt, e);
                    }
                    Err(_) => {
                        warn!("DataSync: fetch {} timed out (attempt {})", ticker, attempt);
                    }
                }
            }
            let Some(page) = page else {
                if all.is_empty() {
                    anyhow::bail!("all fetch attempts failed for {}", ticker);
                }
                break;
            };
            if page.is_empty() {
                break;
            }

            let earliest = page.candles.first().unwrap().ts;
            all.extend(page.candles.into_iter().filter(|c| c.ts >= start));
            if earliest <= start {
                break;
            }
            current_to = earliest - Duration::seconds(1);
        }

        all.sort_by_key(|c| c.ts);
        all.dedup_by_key(|c| c.ts);
        Ok(all)
    }

    /// Sync many tickers with bounded concurrency. Per-ticker and bulk
    /// deadlines both apply; any failure downgrades only its own ticker.
    pub async fn sync_multiple(
        &self,
        tickers: &[String],
        interval: Interval,
        years: Option<u32>,
        max_concurrent: usize,
    ) -> Vec<SyncStatus> {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let tasks = tickers.iter().map(|ticker| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                match timeout(self.per_ticker_timeout, self.sync_coin(ticker, interval, years))
                    .await
                {
                    Ok(status) => status,
                    Err(_) => SyncStatus::failed(
                        ticker,
                        0,
                        format!("sync timed out after {:?}", self.per_ticker_timeout),
                    ),
                }
            }
        });

        let joined = timeout(self.bulk_timeout, futures::future::join_all(tasks)).await;
        match joined {
            Ok(statuses) => {
                let ok = statuses
                    .iter()
                    .filter(|s| s.outcome == SyncOutcome::Success)
                    .count();
                info!("DataSync: bulk sync complete ({}/{} ok)", ok, tickers.len());
                statuses
            }
            Err(_) => {
                warn!("DataSync: bulk sync deadline expired");
                tickers
                    .iter()
                    .map(|t| SyncStatus::failed(t, 0, "bulk sync deadline expired"))
                    .collect()
            }
        }
    }

    /// Delete cache files whose newest row is older than the retention
    /// window.
    pub fn cleanup_old_files(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(self.max_years as i64 * 365);
        let mut deleted = 0;
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            if let Some(newest) = newest_row_ts(&path)?
                && newest < cutoff
            {
                std::fs::remove_file(&path)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn newest_row_ts(path: &Path) -> Result<Option<DateTime<Utc>>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut newest: Option<i64> = None;
    for row in reader.deserialize::<CandleRow>() {
        let row = row?;
        newest = Some(newest.map_or(row.ts, |n: i64| n.max(row.ts)));
    }
    Ok(newest.and_then(|ts| Utc.timestamp_opt(ts, 0).single()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::paper::PaperExchange;
    use rust_decimal_macros::dec;

    fn candle(day: i64, close: f64) -> Candle {
        Candle {
            ts: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::days(day),
            open: Decimal::try_from(close).unwrap(),
            high: Decimal::try_from(close * 1.01).unwrap(),
            low: Decimal::try_from(close * 0.99).unwrap(),
            close: Decimal::try_from(close).unwrap(),
            volume: dec!(1000),
        }
    }

    fn sync_with_dir(dir: &Path) -> HistoricalDataSync {
        let exchange = PaperExchange::builder().build();
        HistoricalDataSync::new(Arc::new(exchange), dir, 2, 3, 60, 180).unwrap()
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_with_dir(dir.path());
        let series = OhlcvSeries::new(
            "KRW-BTC",
            Interval::Day,
            (0..10).map(|i| candle(i, 100.0 + i as f64)).collect(),
        );
        sync.save(&series).unwrap();
        let loaded = sync.load("KRW-BTC", Interval::Day).unwrap().unwrap();
        assert_eq!(loaded.len(), 10);
        assert_eq!(loaded.candles[3].close, series.candles[3].close);
        assert_eq!(loaded.candles[3].ts, series.candles[3].ts);
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_with_dir(dir.path());
        assert!(sync.load("KRW-NONE", Interval::Day).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_fetches_full_history_when_cache_empty() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = PaperExchange::builder()
            .with_series(OhlcvSeries::new(
                "KRW-BTC",
                Interval::Day,
                (0..120).map(|i| candle(i, 100.0 + i as f64)).collect(),
            ))
            .build();
        let sync =
            HistoricalDataSync::new(Arc::new(exchange), dir.path(), 2, 3, 60, 180).unwrap();

        let status = sync.sync_coin("KRW-BTC", Interval::Day, None).await;
        assert_eq!(status.outcome, SyncOutcome::Success, "{:?}", status.error);
        assert!(status.rows_after > 0);

        // Second sync with nothing new is incremental and cheap.
        let again = sync.sync_coin("KRW-BTC", Interval::Day, None).await;
        assert!(matches!(again.outcome, SyncOutcome::Success | SyncOutcome::Skipped));
        assert_eq!(again.rows_after, status.rows_after);
    }

    #[tokio::test]
    async fn test_sync_unknown_ticker_downgrades_not_panics() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_with_dir(dir.path());
        let status = sync.sync_coin("KRW-GHOST", Interval::Day, None).await;
        assert_eq!(status.outcome, SyncOutcome::Failed);
    }
}
