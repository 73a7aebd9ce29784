//! Crypto fear & greed index adapter (alternative.me-style API).
//!
//! The only network adapter in the crate. Transient failures retry with
//! exponential backoff inside the port, so callers see one clean result per
//! call; the index is an optional input and the data-collection stage
//! degrades without it.

use crate::domain::market::{FearGreedClassification, FearGreedIndex};
use crate::domain::ports::MarketDataPort;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

// Sentiment reads are small and latency-tolerant: short request timeout,
// a couple of retries on transient failures.
const REQUEST_TIMEOUT_SECS: u64 = 10;
const CONNECT_TIMEOUT_SECS: u64 = 5;
const MAX_RETRIES: u32 = 2;

#[derive(Debug, Deserialize)]
struct FngResponse {
    data: Vec<FngData>,
}

#[derive(Debug, Deserialize)]
struct FngData {
    value: String,
    timestamp: String,
}

pub struct FearGreedClient {
    client: ClientWithMiddleware,
    url: String,
}

impl FearGreedClient {
    pub fn new() -> Self {
        Self::with_url("https://api.alternative.me/fng/")
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client: ClientBuilder::new(client)
                .with(RetryTransientMiddleware::new_with_policy(retry_policy))
                .build(),
            url: url.into(),
        }
    }
}

impl Default for FearGreedClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataPort for FearGreedClient {
    async fn get_fear_greed_index(&self) -> anyhow::Result<FearGreedIndex> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("fear/greed request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("fear/greed API returned status {}", response.status());
        }

        let body: FngResponse = response
            .json()
            .await
            .context("fear/greed response did not parse")?;
        let data = body
            .data
            .first()
            .context("fear/greed response carried no data")?;

        let value: u8 = data.value.parse().context("fear/greed value not numeric")?;
        let ts_secs: i64 = data
            .timestamp
            .parse()
            .context("fear/greed timestamp not numeric")?;
        let ts = Utc
            .timestamp_opt(ts_secs, 0)
            .single()
            .context("fear/greed timestamp out of range")?;

        // Re-classify locally so the boundaries stay consistent with ours.
        let index = FearGreedIndex {
            value,
            classification: FearGreedClassification::from_score(value),
            ts,
        };
        info!(
            "FearGreedClient: {} ({}) at {}",
            index.value, index.classification, index.ts
        );
        Ok(index)
    }
}
