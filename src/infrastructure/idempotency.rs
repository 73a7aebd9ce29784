//! Process-local idempotency ledger with TTL expiry.

use crate::domain::ports::IdempotencyPort;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// In-memory TTL key store. Marked keys reject duplicates until they expire;
/// `cleanup_expired` reclaims the map.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    keys: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyPort for InMemoryIdempotencyStore {
    async fn check_key(&self, key: &str) -> Result<bool> {
        let keys = self.keys.lock().await;
        Ok(keys.get(key).is_some_and(|expires| *expires > Utc::now()))
    }

    async fn mark_key(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut keys = self.keys.lock().await;
        keys.insert(key.to_string(), Utc::now() + ttl);
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let mut keys = self.keys.lock().await;
        let now = Utc::now();
        let before = keys.len();
        keys.retain(|_, expires| *expires > now);
        Ok(before - keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_marked_key_is_seen_until_expiry() {
        let store = InMemoryIdempotencyStore::new();
        assert!(!store.check_key("k").await.unwrap());
        store.mark_key("k", Duration::hours(4)).await.unwrap();
        assert!(store.check_key("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_key_is_cleaned_up() {
        let store = InMemoryIdempotencyStore::new();
        store.mark_key("old", Duration::seconds(-1)).await.unwrap();
        store.mark_key("new", Duration::hours(1)).await.unwrap();
        assert!(!store.check_key("old").await.unwrap());
        let removed = store.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.check_key("new").await.unwrap());
    }
}
