//! Process-local named locks for at-most-one in-flight pipeline per ticker.

use crate::domain::ports::LockPort;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::Mutex;

/// Non-blocking named lock registry. Acquire returns false instead of
/// waiting, so the scheduler drops stale ticks rather than queueing them.
#[derive(Default)]
pub struct InMemoryLockService {
    held: Mutex<HashSet<String>>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockPort for InMemoryLockService {
    async fn acquire(&self, name: &str) -> Result<bool> {
        let mut held = self.held.lock().await;
        Ok(held.insert(name.to_string()))
    }

    async fn release(&self, name: &str) -> Result<()> {
        let mut held = self.held.lock().await;
        held.remove(name);
        Ok(())
    }

    async fn is_locked(&self, name: &str) -> Result<bool> {
        let held = self.held.lock().await;
        Ok(held.contains(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_fails_until_release() {
        let locks = InMemoryLockService::new();
        assert!(locks.acquire("tick:KRW-BTC").await.unwrap());
        assert!(!locks.acquire("tick:KRW-BTC").await.unwrap());
        assert!(locks.is_locked("tick:KRW-BTC").await.unwrap());

        locks.release("tick:KRW-BTC").await.unwrap();
        assert!(locks.acquire("tick:KRW-BTC").await.unwrap());
    }

    #[tokio::test]
    async fn test_locks_are_independent_by_name() {
        let locks = InMemoryLockService::new();
        assert!(locks.acquire("tick:KRW-BTC").await.unwrap());
        assert!(locks.acquire("tick:KRW-ETH").await.unwrap());
    }
}
