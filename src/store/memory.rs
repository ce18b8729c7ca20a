//! In-memory state store.

use async_trait::async_trait;
use dashmap::DashMap;

use super::StateStore;
use crate::error::Result;
use crate::ratelimit::LimiterState;

/// Keeps limiter state in a concurrent map. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: DashMap<String, LimiterState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with persisted state.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<LimiterState>> {
        Ok(self.states.get(key).map(|s| s.value().clone()))
    }

    async fn set(&self, key: &str, state: &LimiterState) -> Result<()> {
        self.states.insert(key.to_string(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Limit;
    use chrono::Utc;

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = MemoryStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = MemoryStore::new();
        let state = LimiterState::new(Limit::PerSecond(5.0), 10, Utc::now());

        store.set("api", &state).await.unwrap();
        assert_eq!(store.get("api").await.unwrap(), Some(state));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .set("a", &LimiterState::new(Limit::PerSecond(1.0), 1, now))
            .await
            .unwrap();
        store
            .set("b", &LimiterState::new(Limit::Infinite, 2, now))
            .await
            .unwrap();

        assert_eq!(store.get("a").await.unwrap().unwrap().burst, 1);
        assert_eq!(store.get("b").await.unwrap().unwrap().burst, 2);
    }
}
