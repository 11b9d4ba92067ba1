//! Persistence boundary for completed exchanges.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One request/response pair as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub user_id: String,
    pub request_id: String,
    pub request: String,
    pub response: String,
    pub success: bool,
    pub used_handlers: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Sink for finished exchanges. Failures never affect the response.
#[async_trait]
pub trait ExchangeStore: Send + Sync {
    async fn save_exchange(&self, exchange: &Exchange) -> Result<(), StoreError>;
}

/// In-process store, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryExchangeStore {
    exchanges: Mutex<Vec<Exchange>>,
}

impl MemoryExchangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Exchange>> {
        self.exchanges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.entries().clone()
    }
}

#[async_trait]
impl ExchangeStore for MemoryExchangeStore {
    async fn save_exchange(&self, exchange: &Exchange) -> Result<(), StoreError> {
        self.entries().push(exchange.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(user: &str) -> Exchange {
        Exchange {
            user_id: user.to_string(),
            request_id: "r1".to_string(),
            request: "hello".to_string(),
            response: "hi".to_string(),
            success: true,
            used_handlers: vec!["coder".to_string()],
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_survives_poisoned_lock() {
        let store = std::sync::Arc::new(MemoryExchangeStore::new());
        store.save_exchange(&exchange("alice")).await.unwrap();

        let poisoner = store.clone();
        let joined = std::thread::spawn(move || {
            let _guard = poisoner.exchanges.lock().unwrap();
            panic!("poison the lock");
        })
        .join();
        assert!(joined.is_err());
        assert!(store.exchanges.is_poisoned());

        store.save_exchange(&exchange("bob")).await.unwrap();
        let users: Vec<String> = store.exchanges().into_iter().map(|e| e.user_id).collect();
        assert_eq!(users, vec!["alice", "bob"]);
    }
}
