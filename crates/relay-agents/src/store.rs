//! Append-only JSONL exchange store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use coordination::{Exchange, ExchangeStore, StoreError};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Writes one JSON object per line. Appends are serialised through a lock.
pub struct JsonlExchangeStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlExchangeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every stored exchange back. A missing file is an empty store.
    pub async fn load(&self) -> Result<Vec<Exchange>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl ExchangeStore for JsonlExchangeStore {
    async fn save_exchange(&self, exchange: &Exchange) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(exchange)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(path = %self.path.display(), request_id = %exchange.request_id, "exchange saved");
        Ok(())
    }
}
