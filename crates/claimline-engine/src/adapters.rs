//! Boundary adapters: where payloads come from and where published items go.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use claimline_types::{FingerprintRecord, ItemId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::info;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Supplies raw payloads for `submit`. Polling cadence is the caller's.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    async fn fetch(&self) -> Result<Vec<Value>, AdapterError>;
}

/// Receives every item that reaches `Published`, exactly once.
///
/// A delivery error never reverts publication; retrying delivery is the
/// sink's business.
#[async_trait]
pub trait PublicationSink: Send + Sync {
    async fn publish(
        &self,
        item_id: ItemId,
        payload: &Value,
        fingerprints: &[FingerprintRecord],
    ) -> Result<(), AdapterError>;
}

/// A published item as written by [`JsonlSink`] and kept by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub item_id: ItemId,
    pub payload: Value,
    pub fingerprints: Vec<FingerprintRecord>,
    pub published_at: DateTime<Utc>,
}

impl Publication {
    fn new(item_id: ItemId, payload: &Value, fingerprints: &[FingerprintRecord]) -> Self {
        Self {
            item_id,
            payload: payload.clone(),
            fingerprints: fingerprints.to_vec(),
            published_at: Utc::now(),
        }
    }
}

/// Reads payloads from a file holding either a JSON array or one JSON
/// document per line.
pub struct JsonFileFeed {
    path: PathBuf,
}

impl JsonFileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceFeed for JsonFileFeed {
    async fn fetch(&self) -> Result<Vec<Value>, AdapterError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AdapterError::Io {
                path: self.path.clone(),
                source,
            })?;

        if text.trim_start().starts_with('[') {
            return Ok(serde_json::from_str(&text)?);
        }
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(AdapterError::from))
            .collect()
    }
}

/// Logs each publication and does nothing else.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl PublicationSink for LogSink {
    async fn publish(
        &self,
        item_id: ItemId,
        _payload: &Value,
        fingerprints: &[FingerprintRecord],
    ) -> Result<(), AdapterError> {
        let head = fingerprints.last().map(|r| r.hash.short()).unwrap_or_default();
        info!(item_id = %item_id, chain_len = fingerprints.len(), head = %head, "Published");
        Ok(())
    }
}

/// Appends one JSON line per publication to a file.
pub struct JsonlSink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PublicationSink for JsonlSink {
    async fn publish(
        &self,
        item_id: ItemId,
        payload: &Value,
        fingerprints: &[FingerprintRecord],
    ) -> Result<(), AdapterError> {
        let mut line = serde_json::to_string(&Publication::new(item_id, payload, fingerprints))?;
        line.push('\n');

        let io_err = |source| AdapterError::Io {
            path: self.path.clone(),
            source,
        };
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

/// Collects publications in memory. Can be told to fail every delivery.
#[derive(Debug, Default)]
pub struct MemorySink {
    published: Mutex<Vec<Publication>>,
    attempts: Mutex<usize>,
    fail: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that rejects every delivery.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<Publication> {
        self.published.lock().clone()
    }

    /// Deliveries attempted, successful or not.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl PublicationSink for MemorySink {
    async fn publish(
        &self,
        item_id: ItemId,
        payload: &Value,
        fingerprints: &[FingerprintRecord],
    ) -> Result<(), AdapterError> {
        *self.attempts.lock() += 1;
        if self.fail {
            return Err(AdapterError::Delivery("sink unavailable".to_string()));
        }
        self.published
            .lock()
            .push(Publication::new(item_id, payload, fingerprints));
        Ok(())
    }
}
