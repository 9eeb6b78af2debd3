//! JSON file history store.
//!
//! Keeps the whole history as one JSON array. Every save rewrites the file,
//! so this is meant for local development and small deployments.

use super::{Database, DatabaseError, DatabaseResult, HistoryEntry};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct JsonFileDatabase {
    path: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl JsonFileDatabase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file with an empty history if it does not exist.
    pub async fn init(&self) -> DatabaseResult<()> {
        if tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| DatabaseError::Storage(e.to_string()))?
        {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| DatabaseError::Storage(e.to_string()))?;
            }
        }

        tokio::fs::write(&self.path, "[]")
            .await
            .map_err(|e| DatabaseError::Storage(e.to_string()))?;
        debug!(path = %self.path.display(), "created history file");
        Ok(())
    }

    /// Read every entry.
    ///
    /// Content that is not a JSON array counts as an empty history. An array
    /// holding entries that do not deserialize is an error, so a later save
    /// never overwrites records it could not read.
    pub async fn read_all(&self) -> DatabaseResult<Vec<HistoryEntry>> {
        self.init().await?;
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| DatabaseError::Storage(e.to_string()))?;
        parse_history(&raw)
    }

    async fn write_all(&self, entries: &[HistoryEntry]) -> DatabaseResult<()> {
        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| DatabaseError::Storage(e.to_string()))
    }
}

/// Parse file content, tolerating anything that is not an array.
fn parse_history(raw: &str) -> DatabaseResult<Vec<HistoryEntry>> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "history file is not valid JSON, treating as empty");
            return Ok(Vec::new());
        }
    };
    if !value.is_array() {
        warn!("history file does not hold an array, treating as empty");
        return Ok(Vec::new());
    }
    serde_json::from_value(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

#[async_trait]
impl Database for JsonFileDatabase {
    async fn save(&self, entry: HistoryEntry) -> DatabaseResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.push(entry);
        self.write_all(&entries).await
    }

    async fn get_prev_by_number(&self, from: &str) -> DatabaseResult<Option<HistoryEntry>> {
        let entries = self.read_all().await?;
        Ok(entries.into_iter().rev().find(|e| e.from == from))
    }
}
