//! History persistence interface.
//!
//! The engine hands one [`HistoryEntry`] per executed answer to a
//! [`Database`]. Storage layout is up to the implementation.

mod json_file;
mod memory;

pub use json_file::JsonFileDatabase;
pub use memory::MemoryDatabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Result type for database operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Errors from history storage
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatabaseError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Immutable record of one executed answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Sender the answer was sent to
    pub from: String,
    /// Keyword (or inbound text) that entered the flow
    pub keyword: String,
    /// Rendered answer text
    pub answer: String,
    /// Flow and step the answer came from, `<flow>#<step>`
    #[serde(rename = "ref")]
    pub reference: String,
    /// Stable hash of `reference`
    pub ref_serialize: String,
    /// Options declared on the step
    #[serde(default)]
    pub options: Map<String, Value>,
    /// When the answer was sent
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// Build an entry for step `step` of `flow`.
    pub fn new(
        from: impl Into<String>,
        keyword: impl Into<String>,
        answer: impl Into<String>,
        flow: &str,
        step: usize,
    ) -> Self {
        let reference = format!("{}#{}", flow, step);
        Self {
            from: from.into(),
            keyword: keyword.into(),
            answer: answer.into(),
            ref_serialize: serialize_ref(&reference),
            reference,
            options: Map::new(),
            created_at: Utc::now(),
        }
    }

    /// Attach step options.
    pub fn with_options(mut self, options: Map<String, Value>) -> Self {
        self.options = options;
        self
    }
}

/// Hex SHA-256 of a node/step reference.
pub fn serialize_ref(reference: &str) -> String {
    hex::encode(Sha256::digest(reference.as_bytes()))
}

/// History storage used by the dispatcher
#[async_trait]
pub trait Database: Send + Sync {
    /// Append one entry
    async fn save(&self, entry: HistoryEntry) -> DatabaseResult<()>;

    /// Most recent entry for a sender
    async fn get_prev_by_number(&self, from: &str) -> DatabaseResult<Option<HistoryEntry>>;
}
