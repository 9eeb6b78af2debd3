//! Provider Interface
//!
//! The chat platform the engine talks to. Implementations own the wire
//! protocol; the engine only sends messages and consumes [`InboundEvent`]s.

mod console;
mod memory;

pub use console::ConsoleProvider;
pub use memory::{MemoryProvider, SentMessage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors a provider may report for an outbound message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("Message send failed: {0}")]
    SendFailed(String),

    #[error("Provider not connected")]
    NotConnected,

    #[error("Rate limited: retry after {0}s")]
    RateLimited(u64),

    #[error("Provider error: {0}")]
    Other(String),
}

/// Inbound chat event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Sender identifier (phone number, user id, ...)
    pub from: String,
    /// Message text
    pub body: String,
    /// When the platform received the message
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Raw platform metadata, never read by the engine
    #[serde(default)]
    pub metadata: Value,
}

impl InboundEvent {
    /// Create an event received now
    pub fn new(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            body: body.into(),
            timestamp: Utc::now(),
            metadata: Value::Null,
        }
    }

    /// Attach raw platform metadata
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Outbound message content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundContent {
    /// Plain text message
    Text { text: String },
    /// Media reference with optional caption
    Media {
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        media_ref: String,
    },
}

impl OutboundContent {
    /// Create a text message
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Text part of the content
    pub fn text_part(&self) -> &str {
        match self {
            Self::Text { text } => text,
            Self::Media { caption, .. } => caption.as_deref().unwrap_or_default(),
        }
    }
}

/// Per-message options forwarded from the flow definition
pub type SendOptions = Map<String, Value>;

/// Receipt returned by a successful send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Platform message id
    pub message_id: String,
}

/// Chat platform used to deliver answers
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Send one message to `to`
    async fn send_message(
        &self,
        to: &str,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> ProviderResult<SendReceipt>;
}
