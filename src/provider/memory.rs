//! In-process provider that records every send.

use super::{OutboundContent, Provider, ProviderError, ProviderResult, SendOptions, SendReceipt};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;

/// A message accepted by [`MemoryProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub to: String,
    pub content: OutboundContent,
    pub options: SendOptions,
    pub sent_at: DateTime<Utc>,
}

/// Provider that keeps sent messages in memory.
///
/// Texts registered with [`MemoryProvider::fail_on`] are rejected with
/// [`ProviderError::SendFailed`] and not recorded.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    sent: Mutex<Vec<SentMessage>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject sends whose text equals `text`.
    pub fn fail_on(&self, text: impl Into<String>) {
        self.failing.lock().insert(text.into());
    }

    /// Everything sent so far, in send order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Texts sent to `to`, in send order.
    pub fn texts_to(&self, to: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.to == to)
            .map(|m| m.content.text_part().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send_message(
        &self,
        to: &str,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> ProviderResult<SendReceipt> {
        if self.failing.lock().contains(content.text_part()) {
            return Err(ProviderError::SendFailed(format!(
                "rejected message to {}",
                to
            )));
        }

        self.sent.lock().push(SentMessage {
            to: to.to_string(),
            content: content.clone(),
            options: options.clone(),
            sent_at: Utc::now(),
        });

        Ok(SendReceipt {
            message_id: uuid::Uuid::new_v4().to_string(),
        })
    }
}
