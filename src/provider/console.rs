//! Provider that prints answers to stdout, used by the `chat` command.

use super::{OutboundContent, Provider, ProviderResult, SendOptions, SendReceipt};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ConsoleProvider {
    counter: AtomicU64,
}

impl ConsoleProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Provider for ConsoleProvider {
    fn name(&self) -> &str {
        "console"
    }

    async fn send_message(
        &self,
        to: &str,
        content: &OutboundContent,
        _options: &SendOptions,
    ) -> ProviderResult<SendReceipt> {
        match content {
            OutboundContent::Text { text } => println!("[bot -> {}] {}", to, text),
            OutboundContent::Media { caption, media_ref } => match caption {
                Some(caption) => println!("[bot -> {}] {} ({})", to, caption, media_ref),
                None => println!("[bot -> {}] ({})", to, media_ref),
            },
        }
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(SendReceipt {
            message_id: format!("console-{}", id),
        })
    }
}
