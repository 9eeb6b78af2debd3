//! In-process history list.

use super::{Database, DatabaseResult, HistoryEntry};
use async_trait::async_trait;
use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct MemoryDatabase {
    history: RwLock<Vec<HistoryEntry>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in save order.
    pub fn list_history(&self) -> Vec<HistoryEntry> {
        self.history.read().clone()
    }

    /// Answers saved for `from`, in save order.
    pub fn answers_for(&self, from: &str) -> Vec<String> {
        self.history
            .read()
            .iter()
            .filter(|e| e.from == from)
            .map(|e| e.answer.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.history.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.read().is_empty()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn save(&self, entry: HistoryEntry) -> DatabaseResult<()> {
        self.history.write().push(entry);
        Ok(())
    }

    async fn get_prev_by_number(&self, from: &str) -> DatabaseResult<Option<HistoryEntry>> {
        Ok(self
            .history
            .read()
            .iter()
            .rev()
            .find(|e| e.from == from)
            .cloned())
    }
}
