//! Conversation state store.
//!
//! One [`ConversationState`] per sender, created on the first inbound event
//! and kept for the lifetime of the process. Mutation happens only on the
//! sender's dispatch worker, so the per-state mutex is never contended by
//! two events of the same sender.

use crate::flows::graph::NodeId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Default number of recent inputs kept per conversation.
pub const DEFAULT_INPUT_WINDOW: usize = 5;

/// Shared handle to one sender's state.
pub type SharedState = Arc<Mutex<ConversationState>>;

/// Position and bookkeeping for one sender.
#[derive(Debug)]
pub struct ConversationState {
    sender: String,
    current: Option<NodeId>,
    position: usize,
    pending_capture: Option<usize>,
    keyword: Option<String>,
    variables: HashMap<String, String>,
    recent_inputs: VecDeque<String>,
    input_window: usize,
    generation: u64,
    idle_timer: Option<CancellationToken>,
    updated_at: DateTime<Utc>,
}

/// Point-in-time copy of a conversation, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSnapshot {
    pub sender: String,
    pub current: Option<NodeId>,
    pub position: usize,
    pub pending_capture: Option<usize>,
    pub keyword: Option<String>,
    pub variables: HashMap<String, String>,
    pub recent_inputs: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    /// Create an idle state.
    pub fn new(sender: impl Into<String>, input_window: usize) -> Self {
        Self {
            sender: sender.into(),
            current: None,
            position: 0,
            pending_capture: None,
            keyword: None,
            variables: HashMap::new(),
            recent_inputs: VecDeque::with_capacity(input_window),
            input_window,
            generation: 0,
            idle_timer: None,
            updated_at: Utc::now(),
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Current node, `None` when idle.
    pub fn current(&self) -> Option<NodeId> {
        self.current
    }

    /// Index of the capture step waiting for input.
    pub fn pending_capture(&self) -> Option<usize> {
        self.pending_capture
    }

    /// Keyword that entered the current flow.
    pub fn keyword(&self) -> Option<&str> {
        self.keyword.as_deref()
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    /// Bumped on every advance or reset; stale idle timers compare against it.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Push an inbound body into the rolling window.
    pub fn record_input(&mut self, body: &str) {
        if self.input_window == 0 {
            return;
        }
        while self.recent_inputs.len() >= self.input_window {
            self.recent_inputs.pop_front();
        }
        self.recent_inputs.push_back(body.to_string());
    }

    /// Enter a node from a trigger, starting at its first step.
    pub fn enter(&mut self, node: NodeId, keyword: impl Into<String>) {
        self.keyword = Some(keyword.into());
        self.advance(node, 0);
    }

    /// Move to `step` of `node`. Clears any pending capture and idle timer.
    pub fn advance(&mut self, node: NodeId, step: usize) {
        self.cancel_idle_timer();
        self.current = Some(node);
        self.position = step;
        self.pending_capture = None;
        self.touch();
    }

    /// Park on the capture at `step` until the next inbound event.
    pub fn await_capture(&mut self, node: NodeId, step: usize, timer: Option<CancellationToken>) {
        self.advance(node, step);
        self.pending_capture = Some(step);
        self.idle_timer = timer;
    }

    /// Bind a captured value.
    pub fn bind(&mut self, variable: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(variable.into(), value.into());
    }

    /// Return to idle. Captured variables are dropped.
    pub fn reset(&mut self) {
        self.cancel_idle_timer();
        self.current = None;
        self.position = 0;
        self.pending_capture = None;
        self.keyword = None;
        self.variables.clear();
        self.touch();
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }

    fn touch(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            sender: self.sender.clone(),
            current: self.current,
            position: self.position,
            pending_capture: self.pending_capture,
            keyword: self.keyword.clone(),
            variables: self.variables.clone(),
            recent_inputs: self.recent_inputs.iter().cloned().collect(),
            updated_at: self.updated_at,
        }
    }
}

/// Registry of conversation states keyed by sender.
#[derive(Debug)]
pub struct StateStore {
    states: RwLock<HashMap<String, SharedState>>,
    input_window: usize,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_WINDOW)
    }
}

impl StateStore {
    pub fn new(input_window: usize) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            input_window,
        }
    }

    /// Get the sender's state, creating an idle one on first use.
    pub fn get_or_create(&self, sender: &str) -> SharedState {
        if let Some(state) = self.states.read().get(sender) {
            return Arc::clone(state);
        }
        let mut states = self.states.write();
        let state = states.entry(sender.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(ConversationState::new(sender, self.input_window)))
        });
        Arc::clone(state)
    }

    /// Get the sender's state if it exists.
    pub fn get(&self, sender: &str) -> Option<SharedState> {
        self.states.read().get(sender).cloned()
    }

    /// Number of known senders.
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}
