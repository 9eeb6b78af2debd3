//! Per-sender dispatch.
//!
//! Every sender gets a FIFO queue drained by its own tokio task, so events
//! from one sender are handled strictly in arrival order while different
//! senders run in parallel. A worker resolves the event with the matcher and
//! executes steps until the flow completes, parks on a capture, or fails.

use crate::config::EngineConfig;
use crate::database::{Database, DatabaseError, HistoryEntry};
use crate::flows::graph::{normalize, CompiledStep, FlowGraph, FlowNode, NodeId};
use crate::flows::matcher::{self, ResolvedTarget};
use crate::flows::state::{ConversationSnapshot, ConversationState, StateStore};
use crate::provider::{InboundEvent, OutboundContent, Provider, ProviderError, SendOptions};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a single step failed.
#[derive(Debug, Error)]
pub enum StepFailureCause {
    #[error("send failed: {0}")]
    Send(#[from] ProviderError),

    #[error("history save failed: {0}")]
    Save(#[from] DatabaseError),

    #[error("callback '{name}' failed: {message}")]
    Callback { name: String, message: String },

    #[error("no callback registered as '{0}'")]
    UnknownCallback(String),
}

/// A failed step. Execution carried on past it.
#[derive(Debug, Error)]
#[error("flow '{flow}' step {step}: {cause}")]
pub struct StepFailure {
    pub flow: String,
    pub step: usize,
    pub cause: StepFailureCause,
}

/// Dispatch error types
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Too many jumps for one inbound message; the conversation was reset.
    #[error("flow loop for {sender}: more than {limit} jumps, stopped in flow '{flow}'")]
    FlowLoop {
        sender: String,
        flow: String,
        limit: usize,
    },

    /// The sender's queue was full; the event was dropped.
    #[error("queue for {sender} is full ({depth} pending)")]
    QueueOverflow { sender: String, depth: usize },

    /// One or more steps failed; the rest of the flow still ran.
    #[error("{} step(s) failed", .0.len())]
    StepFailures(Vec<StepFailure>),

    /// The sender's worker stopped before answering.
    #[error("dispatch worker stopped")]
    WorkerGone,
}

/// How a dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// The flow ran to completion and the conversation is idle.
    Completed,
    /// The flow stopped on a capture and waits for the next message.
    AwaitingInput,
    /// No flow matched; nothing was sent.
    NoMatch,
}

/// Result of handling one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub status: DispatchStatus,
    /// Answers delivered while handling the event.
    pub answers: usize,
}

impl DispatchOutcome {
    fn no_match() -> Self {
        Self {
            status: DispatchStatus::NoMatch,
            answers: 0,
        }
    }
}

/// What a callback step sees.
#[derive(Debug, Clone)]
pub struct CallbackContext {
    pub from: String,
    pub body: String,
    pub flow: String,
    pub variables: HashMap<String, String>,
}

/// Application hook invoked by a `callback` step.
#[async_trait]
pub trait FlowCallback: Send + Sync {
    async fn call(&self, ctx: &CallbackContext) -> Result<(), String>;
}

#[async_trait]
impl<F> FlowCallback for F
where
    F: Fn(&CallbackContext) -> Result<(), String> + Send + Sync,
{
    async fn call(&self, ctx: &CallbackContext) -> Result<(), String> {
        self(ctx)
    }
}

/// Awaitable completion of one queued event.
#[derive(Debug)]
pub struct DispatchHandle {
    sender: String,
    rx: oneshot::Receiver<Result<DispatchOutcome, DispatchError>>,
}

impl DispatchHandle {
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Wait for the worker to finish the event.
    pub async fn wait(self) -> Result<DispatchOutcome, DispatchError> {
        self.rx.await.unwrap_or(Err(DispatchError::WorkerGone))
    }
}

enum Task {
    Inbound {
        event: InboundEvent,
        reply: oneshot::Sender<Result<DispatchOutcome, DispatchError>>,
    },
    IdleTimeout {
        generation: u64,
    },
}

#[derive(Clone)]
struct SenderQueue {
    tx: mpsc::UnboundedSender<Task>,
    /// Inbound tasks queued but not yet started.
    depth: Arc<AtomicUsize>,
}

struct Inner {
    graph: Arc<FlowGraph>,
    states: StateStore,
    provider: Arc<dyn Provider>,
    database: Arc<dyn Database>,
    config: EngineConfig,
    callbacks: RwLock<HashMap<String, Arc<dyn FlowCallback>>>,
    queues: Mutex<HashMap<String, SenderQueue>>,
    shutdown: CancellationToken,
}

/// Routes inbound events to per-sender workers.
///
/// Dropping the dispatcher stops every worker and idle timer.
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("flows", &self.inner.graph.len())
            .field("provider", &self.inner.provider.name())
            .field("senders", &self.inner.states.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        graph: Arc<FlowGraph>,
        provider: Arc<dyn Provider>,
        database: Arc<dyn Database>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                graph,
                states: StateStore::new(config.input_window),
                provider,
                database,
                config,
                callbacks: RwLock::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register a callback and return self for chaining.
    pub fn with_callback<C>(self, name: impl Into<String>, callback: C) -> Self
    where
        C: FlowCallback + 'static,
    {
        self.register_callback(name, Arc::new(callback));
        self
    }

    /// Register or replace a named callback.
    pub fn register_callback(&self, name: impl Into<String>, callback: Arc<dyn FlowCallback>) {
        self.inner.callbacks.write().insert(name.into(), callback);
    }

    /// Callback names referenced by flows but not registered.
    pub fn missing_callbacks(&self) -> Vec<String> {
        let callbacks = self.inner.callbacks.read();
        let mut missing: Vec<String> = self
            .inner
            .graph
            .callback_names()
            .into_iter()
            .filter(|name| !callbacks.contains_key(*name))
            .map(str::to_string)
            .collect();
        missing.sort();
        missing
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.inner.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Queue an event on its sender's worker.
    ///
    /// Returns immediately; await the handle for the outcome. Fails fast with
    /// [`DispatchError::QueueOverflow`] when the sender's queue is full.
    pub fn on_inbound_message(&self, event: InboundEvent) -> Result<DispatchHandle, DispatchError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DispatchError::WorkerGone);
        }

        let sender = event.from.clone();
        let queue = self.inner.queue_for(&sender);

        match self.inner.config.max_queue_depth {
            Some(max) => {
                if let Err(depth) =
                    queue
                        .depth
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                            (depth < max).then_some(depth + 1)
                        })
                {
                    warn!(sender = %sender, depth, "sender queue full, dropping event");
                    return Err(DispatchError::QueueOverflow { sender, depth });
                }
            }
            None => {
                queue.depth.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (reply, rx) = oneshot::channel();
        if queue.tx.send(Task::Inbound { event, reply }).is_err() {
            queue.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(DispatchError::WorkerGone);
        }
        debug!(sender = %sender, "event queued");
        Ok(DispatchHandle { sender, rx })
    }

    /// Queue an event and wait for it to be handled.
    pub async fn dispatch(&self, event: InboundEvent) -> Result<DispatchOutcome, DispatchError> {
        self.on_inbound_message(event)?.wait().await
    }

    /// Snapshot of a sender's conversation, if the sender is known.
    pub async fn conversation(&self, sender: &str) -> Option<ConversationSnapshot> {
        let state = self.inner.states.get(sender)?;
        let state = state.lock().await;
        Some(state.snapshot())
    }

    /// Stop every worker and idle timer. Pending handles resolve with
    /// [`DispatchError::WorkerGone`].
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("shutting down dispatcher");
            self.inner.shutdown.cancel();
        }
        self.inner.queues.lock().clear();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Per-event execution bookkeeping.
#[derive(Default)]
struct Execution {
    answers: usize,
    jumps: usize,
    failures: Vec<StepFailure>,
}

impl Execution {
    fn finish(self, status: DispatchStatus) -> Result<DispatchOutcome, DispatchError> {
        if self.failures.is_empty() {
            Ok(DispatchOutcome {
                status,
                answers: self.answers,
            })
        } else {
            Err(DispatchError::StepFailures(self.failures))
        }
    }
}

impl Inner {
    /// Get the sender's queue, spawning its worker on first use.
    fn queue_for(self: &Arc<Self>, sender: &str) -> SenderQueue {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(sender) {
            if !queue.tx.is_closed() {
                return queue.clone();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = SenderQueue {
            tx,
            depth: Arc::new(AtomicUsize::new(0)),
        };
        queues.insert(sender.to_string(), queue.clone());

        tokio::spawn(run_worker(
            Arc::clone(self),
            sender.to_string(),
            rx,
            Arc::clone(&queue.depth),
        ));
        queue
    }

    async fn handle_inbound(&self, event: InboundEvent) -> Result<DispatchOutcome, DispatchError> {
        let shared = self.states.get_or_create(&event.from);
        let mut state = shared.lock().await;
        state.record_input(&event.body);

        let mut exec = Execution::default();
        let (node, index) = match matcher::resolve(&event, &state, &self.graph) {
            ResolvedTarget::NoMatch => {
                debug!(sender = %event.from, "no flow matched");
                return Ok(DispatchOutcome::no_match());
            }
            ResolvedTarget::Fresh { node, keyword } => {
                info!(sender = %event.from, keyword = %keyword, flow = %self.flow_name(node), "flow triggered");
                state.enter(node, keyword);
                (node, 0)
            }
            ResolvedTarget::Fallback { node } => {
                info!(sender = %event.from, flow = %self.flow_name(node), "fallback flow triggered");
                state.enter(node, normalize(&event.body));
                (node, 0)
            }
            ResolvedTarget::Resume {
                node,
                capture_index,
            } => match self.resume_capture(&event, &mut state, &mut exec, node, capture_index).await {
                Some(next) => (node, next),
                None => return exec.finish(DispatchStatus::AwaitingInput),
            },
        };

        self.run(&event, &mut state, exec, node, index).await
    }

    /// Feed the inbound body to a pending capture.
    ///
    /// Returns the step to continue from, or `None` if the capture stays
    /// pending because the input was rejected.
    async fn resume_capture(
        &self,
        event: &InboundEvent,
        state: &mut ConversationState,
        exec: &mut Execution,
        node: NodeId,
        index: usize,
    ) -> Option<usize> {
        let Some(flow) = self.graph.node(node) else {
            return Some(index);
        };
        let Some(CompiledStep::Capture {
            variable,
            pattern,
            retry,
        }) = flow.steps.get(index)
        else {
            warn!(sender = %event.from, flow = %flow.name, step = index, "pending capture points at a non-capture step");
            return Some(index);
        };

        let input = event.body.trim();
        if let Some(pattern) = pattern {
            if !pattern.is_match(input) {
                debug!(sender = %event.from, flow = %flow.name, step = index, "capture input rejected");
                if let Some(retry) = retry {
                    let text = render_template(retry, state, event);
                    self.deliver(event, state, exec, flow, index, text, None, &SendOptions::new())
                        .await;
                }
                self.park(state, node, index);
                return None;
            }
        }

        if let Some(variable) = variable {
            debug!(sender = %event.from, variable = %variable, "captured input");
            state.bind(variable.clone(), input);
        }
        let next = index + 1;
        state.advance(node, next);
        Some(next)
    }

    /// Execute steps from `index` of `node` until the flow yields.
    async fn run(
        &self,
        event: &InboundEvent,
        state: &mut ConversationState,
        mut exec: Execution,
        mut node: NodeId,
        mut index: usize,
    ) -> Result<DispatchOutcome, DispatchError> {
        loop {
            let Some(flow) = self.graph.node(node) else {
                error!(sender = %event.from, node = %node, "conversation points at a missing node");
                state.reset();
                return exec.finish(DispatchStatus::Completed);
            };

            let Some(step) = flow.steps.get(index) else {
                match flow.next {
                    Some(next) => {
                        debug!(sender = %event.from, from = %flow.name, "continuing with successor flow");
                        self.jump(event, state, &mut exec, flow, next)?;
                        node = next;
                        index = 0;
                        continue;
                    }
                    None => {
                        debug!(sender = %event.from, flow = %flow.name, "flow completed");
                        state.reset();
                        return exec.finish(DispatchStatus::Completed);
                    }
                }
            };

            match step {
                CompiledStep::Answer {
                    text,
                    delay,
                    media,
                    options,
                } => {
                    let text = render_template(text, state, event);
                    self.deliver(event, state, &mut exec, flow, index, text, media.as_deref(), options)
                        .await;
                    index += 1;
                    state.advance(node, index);
                    if let Some(delay) = (*delay).or_else(|| self.config.default_delay()) {
                        tokio::time::sleep(delay).await;
                    }
                }
                CompiledStep::Capture { .. } => {
                    debug!(sender = %event.from, flow = %flow.name, step = index, "waiting for input");
                    self.park(state, node, index);
                    return exec.finish(DispatchStatus::AwaitingInput);
                }
                CompiledStep::Jump(target) => {
                    self.jump(event, state, &mut exec, flow, *target)?;
                    node = *target;
                    index = 0;
                }
                CompiledStep::End => {
                    debug!(sender = %event.from, flow = %flow.name, "flow ended");
                    state.reset();
                    return exec.finish(DispatchStatus::Completed);
                }
                CompiledStep::Callback(name) => {
                    self.invoke_callback(event, state, &mut exec, flow, index, name)
                        .await;
                    index += 1;
                    state.advance(node, index);
                }
            }
        }
    }

    /// Count a jump and move to the start of `target`.
    fn jump(
        &self,
        event: &InboundEvent,
        state: &mut ConversationState,
        exec: &mut Execution,
        from: &FlowNode,
        target: NodeId,
    ) -> Result<(), DispatchError> {
        exec.jumps += 1;
        if exec.jumps > self.config.max_jump_chain {
            error!(
                sender = %event.from,
                flow = %from.name,
                limit = self.config.max_jump_chain,
                "jump chain limit exceeded, resetting conversation"
            );
            state.reset();
            return Err(DispatchError::FlowLoop {
                sender: event.from.clone(),
                flow: from.name.clone(),
                limit: self.config.max_jump_chain,
            });
        }
        debug!(sender = %event.from, from = %from.name, to = %self.flow_name(target), "jump");
        state.advance(target, 0);
        Ok(())
    }

    /// Send one answer and record it in history.
    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &self,
        event: &InboundEvent,
        state: &ConversationState,
        exec: &mut Execution,
        flow: &FlowNode,
        index: usize,
        text: String,
        media: Option<&str>,
        options: &SendOptions,
    ) {
        let content = match media {
            Some(media_ref) => OutboundContent::Media {
                caption: (!text.is_empty()).then(|| text.clone()),
                media_ref: media_ref.to_string(),
            },
            None => OutboundContent::text(text.clone()),
        };

        if let Err(e) = self
            .provider
            .send_message(&event.from, &content, options)
            .await
        {
            warn!(sender = %event.from, flow = %flow.name, step = index, error = %e, "failed to send answer");
            exec.failures.push(StepFailure {
                flow: flow.name.clone(),
                step: index,
                cause: e.into(),
            });
            return;
        }
        exec.answers += 1;

        let entry = HistoryEntry::new(
            event.from.as_str(),
            state.keyword().unwrap_or_default(),
            text,
            &flow.name,
            index,
        )
        .with_options(options.clone());
        if let Err(e) = self.database.save(entry).await {
            warn!(sender = %event.from, flow = %flow.name, step = index, error = %e, "failed to save history");
            exec.failures.push(StepFailure {
                flow: flow.name.clone(),
                step: index,
                cause: e.into(),
            });
        }
    }

    async fn invoke_callback(
        &self,
        event: &InboundEvent,
        state: &ConversationState,
        exec: &mut Execution,
        flow: &FlowNode,
        index: usize,
        name: &str,
    ) {
        let callback = self.callbacks.read().get(name).cloned();
        let Some(callback) = callback else {
            warn!(sender = %event.from, flow = %flow.name, callback = %name, "callback not registered");
            exec.failures.push(StepFailure {
                flow: flow.name.clone(),
                step: index,
                cause: StepFailureCause::UnknownCallback(name.to_string()),
            });
            return;
        };

        let ctx = CallbackContext {
            from: event.from.clone(),
            body: event.body.clone(),
            flow: flow.name.clone(),
            variables: state.variables().clone(),
        };
        if let Err(message) = callback.call(&ctx).await {
            warn!(sender = %event.from, flow = %flow.name, callback = %name, error = %message, "callback failed");
            exec.failures.push(StepFailure {
                flow: flow.name.clone(),
                step: index,
                cause: StepFailureCause::Callback {
                    name: name.to_string(),
                    message,
                },
            });
        }
    }

    /// Park on a capture and arm the idle timer when one is configured.
    fn park(&self, state: &mut ConversationState, node: NodeId, index: usize) {
        let Some(timeout) = self.config.idle_timeout() else {
            state.await_capture(node, index, None);
            return;
        };

        let token = self.shutdown.child_token();
        state.await_capture(node, index, Some(token.clone()));
        let generation = state.generation();

        let Some(tx) = self
            .queues
            .lock()
            .get(state.sender())
            .map(|queue| queue.tx.clone())
        else {
            return;
        };

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = tx.send(Task::IdleTimeout { generation });
                }
            }
        });
    }

    async fn handle_idle_timeout(&self, sender: &str, generation: u64) {
        let Some(shared) = self.states.get(sender) else {
            return;
        };
        let mut state = shared.lock().await;
        if state.generation() == generation && state.pending_capture().is_some() {
            info!(sender = %sender, "conversation idle, resetting");
            state.reset();
        } else {
            debug!(sender = %sender, "stale idle timer ignored");
        }
    }

    fn flow_name(&self, node: NodeId) -> &str {
        self.graph
            .node(node)
            .map(|n| n.name.as_str())
            .unwrap_or("?")
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    sender: String,
    mut rx: mpsc::UnboundedReceiver<Task>,
    depth: Arc<AtomicUsize>,
) {
    debug!(sender = %sender, "dispatch worker started");
    loop {
        let task = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        match task {
            Task::Inbound { event, reply } => {
                depth.fetch_sub(1, Ordering::SeqCst);
                let result = inner.handle_inbound(event).await;
                if let Err(e) = &result {
                    warn!(sender = %sender, error = %e, "dispatch failed");
                }
                // The caller may have dropped its handle.
                let _ = reply.send(result);
            }
            Task::IdleTimeout { generation } => {
                inner.handle_idle_timeout(&sender, generation).await;
            }
        }
    }
    debug!(sender = %sender, "dispatch worker stopped");
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").unwrap());

/// Substitute `{{name}}` placeholders.
///
/// Captured variables win over the built-ins `from`, `body` and `keyword`.
/// Unknown names are left as written.
pub fn render_template(template: &str, state: &ConversationState, event: &InboundEvent) -> String {
    let lookup = |name: &str| -> Option<String> {
        if let Some(value) = state.variables().get(name) {
            return Some(value.clone());
        }
        match name {
            "from" => Some(event.from.clone()),
            "body" => Some(event.body.clone()),
            "keyword" => state.keyword().map(str::to_string),
            _ => None,
        }
    };

    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
