//! Conversational flows
//!
//! Flows are declared as data ([`FlowDefinition`]), compiled once into an
//! immutable [`FlowGraph`] and executed per sender by the [`Dispatcher`].
//! A flow is entered by one of its keywords (or as the fallback), sends its
//! answers, may wait for the user's reply with a capture step, and can jump
//! to other flows.
//!
//! # Example Flow Configuration
//!
//! ```json5
//! flows: [
//!   {
//!     id: "hola",
//!     trigger: { type: "keywords", keywords: ["hola", "hi"] },
//!     steps: [
//!       { type: "answer", text: "Buenas!" },
//!       { type: "answer", text: "What is your name?" },
//!       { type: "capture", variable: "name" },
//!       { type: "answer", text: "Nice to meet you, {{name}}", delay_ms: 500 },
//!       { type: "jump", flow: "menu" },
//!     ],
//!   },
//!   {
//!     id: "menu",
//!     steps: [{ type: "answer", text: "Type 'prices' or 'hours'" }],
//!   },
//!   {
//!     id: "help",
//!     trigger: { type: "fallback" },
//!     steps: [{ type: "answer", text: "Say 'hola' to start" }],
//!   },
//! ]
//! ```

pub mod definition;
pub mod dispatcher;
pub mod graph;
pub mod matcher;
pub mod state;

pub use definition::{FlowDefinition, Step, Trigger};
pub use dispatcher::{
    CallbackContext, DispatchError, DispatchHandle, DispatchOutcome, DispatchStatus, Dispatcher,
    FlowCallback, StepFailure, StepFailureCause,
};
pub use graph::{CompilationError, CompileWarning, CompiledStep, FlowGraph, FlowNode, NodeId, Route};
pub use matcher::ResolvedTarget;
pub use state::{ConversationSnapshot, ConversationState, StateStore};
