//! Flow definition types.
//!
//! Author-facing declarations: a trigger, an ordered list of steps and
//! optional nested sub-flows. These are plain values; the compiler in
//! [`crate::flows::graph`] turns them into a navigable graph.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single declared flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Unique identifier, also the target name for jumps.
    pub id: String,
    /// What selects this flow as an entry point.
    #[serde(default)]
    pub trigger: Trigger,
    /// Steps executed in declared order.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Nested sub-flows owned by this flow.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flows: Vec<FlowDefinition>,
    /// Flow to continue with once every step has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// Trigger that selects a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "keywords", rename_all = "snake_case")]
pub enum Trigger {
    /// Entered when the inbound text equals one of these keywords.
    Keywords(Vec<String>),
    /// Entered when nothing else matches.
    Fallback,
    /// Only reachable through a jump.
    #[default]
    None,
}

/// One unit of work within a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Send a message.
    Answer {
        /// Message template; `{{name}}` placeholders are substituted.
        text: String,
        /// Pause after sending, overriding the engine default.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
        /// Media reference sent with the text.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media: Option<String>,
        /// Opaque options forwarded to the provider and recorded in history.
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        options: Map<String, Value>,
    },
    /// Wait for the next inbound message.
    Capture {
        /// Variable the reply is bound to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variable: Option<String>,
        /// Regex the reply must match.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        /// Prompt sent when the reply does not match.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<String>,
    },
    /// Continue with another flow.
    Jump {
        /// Target flow id.
        flow: String,
    },
    /// Return the conversation to idle.
    End,
    /// Invoke a callback registered on the dispatcher.
    Callback {
        /// Registered callback name.
        name: String,
    },
}

impl Step {
    /// Plain text answer.
    pub fn answer(text: impl Into<String>) -> Self {
        Self::Answer {
            text: text.into(),
            delay_ms: None,
            media: None,
            options: Map::new(),
        }
    }

    /// Capture bound to `variable`.
    pub fn capture(variable: impl Into<String>) -> Self {
        Self::Capture {
            variable: Some(variable.into()),
            pattern: None,
            retry: None,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Answer { .. } => "answer",
            Self::Capture { .. } => "capture",
            Self::Jump { .. } => "jump",
            Self::End => "end",
            Self::Callback { .. } => "callback",
        }
    }
}

impl FlowDefinition {
    /// Create a flow with no trigger.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trigger: Trigger::None,
            steps: Vec::new(),
            flows: Vec::new(),
            next: None,
        }
    }

    /// Create a flow triggered by a single keyword. The keyword doubles as the id.
    pub fn keyword(keyword: impl Into<String>) -> Self {
        let keyword = keyword.into();
        Self::new(keyword.clone()).with_keywords(vec![keyword])
    }

    /// Create a fallback flow.
    pub fn fallback(id: impl Into<String>) -> Self {
        Self::new(id).with_trigger(Trigger::Fallback)
    }

    /// Set the trigger.
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Trigger on any of `keywords`.
    pub fn with_keywords<S: Into<String>>(mut self, keywords: Vec<S>) -> Self {
        self.trigger = Trigger::Keywords(keywords.into_iter().map(Into::into).collect());
        self
    }

    /// Override the id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Append an arbitrary step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a text answer.
    pub fn answer(self, text: impl Into<String>) -> Self {
        self.step(Step::answer(text))
    }

    /// Append a text answer followed by a pause.
    pub fn answer_with_delay(self, text: impl Into<String>, delay_ms: u64) -> Self {
        self.step(Step::Answer {
            text: text.into(),
            delay_ms: Some(delay_ms),
            media: None,
            options: Map::new(),
        })
    }

    /// Append a capture bound to `variable`.
    pub fn capture(self, variable: impl Into<String>) -> Self {
        self.step(Step::capture(variable))
    }

    /// Append a validated capture that re-prompts with `retry` on mismatch.
    pub fn capture_matching(
        self,
        variable: impl Into<String>,
        pattern: impl Into<String>,
        retry: impl Into<String>,
    ) -> Self {
        self.step(Step::Capture {
            variable: Some(variable.into()),
            pattern: Some(pattern.into()),
            retry: Some(retry.into()),
        })
    }

    /// Append a jump to `flow`.
    pub fn jump(self, flow: impl Into<String>) -> Self {
        self.step(Step::Jump { flow: flow.into() })
    }

    /// Append an end directive.
    pub fn end(self) -> Self {
        self.step(Step::End)
    }

    /// Append a callback invocation.
    pub fn callback(self, name: impl Into<String>) -> Self {
        self.step(Step::Callback { name: name.into() })
    }

    /// Nest a sub-flow.
    pub fn child(mut self, flow: FlowDefinition) -> Self {
        self.flows.push(flow);
        self
    }

    /// Continue with `flow` after the last step.
    pub fn then(mut self, flow: impl Into<String>) -> Self {
        self.next = Some(flow.into());
        self
    }
}
