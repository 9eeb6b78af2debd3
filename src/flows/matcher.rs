//! Inbound message resolution.
//!
//! Decides which node runs next for an inbound message. Order, first match
//! wins: pending capture, root keyword, fallback, nothing.

use crate::flows::graph::{normalize, FlowGraph, NodeId};
use crate::flows::state::ConversationState;
use crate::provider::InboundEvent;

/// Where an inbound message leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    /// The message answers the capture at `capture_index` of `node`.
    Resume { node: NodeId, capture_index: usize },
    /// The message matched a keyword; start `node` from its first step.
    Fresh { node: NodeId, keyword: String },
    /// Nothing matched; start the fallback node.
    Fallback { node: NodeId },
    /// Nothing matched and there is no fallback.
    NoMatch,
}

impl ResolvedTarget {
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Self::Resume { node, .. } | Self::Fresh { node, .. } | Self::Fallback { node } => {
                Some(*node)
            }
            Self::NoMatch => None,
        }
    }
}

/// Resolve `inbound` against the sender's state and the graph.
pub fn resolve(inbound: &InboundEvent, state: &ConversationState, graph: &FlowGraph) -> ResolvedTarget {
    // A capture in progress owns the next message, whatever it says.
    if let (Some(node), Some(capture_index)) = (state.current(), state.pending_capture()) {
        return ResolvedTarget::Resume {
            node,
            capture_index,
        };
    }

    let keyword = normalize(&inbound.body);
    if let Some(node) = graph.lookup(&keyword) {
        return ResolvedTarget::Fresh { node, keyword };
    }

    match graph.fallback() {
        Some(node) => ResolvedTarget::Fallback { node },
        None => ResolvedTarget::NoMatch,
    }
}
