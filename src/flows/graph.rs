//! Flow graph compiler.
//!
//! Flattens declared flows (including nested sub-flows) into an arena of
//! [`FlowNode`]s, builds the root keyword table and validates structure.
//! The resulting [`FlowGraph`] is immutable and shared by every conversation.

use crate::flows::definition::{FlowDefinition, Step, Trigger};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Index of a node inside a [`FlowGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Structural errors found while compiling flows.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompilationError {
    #[error("flow id must not be empty")]
    EmptyId,

    #[error("duplicate flow id: {0}")]
    DuplicateFlow(String),

    #[error("flow '{flow}' references unknown flow '{target}'")]
    UnknownTarget { flow: String, target: String },

    #[error("flow '{flow}' has an invalid capture pattern: {message}")]
    InvalidPattern { flow: String, message: String },

    #[error("cyclic flow jumps: {}", .0.join(" -> "))]
    Cyclic(Vec<String>),
}

/// Non-fatal configuration problems found while compiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileWarning {
    /// A keyword was registered again; the later flow replaced the earlier one.
    KeywordOverridden {
        keyword: String,
        previous: String,
        current: String,
    },
    /// More than one fallback flow was declared; the last one is used.
    FallbackOverridden { previous: String, current: String },
}

impl fmt::Display for CompileWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeywordOverridden {
                keyword,
                previous,
                current,
            } => write!(
                f,
                "keyword '{}' of flow '{}' is overridden by flow '{}'",
                keyword, previous, current
            ),
            Self::FallbackOverridden { previous, current } => write!(
                f,
                "fallback flow '{}' is overridden by flow '{}'",
                previous, current
            ),
        }
    }
}

/// A step ready for execution.
#[derive(Debug, Clone)]
pub enum CompiledStep {
    Answer {
        text: String,
        delay: Option<Duration>,
        media: Option<String>,
        options: Map<String, Value>,
    },
    Capture {
        variable: Option<String>,
        pattern: Option<Regex>,
        retry: Option<String>,
    },
    Jump(NodeId),
    End,
    Callback(String),
}

/// Compiled flow.
#[derive(Debug, Clone)]
pub struct FlowNode {
    /// Position in the graph arena.
    pub id: NodeId,
    /// Declared flow id.
    pub name: String,
    /// Normalized keywords that select this node.
    pub keywords: Vec<String>,
    /// Steps in declared order.
    pub steps: Vec<CompiledStep>,
    /// Successor entered after the last step.
    pub next: Option<NodeId>,
    /// Enclosing flow for nested sub-flows.
    pub parent: Option<NodeId>,
    /// Child nodes by id.
    pub children: HashMap<String, NodeId>,
}

/// One row of the diagnostic route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Normalized keyword, or `*` for the fallback.
    pub keyword: String,
    /// Flow id reached by the keyword.
    pub flow: String,
}

/// Immutable, indexed set of compiled flows.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    nodes: Vec<FlowNode>,
    by_name: HashMap<String, NodeId>,
    keywords: HashMap<String, NodeId>,
    fallback: Option<NodeId>,
    warnings: Vec<CompileWarning>,
}

/// Trim and case-fold text for keyword lookup.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

impl FlowGraph {
    /// Compile flow definitions into a graph.
    pub fn compile(definitions: &[FlowDefinition]) -> Result<Self, CompilationError> {
        let mut graph = FlowGraph::default();

        // Pass 1: allocate nodes so jumps can point forward.
        let mut pending = Vec::new();
        for def in definitions {
            graph.allocate(def, None, &mut pending)?;
        }

        // Pass 2: resolve triggers and steps.
        for (def, id) in &pending {
            graph.register_trigger(def, *id);
            let steps = def
                .steps
                .iter()
                .map(|step| graph.compile_step(def, *id, step))
                .collect::<Result<Vec<_>, _>>()?;
            let next = match &def.next {
                Some(target) => Some(graph.resolve_target(&def.id, *id, target)?),
                None => None,
            };
            let node = &mut graph.nodes[id.0];
            node.steps = steps;
            node.next = next;
        }

        graph.check_cycles()?;

        for warning in &graph.warnings {
            warn!(warning = %warning, "flow configuration warning");
        }
        info!(
            flows = graph.nodes.len(),
            keywords = graph.keywords.len(),
            fallback = graph.fallback.is_some(),
            "compiled flow graph"
        );
        Ok(graph)
    }

    fn allocate<'a>(
        &mut self,
        def: &'a FlowDefinition,
        parent: Option<NodeId>,
        pending: &mut Vec<(&'a FlowDefinition, NodeId)>,
    ) -> Result<NodeId, CompilationError> {
        if def.id.trim().is_empty() {
            return Err(CompilationError::EmptyId);
        }
        if self.by_name.contains_key(&def.id) {
            return Err(CompilationError::DuplicateFlow(def.id.clone()));
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(FlowNode {
            id,
            name: def.id.clone(),
            keywords: Vec::new(),
            steps: Vec::new(),
            next: None,
            parent,
            children: HashMap::new(),
        });
        self.by_name.insert(def.id.clone(), id);
        pending.push((def, id));

        for child in &def.flows {
            let child_id = self.allocate(child, Some(id), pending)?;
            self.nodes[id.0].children.insert(child.id.clone(), child_id);
        }
        Ok(id)
    }

    fn register_trigger(&mut self, def: &FlowDefinition, id: NodeId) {
        match &def.trigger {
            Trigger::Keywords(keywords) => {
                for keyword in keywords {
                    let key = normalize(keyword);
                    if key.is_empty() {
                        continue;
                    }
                    if let Some(previous) = self.keywords.insert(key.clone(), id) {
                        if previous != id {
                            self.warnings.push(CompileWarning::KeywordOverridden {
                                keyword: key.clone(),
                                previous: self.nodes[previous.0].name.clone(),
                                current: def.id.clone(),
                            });
                        }
                    }
                    let node = &mut self.nodes[id.0];
                    if !node.keywords.contains(&key) {
                        node.keywords.push(key);
                    }
                }
            }
            Trigger::Fallback => {
                if let Some(previous) = self.fallback.replace(id) {
                    self.warnings.push(CompileWarning::FallbackOverridden {
                        previous: self.nodes[previous.0].name.clone(),
                        current: def.id.clone(),
                    });
                }
            }
            Trigger::None => {}
        }
    }

    fn compile_step(
        &self,
        def: &FlowDefinition,
        id: NodeId,
        step: &Step,
    ) -> Result<CompiledStep, CompilationError> {
        debug!(flow = %def.id, step = step.kind(), "compiling step");
        Ok(match step {
            Step::Answer {
                text,
                delay_ms,
                media,
                options,
            } => CompiledStep::Answer {
                text: text.clone(),
                delay: delay_ms.map(Duration::from_millis),
                media: media.clone(),
                options: options.clone(),
            },
            Step::Capture {
                variable,
                pattern,
                retry,
            } => {
                let pattern = match pattern {
                    Some(p) => Some(Regex::new(p).map_err(|e| CompilationError::InvalidPattern {
                        flow: def.id.clone(),
                        message: e.to_string(),
                    })?),
                    None => None,
                };
                CompiledStep::Capture {
                    variable: variable.clone(),
                    pattern,
                    retry: retry.clone(),
                }
            }
            Step::Jump { flow } => CompiledStep::Jump(self.resolve_target(&def.id, id, flow)?),
            Step::End => CompiledStep::End,
            Step::Callback { name } => CompiledStep::Callback(name.clone()),
        })
    }

    /// Resolve a jump target, preferring the children of the jumping flow.
    fn resolve_target(
        &self,
        flow: &str,
        from: NodeId,
        target: &str,
    ) -> Result<NodeId, CompilationError> {
        self.nodes[from.0]
            .children
            .get(target)
            .or_else(|| self.by_name.get(target))
            .copied()
            .ok_or_else(|| CompilationError::UnknownTarget {
                flow: flow.to_string(),
                target: target.to_string(),
            })
    }

    /// Jumps a node performs before it can stop on a capture or end step.
    fn immediate_jumps(&self, node: &FlowNode) -> Vec<NodeId> {
        let mut targets = Vec::new();
        for step in &node.steps {
            match step {
                CompiledStep::Jump(target) => {
                    // Nothing after a jump runs in this node.
                    targets.push(*target);
                    return targets;
                }
                CompiledStep::Capture { .. } | CompiledStep::End => return targets,
                _ => {}
            }
        }
        targets.extend(node.next);
        targets
    }

    /// Depth-first search for jump cycles that never yield to the user.
    fn check_cycles(&self) -> Result<(), CompilationError> {
        let edges: Vec<Vec<NodeId>> = self.nodes.iter().map(|n| self.immediate_jumps(n)).collect();
        let mut visited = HashSet::new();

        for start in 0..self.nodes.len() {
            if visited.contains(&NodeId(start)) {
                continue;
            }
            let mut path: Vec<NodeId> = Vec::new();
            let mut on_path = HashSet::new();
            // (node, index of next edge to explore)
            let mut stack = vec![(NodeId(start), 0usize)];
            visited.insert(NodeId(start));
            path.push(NodeId(start));
            on_path.insert(NodeId(start));

            while let Some((node, edge)) = stack.last_mut() {
                let node = *node;
                if let Some(&target) = edges[node.0].get(*edge) {
                    *edge += 1;
                    if on_path.contains(&target) {
                        let begin = path.iter().position(|n| *n == target).unwrap_or(0);
                        let mut cycle: Vec<String> = path[begin..]
                            .iter()
                            .map(|n| self.nodes[n.0].name.clone())
                            .collect();
                        cycle.push(self.nodes[target.0].name.clone());
                        return Err(CompilationError::Cyclic(cycle));
                    }
                    if visited.insert(target) {
                        stack.push((target, 0));
                        path.push(target);
                        on_path.insert(target);
                    }
                } else {
                    stack.pop();
                    path.pop();
                    on_path.remove(&node);
                }
            }
        }
        debug!(flows = self.nodes.len(), "no jump cycles found");
        Ok(())
    }

    /// Get a node by id.
    pub fn node(&self, id: NodeId) -> Option<&FlowNode> {
        self.nodes.get(id.0)
    }

    /// Get a node by declared flow id.
    pub fn get(&self, name: &str) -> Option<&FlowNode> {
        self.by_name.get(name).and_then(|id| self.node(*id))
    }

    /// Look up a keyword in the root table. The text is normalized first.
    pub fn lookup(&self, text: &str) -> Option<NodeId> {
        self.keywords.get(&normalize(text)).copied()
    }

    /// The fallback node, if any.
    pub fn fallback(&self) -> Option<NodeId> {
        self.fallback
    }

    /// Warnings produced during compilation.
    pub fn warnings(&self) -> &[CompileWarning] {
        &self.warnings
    }

    /// Number of compiled nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Names of every callback referenced by a step.
    pub fn callback_names(&self) -> HashSet<&str> {
        self.nodes
            .iter()
            .flat_map(|n| n.steps.iter())
            .filter_map(|s| match s {
                CompiledStep::Callback(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Keyword routing table, sorted by keyword, fallback last.
    ///
    /// Diagnostic only; dispatch never reads it.
    pub fn routes(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self
            .keywords
            .iter()
            .map(|(keyword, id)| Route {
                keyword: keyword.clone(),
                flow: self.nodes[id.0].name.clone(),
            })
            .collect();
        routes.sort_by(|a, b| a.keyword.cmp(&b.keyword));
        if let Some(id) = self.fallback {
            routes.push(Route {
                keyword: "*".to_string(),
                flow: self.nodes[id.0].name.clone(),
            });
        }
        routes
    }
}
