//! Consumer-side reconstruction of the execution tree.
//!
//! The [`StreamReader`] replays events through its own [`ExecutionContext`],
//! so it applies exactly the rules the emitter enforced. The first event that
//! breaks them poisons the reader: every later call returns the same error and
//! no partially valid tree is handed out as if it were complete.

use tracing::{trace, warn};

use crate::context::ExecutionContext;
use crate::error::{ProtocolViolation, ReconstructionError};
use crate::event::{Event, SpanKind};

/// Default number of characters kept by [`Node::result_preview`].
pub const DEFAULT_PREVIEW_CHARS: usize = 200;

/// Index of a node inside an [`ExecutionTree`].
pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// The top-level unit at depth 0.
    Root,
    Agent {
        agent_id: String,
        /// The tool call at the parent depth that was open when the agent started.
        delegated_by: Option<NodeId>,
    },
    ToolCall {
        tool_id: String,
        result: Option<String>,
    },
}

/// One unit of work in the reconstructed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub name: String,
    pub depth: u32,
    /// Concatenated token text. Only agents and the root accumulate text.
    pub text: String,
    pub statuses: Vec<String>,
    /// Child units in start order.
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
    /// Index of the event that opened the node; 0 for the root.
    pub started_at: usize,
    /// Index of the event that closed the node.
    pub ended_at: Option<usize>,
}

impl Node {
    fn new(kind: NodeKind, name: String, depth: u32, parent: Option<NodeId>, index: usize) -> Self {
        Self {
            kind,
            name,
            depth,
            text: String::new(),
            statuses: Vec::new(),
            children: Vec::new(),
            parent,
            started_at: index,
            ended_at: None,
        }
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self.kind, NodeKind::ToolCall { .. })
    }

    pub fn is_agent(&self) -> bool {
        matches!(self.kind, NodeKind::Agent { .. })
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.kind, NodeKind::Root) || self.ended_at.is_some()
    }

    /// Tool or agent id; `None` for the root.
    pub fn span_id(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Root => None,
            NodeKind::Agent { agent_id, .. } => Some(agent_id),
            NodeKind::ToolCall { tool_id, .. } => Some(tool_id),
        }
    }

    /// Full result of a finished tool call.
    pub fn result(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::ToolCall { result, .. } => result.as_deref(),
            _ => None,
        }
    }

    /// Result cut to `limit` characters, with `...` appended when cut.
    pub fn result_preview(&self, limit: usize) -> Option<String> {
        self.result().map(|result| preview(result, limit))
    }
}

/// Truncates `text` to at most `limit` characters, never splitting a char.
pub fn preview(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Arena of nodes rooted at the depth-0 unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionTree {
    nodes: Vec<Node>,
}

impl Default for ExecutionTree {
    fn default() -> Self {
        Self {
            nodes: vec![Node::new(NodeKind::Root, String::new(), 0, None, 0)],
        }
    }
}

impl ExecutionTree {
    pub const ROOT: NodeId = 0;

    pub fn root(&self) -> &Node {
        &self.nodes[Self::ROOT]
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Children of `id` in start order.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &Node> {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|node| node.children.iter())
            .filter_map(|child| self.nodes.get(*child))
    }

    /// Every node except the root, in start order.
    pub fn descendants(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().skip(1)
    }

    pub fn find(&self, kind: SpanKind, id: &str) -> Option<&Node> {
        self.descendants().find(|node| {
            node.span_id() == Some(id)
                && match kind {
                    SpanKind::Tool => node.is_tool_call(),
                    SpanKind::Agent => node.is_agent(),
                }
        })
    }

    fn push(&mut self, parent: NodeId, node: Node) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(node);
        if let Some(parent) = self.nodes.get_mut(parent) {
            parent.children.push(id);
        }
        id
    }
}

/// Rebuilds an [`ExecutionTree`] from an event stream.
#[derive(Debug)]
pub struct StreamReader {
    context: ExecutionContext,
    tree: ExecutionTree,
    // agents[d] is the node of the agent active at depth d; agents[0] is the root.
    agents: Vec<NodeId>,
    // Open tool calls, innermost last within a depth.
    open_tools: Vec<(String, NodeId)>,
    seen: usize,
    failure: Option<ReconstructionError>,
}

impl Default for StreamReader {
    fn default() -> Self {
        Self {
            context: ExecutionContext::new(),
            tree: ExecutionTree::default(),
            agents: vec![ExecutionTree::ROOT],
            open_tools: Vec::new(),
            seen: 0,
            failure: None,
        }
    }
}

impl StreamReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays a complete stream and returns its tree.
    pub fn replay<I>(events: I) -> Result<ExecutionTree, ReconstructionError>
    where
        I: IntoIterator<Item = Event>,
    {
        let mut reader = Self::new();
        for event in events {
            reader.apply(&event)?;
        }
        reader.into_tree()
    }

    pub fn tree(&self) -> &ExecutionTree {
        &self.tree
    }

    pub fn is_finished(&self) -> bool {
        self.context.is_finished()
    }

    pub fn events_seen(&self) -> usize {
        self.seen
    }

    pub fn failure(&self) -> Option<&ReconstructionError> {
        self.failure.as_ref()
    }

    /// Applies the next event of the stream.
    pub fn apply(&mut self, event: &Event) -> Result<(), ReconstructionError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let index = self.seen;
        self.seen += 1;

        // The parent tool is looked up before the agent span pushes onto the context.
        let delegated_by = match event {
            Event::AgentStart { depth, .. } => self.delegating_tool(*depth),
            _ => None,
        };

        if let Err(violation) = self.context.apply(event) {
            let error = match violation {
                ProtocolViolation::UnclosedSpans { .. } => ReconstructionError::Incomplete {
                    open: self.context.open_labels(),
                },
                violation => ReconstructionError::Violation { index, violation },
            };
            warn!(index, kind = %event.kind(), error = %error, "stream rejected");
            self.failure = Some(error.clone());
            return Err(error);
        }
        trace!(index, kind = %event.kind(), "applied event");
        self.record(event, index, delegated_by);
        Ok(())
    }

    /// Signals the end of input. A stream that ended without `done` is truncated.
    pub fn end_of_stream(&mut self) -> Result<(), ReconstructionError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        if !self.is_finished() {
            self.failure = Some(ReconstructionError::Truncated);
            return Err(ReconstructionError::Truncated);
        }
        Ok(())
    }

    /// Returns the finished tree. Fails if the stream was rejected or is not done.
    pub fn into_tree(mut self) -> Result<ExecutionTree, ReconstructionError> {
        self.end_of_stream()?;
        Ok(self.tree)
    }

    fn delegating_tool(&self, depth: u32) -> Option<NodeId> {
        let parent_depth = depth.checked_sub(1)?;
        let span = self.context.innermost(parent_depth)?;
        if span.kind != SpanKind::Tool {
            return None;
        }
        self.open_tools
            .iter()
            .rev()
            .find(|(id, _)| *id == span.id)
            .map(|(_, node)| *node)
    }

    fn active_agent(&self, depth: u32) -> NodeId {
        self.agents
            .get(depth as usize)
            .copied()
            .unwrap_or(ExecutionTree::ROOT)
    }

    // Only called for events the context accepted.
    fn record(&mut self, event: &Event, index: usize, delegated_by: Option<NodeId>) {
        match event {
            Event::Status { description, depth } => {
                let agent = self.active_agent(*depth);
                if let Some(node) = self.tree.nodes.get_mut(agent) {
                    node.statuses.push(description.clone());
                }
            }
            Event::Token { content, depth } => {
                let agent = self.active_agent(*depth);
                if let Some(node) = self.tree.nodes.get_mut(agent) {
                    node.text.push_str(content);
                }
            }
            Event::ToolStart {
                tool_id,
                name,
                depth,
            } => {
                let parent = self.active_agent(*depth);
                let kind = NodeKind::ToolCall {
                    tool_id: tool_id.clone(),
                    result: None,
                };
                let node = Node::new(kind, name.clone(), *depth, Some(parent), index);
                let id = self.tree.push(parent, node);
                self.open_tools.push((tool_id.clone(), id));
            }
            Event::ToolEnd {
                tool_id, result, ..
            } => {
                let Some(pos) = self.open_tools.iter().rposition(|(id, _)| id == tool_id) else {
                    return;
                };
                let (_, id) = self.open_tools.remove(pos);
                if let Some(node) = self.tree.nodes.get_mut(id) {
                    if let NodeKind::ToolCall { result: slot, .. } = &mut node.kind {
                        *slot = Some(result.clone());
                    }
                    node.ended_at = Some(index);
                }
            }
            Event::AgentStart {
                agent_id,
                name,
                depth,
            } => {
                let parent = self.active_agent(depth.saturating_sub(1));
                let kind = NodeKind::Agent {
                    agent_id: agent_id.clone(),
                    delegated_by,
                };
                let node = Node::new(kind, name.clone(), *depth, Some(parent), index);
                let id = self.tree.push(parent, node);
                self.agents.truncate(*depth as usize);
                self.agents.push(id);
            }
            Event::AgentEnd { depth, .. } => {
                if let Some(id) = self.agents.get(*depth as usize).copied()
                    && let Some(node) = self.tree.nodes.get_mut(id)
                {
                    node.ended_at = Some(index);
                }
                self.agents.truncate(*depth as usize);
            }
            Event::Done => {}
        }
    }
}
