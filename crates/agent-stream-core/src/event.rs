//! Typed events that make up an execution stream.
//!
//! An [`Event`] is one observable occurrence of a run. Events are serialized
//! adjacently tagged (`{"type": ..., "data": {...}}`) so every frame on the
//! wire is self-describing. Unknown event types and unknown fields are decode
//! errors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolViolation;

/// Result text attached to tool calls that finished without output.
pub const EMPTY_RESULT_PLACEHOLDER: &str = "✓ completed";

/// One observable occurrence in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    deny_unknown_fields
)]
pub enum Event {
    /// Informational progress update at a nesting depth.
    Status {
        description: String,
        #[serde(rename = "agent_depth")]
        depth: u32,
    },
    /// A tool invocation began.
    ToolStart {
        tool_id: String,
        name: String,
        #[serde(rename = "agent_depth")]
        depth: u32,
    },
    /// The tool invocation identified by `tool_id` completed.
    ToolEnd {
        tool_id: String,
        name: String,
        result: String,
        #[serde(rename = "agent_depth")]
        depth: u32,
    },
    /// Incremental output text of the unit active at `depth`.
    Token {
        content: String,
        #[serde(rename = "agent_depth")]
        depth: u32,
    },
    /// A sub-agent began. Depth is always at least 1.
    AgentStart {
        agent_id: String,
        name: String,
        depth: u32,
    },
    /// The sub-agent identified by `agent_id` completed.
    AgentEnd { agent_id: String, depth: u32 },
    /// Terminal marker, exactly one per stream.
    Done,
}

impl Event {
    pub fn status(description: impl Into<String>, depth: u32) -> Self {
        Event::Status {
            description: description.into(),
            depth,
        }
    }

    pub fn tool_start(tool_id: impl Into<String>, name: impl Into<String>, depth: u32) -> Self {
        Event::ToolStart {
            tool_id: tool_id.into(),
            name: name.into(),
            depth,
        }
    }

    pub fn tool_end(
        tool_id: impl Into<String>,
        name: impl Into<String>,
        result: impl Into<String>,
        depth: u32,
    ) -> Self {
        Event::ToolEnd {
            tool_id: tool_id.into(),
            name: name.into(),
            result: result.into(),
            depth,
        }
    }

    pub fn token(content: impl Into<String>, depth: u32) -> Self {
        Event::Token {
            content: content.into(),
            depth,
        }
    }

    pub fn agent_start(agent_id: impl Into<String>, name: impl Into<String>, depth: u32) -> Self {
        Event::AgentStart {
            agent_id: agent_id.into(),
            name: name.into(),
            depth,
        }
    }

    pub fn agent_end(agent_id: impl Into<String>, depth: u32) -> Self {
        Event::AgentEnd {
            agent_id: agent_id.into(),
            depth,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Status { .. } => EventKind::Status,
            Event::ToolStart { .. } => EventKind::ToolStart,
            Event::ToolEnd { .. } => EventKind::ToolEnd,
            Event::Token { .. } => EventKind::Token,
            Event::AgentStart { .. } => EventKind::AgentStart,
            Event::AgentEnd { .. } => EventKind::AgentEnd,
            Event::Done => EventKind::Done,
        }
    }

    /// Nesting depth of the event. `Done` has no depth.
    pub fn depth(&self) -> Option<u32> {
        match self {
            Event::Status { depth, .. }
            | Event::ToolStart { depth, .. }
            | Event::ToolEnd { depth, .. }
            | Event::Token { depth, .. }
            | Event::AgentStart { depth, .. }
            | Event::AgentEnd { depth, .. } => Some(*depth),
            Event::Done => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Event::Done)
    }

    /// Checks the invariants that hold for a single event in isolation.
    ///
    /// Matching against previously opened spans is the job of
    /// [`ExecutionContext`](crate::ExecutionContext).
    pub fn check_shape(&self) -> Result<(), ProtocolViolation> {
        match self {
            Event::ToolStart { tool_id, .. } | Event::ToolEnd { tool_id, .. }
                if tool_id.trim().is_empty() =>
            {
                Err(ProtocolViolation::EmptyId {
                    kind: SpanKind::Tool,
                })
            }
            Event::AgentStart { agent_id, .. } | Event::AgentEnd { agent_id, .. }
                if agent_id.trim().is_empty() =>
            {
                Err(ProtocolViolation::EmptyId {
                    kind: SpanKind::Agent,
                })
            }
            Event::AgentStart { depth: 0, .. } | Event::AgentEnd { depth: 0, .. } => {
                Err(ProtocolViolation::AgentAtRoot)
            }
            _ => Ok(()),
        }
    }
}

/// Type tag of an [`Event`], as written in the `type` field of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Status,
    ToolStart,
    ToolEnd,
    Token,
    AgentStart,
    AgentEnd,
    Done,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Status => "status",
            EventKind::ToolStart => "tool_start",
            EventKind::ToolEnd => "tool_end",
            EventKind::Token => "token",
            EventKind::AgentStart => "agent_start",
            EventKind::AgentEnd => "agent_end",
            EventKind::Done => "done",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of unit of work a span represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Tool,
    Agent,
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpanKind::Tool => f.write_str("tool"),
            SpanKind::Agent => f.write_str("agent"),
        }
    }
}

/// Maps an empty or whitespace-only tool result to [`EMPTY_RESULT_PLACEHOLDER`].
pub fn normalize_tool_result(result: impl Into<String>) -> String {
    let result = result.into();
    if result.trim().is_empty() {
        EMPTY_RESULT_PLACEHOLDER.to_string()
    } else {
        result
    }
}
