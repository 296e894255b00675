//! Depth tracking and span matching.
//!
//! The context keeps one stack of open spans per depth. A close always matches
//! the most recently opened, not yet closed span at exactly its depth; there is
//! no global FIFO and no cross-depth matching.

use std::collections::HashSet;

use crate::error::ProtocolViolation;
use crate::event::{Event, SpanKind};

/// A span that has started and not yet ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSpan {
    pub kind: SpanKind,
    pub id: String,
    pub name: String,
    pub depth: u32,
}

impl OpenSpan {
    /// Synthetic end event that closes this span.
    pub fn close_event(&self, result: &str) -> Event {
        match self.kind {
            SpanKind::Tool => Event::tool_end(&self.id, &self.name, result, self.depth),
            SpanKind::Agent => Event::agent_end(&self.id, self.depth),
        }
    }

    fn label(&self) -> String {
        format!("{} `{}` at depth {}", self.kind, self.id, self.depth)
    }
}

/// Execution context of one stream: current depth plus open spans per depth.
///
/// Validation happens before any mutation, so a rejected event leaves the
/// context unchanged.
#[derive(Debug)]
pub struct ExecutionContext {
    current: u32,
    // Index is the depth; the root stack always exists.
    stacks: Vec<Vec<OpenSpan>>,
    used_ids: HashSet<(SpanKind, String)>,
    finished: bool,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            current: 0,
            stacks: vec![Vec::new()],
            used_ids: HashSet::new(),
            finished: false,
        }
    }

    pub fn current_depth(&self) -> u32 {
        self.current
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Depth 0 is always active; deeper levels are active while their agent span is open.
    pub fn is_active(&self, depth: u32) -> bool {
        depth <= self.current
    }

    pub fn open_count(&self) -> usize {
        self.stacks.iter().map(Vec::len).sum()
    }

    /// Open spans in opening order, outermost first. Reversed, this is the
    /// order in which a failure cascade has to close them.
    pub fn open_spans(&self) -> impl DoubleEndedIterator<Item = &OpenSpan> {
        self.stacks.iter().flatten()
    }

    /// Innermost open span at `depth`, if any.
    pub fn innermost(&self, depth: u32) -> Option<&OpenSpan> {
        self.stacks.get(depth as usize).and_then(|stack| stack.last())
    }

    /// Labels of all open spans, used for diagnostics.
    pub fn open_labels(&self) -> Vec<String> {
        self.open_spans().map(OpenSpan::label).collect()
    }

    /// Opens a span. Agents must enter exactly one level below the current
    /// depth, tools at the current depth.
    pub fn enter(
        &mut self,
        kind: SpanKind,
        id: &str,
        name: &str,
        depth: u32,
    ) -> Result<(), ProtocolViolation> {
        if id.trim().is_empty() {
            return Err(ProtocolViolation::EmptyId { kind });
        }
        let expected = match kind {
            SpanKind::Agent => self.current + 1,
            SpanKind::Tool => self.current,
        };
        if depth != expected {
            return Err(ProtocolViolation::DepthSkip {
                kind,
                id: id.to_string(),
                expected,
                got: depth,
            });
        }
        let key = (kind, id.to_string());
        if self.used_ids.contains(&key) {
            return Err(ProtocolViolation::DuplicateId {
                kind,
                id: key.1,
            });
        }

        let index = depth as usize;
        if self.stacks.len() <= index {
            self.stacks.resize_with(index + 1, Vec::new);
        }
        self.stacks[index].push(OpenSpan {
            kind,
            id: id.to_string(),
            name: name.to_string(),
            depth,
        });
        self.used_ids.insert(key);
        if kind == SpanKind::Agent {
            self.current = depth;
        }
        Ok(())
    }

    /// Closes the innermost open span at `depth`, which must be `id`.
    pub fn exit(
        &mut self,
        kind: SpanKind,
        id: &str,
        depth: u32,
    ) -> Result<OpenSpan, ProtocolViolation> {
        if depth > self.current {
            return Err(ProtocolViolation::NothingOpen {
                kind,
                id: id.to_string(),
                depth,
            });
        }
        if depth < self.current {
            return Err(ProtocolViolation::CloseAtInactiveDepth {
                kind,
                id: id.to_string(),
                got: depth,
                current: self.current,
            });
        }
        let index = depth as usize;
        let Some(top) = self.stacks.get(index).and_then(|stack| stack.last()) else {
            return Err(ProtocolViolation::NothingOpen {
                kind,
                id: id.to_string(),
                depth,
            });
        };
        if top.kind != kind || top.id != id {
            return Err(ProtocolViolation::IdMismatch {
                kind,
                expected: top.id.clone(),
                got: id.to_string(),
                depth,
            });
        }

        let span = self.stacks[index]
            .pop()
            .ok_or_else(|| ProtocolViolation::NothingOpen {
                kind,
                id: id.to_string(),
                depth,
            })?;
        if kind == SpanKind::Agent {
            self.current = depth - 1;
            self.stacks.truncate(index.max(1));
        }
        Ok(span)
    }

    /// Validates `event` against the current state and applies it.
    pub fn apply(&mut self, event: &Event) -> Result<(), ProtocolViolation> {
        if self.finished {
            return Err(ProtocolViolation::AfterDone {
                event: event.kind(),
            });
        }
        event.check_shape()?;
        match event {
            Event::Status { depth, .. } | Event::Token { depth, .. } => {
                if !self.is_active(*depth) {
                    return Err(ProtocolViolation::InactiveDepth {
                        event: event.kind(),
                        depth: *depth,
                    });
                }
                Ok(())
            }
            Event::ToolStart {
                tool_id,
                name,
                depth,
            } => self.enter(SpanKind::Tool, tool_id, name, *depth),
            Event::ToolEnd { tool_id, depth, .. } => {
                self.exit(SpanKind::Tool, tool_id, *depth).map(|_| ())
            }
            Event::AgentStart {
                agent_id,
                name,
                depth,
            } => self.enter(SpanKind::Agent, agent_id, name, *depth),
            Event::AgentEnd { agent_id, depth } => {
                self.exit(SpanKind::Agent, agent_id, *depth).map(|_| ())
            }
            Event::Done => {
                let open = self.open_count();
                if open > 0 {
                    return Err(ProtocolViolation::UnclosedSpans { open });
                }
                self.finished = true;
                Ok(())
            }
        }
    }
}
