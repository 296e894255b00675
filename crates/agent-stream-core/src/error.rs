use crate::event::{EventKind, SpanKind};

/// A structural invariant of the stream would be broken by the next event.
///
/// Always returned to the caller; the offending event is never written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("{kind} id must not be empty")]
    EmptyId { kind: SpanKind },
    #[error("sub-agents cannot run at depth 0")]
    AgentAtRoot,
    #[error("{kind} id `{id}` was already used in this stream")]
    DuplicateId { kind: SpanKind, id: String },
    #[error("{kind} `{id}` opened at depth {got}, expected depth {expected}")]
    DepthSkip {
        kind: SpanKind,
        id: String,
        expected: u32,
        got: u32,
    },
    #[error("{kind} `{id}` closed at depth {got} while depth {current} is active")]
    CloseAtInactiveDepth {
        kind: SpanKind,
        id: String,
        got: u32,
        current: u32,
    },
    #[error("{kind} `{got}` does not match the innermost open span `{expected}` at depth {depth}")]
    IdMismatch {
        kind: SpanKind,
        expected: String,
        got: String,
        depth: u32,
    },
    #[error("{kind} `{id}` closed at depth {depth} but nothing is open there")]
    NothingOpen { kind: SpanKind, id: String, depth: u32 },
    #[error("{event} at depth {depth} but no agent span is active there")]
    InactiveDepth { event: EventKind, depth: u32 },
    #[error("stream cannot finish with {open} open span(s)")]
    UnclosedSpans { open: usize },
    #[error("{event} after done")]
    AfterDone { event: EventKind },
}

/// Encoding or decoding of a frame failed.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid event json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame {got} arrived out of order, expected {expected}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("invalid frame id `{0}`")]
    InvalidId(String),
    #[error("frame is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Error returned by the emission side of a stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// The push channel to the consumer broke.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The emitter task is gone.
    #[error("stream closed")]
    Closed,
}

impl StreamError {
    pub fn is_protocol(&self) -> bool {
        matches!(self, StreamError::Protocol(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, StreamError::Transport(_))
    }
}

/// Error surfaced by a [`StreamReader`](crate::StreamReader) once it stops
/// trusting the stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconstructionError {
    #[error("event #{index} rejected: {violation}")]
    Violation {
        index: usize,
        violation: ProtocolViolation,
    },
    #[error("stream finished with unclosed spans: {}", .open.join(", "))]
    Incomplete { open: Vec<String> },
    #[error("stream ended without done")]
    Truncated,
}
