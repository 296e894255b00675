//! Hierarchical execution-event stream.
//!
//! A run reports what it is doing as typed [`Event`]s. The [`Emitter`] checks
//! every event against an [`ExecutionContext`] before it becomes a [`Frame`],
//! the [`mux`] owner task serializes producers onto one ordered channel, and a
//! [`StreamReader`] on the far side rebuilds the [`ExecutionTree`].

pub mod codec;
pub mod context;
pub mod emitter;
pub mod error;
pub mod event;
pub mod ingress;
pub mod mux;
pub mod observability;
pub mod reader;
pub mod request;

pub use codec::{Frame, FrameDecoder, SseDecoder, SseMessage};
pub use context::{ExecutionContext, OpenSpan};
pub use emitter::{Emitter, ABORTED_TOOL_RESULT};
pub use error::{CodecError, ProtocolViolation, ReconstructionError, StreamError};
pub use event::{normalize_tool_result, Event, EventKind, SpanKind, EMPTY_RESULT_PLACEHOLDER};
pub use ingress::Ingress;
pub use mux::{EmitterHandle, FrameReceiver, MuxOptions, MuxReport, Termination};
pub use observability::{
    init_observability, run_span, LogOutput, ObservabilityConfig, ObservabilityGuard,
};
pub use reader::{preview, ExecutionTree, Node, NodeId, NodeKind, StreamReader, DEFAULT_PREVIEW_CHARS};
pub use request::{ChatRequest, ChatResponse, Message, Role};
