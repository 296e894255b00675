use tracing::{debug, warn};

use crate::codec::Frame;
use crate::context::ExecutionContext;
use crate::error::StreamError;
use crate::event::Event;

/// Result text of tool spans closed by the failure cascade.
pub const ABORTED_TOOL_RESULT: &str = "aborted";

/// Single writer of a stream: validates each event against the execution
/// context, assigns it the next sequence number and encodes it.
///
/// A violating event is rejected and never encoded. The only place where
/// events are synthesized is [`Emitter::abort`].
#[derive(Debug, Default)]
pub struct Emitter {
    context: ExecutionContext,
    next_seq: u64,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn is_finished(&self) -> bool {
        self.context.is_finished()
    }

    /// Number of frames produced so far.
    pub fn frames_emitted(&self) -> u64 {
        self.next_seq
    }

    /// Validates and encodes `event` as the newest frame of the stream.
    pub fn emit(&mut self, event: Event) -> Result<Frame, StreamError> {
        // Encode first so a codec failure cannot leave the context advanced
        // past a frame that was never produced.
        let frame = Frame::new(self.next_seq, &event)?;
        if let Err(violation) = self.context.apply(&event) {
            warn!(seq = self.next_seq, kind = %event.kind(), error = %violation, "rejected event");
            return Err(violation.into());
        }
        debug!(seq = frame.seq, kind = %frame.kind, depth = ?event.depth(), "emitted event");
        self.next_seq += 1;
        Ok(frame)
    }

    /// Emits the terminal `done` frame. Fails if spans are still open.
    pub fn finish(&mut self) -> Result<Frame, StreamError> {
        self.emit(Event::Done)
    }

    /// Failure cascade: closes every open span deepest first, reports
    /// `description` as a root status and terminates the stream.
    pub fn abort(&mut self, description: &str) -> Result<Vec<Frame>, StreamError> {
        let open = self.context.open_count();
        // Reversed opening order is deepest depth first, innermost first
        // within a depth. Closes go through `emit` so they stay validated.
        let mut closing: Vec<Event> = self
            .context
            .open_spans()
            .rev()
            .map(|span| span.close_event(ABORTED_TOOL_RESULT))
            .collect();
        closing.push(Event::status(description, 0));
        closing.push(Event::Done);

        warn!(open, description, "closing stream after failure");
        closing.into_iter().map(|event| self.emit(event)).collect()
    }
}
