use tracing::trace;

use crate::error::StreamError;
use crate::event::{normalize_tool_result, Event};
use crate::mux::EmitterHandle;

/// What the agent runtime calls to report progress.
///
/// With step details hidden, only root-depth tokens and `done` reach the
/// emitter; everything else is dropped here, before validation. The failure
/// status written by [`Ingress::fail`] is always delivered.
#[derive(Debug, Clone)]
pub struct Ingress {
    handle: EmitterHandle,
    show_steps: bool,
}

impl Ingress {
    pub fn new(handle: EmitterHandle, show_steps: bool) -> Self {
        Self { handle, show_steps }
    }

    pub fn shows_steps(&self) -> bool {
        self.show_steps
    }

    pub async fn status(&self, description: impl Into<String>, depth: u32) -> Result<(), StreamError> {
        self.publish(Event::status(description, depth)).await
    }

    pub async fn tool_start(
        &self,
        tool_id: impl Into<String>,
        name: impl Into<String>,
        depth: u32,
    ) -> Result<(), StreamError> {
        self.publish(Event::tool_start(tool_id, name, depth)).await
    }

    /// Reports a finished tool call. Empty results are sent as `✓ completed`.
    pub async fn tool_end(
        &self,
        tool_id: impl Into<String>,
        name: impl Into<String>,
        result: impl Into<String>,
        depth: u32,
    ) -> Result<(), StreamError> {
        let result = normalize_tool_result(result);
        self.publish(Event::tool_end(tool_id, name, result, depth)).await
    }

    pub async fn token(&self, content: impl Into<String>, depth: u32) -> Result<(), StreamError> {
        self.publish(Event::token(content, depth)).await
    }

    pub async fn agent_start(
        &self,
        agent_id: impl Into<String>,
        name: impl Into<String>,
        depth: u32,
    ) -> Result<(), StreamError> {
        self.publish(Event::agent_start(agent_id, name, depth)).await
    }

    pub async fn agent_end(&self, agent_id: impl Into<String>, depth: u32) -> Result<(), StreamError> {
        self.publish(Event::agent_end(agent_id, depth)).await
    }

    /// Terminates the stream with `done`.
    pub async fn finish(&self) -> Result<(), StreamError> {
        self.handle.finish().await.map(|_| ())
    }

    /// Closes every open span, reports `description` at depth 0 and terminates the stream.
    pub async fn fail(&self, description: impl Into<String>) -> Result<(), StreamError> {
        self.handle.abort(description).await.map(|_| ())
    }

    fn is_visible(&self, event: &Event) -> bool {
        self.show_steps || matches!(event, Event::Token { depth: 0, .. } | Event::Done)
    }

    async fn publish(&self, event: Event) -> Result<(), StreamError> {
        if !self.is_visible(&event) {
            trace!(kind = %event.kind(), "suppressed hidden step");
            return Ok(());
        }
        self.handle.emit(event).await.map(|_| ())
    }
}
