use std::sync::Arc;
use std::time::Duration;

use agent_stream_core::mux::{self, MuxOptions, MuxReport};
use agent_stream_core::{ChatRequest, Frame, FrameReceiver, Ingress, run_span};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument as _, info, warn};
use uuid::Uuid;

use crate::errors::{RunError, RuntimeFailure};
use crate::runtime::AgentRuntime;

/// Per-run settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    mux: MuxOptions,
    timeout: Option<Duration>,
    show_steps: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mux: MuxOptions::default(),
            timeout: None,
            show_steps: true,
        }
    }
}

impl RunOptions {
    pub fn mux(mut self, mux: MuxOptions) -> Self {
        self.mux = mux;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// When false only root-depth tokens, the failure status and `done` are streamed.
    pub fn show_steps(mut self, show: bool) -> Self {
        self.show_steps = show;
        self
    }

    pub fn mux_options(&self) -> MuxOptions {
        self.mux
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    Cancelled,
    TimedOut,
    /// The consumer disconnected before `done`.
    TransportLost,
}

/// Requests cancellation of a running stream.
///
/// Cancellation closes every open span and ends the stream with a
/// `Run cancelled` status followed by `done`.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Handle to a started run: its frames plus the means to stop it and await its outcome.
pub struct RunStream {
    run_id: Uuid,
    frames: FrameReceiver,
    handle: RunHandle,
}

/// Everything about a run except its frames.
pub struct RunHandle {
    run_id: Uuid,
    abort: AbortHandle,
    task: JoinHandle<RunOutcome>,
}

impl RunStream {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort.clone()
    }

    /// Next frame, `None` once the stream is over.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    pub fn into_parts(self) -> (FrameReceiver, RunHandle) {
        (self.frames, self.handle)
    }

    /// Drains all frames and waits for the outcome.
    pub async fn collect(mut self) -> (Vec<Frame>, RunOutcome) {
        let mut frames = Vec::new();
        while let Some(frame) = self.frames.recv().await {
            frames.push(frame);
        }
        (frames, self.handle.wait().await)
    }
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub async fn wait(self) -> RunOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => RunOutcome::Failed(format!("run task ended abnormally: {err}")),
        }
    }
}

/// Validates `request` and starts it on `runtime`.
///
/// Spawns the emitter owner task and the run task; must be called inside a
/// Tokio runtime.
pub fn start_run(
    runtime: Arc<dyn AgentRuntime>,
    request: ChatRequest,
    options: RunOptions,
) -> Result<RunStream, RunError> {
    validate(&request, &options)?;

    let run_id = Uuid::new_v4();
    let span = run_span(run_id);
    let (emitter, frames, owner) = {
        let _entered = span.enter();
        mux::spawn(options.mux)
    };
    let ingress = Ingress::new(emitter, options.show_steps);
    let (abort_tx, abort_rx) = watch::channel(false);
    let task = tokio::spawn(
        run_task(runtime, request, ingress, abort_rx, options.timeout, owner).instrument(span),
    );

    Ok(RunStream {
        run_id,
        frames,
        handle: RunHandle {
            run_id,
            abort: AbortHandle { tx: abort_tx },
            task,
        },
    })
}

fn validate(request: &ChatRequest, options: &RunOptions) -> Result<(), RunError> {
    if request.messages.is_empty() {
        return Err(RunError::Validation(
            "at least one message is required".into(),
        ));
    }
    if options.mux.frame_buffer == 0 || options.mux.command_buffer == 0 {
        return Err(RunError::Validation(
            "stream buffers must be greater than 0".into(),
        ));
    }
    if options.timeout == Some(Duration::ZERO) {
        return Err(RunError::Validation("timeout must be greater than 0".into()));
    }
    Ok(())
}

enum Interrupt {
    Cancelled,
    TimedOut(Duration),
}

async fn run_task(
    runtime: Arc<dyn AgentRuntime>,
    request: ChatRequest,
    ingress: Ingress,
    mut abort_rx: watch::Receiver<bool>,
    timeout: Option<Duration>,
    owner: JoinHandle<MuxReport>,
) -> RunOutcome {
    info!(messages = request.messages.len(), show_steps = ingress.shows_steps(), "run started");

    let deadline = async {
        match timeout {
            Some(limit) => {
                tokio::time::sleep(limit).await;
                limit
            }
            None => std::future::pending().await,
        }
    };
    let ended = tokio::select! {
        result = runtime.run(&request, &ingress) => Ok(result),
        _ = wait_for_abort(&mut abort_rx) => Err(Interrupt::Cancelled),
        limit = deadline => Err(Interrupt::TimedOut(limit)),
    };

    let outcome = match ended {
        Ok(Ok(())) => match ingress.finish().await {
            Ok(()) => RunOutcome::Completed,
            Err(err) if err.is_transport() => RunOutcome::TransportLost,
            Err(err) => {
                warn!(error = %err, "runtime finished with an inconsistent stream");
                close(&ingress, "Run failed: runtime left spans open", RunOutcome::Failed(err.to_string())).await
            }
        },
        Ok(Err(failure)) if failure.is_transport() => RunOutcome::TransportLost,
        Ok(Err(failure)) => {
            warn!(error = %failure, "run failed");
            close(&ingress, &format!("Run failed: {failure}"), RunOutcome::Failed(failure.to_string())).await
        }
        Err(Interrupt::Cancelled) => {
            info!("run cancelled");
            close(&ingress, "Run cancelled", RunOutcome::Cancelled).await
        }
        Err(Interrupt::TimedOut(limit)) => {
            warn!(timeout_secs = limit.as_secs_f64(), "run timed out");
            close(
                &ingress,
                &format!("Run timed out after {}s", limit.as_secs()),
                RunOutcome::TimedOut,
            )
            .await
        }
    };

    drop(ingress);
    match owner.await {
        Ok(report) => {
            info!(outcome = ?outcome, frames = report.frames, termination = ?report.termination, "run finished")
        }
        Err(err) => warn!(error = %err, "emitter task ended abnormally"),
    }
    outcome
}

// Runs the failure cascade; a consumer that is already gone overrides the outcome.
async fn close(ingress: &Ingress, description: &str, outcome: RunOutcome) -> RunOutcome {
    match ingress.fail(description).await {
        Ok(()) => outcome,
        Err(err) if err.is_transport() => RunOutcome::TransportLost,
        Err(err) => {
            warn!(error = %err, "failure cascade was rejected");
            outcome
        }
    }
}

async fn wait_for_abort(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Every abort handle is gone; the run can no longer be cancelled.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ScriptedRuntime, Step};
    use agent_stream_core::{
        Event, EventKind, Message, ObservabilityConfig, StreamReader, init_observability,
    };

    fn request() -> ChatRequest {
        ChatRequest::new(vec![Message::user("hello")])
    }

    fn decode(frames: &[Frame]) -> Vec<Event> {
        frames.iter().map(|frame| frame.decode().unwrap()).collect()
    }

    struct LeakyRuntime;

    #[async_trait::async_trait]
    impl AgentRuntime for LeakyRuntime {
        async fn run(&self, _request: &ChatRequest, ingress: &Ingress) -> Result<(), RuntimeFailure> {
            ingress.tool_start("t1", "search", 0).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn completed_run_ends_with_done() {
        let stream = start_run(Arc::new(ScriptedRuntime::demo()), request(), RunOptions::default()).unwrap();
        let (frames, outcome) = stream.collect().await;
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(frames.last().unwrap().is_done());
        let tree = StreamReader::replay(decode(&frames)).unwrap();
        assert!(tree.root().text.ends_with("hello"));
    }

    #[tokio::test]
    async fn empty_request_is_rejected() {
        let err = start_run(
            Arc::new(ScriptedRuntime::demo()),
            ChatRequest::new(Vec::new()),
            RunOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RunError::Validation(_)));
    }

    #[tokio::test]
    async fn hidden_steps_stream_only_the_answer() {
        let stream = start_run(
            Arc::new(ScriptedRuntime::demo()),
            request(),
            RunOptions::default().show_steps(false),
        )
        .unwrap();
        let (frames, outcome) = stream.collect().await;
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(frames[..frames.len() - 1].iter().all(|f| f.kind == EventKind::Token));
        for event in decode(&frames) {
            assert!(matches!(event, Event::Token { depth: 0, .. } | Event::Done));
        }
    }

    #[tokio::test]
    async fn abort_cascades_and_reports_cancelled() {
        let _logs = init_observability(&ObservabilityConfig::for_tests());
        let runtime = ScriptedRuntime::new(vec![
            Step::Delegate {
                agent: "research-agent".into(),
                description: "slow research".into(),
                steps: vec![Step::Delay { ms: 10_000 }],
            },
        ]);
        let mut stream = start_run(Arc::new(runtime), request(), RunOptions::default()).unwrap();
        // tool_start, agent_start, status are out before the delay.
        for _ in 0..3 {
            stream.next_frame().await.unwrap();
        }
        stream.abort_handle().abort();

        let (frames, outcome) = stream.collect().await;
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(
            decode(&frames),
            vec![
                Event::agent_end("agent-1", 1),
                Event::tool_end("tool-1", "task", agent_stream_core::ABORTED_TOOL_RESULT, 0),
                Event::status("Run cancelled", 0),
                Event::Done,
            ]
        );
    }

    #[tokio::test]
    async fn timeout_cascades_and_reports_timed_out() {
        let _logs = init_observability(&ObservabilityConfig::for_tests());
        let runtime = ScriptedRuntime::new(vec![Step::Tool {
            name: "slow".into(),
            result: "never".into(),
            delay_ms: 10_000,
        }]);
        let stream = start_run(
            Arc::new(runtime),
            request(),
            RunOptions::default().timeout(Duration::from_millis(20)),
        )
        .unwrap();
        let (frames, outcome) = stream.collect().await;
        assert_eq!(outcome, RunOutcome::TimedOut);
        let events = decode(&frames);
        assert_eq!(events[1], Event::tool_end("tool-1", "slow", agent_stream_core::ABORTED_TOOL_RESULT, 0));
        assert!(matches!(&events[2], Event::Status { description, depth: 0 } if description.starts_with("Run timed out")));
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn runtime_leaving_spans_open_is_closed_as_a_failure() {
        let stream = start_run(Arc::new(LeakyRuntime), request(), RunOptions::default()).unwrap();
        let (frames, outcome) = stream.collect().await;
        assert!(matches!(outcome, RunOutcome::Failed(_)));
        let tree = StreamReader::replay(decode(&frames)).unwrap();
        assert_eq!(tree.root().statuses, vec!["Run failed: runtime left spans open".to_string()]);
    }

    #[tokio::test]
    async fn dropped_consumer_is_transport_lost() {
        let runtime = ScriptedRuntime::new(vec![
            Step::Delay { ms: 20 },
            Step::Token { text: "too late".into() },
        ]);
        let stream = start_run(Arc::new(runtime), request(), RunOptions::default()).unwrap();
        let (frames, handle) = stream.into_parts();
        drop(frames);
        assert_eq!(handle.wait().await, RunOutcome::TransportLost);
    }
}
