//! Emission owner task.
//!
//! Producers never touch the [`Emitter`] directly. They hold an
//! [`EmitterHandle`] that forwards each event over a bounded command queue to
//! one task owning the emitter; that task writes frames to a bounded frame
//! channel read by the transport. Both queues block when full, so a slow
//! consumer slows the producer down and no frame is ever dropped.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument as _, debug, warn};

use crate::codec::Frame;
use crate::emitter::Emitter;
use crate::error::StreamError;
use crate::event::Event;

/// Default capacity of the frame channel between the owner task and the transport.
pub const DEFAULT_FRAME_BUFFER: usize = 128;
/// Default capacity of the command queue between producers and the owner task.
pub const DEFAULT_COMMAND_BUFFER: usize = 64;

/// Status description used when every producer went away without finishing.
pub const ABANDONED_DESCRIPTION: &str = "Run ended before completion";

/// Receiving end of a stream's frames, in emission order.
pub type FrameReceiver = mpsc::Receiver<Frame>;

/// Buffer sizes of the emission pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxOptions {
    pub frame_buffer: usize,
    pub command_buffer: usize,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            frame_buffer: DEFAULT_FRAME_BUFFER,
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }
}

/// How the owner task stopped writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// `done` was emitted by the producer.
    Done,
    /// The producer requested the failure cascade.
    Aborted,
    /// All producers went away without `done`; the task ran the cascade itself.
    Abandoned,
    /// The frame receiver was dropped.
    TransportLost,
}

/// Summary returned by the owner task when it exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxReport {
    pub frames: u64,
    pub termination: Termination,
}

enum Command {
    Emit {
        event: Event,
        reply: oneshot::Sender<Result<u64, StreamError>>,
    },
    Abort {
        description: String,
        reply: oneshot::Sender<Result<u64, StreamError>>,
    },
}

/// Cloneable producer side of a stream.
#[derive(Debug, Clone)]
pub struct EmitterHandle {
    tx: mpsc::Sender<Command>,
}

impl EmitterHandle {
    /// Publishes `event` and waits until its frame was handed to the
    /// transport. Returns the frame's sequence number.
    pub async fn emit(&self, event: Event) -> Result<u64, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Emit { event, reply })
            .await
            .map_err(|_| StreamError::Closed)?;
        rx.await.map_err(|_| StreamError::Closed)?
    }

    /// Emits `done`. Fails with a protocol violation while spans are open.
    pub async fn finish(&self) -> Result<u64, StreamError> {
        self.emit(Event::Done).await
    }

    /// Runs the failure cascade and terminates the stream. Returns the
    /// sequence number of the final `done` frame.
    pub async fn abort(&self, description: impl Into<String>) -> Result<u64, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Abort {
                description: description.into(),
                reply,
            })
            .await
            .map_err(|_| StreamError::Closed)?;
        rx.await.map_err(|_| StreamError::Closed)?
    }
}

/// Spawns the owner task for a new stream. Must be called inside a Tokio runtime.
pub fn spawn(options: MuxOptions) -> (EmitterHandle, FrameReceiver, JoinHandle<MuxReport>) {
    let (command_tx, command_rx) = mpsc::channel(options.command_buffer.max(1));
    let (frame_tx, frame_rx) = mpsc::channel(options.frame_buffer.max(1));
    // The owner task logs inside the caller's span.
    let task = tokio::spawn(run_owner(Emitter::new(), command_rx, frame_tx).in_current_span());
    (EmitterHandle { tx: command_tx }, frame_rx, task)
}

struct Output {
    tx: Option<mpsc::Sender<Frame>>,
    termination: Option<Termination>,
}

impl Output {
    async fn write(&mut self, frames: Vec<Frame>) -> Result<u64, StreamError> {
        if self.termination == Some(Termination::TransportLost) {
            return Err(StreamError::Transport("consumer disconnected".into()));
        }
        let mut last_seq = 0;
        for frame in frames {
            let Some(tx) = self.tx.as_ref() else {
                return Err(StreamError::Closed);
            };
            last_seq = frame.seq;
            if tx.send(frame).await.is_err() {
                warn!(seq = last_seq, "frame receiver dropped; stopping stream");
                self.tx = None;
                self.termination = Some(Termination::TransportLost);
                return Err(StreamError::Transport("consumer disconnected".into()));
            }
        }
        Ok(last_seq)
    }

    fn close(&mut self, termination: Termination) {
        // Dropping the sender ends the consumer's stream after the last frame.
        self.tx = None;
        self.termination.get_or_insert(termination);
    }
}

async fn run_owner(
    mut emitter: Emitter,
    mut commands: mpsc::Receiver<Command>,
    frames: mpsc::Sender<Frame>,
) -> MuxReport {
    let mut output = Output {
        tx: Some(frames),
        termination: None,
    };

    while let Some(command) = commands.recv().await {
        match command {
            Command::Emit { event, reply } => {
                let result = if output.termination == Some(Termination::TransportLost) {
                    Err(StreamError::Transport("consumer disconnected".into()))
                } else {
                    match emitter.emit(event) {
                        Ok(frame) => {
                            let done = frame.is_done();
                            let written = output.write(vec![frame]).await;
                            if done && written.is_ok() {
                                output.close(Termination::Done);
                            }
                            written
                        }
                        Err(err) => Err(err),
                    }
                };
                let _ = reply.send(result);
            }
            Command::Abort { description, reply } => {
                let result = if output.termination == Some(Termination::TransportLost) {
                    Err(StreamError::Transport("consumer disconnected".into()))
                } else {
                    match emitter.abort(&description) {
                        Ok(frames) => {
                            let written = output.write(frames).await;
                            if written.is_ok() {
                                output.close(Termination::Aborted);
                            }
                            written
                        }
                        Err(err) => Err(err),
                    }
                };
                let _ = reply.send(result);
            }
        }
    }

    if output.termination.is_none() {
        warn!(
            open = emitter.context().open_count(),
            "all producers dropped before done; closing stream"
        );
        if let Ok(frames) = emitter.abort(ABANDONED_DESCRIPTION)
            && output.write(frames).await.is_ok()
        {
            output.close(Termination::Abandoned);
        }
    }

    let report = MuxReport {
        frames: emitter.frames_emitted(),
        termination: output.termination.unwrap_or(Termination::TransportLost),
    };
    debug!(frames = report.frames, termination = ?report.termination, "stream owner finished");
    report
}
