use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

use agent_stream_core::{CodecError, Event, ExecutionTree, FrameDecoder, StreamReader};
use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::errors::ClientError;

/// Typed events decoded from a response body.
pub type EventStream = Pin<Box<dyn futures::Stream<Item = Result<Event, ClientError>> + Send>>;

/// Turns a stream of SSE body chunks into typed events.
///
/// Chunks may split frames anywhere. The stream ends when the body ends;
/// the first decode or transport error is yielded after the events decoded
/// before it, and ends it too.
pub fn event_stream<S, E>(bytes: S) -> impl futures::Stream<Item = Result<Event, ClientError>> + Send
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    struct State<S> {
        bytes: S,
        decoder: FrameDecoder,
        pending: VecDeque<Result<Event, CodecError>>,
        done: bool,
    }

    stream::try_unfold(
        State {
            bytes,
            decoder: FrameDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(decoded) = state.pending.pop_front() {
                    return Ok(Some((decoded?, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend(state.decoder.push_chunk(&chunk));
                    }
                    Some(Err(err)) => {
                        return Err(ClientError::Transport(format!(
                            "stream read failed: {err}"
                        )));
                    }
                    None => {
                        state.done = true;
                        state.pending.extend(state.decoder.finish().transpose());
                    }
                }
            }
        },
    )
}

/// Feeds events into a [`StreamReader`] until the stream ends and returns the tree.
///
/// A stream that ends without `done` is a truncation error.
pub async fn reconstruct<S>(mut events: S) -> Result<ExecutionTree, ClientError>
where
    S: futures::Stream<Item = Result<Event, ClientError>> + Unpin,
{
    let mut reader = StreamReader::new();
    while let Some(event) = events.next().await {
        reader.apply(&event?)?;
    }
    debug!(events = reader.events_seen(), "stream reconstructed");
    Ok(reader.into_tree()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_stream_core::{Frame, ReconstructionError};

    fn wire(events: &[Event]) -> String {
        events
            .iter()
            .enumerate()
            .map(|(seq, event)| Frame::new(seq as u64, event).unwrap().to_sse())
            .collect()
    }

    fn chunked(text: &str, size: usize) -> Vec<Result<bytes::Bytes, String>> {
        text.as_bytes()
            .chunks(size)
            .map(|chunk| Ok(bytes::Bytes::copy_from_slice(chunk)))
            .collect()
    }

    fn scenario() -> Vec<Event> {
        vec![
            Event::status("start", 0),
            Event::tool_start("t1", "search", 0),
            Event::tool_end("t1", "search", "3 results", 0),
            Event::agent_start("a1", "researcher", 1),
            Event::token("analyzing", 1),
            Event::agent_end("a1", 1),
            Event::token("final answer", 0),
            Event::Done,
        ]
    }

    #[tokio::test]
    async fn decodes_events_across_arbitrary_chunks() {
        let body = wire(&scenario());
        let events: Vec<Event> = event_stream(stream::iter(chunked(&body, 7)))
            .map(|event| event.unwrap())
            .collect()
            .await;
        assert_eq!(events, scenario());
    }

    #[tokio::test]
    async fn reconstructs_the_scenario_tree() {
        let body = wire(&scenario());
        let tree = reconstruct(Box::pin(event_stream(stream::iter(chunked(&body, 64)))))
            .await
            .unwrap();

        assert_eq!(tree.root().text, "final answer");
        let tools: Vec<_> = tree.descendants().filter(|node| node.is_tool_call()).collect();
        assert_eq!(tools.len(), 1);
        assert!(tools[0].is_complete());
        let agents: Vec<_> = tree.descendants().filter(|node| node.is_agent()).collect();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].text, "analyzing");
    }

    #[tokio::test]
    async fn missing_done_is_truncation() {
        let events = scenario();
        let body = wire(&events[..events.len() - 1]);
        let err = reconstruct(Box::pin(event_stream(stream::iter(chunked(&body, 64)))))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Reconstruction(ReconstructionError::Truncated)
        ));
    }

    #[tokio::test]
    async fn sequence_gap_is_a_decode_error() {
        let body = format!(
            "{}{}",
            Frame::new(0, &Event::status("a", 0)).unwrap().to_sse(),
            Frame::new(5, &Event::Done).unwrap().to_sse()
        );
        let results: Vec<_> = event_stream(stream::iter(chunked(&body, 1024))).collect().await;
        assert_eq!(results.len(), 2);
        // The frame before the gap in the same chunk is still delivered.
        assert_eq!(results[0].as_ref().unwrap(), &Event::status("a", 0));
        assert!(matches!(
            results[1],
            Err(ClientError::Decode(CodecError::OutOfOrder { expected: 1, got: 5 }))
        ));
    }

    #[tokio::test]
    async fn reader_keeps_the_tree_built_before_a_gap() {
        let body = format!(
            "{}{}",
            Frame::new(0, &Event::tool_start("t1", "search", 0)).unwrap().to_sse(),
            Frame::new(2, &Event::Done).unwrap().to_sse()
        );
        let mut events = Box::pin(event_stream(stream::iter(chunked(&body, 1024))));
        let mut reader = StreamReader::new();
        let err = loop {
            match events.next().await.unwrap() {
                Ok(event) => reader.apply(&event).unwrap(),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, ClientError::Decode(CodecError::OutOfOrder { .. })));
        assert_eq!(reader.events_seen(), 1);
        assert!(!reader.tree().is_empty());
    }

    #[tokio::test]
    async fn body_errors_surface_as_transport_errors() {
        let chunks: Vec<Result<bytes::Bytes, String>> = vec![
            Ok(bytes::Bytes::from(wire(&[Event::status("a", 0)]))),
            Err("connection reset".to_string()),
        ];
        let results: Vec<_> = event_stream(stream::iter(chunks)).collect().await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(&results[1], Err(ClientError::Transport(msg)) if msg.contains("connection reset")));
    }
}
