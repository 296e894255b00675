//! Wire encoding of events.
//!
//! One event maps to one frame. The frame payload is the adjacently tagged
//! JSON form of the event; on Server-Sent Events it travels as the `data:`
//! field, with the frame's sequence number as the `id:` field.

use crate::error::CodecError;
use crate::event::{Event, EventKind};

/// Encodes an event into its JSON payload. Pure: the same event always yields
/// the same bytes.
pub fn encode(event: &Event) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}

/// Decodes a JSON payload back into an event.
pub fn decode(data: &str) -> Result<Event, CodecError> {
    Ok(serde_json::from_str(data)?)
}

/// One serialized event with its position in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub kind: EventKind,
    pub data: String,
}

impl Frame {
    pub fn new(seq: u64, event: &Event) -> Result<Self, CodecError> {
        Ok(Self {
            seq,
            kind: event.kind(),
            data: encode(event)?,
        })
    }

    pub fn is_done(&self) -> bool {
        self.kind == EventKind::Done
    }

    pub fn decode(&self) -> Result<Event, CodecError> {
        decode(&self.data)
    }

    /// Text form of the frame as written on an SSE channel.
    pub fn to_sse(&self) -> String {
        format!("id: {}\ndata: {}\n\n", self.seq, self.data)
    }
}

/// A raw Server-Sent Events message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser. Chunks may split messages anywhere.
///
/// Each byte is searched for a message boundary once, so a message split
/// over many chunks costs time linear in its size.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    // Offset in `buf` where the next boundary search starts.
    scan_from: usize,
}

impl SseDecoder {
    /// Returns the messages completed by `chunk`, in order.
    ///
    /// A message that is not valid UTF-8 yields an error in its place.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Result<SseMessage, CodecError>> {
        self.buf.extend_from_slice(chunk);
        let mut messages = Vec::new();
        let mut start = 0;
        while let Some((end, next)) = message_boundary(&self.buf, self.scan_from.max(start)) {
            if let Some(message) = parse_sse_message(&self.buf[start..end]).transpose() {
                messages.push(message);
            }
            start = next;
        }
        self.buf.drain(..start);
        // A boundary is at most three bytes; its head may end this chunk.
        self.scan_from = self.buf.len().saturating_sub(2);
        messages
    }

    /// Flushes a trailing message that was not terminated by a blank line.
    pub fn finish(&mut self) -> Result<Option<SseMessage>, CodecError> {
        let rest = std::mem::take(&mut self.buf);
        self.scan_from = 0;
        parse_sse_message(&rest)
    }
}

// Finds the blank line ending the next message at or after `from`.
// Returns the end of the message body and the start of the next message.
fn message_boundary(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut at = from;
    loop {
        let newline = at + buf.get(at..)?.iter().position(|&b| b == b'\n')?;
        match &buf[newline + 1..] {
            [b'\n', ..] => return Some((newline, newline + 2)),
            [b'\r', b'\n', ..] => return Some((newline, newline + 3)),
            _ => at = newline + 1,
        }
    }
}

fn parse_sse_message(bytes: &[u8]) -> Result<Option<SseMessage>, CodecError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let text = std::str::from_utf8(bytes)?;
    let mut id: Option<String> = None;
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("id:") {
            id = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        return Ok(None);
    }
    Ok(Some(SseMessage {
        id,
        event,
        data: data_lines.join("\n"),
    }))
}

/// Turns SSE bytes back into ordered events.
///
/// Frames carrying an `id` must arrive with consecutive sequence numbers
/// starting at 0; a gap or reordering is a decode error. After the first
/// error the decoder yields nothing more.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    sse: SseDecoder,
    next_seq: u64,
    failed: bool,
}

impl FrameDecoder {
    /// Decodes the frames completed by `chunk`.
    ///
    /// Events decoded before a bad frame are returned ahead of its error,
    /// which is always the last item.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Result<Event, CodecError>> {
        if self.failed {
            return Vec::new();
        }
        let mut decoded = Vec::new();
        for message in self.sse.push_chunk(chunk) {
            let result = message.and_then(|message| self.accept(message));
            let stop = result.is_err();
            decoded.push(result);
            if stop {
                self.failed = true;
                break;
            }
        }
        decoded
    }

    pub fn finish(&mut self) -> Result<Option<Event>, CodecError> {
        if self.failed {
            return Ok(None);
        }
        let result = match self.sse.finish() {
            Ok(Some(message)) => self.accept(message).map(Some),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        };
        self.failed = result.is_err();
        result
    }

    fn accept(&mut self, message: SseMessage) -> Result<Event, CodecError> {
        if let Some(id) = message.id.as_deref() {
            let seq: u64 = id
                .trim()
                .parse()
                .map_err(|_| CodecError::InvalidId(id.to_string()))?;
            if seq != self.next_seq {
                return Err(CodecError::OutOfOrder {
                    expected: self.next_seq,
                    got: seq,
                });
            }
        }
        self.next_seq += 1;
        decode(&message.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_deterministic() {
        let event = Event::tool_end("t1", "search", "3 results", 0);
        assert_eq!(encode(&event).unwrap(), encode(&event.clone()).unwrap());
        assert_eq!(
            encode(&event).unwrap(),
            r#"{"type":"tool_end","data":{"tool_id":"t1","name":"search","result":"3 results","agent_depth":0}}"#
        );
    }

    #[test]
    fn frame_renders_as_sse() {
        let frame = Frame::new(4, &Event::Done).unwrap();
        assert!(frame.is_done());
        assert_eq!(frame.to_sse(), "id: 4\ndata: {\"type\":\"done\"}\n\n");
    }

    fn messages(decoded: Vec<Result<SseMessage, CodecError>>) -> Vec<SseMessage> {
        decoded.into_iter().map(|message| message.unwrap()).collect()
    }

    fn wire(events: &[Event]) -> String {
        events
            .iter()
            .enumerate()
            .map(|(seq, event)| Frame::new(seq as u64, event).unwrap().to_sse())
            .collect()
    }

    #[test]
    fn sse_decoder_handles_partial_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        let first = decoder.push_chunk(b"id: 0\ndata: {\"type\":\"tok");
        assert!(first.is_empty());
        let second = messages(
            decoder.push_chunk(b"en\",\"data\":{\"content\":\"hi\",\"agent_depth\":0}}\r\n\r\n"),
        );
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id.as_deref(), Some("0"));
        assert_eq!(decode(&second[0].data).unwrap(), Event::token("hi", 0));
    }

    #[test]
    fn sse_decoder_finds_boundaries_split_across_chunks() {
        for body in ["data: a\n\ndata: b\n\n", "data: a\r\n\r\ndata: b\r\n\r\n"] {
            for split in 1..body.len() {
                let mut decoder = SseDecoder::default();
                let (head, tail) = body.as_bytes().split_at(split);
                let mut found = messages(decoder.push_chunk(head));
                found.extend(messages(decoder.push_chunk(tail)));
                let data: Vec<_> = found.iter().map(|m| m.data.as_str()).collect();
                assert_eq!(data, ["a", "b"], "split at {split} of {body:?}");
                assert!(decoder.finish().unwrap().is_none());
            }
        }
    }

    #[test]
    fn large_frame_survives_small_chunks() {
        let result = "x".repeat(256 * 1024);
        let event = Event::tool_end("t1", "fetch", result, 0);
        let body = Frame::new(0, &event).unwrap().to_sse();

        let mut decoder = FrameDecoder::default();
        let mut decoded = Vec::new();
        for chunk in body.as_bytes().chunks(4096) {
            decoded.extend(decoder.push_chunk(chunk).into_iter().map(|e| e.unwrap()));
        }
        assert_eq!(decoded, vec![event]);
    }

    #[test]
    fn boundary_search_resumes_after_scanned_bytes() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push_chunk(b"data: {\"type\":").is_empty());
        assert_eq!(decoder.scan_from, decoder.buf.len() - 2);
        assert!(decoder.push_chunk(b"\"done\"}\n").is_empty());
        assert_eq!(decoder.scan_from, decoder.buf.len() - 2);

        let found = messages(decoder.push_chunk(b"\n"));
        assert_eq!(found.len(), 1);
        assert!(decoder.buf.is_empty());
        assert_eq!(decoder.scan_from, 0);
    }

    #[test]
    fn sse_decoder_skips_keep_alive_comments() {
        let mut decoder = SseDecoder::default();
        let found = messages(decoder.push_chunk(b":\n\n: keepalive\n\ndata: {\"type\":\"done\"}\n\n"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].data, "{\"type\":\"done\"}");
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        let mut decoder = SseDecoder::default();
        let found = decoder.push_chunk(b"data: {\"type\":\"token\",\"data\":{\"content\":\"\xff\"}}\n\n");
        assert_eq!(found.len(), 1);
        assert!(matches!(found[0], Err(CodecError::InvalidUtf8(_))));
    }

    #[test]
    fn multibyte_text_split_mid_character_decodes() {
        let event = Event::token("caf\u{e9} \u{2713}", 0);
        let body = wire(&[event.clone()]);
        let bytes = body.as_bytes();
        let split = body.find('\u{2713}').unwrap() + 1;

        let mut decoder = FrameDecoder::default();
        assert!(decoder.push_chunk(&bytes[..split]).is_empty());
        let decoded = decoder.push_chunk(&bytes[split..]);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().unwrap(), &event);
    }

    #[test]
    fn frame_decoder_reads_encoded_frames_in_order() {
        let events = vec![
            Event::status("start", 0),
            Event::token("final answer", 0),
            Event::Done,
        ];
        let wire = wire(&events);

        let mut decoder = FrameDecoder::default();
        let (head, tail) = wire.as_bytes().split_at(17);
        let mut decoded: Vec<Event> = decoder.push_chunk(head).into_iter().map(|e| e.unwrap()).collect();
        decoded.extend(decoder.push_chunk(tail).into_iter().map(|e| e.unwrap()));
        assert!(decoder.finish().unwrap().is_none());
        assert_eq!(decoded, events);
    }

    #[test]
    fn frame_decoder_rejects_gaps() {
        let mut decoder = FrameDecoder::default();
        let first = Frame::new(0, &Event::status("a", 0)).unwrap().to_sse();
        let third = Frame::new(2, &Event::status("c", 0)).unwrap().to_sse();
        assert!(decoder.push_chunk(first.as_bytes())[0].is_ok());
        let decoded = decoder.push_chunk(third.as_bytes());
        assert!(matches!(
            decoded[..],
            [Err(CodecError::OutOfOrder {
                expected: 1,
                got: 2
            })]
        ));
    }

    #[test]
    fn frames_before_a_gap_are_kept() {
        let body = format!(
            "{}{}{}",
            Frame::new(0, &Event::status("a", 0)).unwrap().to_sse(),
            Frame::new(3, &Event::status("d", 0)).unwrap().to_sse(),
            Frame::new(4, &Event::Done).unwrap().to_sse(),
        );
        let mut decoder = FrameDecoder::default();
        let decoded = decoder.push_chunk(body.as_bytes());
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].as_ref().unwrap(), &Event::status("a", 0));
        assert!(matches!(decoded[1], Err(CodecError::OutOfOrder { expected: 1, got: 3 })));

        // The stream is no longer trusted.
        let later = Frame::new(5, &Event::Done).unwrap().to_sse();
        assert!(decoder.push_chunk(later.as_bytes()).is_empty());
        assert!(decoder.finish().unwrap().is_none());
    }

    #[test]
    fn frame_decoder_surfaces_invalid_json() {
        let mut decoder = FrameDecoder::default();
        let decoded = decoder.push_chunk(b"data: {\"type\":\"token\"\n\n");
        assert!(matches!(decoded[..], [Err(CodecError::Json(_))]));
    }
}
