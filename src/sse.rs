//! Server-Sent Events framing.
//!
//! This module turns a raw byte stream into discrete [`Frame`]s. It knows
//! nothing about JSON-RPC or tools; both the tool-server transport and the
//! OpenAI-compatible completion client sit on top of it.
//!
//! # Wire format
//!
//! ```text
//! : comment lines start with a colon and are ignored
//! event: endpoint
//! data: /messages?session_id=abc
//!
//! id: 7
//! data: {"jsonrpc":"2.0","id":1,"result":{}}
//!
//! ```
//!
//! A record accumulates `field: value` lines until a blank line flushes it.
//! `data` lines are joined with `\n`; `event` defaults to `"message"`.
//!
//! # Chunk boundaries
//!
//! Network chunks can split a record anywhere, including inside a multi-byte
//! UTF-8 sequence or between `\r` and `\n`. [`FrameParser`] buffers raw bytes
//! and only decodes complete lines, so feeding a byte sequence in any number of
//! pieces yields exactly the frames produced by feeding it whole.

use crate::{Error, Result};
use futures::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;

/// Event name used when a record does not carry an `event:` field.
pub const DEFAULT_EVENT: &str = "message";

/// One decoded event from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Event name (`"message"` unless the record said otherwise)
    pub event: String,
    /// Payload, with lines joined by `\n`
    pub data: String,
    /// Last `id:` seen in the record
    pub id: Option<String>,
}

impl Frame {
    /// Create a `message` frame with the given payload.
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: DEFAULT_EVENT.to_string(),
            data: data.into(),
            id: None,
        }
    }

    /// Create a frame with an explicit event name.
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            id: None,
        }
    }

    /// Attach an event id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Serialize the frame back into wire format, terminated by a blank line.
    ///
    /// Parsing the output with [`FrameParser`] yields an equal frame.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if self.event != DEFAULT_EVENT {
            out.push_str("event: ");
            out.push_str(&self.event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Fields collected since the last flush.
#[derive(Debug, Default)]
struct PendingRecord {
    event: Option<String>,
    data: Option<String>,
    id: Option<String>,
}

impl PendingRecord {
    fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_none() && self.id.is_none()
    }

    fn take_frame(&mut self) -> Option<Frame> {
        if self.is_empty() {
            return None;
        }
        let record = std::mem::take(self);
        let mut data = record.data.unwrap_or_default();
        // Every data line was stored with a trailing newline; drop exactly one.
        if data.ends_with('\n') {
            data.pop();
        }
        Some(Frame {
            event: record.event.unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
            id: record.id,
        })
    }
}

/// Incremental Server-Sent Events parser.
///
/// Feed it chunks with [`push`](Self::push) and call [`finish`](Self::finish)
/// once the input ends.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
    record: PendingRecord,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every frame it completed.
    pub fn push(&mut self, chunk: impl AsRef<[u8]>) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk.as_ref());

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let newline = start + offset;
            let mut end = newline;
            if end > start && self.buffer[end - 1] == b'\r' {
                end -= 1;
            }
            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
            start = newline + 1;
        }
        if start > 0 {
            self.buffer.drain(..start);
        }
        frames
    }

    /// Flush whatever is left once the input has ended.
    ///
    /// A trailing line without a newline is processed first; a record that
    /// never saw its terminating blank line is still emitted, once.
    pub fn finish(&mut self) -> Option<Frame> {
        if !self.buffer.is_empty() {
            let mut rest = std::mem::take(&mut self.buffer);
            if rest.last() == Some(&b'\r') {
                rest.pop();
            }
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.record.take_frame()
    }

    fn process_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.record.take_frame();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                let data = self.record.data.get_or_insert_with(String::new);
                data.push_str(value);
                data.push('\n');
            }
            "event" => self.record.event = Some(value.to_string()),
            "id" => self.record.id = Some(value.to_string()),
            // retry and unknown fields carry nothing we act on
            _ => {}
        }
        None
    }
}

/// Parse a complete input in one go.
pub fn parse_frames(input: impl AsRef<[u8]>) -> Vec<Frame> {
    let mut parser = FrameParser::new();
    let mut frames = parser.push(input);
    frames.extend(parser.finish());
    frames
}

/// Stream of frames decoded from a byte stream.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Lazily decode a byte stream into frames.
///
/// The returned stream ends when the input ends (after flushing any partial
/// record). A read error is yielded once and terminates the stream.
pub fn frame_stream<S, B, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: Into<Error>,
{
    struct State<S> {
        bytes: Pin<Box<S>>,
        parser: FrameParser,
        ready: VecDeque<Frame>,
        done: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        parser: FrameParser::new(),
        ready: VecDeque::new(),
        done: false,
    };

    let frames = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.ready.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.ready.extend(state.parser.push(chunk)),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.done = true;
                    state.ready.extend(state.parser.finish());
                }
            }
        }
    });

    Box::pin(frames)
}

/// Decode the body of an HTTP response as an event stream.
pub fn response_frames(response: reqwest::Response) -> FrameStream {
    frame_stream(response.bytes_stream())
}
