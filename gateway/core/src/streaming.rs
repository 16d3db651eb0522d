//! Streaming Response Parser
//!
//! Incremental parser for `data:`-prefixed event streams. Response bodies
//! arrive in chunks whose boundaries have nothing to do with event
//! boundaries, so the parser keeps a line-reassembly buffer:
//!
//! ```text
//!   chunk 1: "data: {\"delta\":\"He"        → buffered, nothing emitted
//!   chunk 2: "l\"}\n\ndata: {\"delta\":\"lo\"}\n"
//!                                          → ContentDelta("Hel"), ContentDelta("lo")
//!   chunk 3: "data: [DONE]\n"              → StreamComplete
//! ```
//!
//! The buffer holds raw bytes and a line is decoded only once its `\n` has
//! arrived, so a multi-byte UTF-8 character split across chunks is decoded
//! intact. Memory use is bounded by the longest line, not the response.
//!
//! Per complete line:
//! - blank lines, comments and non-`data:` fields (`event:`, `id:`) are ignored
//! - `data: [DONE]` → [`ParserEvent::StreamComplete`], parser stops
//! - JSON payloads go through the provider schema: content → `ContentDelta`,
//!   embedded error → `StreamError` (parser stops), role-only frames → nothing
//! - payloads that are not JSON are skipped, not fatal

use serde_json::Value;
use thiserror::Error;

use crate::provider::ProviderKind;
use crate::schema::{ProviderSchema, StreamRecord};

/// Field prefix of event lines that carry a payload
pub const DATA_PREFIX: &str = "data:";

/// Payload marking the end of the stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Default upper bound for one line
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Output of the parser
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParserEvent {
    /// Incremental text
    ContentDelta(String),
    /// End-of-stream sentinel (or schema-level stop record)
    StreamComplete,
    /// Error record from upstream
    StreamError(String),
}

impl ParserEvent {
    /// Whether the parser stops after this event
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::ContentDelta(_))
    }
}

/// Unrecoverable parse failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// A single line outgrew the buffer limit
    #[error("event line exceeds {limit} bytes without a terminator")]
    LineTooLong {
        /// Configured limit
        limit: usize,
    },
}

/// Incremental event-stream parser for one response
pub struct StreamParser {
    schema: &'static dyn ProviderSchema,
    buffer: Vec<u8>,
    max_line_bytes: usize,
    finished: bool,
    skipped_lines: usize,
}

impl StreamParser {
    /// Parser interpreting records with `kind`'s schema
    #[must_use]
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            schema: kind.schema(),
            buffer: Vec::new(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            finished: false,
            skipped_lines: 0,
        }
    }

    /// Override the line length limit
    #[must_use]
    pub fn with_max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit.max(1);
        self
    }

    /// Whether a terminal event has been emitted
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes waiting for a line terminator
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Lines dropped because their payload was not JSON
    #[must_use]
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Consume one chunk of the body
    ///
    /// Returns the events completed by this chunk, in order. Once a
    /// terminal event is returned, later input is ignored.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<ParserEvent>, ParseError> {
        let mut events = Vec::new();
        if self.finished {
            return Ok(events);
        }

        self.buffer.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..].iter().position(|&b| b == b'\n') {
            let end = consumed + offset;
            let event = self.process_line(consumed, end);
            consumed = end + 1;

            if let Some(event) = event {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    self.finished = true;
                    self.buffer.clear();
                    return Ok(events);
                }
            }
        }
        self.buffer.drain(..consumed);

        if self.buffer.len() > self.max_line_bytes {
            self.buffer.clear();
            return Err(ParseError::LineTooLong {
                limit: self.max_line_bytes,
            });
        }

        Ok(events)
    }

    /// Flush a trailing line that never got its terminator
    pub fn finish(&mut self) -> Vec<ParserEvent> {
        if self.finished || self.buffer.is_empty() {
            return Vec::new();
        }
        let event = self.process_line(0, self.buffer.len());
        self.buffer.clear();
        match event {
            Some(event) => {
                self.finished = event.is_terminal();
                vec![event]
            }
            None => Vec::new(),
        }
    }

    fn process_line(&mut self, start: usize, end: usize) -> Option<ParserEvent> {
        let raw = &self.buffer[start..end];
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();

        let payload = line.strip_prefix(DATA_PREFIX)?.trim();
        if payload.is_empty() {
            return None;
        }
        if payload == DONE_SENTINEL {
            return Some(ParserEvent::StreamComplete);
        }

        let record: Value = match serde_json::from_str(payload) {
            Ok(record) => record,
            Err(e) => {
                self.skipped_lines += 1;
                tracing::debug!(error = %e, len = payload.len(), "Skipping non-JSON stream line");
                return None;
            }
        };

        match self.schema.interpret(&record) {
            StreamRecord::Delta(text) => Some(ParserEvent::ContentDelta(text)),
            StreamRecord::Empty => None,
            StreamRecord::Done => Some(ParserEvent::StreamComplete),
            StreamRecord::Error(message) => Some(ParserEvent::StreamError(message)),
        }
    }
}

impl std::fmt::Debug for StreamParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamParser")
            .field("buffered", &self.buffer.len())
            .field("max_line_bytes", &self.max_line_bytes)
            .field("finished", &self.finished)
            .field("skipped_lines", &self.skipped_lines)
            .finish_non_exhaustive()
    }
}
