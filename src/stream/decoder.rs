use std::collections::VecDeque;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tracing::trace;

use crate::error::LLMError;
use crate::http::HttpBodyStream;

/// Data payload that marks the normal end of a stream.
pub const DONE_TOKEN: &str = "[DONE]";

/// One server-sent-event record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` field, if the record carried one.
    pub event: Option<String>,
    /// All `data:` values of the record joined with `\n`.
    pub data: String,
    /// Every non-blank line of the record in arrival order, unrecognized ones included.
    pub raw_lines: Vec<String>,
}

impl SseFrame {
    /// Returns `true` for the `[DONE]` sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_TOKEN
    }
}

#[derive(Default)]
struct PendingRecord {
    event: Option<String>,
    data: Vec<String>,
    raw_lines: Vec<String>,
}

/// Splits a raw HTTP body into [`SseFrame`] values.
///
/// The output does not depend on how the transport chunks the body. The sequence
/// ends after the `[DONE]` sentinel, when the body closes, or after the first error.
pub struct FrameDecoder {
    body: HttpBodyStream,
    buffer: Vec<u8>,
    record: PendingRecord,
    pending: VecDeque<SseFrame>,
    provider: &'static str,
    emit_done: bool,
    body_closed: bool,
    done_received: bool,
    finished: bool,
}

impl FrameDecoder {
    /// Wraps a raw HTTP body stream and prepares it for SSE decoding.
    pub fn new(body: HttpBodyStream, provider: &'static str) -> Self {
        Self {
            body,
            buffer: Vec::new(),
            record: PendingRecord::default(),
            pending: VecDeque::new(),
            provider,
            emit_done: false,
            body_closed: false,
            done_received: false,
            finished: false,
        }
    }

    /// Yields the `[DONE]` sentinel as a regular frame instead of filtering it.
    pub fn emit_done(mut self, emit_done: bool) -> Self {
        self.emit_done = emit_done;
        self
    }

    fn handle_line(&mut self, line: Vec<u8>) -> Result<(), LLMError> {
        let line = String::from_utf8(line).map_err(|err| {
            let raw = String::from_utf8_lossy(err.as_bytes()).into_owned();
            LLMError::decode(
                self.provider,
                raw,
                format!("invalid UTF-8 in stream: {}", err.utf8_error()),
            )
        })?;

        if line.is_empty() {
            self.dispatch();
            return Ok(());
        }

        if let Some(value) = field_value(&line, "data") {
            self.record.data.push(value.to_string());
        } else if let Some(value) = field_value(&line, "event") {
            self.record.event = Some(value.to_string());
        }
        self.record.raw_lines.push(line);
        Ok(())
    }

    fn dispatch(&mut self) {
        let record = mem::take(&mut self.record);
        // Records without data (comments, lone `event:` lines) are not dispatched.
        if record.data.is_empty() {
            return;
        }

        let frame = SseFrame {
            event: record.event,
            data: record.data.join("\n"),
            raw_lines: record.raw_lines,
        };

        if frame.is_done() {
            trace!(provider = self.provider, "stream sentinel received");
            self.done_received = true;
            if self.emit_done {
                self.pending.push_back(frame);
            }
        } else {
            self.pending.push_back(frame);
        }
    }

    fn drain_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
        buffer.iter().position(|b| *b == b'\n').map(|pos| {
            let mut line: Vec<u8> = buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            line
        })
    }

    fn fail(&mut self, err: LLMError) -> Poll<Option<Result<SseFrame, LLMError>>> {
        self.finished = true;
        self.pending.clear();
        Poll::Ready(Some(Err(err)))
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let value = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}

impl Stream for FrameDecoder {
    type Item = Result<SseFrame, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if this.finished {
                return Poll::Ready(None);
            }
            if this.done_received {
                this.finished = true;
                continue;
            }

            if let Some(line) = Self::drain_line(&mut this.buffer) {
                if let Err(err) = this.handle_line(line) {
                    return this.fail(err);
                }
                continue;
            }

            if this.body_closed {
                if !this.buffer.is_empty() {
                    let line = mem::take(&mut this.buffer);
                    if let Err(err) = this.handle_line(line) {
                        return this.fail(err);
                    }
                }
                this.dispatch();
                this.finished = true;
                continue;
            }

            match this.body.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => this.buffer.extend_from_slice(&bytes),
                Poll::Ready(Some(Err(err))) => return this.fail(err),
                Poll::Ready(None) => this.body_closed = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
