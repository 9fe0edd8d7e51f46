//! Line framing over a chunked HTTP body.
//!
//! Both backend protocols are line oriented (NDJSON and SSE), but the
//! transport delivers arbitrary byte chunks: a line, or a multi-byte UTF-8
//! character, may be split across chunks. Bytes are buffered until a full
//! line is available and only then decoded. A line longer than the
//! splitter's limit fails instead of growing the buffer without bound.

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::VecDeque;
use thiserror::Error;

/// Default upper bound on a single line, in bytes.
pub const DEFAULT_MAX_LINE: usize = 1024 * 1024;

/// A line grew past the splitter's limit before its terminator arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("line exceeds {limit} bytes without a newline")]
pub struct LineTooLong {
    /// The limit that was exceeded.
    pub limit: usize,
}

/// Incremental splitter from byte chunks to complete lines.
///
/// Line terminators (`\n`, `\r\n`) are stripped. Each byte is scanned for
/// a terminator once, however many chunks a line arrives in.
#[derive(Debug)]
pub struct LineSplitter {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to contain no `\n`.
    scanned: usize,
    max_line: usize,
    failure: Option<LineTooLong>,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE)
    }
}

impl LineSplitter {
    /// Create an empty splitter with [`DEFAULT_MAX_LINE`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty splitter that rejects lines longer than `max_line`
    /// bytes (terminator excluded).
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
            failure: None,
        }
    }

    /// Feed a chunk and return every line it completes.
    ///
    /// Lines completed before an over-long one are still returned; the
    /// splitter is then failed, see [`LineSplitter::failure`].
    ///
    /// # Errors
    ///
    /// Returns [`LineTooLong`] when the splitter is failed and this call
    /// produced no lines.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, LineTooLong> {
        if let Some(e) = self.failure {
            return Err(e);
        }
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buf[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            if end - start > self.max_line {
                return self.overflow(lines);
            }
            lines.push(decode_line(&self.buf[start..end]));
            start = end + 1;
            from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line {
            return self.overflow(lines);
        }
        Ok(lines)
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buf.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        Some(decode_line(&raw))
    }

    /// Set once a line outgrew the limit; every later `push` fails.
    pub fn failure(&self) -> Option<LineTooLong> {
        self.failure
    }

    fn overflow(&mut self, lines: Vec<String>) -> Result<Vec<String>, LineTooLong> {
        let err = LineTooLong {
            limit: self.max_line,
        };
        self.buf.clear();
        self.scanned = 0;
        self.failure = Some(err);
        if lines.is_empty() {
            Err(err)
        } else {
            Ok(lines)
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches('\r')
        .to_string()
}

/// Why [`body_lines`] stopped early.
#[derive(Debug, Error)]
pub(crate) enum BodyError {
    /// The connection failed while reading the body.
    #[error("{0}")]
    Transport(String),
    /// A line exceeded the splitter's limit.
    #[error(transparent)]
    TooLong(#[from] LineTooLong),
}

struct LineState {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    splitter: LineSplitter,
    pending: VecDeque<String>,
    error: Option<BodyError>,
    finished: bool,
}

/// Stream the body of `response` line by line.
///
/// A transport failure or an over-long line yields one `Err` after the lines
/// completed before it, and ends the stream; an unterminated trailing line
/// is flushed on a clean close.
pub(crate) fn body_lines(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String, BodyError>> {
    let state = LineState {
        bytes: response.bytes_stream().boxed(),
        splitter: LineSplitter::new(),
        pending: VecDeque::new(),
        error: None,
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(line) = st.pending.pop_front() {
                return Some((Ok(line), st));
            }
            if let Some(e) = st.error.take() {
                return Some((Err(e), st));
            }
            if st.finished {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    if let Ok(lines) = st.splitter.push(&chunk) {
                        st.pending.extend(lines);
                    }
                    if let Some(e) = st.splitter.failure() {
                        st.finished = true;
                        st.error = Some(BodyError::TooLong(e));
                    }
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.error = Some(BodyError::Transport(e.to_string()));
                }
                None => {
                    st.finished = true;
                    if let Some(tail) = st.splitter.finish() {
                        st.pending.push_back(tail);
                    }
                }
            }
        }
    })
    .boxed()
}
