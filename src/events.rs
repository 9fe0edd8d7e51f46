//! # Stage: Caller Event Contract
//!
//! ## Responsibility
//! Define [`StreamEvent`], the only shape the caller ever sees on a
//! streaming request, and its `text/event-stream` framing.
//!
//! ## Guarantees
//! - Frames are produced by a structured encoder (`serde_json`): quotes,
//!   newlines and `data:` sequences inside model output can never break a
//!   frame, because JSON escapes every control character.
//! - [`FrameDecoder`] accepts arbitrary byte splits, including splits inside
//!   a multi-byte character.
//!
//! ## Wire shapes
//!
//! ```text
//! data: {"response":"def f():","model":"llama3.2:3b"}
//!
//! data: {"warning":"Code may contain syntax errors, check invalid_code.log","snippet_id":7}
//!
//! data: {"error":"gpt-4o backend error: status 503: down"}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{LineSplitter, LineTooLong};

/// Warning text attached to persisted code that failed validation.
pub const INVALID_CODE_WARNING: &str = "Code may contain syntax errors, check invalid_code.log";

/// One caller-visible event in a streaming response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    /// A cleaned chunk of generated text.
    Response {
        /// Chunk text.
        response: String,
        /// Model that produced it.
        model: String,
    },
    /// The persisted answer failed validation.
    Warning {
        /// Human-readable warning.
        warning: String,
        /// Identifier of the stored snippet.
        snippet_id: i64,
    },
    /// The request failed; nothing follows this event.
    Error {
        /// Formatted error detail.
        error: String,
    },
}

impl StreamEvent {
    /// A text chunk event.
    pub fn response(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self::Response {
            response: text.into(),
            model: model.into(),
        }
    }

    /// The invalid-code warning for `snippet_id`.
    pub fn invalid_code(snippet_id: i64) -> Self {
        Self::Warning {
            warning: INVALID_CODE_WARNING.to_string(),
            snippet_id,
        }
    }

    /// A terminal error event.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// `true` for [`StreamEvent::Error`].
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// JSON payload of this event, without framing.
    ///
    /// # Errors
    ///
    /// Only if serialization fails, which plain strings and integers do not.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Encode as one `data: {json}\n\n` frame.
    ///
    /// # Errors
    ///
    /// Only if serialization fails, which plain strings and integers do not.
    pub fn to_sse_frame(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", self.to_json()?))
    }
}

/// A frame that could not be turned into a [`StreamEvent`].
#[derive(Debug, Error)]
pub enum FrameError {
    /// The `data` payload is not a valid event.
    #[error("undecodable event frame: {source}")]
    Json {
        /// Raw `data` payload.
        data: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A line outgrew the decoder's limit; nothing more can be decoded.
    #[error(transparent)]
    TooLong(#[from] LineTooLong),
}

/// Incremental decoder for `data:` framed event streams.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    lines: LineSplitter,
    data: String,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every frame completed by them.
    ///
    /// Once a line outgrows the limit, this and every later call end with
    /// [`FrameError::TooLong`].
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, FrameError>> {
        let lines = self.lines.push(chunk).unwrap_or_default();
        let mut events = Vec::new();
        for line in lines {
            if let Some(event) = self.accept_line(&line) {
                events.push(event);
            }
        }
        if let Some(e) = self.lines.failure() {
            self.data.clear();
            events.push(Err(e.into()));
        }
        events
    }

    /// Flush a final frame that was not followed by a blank line.
    pub fn finish(mut self) -> Option<Result<StreamEvent, FrameError>> {
        if let Some(line) = self.lines.finish() {
            if let Some(event) = self.accept_line(&line) {
                return Some(event);
            }
        }
        self.take_frame()
    }

    fn accept_line(&mut self, line: &str) -> Option<Result<StreamEvent, FrameError>> {
        if line.is_empty() {
            return self.take_frame();
        }
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(value);
        }
        // other fields (event:, id:, retry:, comments) carry nothing for us
        None
    }

    fn take_frame(&mut self) -> Option<Result<StreamEvent, FrameError>> {
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data);
        Some(serde_json::from_str(&data).map_err(|source| FrameError::Json { data, source }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<StreamEvent> {
        let mut decoder = FrameDecoder::new();
        let mut out: Vec<StreamEvent> = decoder
            .push(bytes)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        if let Some(last) = decoder.finish() {
            out.push(last.unwrap());
        }
        out
    }

    #[test]
    fn test_wire_shapes() {
        assert_eq!(
            StreamEvent::response("hi", "m").to_json().unwrap(),
            r#"{"response":"hi","model":"m"}"#
        );
        assert_eq!(
            StreamEvent::invalid_code(7).to_json().unwrap(),
            format!(r#"{{"warning":"{INVALID_CODE_WARNING}","snippet_id":7}}"#)
        );
        assert_eq!(
            StreamEvent::error("boom").to_json().unwrap(),
            r#"{"error":"boom"}"#
        );
    }

    #[test]
    fn test_hostile_payload_stays_in_one_frame() {
        let text = "say \"hi\"\n\ndata: {\"error\":\"fake\"}\n\n\\";
        let frame = StreamEvent::response(text, "m").to_sse_frame().unwrap();
        assert_eq!(frame.matches("\n\n").count(), 1);
        assert!(frame.ends_with("\n\n"));
        assert_eq!(decode_all(frame.as_bytes()), vec![StreamEvent::response(text, "m")]);
    }

    #[test]
    fn test_decoder_handles_byte_level_splits() {
        let events = vec![
            StreamEvent::response("π ≈ 3.14", "m"),
            StreamEvent::invalid_code(3),
            StreamEvent::error("done"),
        ];
        let wire: String = events
            .iter()
            .map(|e| e.to_sse_frame().unwrap())
            .collect();

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for byte in wire.as_bytes() {
            decoded.extend(decoder.push(std::slice::from_ref(byte)));
        }
        let decoded: Vec<StreamEvent> = decoded.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(decoded, events);
    }

    #[test]
    fn test_decoder_ignores_comments_and_other_fields() {
        let wire = b": keep-alive\nevent: message\ndata: {\"error\":\"x\"}\n\n";
        assert_eq!(decode_all(wire), vec![StreamEvent::error("x")]);
    }

    #[test]
    fn test_decoder_flushes_unterminated_final_frame() {
        assert_eq!(
            decode_all(b"data: {\"error\":\"tail\"}"),
            vec![StreamEvent::error("tail")]
        );
    }

    #[test]
    fn test_decoder_reports_oversized_line_after_complete_frames() {
        let mut decoder = FrameDecoder {
            lines: LineSplitter::with_max_line(32),
            data: String::new(),
        };
        let mut wire = b"data: {\"error\":\"x\"}\n\n".to_vec();
        wire.extend(std::iter::repeat(b'a').take(64));
        let out = decoder.push(&wire);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), &StreamEvent::error("x"));
        assert!(matches!(&out[1], Err(FrameError::TooLong(_))));
    }

    #[test]
    fn test_decoder_reports_bad_json() {
        let mut decoder = FrameDecoder::new();
        let out = decoder.push(b"data: {nope\n\n");
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Err(FrameError::Json { data, .. }) if data == "{nope"));
    }

    #[test]
    fn test_is_error() {
        assert!(StreamEvent::error("x").is_error());
        assert!(!StreamEvent::response("x", "m").is_error());
    }
}
