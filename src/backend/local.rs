//! Local generation service over Ollama's `/api/generate` protocol.
//!
//! ## Wire format
//!
//! Request: `POST {base_url}/api/generate` with `{model, prompt, stream}`.
//!
//! - `stream = false`: one JSON object with a `response` field.
//! - `stream = true`: newline-delimited JSON objects, each with a partial
//!   `response` and/or a terminal `done: true`.
//!
//! ## Stream tolerance
//!
//! Each line is parsed on its own. A malformed line is skipped with a
//! warning. A connection that closes before `done` is treated as an
//! implicit `done` with whatever has been produced. A line that outgrows
//! the splitter limit is fatal.

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::lines::{body_lines, BodyError};
use super::{status_error, BackendError, ChunkStream, ModelBackend};
use crate::config::LocalSection;
use crate::metrics;

/// Default base URL of a local Ollama server.
pub const DEFAULT_LOCAL_URL: &str = "http://localhost:11434";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// One line of a streaming `/api/generate` reply.
#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// What a single NDJSON line contributes to the stream.
#[derive(Debug, PartialEq)]
enum LineOutcome {
    /// Blank or malformed; nothing to emit.
    Skip,
    /// Partial text; `done` marks the final line.
    Text { text: String, done: bool },
    /// Terminal marker without text.
    Done,
    /// The server reported a failure mid-stream.
    Failed(String),
}

fn parse_line(line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Skip;
    }
    match serde_json::from_str::<StreamLine>(line) {
        Ok(StreamLine {
            error: Some(error), ..
        }) => LineOutcome::Failed(error),
        Ok(StreamLine {
            response: Some(text),
            done,
            ..
        }) if !text.is_empty() => LineOutcome::Text { text, done },
        Ok(StreamLine { done: true, .. }) => LineOutcome::Done,
        Ok(_) => LineOutcome::Skip,
        Err(e) => {
            warn!(error = %e, line_len = line.len(), "skipping malformed stream line");
            metrics::inc_malformed_line("local");
            LineOutcome::Skip
        }
    }
}

/// Adapter for a local Ollama-compatible generation server.
///
/// ## Example
///
/// ```no_run
/// use model_stream_router::LocalBackend;
/// use std::time::Duration;
///
/// let backend = LocalBackend::new("http://localhost:11434")
///     .with_timeout(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone)]
pub struct LocalBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl LocalBackend {
    /// Create an adapter for the server at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Build from the `[local]` configuration section.
    pub fn from_config(section: &LocalSection) -> Self {
        Self::new(section.base_url.clone()).with_timeout(Duration::from_secs(section.timeout_secs))
    }

    /// Set the whole-response request timeout. Streaming requests have none.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Base URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_URL)
    }
}

#[async_trait]
impl ModelBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn generate(&self, model: &str, prompt: &str) -> Result<String, BackendError> {
        let response = self
            .client
            .post(self.endpoint())
            .timeout(self.timeout)
            .json(&GenerateRequest {
                model,
                prompt,
                stream: false,
            })
            .send()
            .await
            .map_err(|e| BackendError::Request(format!("local request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        if body.response.trim().is_empty() {
            return Err(BackendError::Empty);
        }
        Ok(body.response)
    }

    async fn generate_stream(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<ChunkStream, BackendError> {
        let response = self
            .client
            .post(self.endpoint())
            .json(&GenerateRequest {
                model,
                prompt,
                stream: true,
            })
            .send()
            .await
            .map_err(|e| BackendError::Request(format!("local request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let lines = body_lines(response);
        let chunks = stream::unfold((lines, false), |(mut lines, finished)| async move {
            if finished {
                return None;
            }
            loop {
                let next = match lines.next().await {
                    Some(next) => next,
                    None => return None,
                };
                match next {
                    Ok(line) => match parse_line(&line) {
                        LineOutcome::Skip => continue,
                        LineOutcome::Text { text, done } => {
                            return Some((Ok(text), (lines, done)));
                        }
                        LineOutcome::Done => return None,
                        LineOutcome::Failed(error) => {
                            return Some((Err(BackendError::Reported(error)), (lines, true)));
                        }
                    },
                    Err(BodyError::Transport(e)) => {
                        debug!(error = %e, "local stream closed early, treating as done");
                        return None;
                    }
                    Err(e @ BodyError::TooLong(_)) => {
                        let err = BackendError::InvalidChunk(e.to_string());
                        return Some((Err(err), (lines, true)));
                    }
                }
            }
        });

        Ok(Box::pin(chunks))
    }
}
