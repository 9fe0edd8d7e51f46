//! Hosted model API over the OpenAI-compatible chat-completions protocol.
//!
//! Defaults to the GitHub Models endpoint, authenticated with a bearer token
//! read from an environment variable (`GITHUB_TOKEN` by default).
//!
//! ## Stream strictness
//!
//! Unlike the local adapter, a streamed chunk that is not a valid text token
//! (undecodable JSON, or a `content` that is not a string) is fatal: the
//! stream yields one [`BackendError::InvalidChunk`] and ends. Role-only and
//! finish deltas carry no `content` and are skipped.

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::lines::{body_lines, BodyError};
use super::{status_error, BackendError, ChunkStream, ModelBackend};
use crate::config::RemoteSection;

/// Default hosted endpoint (GitHub Models).
pub const DEFAULT_REMOTE_URL: &str = "https://models.inference.ai.azure.com";

/// Default environment variable holding the API token.
pub const DEFAULT_API_KEY_ENV: &str = "GITHUB_TOKEN";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// What a single SSE line contributes to the stream.
#[derive(Debug, PartialEq)]
enum SseOutcome {
    /// Blank line, comment, non-data field, or a delta without content.
    Skip,
    /// A text token.
    Token(String),
    /// `data: [DONE]`.
    Done,
    /// Fatal for the request.
    Fatal(String),
    /// Error payload reported by the API.
    Reported(String),
}

fn parse_sse_line(line: &str) -> SseOutcome {
    let Some(data) = line.strip_prefix("data:") else {
        return SseOutcome::Skip;
    };
    let data = data.trim();
    if data.is_empty() {
        return SseOutcome::Skip;
    }
    if data == "[DONE]" {
        return SseOutcome::Done;
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return SseOutcome::Fatal(truncate(data)),
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return SseOutcome::Reported(message);
    }

    match value.pointer("/choices/0/delta/content") {
        None | Some(Value::Null) => SseOutcome::Skip,
        Some(Value::String(s)) if s.is_empty() => SseOutcome::Skip,
        Some(Value::String(s)) => SseOutcome::Token(s.clone()),
        Some(other) => SseOutcome::Fatal(truncate(&other.to_string())),
    }
}

fn truncate(s: &str) -> String {
    const MAX: usize = 200;
    match s.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// Adapter for a hosted OpenAI-compatible chat-completions API.
///
/// ## Example
///
/// ```no_run
/// use model_stream_router::RemoteBackend;
///
/// let backend = RemoteBackend::with_api_key("ghp_example")
///     .with_base_url("https://models.inference.ai.azure.com");
/// ```
#[derive(Clone)]
pub struct RemoteBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    system_prompt: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("system_prompt", &self.system_prompt.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteBackend {
    /// Create an adapter, reading the token from `api_key_env`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] if the environment variable is not
    /// set.
    pub fn from_env(api_key_env: &str) -> Result<Self, BackendError> {
        let api_key = std::env::var(api_key_env).map_err(|_| {
            BackendError::Config(format!("{api_key_env} environment variable not set"))
        })?;
        Ok(Self::with_api_key(api_key))
    }

    /// Create an adapter with an explicit token.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_REMOTE_URL.to_string(),
            api_key: api_key.into(),
            system_prompt: None,
            timeout: Duration::from_secs(120),
        }
    }

    /// Build from the `[remote]` configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] if the token variable is not set.
    pub fn from_config(section: &RemoteSection) -> Result<Self, BackendError> {
        let mut backend = Self::from_env(&section.api_key_env)?
            .with_base_url(section.base_url.clone())
            .with_timeout(Duration::from_secs(section.timeout_secs));
        if let Some(prompt) = &section.system_prompt {
            backend = backend.with_system_prompt(prompt.clone());
        }
        Ok(backend)
    }

    /// Override the API base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Prepend a system message to every request.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the whole-response request timeout. Streaming requests have none.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn body<'a>(&'a self, model: &'a str, prompt: &'a str, stream: bool) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });
        ChatRequest {
            model,
            messages,
            stream,
        }
    }

    async fn send(
        &self,
        body: &ChatRequest<'_>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, BackendError> {
        let mut request = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Request(format!("remote request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelBackend for RemoteBackend {
    fn name(&self) -> &str {
        "remote"
    }

    async fn generate(&self, model: &str, prompt: &str) -> Result<String, BackendError> {
        let response = self
            .send(&self.body(model, prompt, false), Some(self.timeout))
            .await?;

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(BackendError::Empty);
        }
        Ok(content)
    }

    async fn generate_stream(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<ChunkStream, BackendError> {
        let response = self.send(&self.body(model, prompt, true), None).await?;

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
                let line = match next {
                    Ok(line) => line,
                    Err(BodyError::Transport(e)) => {
                        let err = BackendError::Request(format!("remote stream interrupted: {e}"));
                        return Some((Err(err), (lines, true)));
                    }
                    Err(e @ BodyError::TooLong(_)) => {
                        return Some((Err(BackendError::InvalidChunk(e.to_string())), (lines, true)));
                    }
                };
                match parse_sse_line(&line) {
                    SseOutcome::Skip => continue,
                    SseOutcome::Token(token) => return Some((Ok(token), (lines, false))),
                    SseOutcome::Done => return None,
                    SseOutcome::Fatal(raw) => {
                        return Some((Err(BackendError::InvalidChunk(raw)), (lines, true)));
                    }
                    SseOutcome::Reported(message) => {
                        return Some((Err(BackendError::Reported(message)), (lines, true)));
                    }
                }
            }
        });

        Ok(Box::pin(chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_token() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert_eq!(parse_sse_line(line), SseOutcome::Token("Hello".into()));
    }

    #[test]
    fn test_parse_sse_role_only_delta_is_skipped() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(line), SseOutcome::Skip);
        let line = r#"data: {"choices":[{"delta":{"content":null},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_sse_line(line), SseOutcome::Skip);
    }

    #[test]
    fn test_parse_sse_non_string_content_is_fatal() {
        let line = r#"data: {"choices":[{"delta":{"content":42}}]}"#;
        assert_eq!(parse_sse_line(line), SseOutcome::Fatal("42".into()));
    }

    #[test]
    fn test_parse_sse_undecodable_payload_is_fatal() {
        assert!(matches!(parse_sse_line("data: {broken"), SseOutcome::Fatal(_)));
    }

    #[test]
    fn test_parse_sse_done_and_non_data_lines() {
        assert_eq!(parse_sse_line("data: [DONE]"), SseOutcome::Done);
        assert_eq!(parse_sse_line(""), SseOutcome::Skip);
        assert_eq!(parse_sse_line(": keep-alive"), SseOutcome::Skip);
        assert_eq!(parse_sse_line("event: message"), SseOutcome::Skip);
    }

    #[test]
    fn test_parse_sse_error_payload_is_reported() {
        let line = r#"data: {"error":{"message":"quota exceeded"}}"#;
        assert_eq!(
            parse_sse_line(line),
            SseOutcome::Reported("quota exceeded".into())
        );
    }

    #[test]
    fn test_truncate_limits_long_payloads() {
        let long = "x".repeat(500);
        let out = truncate(&long);
        assert!(out.chars().count() <= 201);
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn test_body_includes_system_prompt_first() {
        let backend = RemoteBackend::with_api_key("k").with_system_prompt("be terse");
        let body = backend.body("gpt-4o", "hi", false);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let backend = RemoteBackend::with_api_key("secret-token");
        assert!(!format!("{backend:?}").contains("secret-token"));
    }

    #[test]
    fn test_from_env_missing_variable_is_config_error() {
        let err = RemoteBackend::from_env("MODEL_STREAM_ROUTER_TEST_UNSET_TOKEN").unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));
    }
}
