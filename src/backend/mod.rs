//! # Stage: Backend Adapters
//!
//! ## Responsibility
//! Turn a normalized generate request (model + prompt) into a specific
//! service's wire protocol, in either whole-response or streaming mode.
//!
//! - [`LocalBackend`]: Ollama-style `/api/generate`, newline-delimited JSON.
//! - [`RemoteBackend`]: hosted OpenAI-compatible chat completions, SSE.
//!
//! ## Guarantees
//! - Whole-response mode never returns `Ok` with blank text: blank output is
//!   [`BackendError::Empty`].
//! - A non-success initial status is an `Err` before any chunk is produced.
//! - Every `Err` item inside a [`ChunkStream`] is terminal: the stream yields
//!   nothing after it.
//!
//! ## NOT Responsible For
//! - Cleaning or validating generated text (that belongs to `cleaner` and
//!   `validator`)
//! - Choosing which backend serves a model (that belongs to `orchestrator`)

mod lines;
pub mod local;
pub mod remote;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

pub use lines::{LineSplitter, LineTooLong, DEFAULT_MAX_LINE};
pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// Lazy, finite, non-restartable sequence of raw text chunks.
///
/// `Err` items are fatal for the request; adapters end the stream after one.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Errors produced at the adapter boundary.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("request failed: {0}")]
    Request(String),

    /// The backend answered with a non-success status.
    #[error("status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, as far as it could be read.
        body: String,
    },

    /// The response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The backend reported success but produced no text.
    #[error("backend returned an empty response")]
    Empty,

    /// A streamed chunk was not a valid text token.
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    /// The backend reported an error inside an otherwise successful response.
    #[error("backend reported an error: {0}")]
    Reported(String),

    /// The adapter is misconfigured (e.g. a missing API token).
    #[error("configuration error: {0}")]
    Config(String),
}

/// Single "generate, whole or incremental" capability shared by all
/// backends.
///
/// Implementations must be thread-safe (Send + Sync) and object-safe so the
/// orchestrator can hold them as `Arc<dyn ModelBackend>`.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Short backend name used in logs and metrics labels.
    fn name(&self) -> &str;

    /// Generate the complete response for `prompt` with `model`.
    ///
    /// # Errors
    ///
    /// - [`BackendError::Status`] on a non-success status.
    /// - [`BackendError::Empty`] when the backend produced blank text.
    /// - [`BackendError::Request`] / [`BackendError::Decode`] on transport or
    ///   shape failures.
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, BackendError>;

    /// Start a streaming generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be started or the backend
    /// rejects it with a non-success status. Failures after the first byte
    /// are reported inside the returned stream.
    async fn generate_stream(&self, model: &str, prompt: &str)
        -> Result<ChunkStream, BackendError>;
}

/// Stand-in for a backend that could not be constructed (e.g. the remote
/// token is missing). Every call fails with the construction error, so the
/// service still starts and serves models on the other backend.
#[derive(Debug, Clone)]
pub struct UnavailableBackend {
    name: String,
    reason: String,
}

impl UnavailableBackend {
    /// A backend named `name` that always fails with `reason`.
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ModelBackend for UnavailableBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, _model: &str, _prompt: &str) -> Result<String, BackendError> {
        Err(BackendError::Config(self.reason.clone()))
    }

    async fn generate_stream(
        &self,
        _model: &str,
        _prompt: &str,
    ) -> Result<ChunkStream, BackendError> {
        Err(BackendError::Config(self.reason.clone()))
    }
}

/// Turn a non-success response into [`BackendError::Status`], reading as
/// much of the body as the server sends.
pub(crate) async fn status_error(response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    BackendError::Status { status, body }
}
