//! # model-stream-router
//!
//! Routes chat messages to a local or hosted generation backend, drives the
//! backend in whole-response or streaming mode, cleans the output, persists
//! code-bearing answers exactly once, and hands the caller one uniform event
//! stream regardless of which backend served the request.
//!
//! ## Architecture
//!
//! ```text
//! ChatRequest → ModelRouter → ModelBackend (local | remote) → ResponseCleaner
//!             → [CodeValidator + SnippetStore on completion] → StreamEvent*
//! ```

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod backend;
pub mod cleaner;
pub mod config;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod routing;
pub mod store;
pub mod validator;

#[cfg(feature = "web-api")]
pub mod web_api;

// Re-exports for convenience
pub use backend::{
    BackendError, ChunkStream, LocalBackend, ModelBackend, RemoteBackend, UnavailableBackend,
};
pub use cleaner::{MarkupCleaner, ResponseCleaner};
pub use config::RouterConfig;
pub use events::{FrameDecoder, StreamEvent, INVALID_CODE_WARNING};
pub use orchestrator::StreamOrchestrator;
pub use routing::{CodeClassifier, KeywordClassifier, ModelRouter};
pub use store::{CodeSnippet, SnippetStore, SqliteSnippetStore, StoreError};
pub use validator::{CodeValidator, SyntaxValidator};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`RouterError::Internal`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Example
///
/// ```no_run
/// # use model_stream_router::{init_tracing, RouterError};
/// # fn example() -> Result<(), RouterError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), RouterError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RouterError::Internal(format!("tracing init failed: {e}")))
}

/// Request-level errors surfaced to the caller.
///
/// Every fault inside the pipeline is mapped to one of these variants at the
/// orchestrator boundary. Persistence failures are deliberately absent: they
/// are logged and never retract content that was already produced.
#[derive(Error, Debug)]
pub enum RouterError {
    /// The request itself is unusable (e.g. an empty message). No backend
    /// call is made.
    #[error("{0}")]
    ClientFault(String),

    /// The backend failed: transport error, non-success status, undecodable
    /// body, or an invalid stream chunk.
    #[error("{model} backend error: {source}")]
    Backend {
        /// Model the request was routed to.
        model: String,
        /// Underlying adapter error.
        #[source]
        source: BackendError,
    },

    /// The backend reported success but produced no content.
    #[error("empty response from {model}")]
    EmptyResponse {
        /// Model the request was routed to.
        model: String,
    },

    /// Whole-response generation exceeded its deadline.
    #[error("{model} did not respond within {after:?}")]
    Timeout {
        /// Model the request was routed to.
        model: String,
        /// Deadline that elapsed.
        after: Duration,
    },

    /// Catch-all for faults that do not fit a specific variant.
    #[error("{0}")]
    Internal(String),
}

impl RouterError {
    /// Classify a backend failure for `model`, keeping "backend had nothing
    /// to say" distinct from "backend is down".
    pub fn from_backend(model: &str, err: BackendError) -> Self {
        match err {
            BackendError::Empty => Self::EmptyResponse {
                model: model.to_string(),
            },
            other => Self::Backend {
                model: model.to_string(),
                source: other,
            },
        }
    }

    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientFault(_) => "client_fault",
            Self::Backend { .. } => "backend_error",
            Self::EmptyResponse { .. } => "empty_response",
            Self::Timeout { .. } => "timeout",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP-equivalent status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ClientFault(_) => 400,
            Self::Backend { .. } | Self::EmptyResponse { .. } => 502,
            Self::Timeout { .. } => 504,
            Self::Internal(_) => 500,
        }
    }
}

/// Inbound chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The user message. Must not be blank.
    pub message: String,
    /// Explicit model choice. When present and non-blank, routing is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ChatRequest {
    /// Create a request that lets the router pick the model.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            model: None,
        }
    }

    /// Pin the request to an explicit model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// The explicit model, if the caller supplied a non-blank one.
    pub fn explicit_model(&self) -> Option<&str> {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
    }

    /// Reject requests that cannot be served.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ClientFault`] when the message is blank.
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.message.trim().is_empty() {
            return Err(RouterError::ClientFault(
                "Message or prompt is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Terminal result of a whole-response generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Cleaned response text.
    pub response: String,
    /// Model that produced the text.
    pub model: String,
    /// Identifier of the stored snippet, when the answer was persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet_id: Option<i64>,
    /// Set when the persisted code failed validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}
