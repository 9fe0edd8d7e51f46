//! # Stage: Request Orchestration
//!
//! ## Responsibility
//! Drive one chat request end to end: resolve the model, dispatch to the
//! backend that serves it, clean the output, and persist code-bearing
//! answers once the full text is known.
//!
//! ```text
//! Routing → Generating → Aggregating → Persisting → Done
//!    └──────────┴─────────────┴─────────────┴──→ Error (one event, terminal)
//! ```
//!
//! ## Guarantees
//! - At most one snippet row per request, written only after the whole
//!   response is aggregated, and only when the message is code-bearing and
//!   the text is non-empty.
//! - A blank message fails with [`RouterError::ClientFault`] before any
//!   backend or store call.
//! - Streaming: an `Error` event is always the last event. Text already
//!   sent is never retracted.
//! - Streaming: a caller disconnect is noticed even while the backend is
//!   silent; the backend stream is dropped and the partial text persisted.
//! - Persistence failures are logged and counted, never surfaced as errors.
//! - A panicking validator counts as an invalid verdict.
//!
//! ## Span Fields
//!
//! | Field | Description |
//! |-------|-------------|
//! | `request_id` | Unique ID for trace correlation |
//! | `mode` | `"whole"` or `"stream"` |
//! | `model` | Resolved model, recorded after routing |
//! | `duration_ms` | Generation time, recorded after completion |
//! | `outcome` | `"ok"` or `"err"` |
//! | `error_kind` | [`RouterError::kind`], recorded only on error |
//!
//! Prompt and response text are never logged.
//!
//! ## NOT Responsible For
//! - Wire framing of events (that belongs to `events` and `web_api`)
//! - Backend protocols (that belongs to `backend`)

use futures::StreamExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn, Instrument, Span};
use uuid::Uuid;

use crate::backend::ModelBackend;
use crate::cleaner::{MarkupCleaner, ResponseCleaner};
use crate::events::{StreamEvent, INVALID_CODE_WARNING};
use crate::routing::ModelRouter;
use crate::store::SnippetStore;
use crate::validator::{CodeValidator, SyntaxValidator};
use crate::{metrics, ChatRequest, ChatResponse, RouterError};

/// Default upper bound for whole-response generation.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(120);

/// Default capacity of the per-request event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Request lifecycle phase, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Routing,
    Generating,
    Aggregating,
    Persisting,
    Done,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Routing => "routing",
            Self::Generating => "generating",
            Self::Aggregating => "aggregating",
            Self::Persisting => "persisting",
            Self::Done => "done",
        }
    }
}

/// Outcome of a successful insert.
#[derive(Debug, Clone, Copy)]
struct Persisted {
    id: i64,
    valid: bool,
}

/// Top-level coordinator for chat requests.
///
/// Cheap to clone: every collaborator is behind an `Arc`.
///
/// ## Example
///
/// ```no_run
/// use model_stream_router::{
///     ChatRequest, LocalBackend, ModelRouter, RemoteBackend, SqliteSnippetStore,
///     StreamOrchestrator,
/// };
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = StreamOrchestrator::new(
///     ModelRouter::new("llama3.2:3b"),
///     Arc::new(LocalBackend::default()),
///     Arc::new(RemoteBackend::from_env("GITHUB_TOKEN")?),
///     Arc::new(SqliteSnippetStore::open("data/snippets.db")?),
/// );
/// let reply = orchestrator.respond(ChatRequest::new("hello")).await?;
/// println!("{}: {}", reply.model, reply.response);
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct StreamOrchestrator {
    router: ModelRouter,
    local: Arc<dyn ModelBackend>,
    remote: Arc<dyn ModelBackend>,
    cleaner: Arc<dyn ResponseCleaner>,
    validator: Arc<dyn CodeValidator>,
    store: Arc<dyn SnippetStore>,
    deadline: Duration,
    event_buffer: usize,
}

impl std::fmt::Debug for StreamOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOrchestrator")
            .field("router", &self.router)
            .field("local", &self.local.name())
            .field("remote", &self.remote.name())
            .field("deadline", &self.deadline)
            .field("event_buffer", &self.event_buffer)
            .finish()
    }
}

impl StreamOrchestrator {
    /// Wire up an orchestrator with the default cleaner and validator.
    pub fn new(
        router: ModelRouter,
        local: Arc<dyn ModelBackend>,
        remote: Arc<dyn ModelBackend>,
        store: Arc<dyn SnippetStore>,
    ) -> Self {
        Self {
            router,
            local,
            remote,
            cleaner: Arc::new(MarkupCleaner),
            validator: Arc::new(SyntaxValidator),
            store,
            deadline: DEFAULT_DEADLINE,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Replace the response cleaner.
    pub fn with_cleaner(mut self, cleaner: Arc<dyn ResponseCleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    /// Replace the code validator.
    pub fn with_validator(mut self, validator: Arc<dyn CodeValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Set the whole-response deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the per-request event channel capacity (minimum 1).
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// The router in use.
    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Fresh snapshot of the routing candidate set.
    ///
    /// A store failure degrades to an empty set; routing then falls back to
    /// the default model.
    pub async fn candidates(&self) -> BTreeSet<String> {
        match self.store.distinct_models_with_code().await {
            Ok(models) => models,
            Err(e) => {
                warn!(error = %e, "candidate query failed, routing with an empty set");
                BTreeSet::new()
            }
        }
    }

    // ── Whole-response mode ──────────────────────────────────────────────

    /// Generate the complete answer for `request`.
    ///
    /// # Errors
    ///
    /// - [`RouterError::ClientFault`] for a blank message (no backend call).
    /// - [`RouterError::Backend`] when the backend fails.
    /// - [`RouterError::EmptyResponse`] when the cleaned text is empty.
    /// - [`RouterError::Timeout`] when the deadline elapses.
    pub async fn respond(&self, request: ChatRequest) -> Result<ChatResponse, RouterError> {
        let span = request_span("whole");
        async move {
            let result = self.respond_inner(&request).await;
            match &result {
                Ok(_) => {
                    Span::current().record("outcome", "ok");
                }
                Err(e) => record_failure(e),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn respond_inner(&self, request: &ChatRequest) -> Result<ChatResponse, RouterError> {
        let model = self.resolve(request).await?;
        let backend = self.backend_for(&model);
        metrics::inc_request("whole", backend.name());
        debug!(phase = Phase::Generating.as_str(), backend = backend.name(), "dispatching");
        let started = Instant::now();
        let generated =
            tokio::time::timeout(self.deadline, backend.generate(&model, &request.message)).await;
        let elapsed = started.elapsed();
        metrics::record_generation("whole", elapsed);
        Span::current().record("duration_ms", elapsed.as_millis() as u64);

        let raw = match generated {
            Ok(result) => result.map_err(|e| RouterError::from_backend(&model, e))?,
            Err(_) => {
                return Err(RouterError::Timeout {
                    model,
                    after: self.deadline,
                })
            }
        };

        debug!(phase = Phase::Aggregating.as_str(), "cleaning response");
        let text = self.cleaner.clean(raw.trim()).trim().to_string();
        if text.is_empty() {
            return Err(RouterError::EmptyResponse { model });
        }

        let persisted = self.persist(&request.message, &text, &model).await;
        debug!(phase = Phase::Done.as_str(), "request complete");
        Ok(ChatResponse {
            response: text,
            snippet_id: persisted.map(|p| p.id),
            warning: persisted
                .filter(|p| !p.valid)
                .map(|_| INVALID_CODE_WARNING.to_string()),
            model,
        })
    }

    // ── Streaming mode ───────────────────────────────────────────────────

    /// Start a streaming generation and return its event sequence.
    ///
    /// The work runs on a spawned task, so this must be called inside a
    /// Tokio runtime. Dropping the returned stream stops forwarding, but
    /// text produced so far is still persisted when the message is
    /// code-bearing.
    pub fn stream(&self, request: ChatRequest) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let this = self.clone();
        let span = request_span("stream");
        tokio::spawn(async move { this.drive_stream(request, tx).await }.instrument(span));
        ReceiverStream::new(rx)
    }

    async fn drive_stream(&self, request: ChatRequest, tx: mpsc::Sender<StreamEvent>) {
        let model = match self.resolve(&request).await {
            Ok(model) => model,
            Err(e) => return fail(&tx, e).await,
        };
        let backend = self.backend_for(&model);
        metrics::inc_request("stream", backend.name());
        debug!(phase = Phase::Generating.as_str(), backend = backend.name(), "dispatching");
        let started = Instant::now();
        let started_stream = tokio::select! {
            result = backend.generate_stream(&model, &request.message) => result,
            () = tx.closed() => {
                info!("caller disconnected before the backend answered");
                return;
            }
        };
        let mut chunks = match started_stream {
            Ok(chunks) => chunks,
            Err(e) => return fail(&tx, RouterError::from_backend(&model, e)).await,
        };

        let mut accumulated = String::new();
        let mut connected = true;
        loop {
            let item = tokio::select! {
                item = chunks.next() => item,
                () = tx.closed() => {
                    info!("caller disconnected while waiting on the backend");
                    connected = false;
                    break;
                }
            };
            let Some(item) = item else { break };
            let raw = match item {
                Ok(raw) => raw,
                Err(e) => return fail(&tx, RouterError::from_backend(&model, e)).await,
            };
            let text = self.cleaner.clean(&raw);
            if text.is_empty() {
                continue;
            }
            accumulated.push_str(&text);
            if tx.send(StreamEvent::response(text, &model)).await.is_err() {
                info!("caller disconnected, keeping partial output for persistence");
                connected = false;
                break;
            }
        }
        drop(chunks);

        let elapsed = started.elapsed();
        metrics::record_generation("stream", elapsed);
        Span::current().record("duration_ms", elapsed.as_millis() as u64);
        debug!(
            phase = Phase::Aggregating.as_str(),
            chars = accumulated.chars().count(),
            "generation finished"
        );

        if accumulated.is_empty() {
            if connected {
                return fail(&tx, RouterError::EmptyResponse { model }).await;
            }
            return;
        }

        if let Some(p) = self.persist(&request.message, &accumulated, &model).await {
            if !p.valid && connected {
                // Receiver may be gone by now; nothing left to do then.
                let _ = tx.send(StreamEvent::invalid_code(p.id)).await;
            }
        }
        Span::current().record("outcome", "ok");
        debug!(phase = Phase::Done.as_str(), "request complete");
    }

    // ── Shared steps ─────────────────────────────────────────────────────

    async fn resolve(&self, request: &ChatRequest) -> Result<String, RouterError> {
        request.validate()?;
        let model = match request.explicit_model() {
            Some(model) => model.to_string(),
            None => {
                let candidates = self.candidates().await;
                self.router.route(&request.message, &candidates)
            }
        };
        Span::current().record("model", model.as_str());
        debug!(
            phase = Phase::Routing.as_str(),
            explicit = request.explicit_model().is_some(),
            "model resolved"
        );
        Ok(model)
    }

    fn backend_for(&self, model: &str) -> &Arc<dyn ModelBackend> {
        if self.router.is_local(model) {
            &self.local
        } else {
            &self.remote
        }
    }

    /// Validate and store `text` when `prompt` is code-bearing.
    async fn persist(&self, prompt: &str, text: &str, model: &str) -> Option<Persisted> {
        if !self.router.is_code_bearing(prompt) || text.trim().is_empty() {
            return None;
        }
        debug!(phase = Phase::Persisting.as_str(), "persisting snippet");

        let valid = self.verdict(text);
        match self.store.insert(prompt, text, model).await {
            Ok(id) => {
                metrics::inc_snippet(valid);
                info!(snippet_id = id, valid, "snippet stored");
                Some(Persisted { id, valid })
            }
            Err(e) => {
                metrics::inc_persistence_failure();
                error!(error = %e, "failed to persist snippet");
                None
            }
        }
    }

    fn verdict(&self, text: &str) -> bool {
        let validator = &self.validator;
        std::panic::catch_unwind(AssertUnwindSafe(|| validator.is_valid_code(text))).unwrap_or_else(
            |_| {
                warn!(target: "invalid_code", "validator panicked, treating code as invalid");
                false
            },
        )
    }
}

fn request_span(mode: &'static str) -> Span {
    tracing::info_span!(
        "router.request",
        request_id = %Uuid::new_v4(),
        mode,
        model = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
        error_kind = tracing::field::Empty,
    )
}

fn record_failure(e: &RouterError) {
    Span::current().record("outcome", "err");
    Span::current().record("error_kind", e.kind());
    metrics::inc_error(e.kind());
    warn!(error = %e, "request failed");
}

/// Emit the single terminal `Error` event.
async fn fail(tx: &mpsc::Sender<StreamEvent>, e: RouterError) {
    record_failure(&e);
    let _ = tx.send(StreamEvent::error(e.to_string())).await;
}
