//! Integration tests for `StreamOrchestrator`
//!
//! Covers:
//! - Whole-response routing, cleaning, persistence and warnings
//! - Blank messages rejected before any backend or store call
//! - Streaming event order: Response*, then at most one Warning or Error
//! - Mid-stream failures end with exactly one Error and skip persistence
//! - Caller disconnect keeps partial output for persistence
//! - Persistence and candidate-query failures never fail the request
//! - Deadline, explicit model, and candidate-driven routing
//! - End to end against a mocked local generation server

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use model_stream_router::{
    BackendError, ChatRequest, ChunkStream, CodeSnippet, CodeValidator, LocalBackend,
    ModelBackend, ModelRouter, RouterError, SnippetStore, SqliteSnippetStore, StoreError,
    StreamEvent, StreamOrchestrator, INVALID_CODE_WARNING,
};

const DEFAULT_MODEL: &str = "llama3.2:3b";
const CODE_PROMPT: &str = "write python code to reverse a string";

// ============================================================================
// Helpers
// ============================================================================

/// What a scripted backend does on every call.
#[derive(Debug, Clone)]
enum Reply {
    /// Whole text; streamed as a single chunk.
    Text(&'static str),
    /// Streamed chunk by chunk; whole mode returns the concatenation.
    Chunks(Vec<&'static str>),
    /// Streams the chunks, then an invalid chunk, then more text.
    ChunksThenInvalid(Vec<&'static str>),
    /// Rejects the request with this status.
    Status(u16),
    /// Sleeps before answering.
    Slow(Duration),
}

#[derive(Debug)]
struct ScriptedBackend {
    name: &'static str,
    reply: Reply,
    calls: AtomicUsize,
    last_model: Mutex<Option<String>>,
}

impl ScriptedBackend {
    fn new(name: &'static str, reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            name,
            reply,
            calls: AtomicUsize::new(0),
            last_model: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_model(&self) -> Option<String> {
        self.last_model.lock().unwrap().clone()
    }

    fn record(&self, model: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_model.lock().unwrap() = Some(model.to_string());
    }
}

fn status(code: u16) -> BackendError {
    BackendError::Status {
        status: code,
        body: "scripted failure".into(),
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        self.name
    }

    async fn generate(&self, model: &str, _prompt: &str) -> Result<String, BackendError> {
        self.record(model);
        match &self.reply {
            Reply::Text(text) => Ok(text.to_string()),
            Reply::Chunks(chunks) | Reply::ChunksThenInvalid(chunks) => Ok(chunks.concat()),
            Reply::Status(code) => Err(status(*code)),
            Reply::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                Ok("late".to_string())
            }
        }
    }

    async fn generate_stream(
        &self,
        model: &str,
        _prompt: &str,
    ) -> Result<ChunkStream, BackendError> {
        self.record(model);
        let items: Vec<Result<String, BackendError>> = match &self.reply {
            Reply::Text(text) => vec![Ok(text.to_string())],
            Reply::Chunks(chunks) => chunks.iter().map(|c| Ok(c.to_string())).collect(),
            Reply::ChunksThenInvalid(chunks) => {
                let mut items: Vec<_> = chunks.iter().map(|c| Ok(c.to_string())).collect();
                items.push(Err(BackendError::InvalidChunk("{\"unexpected\":true}".into())));
                items.push(Ok("never delivered".to_string()));
                items
            }
            Reply::Status(code) => return Err(status(*code)),
            Reply::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                vec![Ok("late".to_string())]
            }
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Sets its flag when dropped.
#[derive(Debug)]
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Streams one chunk, then goes silent forever.
#[derive(Debug)]
struct StallingBackend {
    first: &'static str,
    released: Arc<AtomicBool>,
}

#[async_trait]
impl ModelBackend for StallingBackend {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn generate(&self, _model: &str, _prompt: &str) -> Result<String, BackendError> {
        Ok(self.first.to_string())
    }

    async fn generate_stream(
        &self,
        _model: &str,
        _prompt: &str,
    ) -> Result<ChunkStream, BackendError> {
        let guard = DropFlag(self.released.clone());
        let first: Result<String, BackendError> = Ok(self.first.to_string());
        let chunks = futures::stream::iter(vec![first])
            .chain(futures::stream::pending())
            .map(move |item| {
                let _held = &guard;
                item
            });
        Ok(Box::pin(chunks))
    }
}

/// Store whose every call fails.
#[derive(Debug, Default)]
struct FailingStore {
    inserts: AtomicUsize,
}

#[async_trait]
impl SnippetStore for FailingStore {
    async fn insert(&self, _prompt: &str, _code: &str, _model: &str) -> Result<i64, StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Task("disk full".into()))
    }

    async fn distinct_models_with_code(&self) -> Result<BTreeSet<String>, StoreError> {
        Err(StoreError::Poisoned)
    }

    async fn get(&self, _id: i64) -> Result<Option<CodeSnippet>, StoreError> {
        Err(StoreError::Poisoned)
    }
}

struct Harness {
    orchestrator: StreamOrchestrator,
    local: Arc<ScriptedBackend>,
    remote: Arc<ScriptedBackend>,
    store: SqliteSnippetStore,
}

fn harness(local: Reply, remote: Reply) -> Harness {
    let local = ScriptedBackend::new("local", local);
    let remote = ScriptedBackend::new("remote", remote);
    let store = SqliteSnippetStore::open_in_memory().unwrap();
    let orchestrator = StreamOrchestrator::new(
        ModelRouter::new(DEFAULT_MODEL).with_preferred_code_models(vec!["gpt-4o".to_string()]),
        local.clone(),
        remote.clone(),
        Arc::new(store.clone()),
    );
    Harness {
        orchestrator,
        local,
        remote,
        store,
    }
}

async fn collect(orchestrator: &StreamOrchestrator, request: ChatRequest) -> Vec<StreamEvent> {
    orchestrator.stream(request).collect().await
}

fn response_texts(events: &[StreamEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Response { response, .. } => Some(response.as_str()),
            _ => None,
        })
        .collect()
}

#[derive(Debug)]
struct PanickingValidator;

impl CodeValidator for PanickingValidator {
    fn is_valid_code(&self, _text: &str) -> bool {
        panic!("validator bug")
    }
}

// ============================================================================
// Whole-response mode
// ============================================================================

#[tokio::test]
async fn test_code_prompt_with_no_candidates_uses_default_and_persists() {
    let h = harness(Reply::Text("def reverse(s): return s[::-1]"), Reply::Text("unused"));

    let reply = h
        .orchestrator
        .respond(ChatRequest::new(CODE_PROMPT))
        .await
        .unwrap();

    assert_eq!(reply.response, "def reverse(s): return s[::-1]");
    assert_eq!(reply.model, DEFAULT_MODEL);
    assert!(reply.warning.is_none());
    let id = reply.snippet_id.expect("code answer must be persisted");

    let row = h.store.get(id).await.unwrap().expect("row exists");
    assert_eq!(row.prompt, CODE_PROMPT);
    assert_eq!(row.code, "def reverse(s): return s[::-1]");
    assert_eq!(row.model, DEFAULT_MODEL);
    assert_eq!(h.remote.calls(), 0);
}

#[tokio::test]
async fn test_plain_prompt_is_not_persisted() {
    let h = harness(Reply::Text("Hi there!"), Reply::Text("unused"));

    let reply = h
        .orchestrator
        .respond(ChatRequest::new("hello"))
        .await
        .unwrap();

    assert_eq!(reply.response, "Hi there!");
    assert!(reply.snippet_id.is_none());
    assert!(reply.warning.is_none());
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_empty_message_is_rejected_without_backend_call() {
    let h = harness(Reply::Text("unused"), Reply::Text("unused"));

    let err = h
        .orchestrator
        .respond(ChatRequest::new(""))
        .await
        .unwrap_err();

    assert!(matches!(err, RouterError::ClientFault(_)));
    assert_eq!(err.status_code(), 400);
    assert_eq!(h.local.calls(), 0);
    assert_eq!(h.remote.calls(), 0);
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_fenced_answer_is_cleaned_before_persisting() {
    let h = harness(
        Reply::Text("```python\ndef f():\n    return 1\n```<|im_end|>"),
        Reply::Text("unused"),
    );

    let reply = h
        .orchestrator
        .respond(ChatRequest::new("python code please"))
        .await
        .unwrap();

    assert_eq!(reply.response, "def f():\n    return 1");
    assert!(reply.warning.is_none());
    let row = h
        .store
        .get(reply.snippet_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.code, reply.response);
}

#[tokio::test]
async fn test_invalid_code_carries_warning_and_snippet_id() {
    let h = harness(Reply::Text("def broken(:\n    pass"), Reply::Text("unused"));

    let reply = h
        .orchestrator
        .respond(ChatRequest::new(CODE_PROMPT))
        .await
        .unwrap();

    assert_eq!(reply.warning.as_deref(), Some(INVALID_CODE_WARNING));
    assert!(reply.snippet_id.is_some());
    assert_eq!(h.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_backend_status_error_fails_request() {
    let h = harness(Reply::Status(500), Reply::Text("unused"));

    let err = h
        .orchestrator
        .respond(ChatRequest::new(CODE_PROMPT))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RouterError::Backend {
            source: BackendError::Status { status: 500, .. },
            ..
        }
    ));
    assert_eq!(err.status_code(), 502);
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_markup_only_answer_is_empty_response() {
    let h = harness(Reply::Text("```\n```"), Reply::Text("unused"));

    let err = h
        .orchestrator
        .respond(ChatRequest::new(CODE_PROMPT))
        .await
        .unwrap_err();

    assert!(matches!(err, RouterError::EmptyResponse { .. }));
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_elapses_as_timeout() {
    let h = harness(Reply::Slow(Duration::from_secs(3600)), Reply::Text("unused"));
    let orchestrator = h.orchestrator.with_deadline(Duration::from_secs(120));
    let started = tokio::time::Instant::now();

    let err = orchestrator
        .respond(ChatRequest::new("hello").with_model(DEFAULT_MODEL))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RouterError::Timeout { after, .. } if after == Duration::from_secs(120)
    ));
    assert_eq!(err.status_code(), 504);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(120) && waited < Duration::from_secs(3600));
}

#[tokio::test]
async fn test_explicit_model_skips_routing() {
    let h = harness(Reply::Text("unused"), Reply::Text("print('hi')"));

    let reply = h
        .orchestrator
        .respond(ChatRequest::new("hello").with_model("gpt-4o-mini"))
        .await
        .unwrap();

    assert_eq!(reply.model, "gpt-4o-mini");
    assert_eq!(h.remote.last_model().as_deref(), Some("gpt-4o-mini"));
    assert_eq!(h.local.calls(), 0);
}

#[tokio::test]
async fn test_code_prompt_routes_to_preferred_candidate() {
    let h = harness(Reply::Text("unused"), Reply::Text("print(1)"));
    h.store.insert("earlier", "x = 1", "gpt-4o").await.unwrap();

    let reply = h
        .orchestrator
        .respond(ChatRequest::new("show me some code"))
        .await
        .unwrap();

    assert_eq!(reply.model, "gpt-4o");
    assert_eq!(h.remote.calls(), 1);
    assert_eq!(h.local.calls(), 0);

    // The new row is attributed to the routed model.
    let row = h.store.get(reply.snippet_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(row.model, "gpt-4o");
}

#[tokio::test]
async fn test_plain_prompt_ignores_candidates() {
    let h = harness(Reply::Text("hi"), Reply::Text("unused"));
    h.store.insert("earlier", "x = 1", "gpt-4o").await.unwrap();

    let reply = h
        .orchestrator
        .respond(ChatRequest::new("hello"))
        .await
        .unwrap();

    assert_eq!(reply.model, DEFAULT_MODEL);
    assert_eq!(h.remote.calls(), 0);
}

#[tokio::test]
async fn test_store_failures_never_fail_the_request() {
    let local = ScriptedBackend::new("local", Reply::Text("def f(): pass"));
    let store = Arc::new(FailingStore::default());
    let orchestrator = StreamOrchestrator::new(
        ModelRouter::new(DEFAULT_MODEL),
        local.clone(),
        ScriptedBackend::new("remote", Reply::Text("unused")),
        store.clone(),
    );

    let reply = orchestrator
        .respond(ChatRequest::new(CODE_PROMPT))
        .await
        .unwrap();

    assert_eq!(reply.response, "def f(): pass");
    assert_eq!(reply.model, DEFAULT_MODEL);
    assert!(reply.snippet_id.is_none());
    assert!(reply.warning.is_none());
    assert_eq!(store.inserts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_validator_yields_warning() {
    let h = harness(Reply::Text("def f(): pass"), Reply::Text("unused"));
    let orchestrator = h
        .orchestrator
        .with_validator(Arc::new(PanickingValidator));

    let reply = orchestrator
        .respond(ChatRequest::new(CODE_PROMPT))
        .await
        .unwrap();

    assert_eq!(reply.warning.as_deref(), Some(INVALID_CODE_WARNING));
    assert_eq!(h.store.count().await.unwrap(), 1);
}

// ============================================================================
// Streaming mode
// ============================================================================

#[tokio::test]
async fn test_stream_invalid_code_ends_with_warning() {
    let h = harness(
        Reply::Chunks(vec!["def f(:\n", "    return 1\n", "print(f())"]),
        Reply::Text("unused"),
    );

    let events = collect(&h.orchestrator, ChatRequest::new(CODE_PROMPT)).await;

    assert_eq!(events.len(), 4, "three responses and one warning: {events:?}");
    assert_eq!(
        response_texts(&events),
        vec!["def f(:\n", "    return 1\n", "print(f())"]
    );
    let snippet_id = match events.last() {
        Some(StreamEvent::Warning {
            warning,
            snippet_id,
        }) => {
            assert_eq!(warning, INVALID_CODE_WARNING);
            *snippet_id
        }
        other => panic!("expected a trailing warning, got {other:?}"),
    };

    let row = h.store.get(snippet_id).await.unwrap().unwrap();
    assert_eq!(row.code, "def f(:\n    return 1\nprint(f())");
    assert_eq!(h.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_stream_valid_code_has_no_trailing_event() {
    let h = harness(
        Reply::Chunks(vec!["def f():\n", "    return 1\n"]),
        Reply::Text("unused"),
    );

    let events = collect(&h.orchestrator, ChatRequest::new(CODE_PROMPT)).await;

    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|e| matches!(e, StreamEvent::Response { model, .. } if model == DEFAULT_MODEL)));
    assert_eq!(h.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_stream_invalid_chunk_ends_with_one_error() {
    let h = harness(
        Reply::Text("unused"),
        Reply::ChunksThenInvalid(vec!["print(", "1)"]),
    );

    let events = collect(
        &h.orchestrator,
        ChatRequest::new(CODE_PROMPT).with_model("gpt-4o"),
    )
    .await;

    assert_eq!(response_texts(&events), vec!["print(", "1)"]);
    assert_eq!(events.iter().filter(|e| e.is_error()).count(), 1);
    assert!(events.last().unwrap().is_error(), "error must be last");
    assert_eq!(h.store.count().await.unwrap(), 0, "failed stream is not persisted");
}

#[tokio::test]
async fn test_stream_rejected_start_is_single_error() {
    let h = harness(Reply::Status(503), Reply::Text("unused"));

    let events = collect(&h.orchestrator, ChatRequest::new(CODE_PROMPT)).await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error { error } => assert!(error.contains("503")),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_stream_blank_message_is_single_error() {
    let h = harness(Reply::Text("unused"), Reply::Text("unused"));

    let events = collect(&h.orchestrator, ChatRequest::new("  ")).await;

    assert_eq!(
        events,
        vec![StreamEvent::error("Message or prompt is required")]
    );
    assert_eq!(h.local.calls(), 0);
}

#[tokio::test]
async fn test_stream_markup_only_output_is_empty_error() {
    let h = harness(Reply::Chunks(vec!["```", "<|im_end|>", "\r"]), Reply::Text("unused"));

    let events = collect(&h.orchestrator, ChatRequest::new(CODE_PROMPT)).await;

    assert_eq!(events.len(), 1);
    assert!(events[0].is_error());
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_stream_skips_chunks_that_clean_to_nothing() {
    let h = harness(
        Reply::Chunks(vec!["```python", "x = 1", "```"]),
        Reply::Text("unused"),
    );

    let events = collect(&h.orchestrator, ChatRequest::new("hello")).await;

    assert_eq!(response_texts(&events), vec!["x = 1"]);
}

#[tokio::test]
async fn test_stream_disconnect_persists_partial_output() {
    let h = harness(
        Reply::Chunks(vec!["a = 1\n", "b = 2\n", "c = 3\n", "d = 4\n", "e = 5\n"]),
        Reply::Text("unused"),
    );
    let orchestrator = h.orchestrator.clone().with_event_buffer(1);

    let mut events = orchestrator.stream(ChatRequest::new(CODE_PROMPT));
    let first = events.next().await.expect("first event");
    assert!(matches!(first, StreamEvent::Response { .. }));
    drop(events);

    let mut rows = 0;
    for _ in 0..100 {
        rows = h.store.count().await.unwrap();
        if rows > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(rows, 1);

    let models = h.store.distinct_models_with_code().await.unwrap();
    assert!(models.contains(DEFAULT_MODEL));
}

#[tokio::test]
async fn test_stream_disconnect_while_backend_is_silent_persists_partial_output() {
    let released = Arc::new(AtomicBool::new(false));
    let store = SqliteSnippetStore::open_in_memory().unwrap();
    let orchestrator = StreamOrchestrator::new(
        ModelRouter::new(DEFAULT_MODEL),
        Arc::new(StallingBackend {
            first: "a = 1\n",
            released: released.clone(),
        }),
        ScriptedBackend::new("remote", Reply::Text("unused")),
        Arc::new(store.clone()),
    );

    let mut events = orchestrator.stream(ChatRequest::new(CODE_PROMPT));
    let first = events.next().await.expect("first event");
    assert_eq!(first, StreamEvent::response("a = 1\n", DEFAULT_MODEL));
    drop(events);

    let mut rows = 0;
    for _ in 0..100 {
        rows = store.count().await.unwrap();
        if rows > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(rows, 1, "partial output must be stored after disconnect");
    assert!(released.load(Ordering::SeqCst), "backend stream must be dropped");

    let models = store.distinct_models_with_code().await.unwrap();
    assert!(models.contains(DEFAULT_MODEL));
}

#[tokio::test]
async fn test_stream_plain_prompt_is_not_persisted() {
    let h = harness(Reply::Chunks(vec!["Hi", " there"]), Reply::Text("unused"));

    let events = collect(&h.orchestrator, ChatRequest::new("hello")).await;

    assert_eq!(response_texts(&events), vec!["Hi", " there"]);
    assert_eq!(h.store.count().await.unwrap(), 0);
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn test_end_to_end_against_mock_local_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": "def reverse(s): return s[::-1]",
            "done": true
        })))
        .mount(&server)
        .await;

    let store = SqliteSnippetStore::open_in_memory().unwrap();
    let orchestrator = StreamOrchestrator::new(
        ModelRouter::new(DEFAULT_MODEL),
        Arc::new(LocalBackend::new(server.uri())),
        ScriptedBackend::new("remote", Reply::Status(401)),
        Arc::new(store.clone()),
    );

    let reply = orchestrator
        .respond(ChatRequest::new(CODE_PROMPT))
        .await
        .unwrap();

    assert_eq!(reply.response, "def reverse(s): return s[::-1]");
    assert_eq!(reply.model, DEFAULT_MODEL);
    assert!(reply.warning.is_none());
    assert!(reply.snippet_id.is_some());
    assert_eq!(store.count().await.unwrap(), 1);
}
