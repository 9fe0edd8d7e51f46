//! Web API Server
//!
//! HTTP front end for the [`StreamOrchestrator`].
//!
//! ## Endpoints
//!
//! - `POST /chat`: whole-response chat (JSON)
//! - `POST /chat/chat-stream`: streaming chat as Server-Sent Events; every
//!   `data:` frame is one JSON-encoded [`StreamEvent`]
//! - `GET  /chat/models`: default model and current routing candidates
//! - `GET  /health`: liveness
//! - `GET  /metrics`: Prometheus metrics
//!
//! Unknown paths get a JSON 404. Errors from the orchestrator are returned as
//! `{"detail": ..., "kind": ...}` with the status from
//! [`RouterError::status_code`].

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerSection;
use crate::events::StreamEvent;
use crate::orchestrator::StreamOrchestrator;
use crate::{ChatRequest, ChatResponse, RouterError};

// ============================================================================
// Types
// ============================================================================

/// Shared application state available to all handlers.
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<StreamOrchestrator>,
}

/// Body of `GET /chat/models`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelsResponse {
    /// The fallback model.
    pub default_model: String,
    /// Every model the router may currently pick, sorted, default included.
    pub models: Vec<String>,
}

/// Error body for failed chat requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Formatted error message.
    pub detail: String,
    /// Machine-readable kind, see [`RouterError::kind`].
    pub kind: String,
}

// ============================================================================
// Server
// ============================================================================

/// Build the application router without binding a socket.
pub fn app(orchestrator: StreamOrchestrator, config: &ServerSection) -> Router {
    let state = AppState {
        orchestrator: Arc::new(orchestrator),
    };

    Router::new()
        .route("/chat", post(chat_handler))
        .route("/chat/chat-stream", post(chat_stream_handler))
        .route("/chat/models", get(models_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(not_found_handler)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn_with_state(
            config.max_request_bytes,
            body_size_middleware,
        ))
        .layer(cors_layer(&config.allowed_origins))
        .with_state(state)
}

/// Start the web API server.
///
/// Binds to `config.host:config.port` and serves until the server shuts
/// down.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn start_server(
    config: ServerSection,
    orchestrator: StreamOrchestrator,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.host, config.port);
    let app = app(orchestrator, &config);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Web API ready on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o.trim() == "*") {
        AllowOrigin::any()
    } else {
        let values: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o.trim()) {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(origin = %o, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(values)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// ============================================================================
// Middleware
// ============================================================================

/// Adds an `X-Request-ID` header to every response, preserving one sent by
/// the client.
async fn request_id_middleware(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

/// Rejects requests whose `Content-Length` exceeds `max_size` with 413.
async fn body_size_middleware(
    State(max_size): State<usize>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let too_large = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
        .is_some_and(|len| len > max_size);

    if too_large {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(serde_json::json!({"error": "payload_too_large", "message": "Request body too large"})),
        )
            .into_response();
    }

    next.run(req).await
}

// ============================================================================
// Chat Handlers
// ============================================================================

/// `POST /chat`: whole-response chat.
async fn chat_handler(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    Ok(Json(state.orchestrator.respond(req).await?))
}

/// `POST /chat/chat-stream`: streaming chat over SSE.
///
/// A blank message is rejected with 400 before the stream opens. Every later
/// failure arrives in-band as an `{"error": ...}` frame.
async fn chat_stream_handler(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    req.validate()?;
    let events = state.orchestrator.stream(req).map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &StreamEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|e| {
        warn!(error = %e, "failed to encode stream event");
        Event::default().data(r#"{"error":"event encoding failed"}"#)
    })
}

/// `GET /chat/models`: routing candidates.
async fn models_handler(State(state): State<AppState>) -> Json<ModelsResponse> {
    let default_model = state.orchestrator.router().default_model().to_string();
    let mut models = state.orchestrator.candidates().await;
    models.insert(default_model.clone());
    Json(ModelsResponse {
        default_model,
        models: models.into_iter().collect(),
    })
}

// ============================================================================
// Utility Handlers
// ============================================================================

/// `GET /health`: Health check endpoint.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /metrics`: Prometheus metrics endpoint.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

/// Fallback for unknown paths.
async fn not_found_handler(uri: Uri) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "error": "not_found",
            "message": "The requested endpoint does not exist",
            "path": uri.path(),
        })),
    )
        .into_response()
}

// ============================================================================
// Error Type
// ============================================================================

/// [`RouterError`] rendered as an HTTP response.
#[derive(Debug)]
struct ApiError(RouterError);

impl From<RouterError> for ApiError {
    fn from(e: RouterError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            detail: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Tests
// ============================================================================
