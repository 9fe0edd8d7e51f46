//! model-stream-router server binary.
//!
//! Loads configuration, opens the snippet store, wires the local and remote
//! backends into a [`StreamOrchestrator`], and serves the HTTP API.
//!
//! ## Usage
//!
//! ```text
//! model-stream-router [--config router.toml]
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter
//! - `OLLAMA_HOST`, `DEFAULT_OLLAMA_MODEL`, `DB_PATH`, `PORT`: override the
//!   config file
//! - `GITHUB_TOKEN` (or `remote.api_key_env`): hosted API token

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use model_stream_router::config::{self, RouterConfig};
use model_stream_router::{
    init_tracing, metrics, web_api, LocalBackend, ModelBackend, ModelRouter, RemoteBackend,
    SqliteSnippetStore, StreamOrchestrator, UnavailableBackend,
};
use tracing::{error, info, warn};

/// Parse command-line arguments manually.
///
/// Returns the optional config path, or a usage message.
fn parse_args() -> Result<Option<PathBuf>, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a value".to_string());
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
        i += 1;
    }

    Ok(config_path)
}

fn usage() -> String {
    [
        "Usage: model-stream-router [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>   Path to a TOML config file (default: built-in defaults)",
        "  --help, -h            Show this help message",
    ]
    .join("\n")
}

fn build_orchestrator(config: &RouterConfig) -> Result<StreamOrchestrator, Box<dyn std::error::Error>> {
    let store = SqliteSnippetStore::open(&config.store.db_path)?;
    info!(db_path = %config.store.db_path, "snippet store ready");

    let local = LocalBackend::from_config(&config.local);
    info!(base_url = %local.base_url(), "local backend configured");

    let remote: Arc<dyn ModelBackend> = match RemoteBackend::from_config(&config.remote) {
        Ok(remote) => Arc::new(remote),
        Err(e) => {
            warn!(error = %e, "remote backend disabled; hosted models will fail");
            Arc::new(UnavailableBackend::new("remote", e.to_string()))
        }
    };

    Ok(StreamOrchestrator::new(
        ModelRouter::from_config(&config.routing),
        Arc::new(local),
        remote,
        Arc::new(store),
    )
    .with_deadline(Duration::from_secs(
        config.generation.whole_response_deadline_secs,
    )))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();

    let config_path = match parse_args() {
        Ok(path) => path,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let config = config::loader::load(config_path.as_deref()).map_err(|e| {
        error!(error = %e, "invalid configuration");
        e
    })?;

    metrics::init_metrics()?;

    info!(
        default_model = %config.routing.default_model,
        port = config.server.port,
        "Starting model-stream-router"
    );

    let orchestrator = build_orchestrator(&config)?;

    web_api::start_server(config.server, orchestrator)
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;

    Ok(())
}
