//! # Stage: Router Configuration
//!
//! ## Responsibility
//! Define the TOML configuration schema for the router service: listen
//! address, routing policy, backend endpoints, snippet store location, and
//! generation deadlines. Apply environment overrides on top of file values.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `RouterConfig`
//! - Complete defaults: an empty file (or no file) yields a runnable config
//! - Validated: `loader` checks every semantic constraint before returning
//!
//! ## NOT Responsible For
//! - Constructing backends or the store from config (that belongs to `main`)
//! - Reading secrets; only the *name* of the token variable lives here

pub mod loader;
pub mod validation;

use serde::{Deserialize, Serialize};

pub use loader::{load_from_file, load_from_str};
pub use validation::ConfigError;

// ── Default value functions ──────────────────────────────────────────────

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:8080".to_string()]
}

/// Default request body limit: 1 MiB.
fn default_max_request_bytes() -> usize {
    1024 * 1024
}

fn default_model() -> String {
    "llama3.2:3b".to_string()
}

fn default_preferred_code_models() -> Vec<String> {
    vec!["gpt-4o".to_string()]
}

fn default_code_keywords() -> Vec<String> {
    vec!["code".to_string(), "python".to_string()]
}

fn default_local_url() -> String {
    crate::backend::local::DEFAULT_LOCAL_URL.to_string()
}

fn default_remote_url() -> String {
    crate::backend::remote::DEFAULT_REMOTE_URL.to_string()
}

fn default_api_key_env() -> String {
    crate::backend::remote::DEFAULT_API_KEY_ENV.to_string()
}

/// Default backend and deadline timeout: 120 seconds.
fn default_timeout_secs() -> u64 {
    120
}

fn default_db_path() -> String {
    "data/kouroshai.db".to_string()
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a router instance.
///
/// Every section and field has a default, so partial files are accepted.
///
/// # Example
///
/// ```toml
/// [server]
/// port = 9000
///
/// [routing]
/// default_model = "llama3.2:3b"
/// preferred_code_models = ["gpt-4o"]
///
/// [remote]
/// api_key_env = "GITHUB_TOKEN"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerSection,
    /// Model selection policy.
    #[serde(default)]
    pub routing: RoutingSection,
    /// Local generation service.
    #[serde(default)]
    pub local: LocalSection,
    /// Hosted model API.
    #[serde(default)]
    pub remote: RemoteSection,
    /// Snippet persistence.
    #[serde(default)]
    pub store: StoreSection,
    /// Generation deadlines.
    #[serde(default)]
    pub generation: GenerationSection,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origins allowed by CORS. `"*"` allows any origin.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Requests with a larger `Content-Length` are rejected with 413.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

/// Model selection policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingSection {
    /// Fallback model; always served by the local backend.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Additional models served by the local backend.
    #[serde(default)]
    pub local_models: Vec<String>,
    /// Models tried first, in order, for code-bearing messages.
    #[serde(default = "default_preferred_code_models")]
    pub preferred_code_models: Vec<String>,
    /// Case-insensitive substrings that mark a message as code-bearing.
    #[serde(default = "default_code_keywords")]
    pub code_keywords: Vec<String>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            local_models: Vec::new(),
            preferred_code_models: default_preferred_code_models(),
            code_keywords: default_code_keywords(),
        }
    }
}

/// Local (Ollama-compatible) generation service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalSection {
    /// Base URL, e.g. `http://localhost:11434`.
    #[serde(default = "default_local_url")]
    pub base_url: String,
    /// Whole-response request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            base_url: default_local_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Hosted OpenAI-compatible model API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteSection {
    /// API base URL; `/chat/completions` is appended.
    #[serde(default = "default_remote_url")]
    pub base_url: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Whole-response request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Optional system message prepended to every request.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            base_url: default_remote_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            system_prompt: None,
        }
    }
}

/// Snippet store location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSection {
    /// SQLite database file. The parent directory is created on open.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Generation deadlines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationSection {
    /// Upper bound on a whole-response generation, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub whole_response_deadline_secs: u64,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            whole_response_deadline_secs: default_timeout_secs(),
        }
    }
}

impl RouterConfig {
    /// Check every semantic constraint, collecting all violations.
    ///
    /// # Errors
    ///
    /// Returns every [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        validation::validate(self)
    }

    /// Apply `OLLAMA_HOST`, `DEFAULT_OLLAMA_MODEL`, `DB_PATH` and `PORT`
    /// from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] if `PORT` is not a valid port.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Blank values are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] if `PORT` is not a valid port.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("OLLAMA_HOST") {
            self.local.base_url = host.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("DEFAULT_OLLAMA_MODEL") {
            self.routing.default_model = model;
        }
        if let Some(path) = get("DB_PATH") {
            self.store.db_path = path;
        }
        if let Some(port) = get("PORT") {
            self.server.port = port.trim().parse().map_err(|_| ConfigError::InvalidField {
                field: "PORT".into(),
                value: port.clone(),
                reason: "must be an integer between 1 and 65535".into(),
            })?;
        }
        Ok(())
    }
}
