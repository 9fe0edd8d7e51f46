//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`RouterConfig`] that cannot
//! be expressed through the type system alone (non-empty names, non-zero
//! deadlines, well-formed URLs).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::RouterConfig;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "routing.default_model").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn is_http_url(url: &str) -> bool {
    ["http://", "https://"].iter().any(|scheme| {
        url.strip_prefix(scheme)
            .is_some_and(|rest| !rest.is_empty() && !rest.starts_with('/'))
    })
}

fn non_empty(errors: &mut Vec<ConfigError>, field: &str, value: &str) {
    if value.trim().is_empty() {
        errors.push(ConfigError::InvalidField {
            field: field.into(),
            value: String::new(),
            reason: "must not be empty".into(),
        });
    }
}

fn at_least_one_second(errors: &mut Vec<ConfigError>, field: &str, secs: u64) {
    if secs == 0 {
        errors.push(ConfigError::InvalidField {
            field: field.into(),
            value: "0".into(),
            reason: "must be at least 1 second".into(),
        });
    }
}

fn http_url(errors: &mut Vec<ConfigError>, field: &str, url: &str) {
    if !is_http_url(url) {
        errors.push(ConfigError::InvalidField {
            field: field.into(),
            value: url.to_string(),
            reason: "must be an http:// or https:// URL".into(),
        });
    }
}

/// Validate all semantic constraints on a [`RouterConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Errors
///
/// Returns every violation found.
pub fn validate(config: &RouterConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Server ───────────────────────────────────────────────────────
    non_empty(&mut errors, "server.host", &config.server.host);
    if config.server.port == 0 {
        errors.push(ConfigError::InvalidField {
            field: "server.port".into(),
            value: "0".into(),
            reason: "must be between 1 and 65535".into(),
        });
    }

    if config.server.max_request_bytes == 0 {
        errors.push(ConfigError::InvalidField {
            field: "server.max_request_bytes".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    // ── Routing ──────────────────────────────────────────────────────
    non_empty(&mut errors, "routing.default_model", &config.routing.default_model);
    for (i, model) in config.routing.local_models.iter().enumerate() {
        non_empty(&mut errors, &format!("routing.local_models[{i}]"), model);
    }
    for (i, model) in config.routing.preferred_code_models.iter().enumerate() {
        non_empty(&mut errors, &format!("routing.preferred_code_models[{i}]"), model);
    }
    if config.routing.code_keywords.iter().all(|k| k.trim().is_empty()) {
        errors.push(ConfigError::InvalidField {
            field: "routing.code_keywords".into(),
            value: format!("{:?}", config.routing.code_keywords),
            reason: "at least one non-empty keyword is required".into(),
        });
    }

    // ── Backends ─────────────────────────────────────────────────────
    http_url(&mut errors, "local.base_url", &config.local.base_url);
    at_least_one_second(&mut errors, "local.timeout_secs", config.local.timeout_secs);
    http_url(&mut errors, "remote.base_url", &config.remote.base_url);
    non_empty(&mut errors, "remote.api_key_env", &config.remote.api_key_env);
    at_least_one_second(&mut errors, "remote.timeout_secs", config.remote.timeout_secs);

    // ── Store and generation ─────────────────────────────────────────
    non_empty(&mut errors, "store.db_path", &config.store.db_path);
    at_least_one_second(
        &mut errors,
        "generation.whole_response_deadline_secs",
        config.generation.whole_response_deadline_secs,
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
