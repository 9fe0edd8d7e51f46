//! Prometheus metrics for the router.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_request`, `inc_error`, …) are no-ops if `init_metrics` was never
//! called, so the router is always safe to run and observability simply
//! degrades.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `router_requests_total` | Counter | `mode`, `backend` |
//! | `router_errors_total` | Counter | `kind` |
//! | `router_snippets_total` | Counter | `valid` |
//! | `router_persistence_failures_total` | Counter | |
//! | `router_malformed_lines_total` | Counter | `backend` |
//! | `router_generation_duration_seconds` | Histogram | `mode` |

use crate::RouterError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All router metrics, stored in a single [`OnceLock`] and initialised
/// atomically.
pub struct Metrics {
    /// Registry that owns all metric descriptors.
    pub registry: Registry,
    /// Requests by generation mode and resolved model.
    pub requests_total: CounterVec,
    /// Request failures by error kind.
    pub errors_total: CounterVec,
    /// Persisted snippets by validation verdict.
    pub snippets_total: CounterVec,
    /// Snippet inserts that failed.
    pub persistence_failures: IntCounter,
    /// Stream lines skipped as malformed, by backend.
    pub malformed_lines: CounterVec,
    /// Generation latency by mode.
    pub generation_duration: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

// ── Initialisation ─────────────────────────────────────────────────────────

fn register<C>(registry: &Registry, metric: Result<C, prometheus::Error>) -> Result<C, RouterError>
where
    C: Collector + Clone + 'static,
{
    let metric = metric.map_err(|e| RouterError::Internal(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| RouterError::Internal(format!("metrics registration failed: {e}")))?;
    Ok(metric)
}

/// Build a fresh, fully registered metrics bundle.
fn build(prefix: &str) -> Result<Metrics, RouterError> {
    let registry = Registry::new();
    let name = |suffix: &str| format!("{prefix}_{suffix}");

    let requests_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("requests_total"), "Chat requests by mode and backend"),
            &["mode", "backend"],
        ),
    )?;
    let errors_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("errors_total"), "Failed requests by error kind"),
            &["kind"],
        ),
    )?;
    let snippets_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("snippets_total"), "Persisted code snippets by verdict"),
            &["valid"],
        ),
    )?;
    let persistence_failures = register(
        &registry,
        IntCounter::new(
            name("persistence_failures_total"),
            "Snippet inserts that failed",
        ),
    )?;
    let malformed_lines = register(
        &registry,
        CounterVec::new(
            Opts::new(name("malformed_lines_total"), "Skipped malformed stream lines"),
            &["backend"],
        ),
    )?;
    let generation_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(name("generation_duration_seconds"), "Generation latency"),
            &["mode"],
        ),
    )?;

    Ok(Metrics {
        registry,
        requests_total,
        errors_total,
        snippets_total,
        persistence_failures,
        malformed_lines,
        generation_duration,
    })
}

/// Initialise all metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`RouterError::Internal`] if metric construction or registration
/// fails.
pub fn init_metrics() -> Result<(), RouterError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(build("router")?);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count one request served in `mode` (`whole` or `stream`) by `backend`.
///
/// The label set is closed: model names, which callers may choose freely,
/// never become label values.
pub fn inc_request(mode: &str, backend: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[mode, backend]) {
            c.inc();
        }
    }
}

/// Count one failed request of `kind` (see [`RouterError::kind`]).
pub fn inc_error(kind: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.errors_total.get_metric_with_label_values(&[kind]) {
            c.inc();
        }
    }
}

/// Count one persisted snippet with its validation verdict.
pub fn inc_snippet(valid: bool) {
    if let Some(m) = metrics() {
        let label = if valid { "true" } else { "false" };
        if let Ok(c) = m.snippets_total.get_metric_with_label_values(&[label]) {
            c.inc();
        }
    }
}

/// Count one failed snippet insert.
pub fn inc_persistence_failure() {
    if let Some(m) = metrics() {
        m.persistence_failures.inc();
    }
}

/// Count one malformed stream line skipped by `backend`.
pub fn inc_malformed_line(backend: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.malformed_lines.get_metric_with_label_values(&[backend]) {
            c.inc();
        }
    }
}

/// Record how long a generation in `mode` took.
pub fn record_generation(mode: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.generation_duration.get_metric_with_label_values(&[mode]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Render all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics are not initialised.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    encode(&m.registry)
}

fn encode(registry: &Registry) -> String {
    let families = registry.gather();
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
