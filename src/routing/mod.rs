//! # Stage: Model Routing
//!
//! ## Responsibility
//! Pick the model that serves a chat message. Code-bearing messages go to a
//! preferred code model when one has proven itself (it has produced at
//! least one stored snippet); everything else goes to the default model.
//!
//! ## Guarantees
//! - Pure: no I/O. The candidate set is a per-request snapshot passed in by
//!   the caller, never a hidden dependency.
//! - Deterministic: the same `(message, candidates)` always yields the same
//!   model, since candidates are a sorted `BTreeSet`.
//! - Total: always returns a non-empty model name.
//!
//! ## NOT Responsible For
//! - Honoring an explicit caller model (the orchestrator skips routing)
//! - Fetching the candidate set (that belongs to `store`)
//! - Choosing a backend for a model (that belongs to `orchestrator`)

pub mod classifier;
pub mod router;

// Re-exports for convenience
pub use classifier::{CodeClassifier, KeywordClassifier};
pub use router::ModelRouter;
