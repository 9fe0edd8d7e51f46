//! Model routing logic.
//!
//! The [`ModelRouter`] combines a [`CodeClassifier`] with the configured
//! default and preferred models. It holds no mutable state, so one instance
//! is shared across all requests.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::classifier::{CodeClassifier, KeywordClassifier};
use crate::config::RoutingSection;

/// Deterministic model router.
///
/// # Routing rules
///
/// For a code-bearing message:
/// 1. the first `preferred_code_models` entry present in the candidate set;
/// 2. otherwise the lexicographically smallest candidate that is not the
///    default model;
/// 3. otherwise the default model.
///
/// Any other message gets the default model.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    default_model: String,
    local_models: BTreeSet<String>,
    preferred_code_models: Vec<String>,
    classifier: Arc<dyn CodeClassifier>,
}

impl ModelRouter {
    /// Create a router whose fallback is `default_model`, with the default
    /// keyword classifier and no preferred models.
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            local_models: BTreeSet::new(),
            preferred_code_models: Vec::new(),
            classifier: Arc::new(KeywordClassifier::default()),
        }
    }

    /// Build from the `[routing]` configuration section.
    pub fn from_config(section: &RoutingSection) -> Self {
        Self::new(section.default_model.clone())
            .with_local_models(section.local_models.iter().cloned())
            .with_preferred_code_models(section.preferred_code_models.iter().cloned())
            .with_classifier(Arc::new(KeywordClassifier::new(&section.code_keywords)))
    }

    /// Models, besides the default, that the local backend serves.
    pub fn with_local_models<I: IntoIterator<Item = String>>(mut self, models: I) -> Self {
        self.local_models = models.into_iter().collect();
        self
    }

    /// Ordered preference list for code-bearing messages.
    pub fn with_preferred_code_models<I: IntoIterator<Item = String>>(mut self, models: I) -> Self {
        self.preferred_code_models = models.into_iter().collect();
        self
    }

    /// Replace the code-bearing classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn CodeClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// The fallback model, always a valid routing result.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// `true` if `model` is served by the local backend.
    pub fn is_local(&self, model: &str) -> bool {
        model == self.default_model || self.local_models.contains(model)
    }

    /// Whether `message` is code-bearing according to the classifier.
    pub fn is_code_bearing(&self, message: &str) -> bool {
        self.classifier.is_code_bearing(message)
    }

    /// Choose the model for `message` from `candidates`.
    ///
    /// The result is always a member of `candidates ∪ {default_model}`.
    pub fn route(&self, message: &str, candidates: &BTreeSet<String>) -> String {
        if !self.is_code_bearing(message) {
            return self.default_model.clone();
        }

        let preferred = self
            .preferred_code_models
            .iter()
            .find(|m| candidates.contains(m.as_str()));
        if let Some(model) = preferred {
            return model.clone();
        }

        candidates
            .iter()
            .find(|m| !m.trim().is_empty() && **m != self.default_model)
            .cloned()
            .unwrap_or_else(|| self.default_model.clone())
    }
}
