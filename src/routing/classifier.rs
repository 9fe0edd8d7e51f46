//! "Is this a code question" heuristics.

use std::fmt::Debug;

/// Message-level classifier deciding whether a request is code-bearing.
///
/// Code-bearing requests are routed to code models, and their final output
/// is validated and persisted.
pub trait CodeClassifier: Send + Sync + Debug {
    /// `true` if `message` likely asks for source code.
    fn is_code_bearing(&self, message: &str) -> bool;
}

/// Case-insensitive substring match against a keyword list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordClassifier {
    keywords: Vec<String>,
}

impl KeywordClassifier {
    /// Build a classifier from `keywords`. Blank keywords are dropped.
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// The normalized keyword list.
    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(["code", "python"])
    }
}

impl CodeClassifier for KeywordClassifier {
    fn is_code_bearing(&self, message: &str) -> bool {
        let lowered = message.to_lowercase();
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }
}
