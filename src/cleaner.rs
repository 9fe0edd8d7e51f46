//! # Stage: Response Cleaning
//!
//! ## Responsibility
//! Normalize raw backend text by stripping formatting artifacts: markdown
//! code fences (with their language tag), chat-template control tokens such
//! as `<|im_end|>`, and carriage returns.
//!
//! ## Guarantees
//! - Pure and total: never fails, never allocates beyond the output.
//! - Idempotent: `clean(clean(x)) == clean(x)`. Passes repeat until the text
//!   is a fixed point, and every changing pass strictly shrinks it.
//!
//! ## NOT Responsible For
//! - Escaping wire delimiters (that belongs to `events`)
//! - Artifacts split across two streamed chunks (each chunk is cleaned on
//!   its own)

/// Text normalizer applied to every streamed chunk and to whole responses.
pub trait ResponseCleaner: Send + Sync {
    /// Return the cleaned form of `text`.
    fn clean(&self, text: &str) -> String;
}

/// Default cleaner: removes code fences, control tokens, and `\r`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkupCleaner;

impl MarkupCleaner {
    /// Create the default cleaner.
    pub fn new() -> Self {
        Self
    }
}

impl ResponseCleaner for MarkupCleaner {
    fn clean(&self, text: &str) -> String {
        let mut current = text.to_string();
        loop {
            let next = single_pass(&current);
            if next.len() == current.len() {
                return next;
            }
            current = next;
        }
    }
}

/// Minimum backtick run treated as a fence.
const FENCE_LEN: usize = 3;

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '#' | '.' | '-')
}

fn single_pass(text: &str) -> String {
    let without_cr: String = text.chars().filter(|&c| c != '\r').collect();
    let unfenced = strip_fences(&without_cr);
    strip_control_tokens(&unfenced)
}

/// Remove every run of three or more backticks plus the language tag that
/// directly follows it.
fn strip_fences(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '`' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && chars[i] == '`' {
            i += 1;
        }
        if i - start < FENCE_LEN {
            out.extend(&chars[start..i]);
            continue;
        }
        while i < chars.len() && is_tag_char(chars[i]) {
            i += 1;
        }
    }
    out
}

/// Remove `<|name|>` control tokens (e.g. `<|im_end|>`, `<|eot_id|>`).
fn strip_control_tokens(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("<|") {
        let after_open = &rest[open + 2..];
        let token_end = after_open
            .find("|>")
            .filter(|&end| after_open[..end].chars().all(is_token_char));
        match token_end {
            Some(end) => {
                out.push_str(&rest[..open]);
                rest = &after_open[end + 2..];
            }
            None => {
                out.push_str(&rest[..open + 2]);
                rest = after_open;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
