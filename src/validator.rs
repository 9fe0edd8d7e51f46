//! # Stage: Code Validation
//!
//! ## Responsibility
//! Decide whether a generated text blob is syntactically plausible Python,
//! the language code-bearing requests are assumed to target.
//!
//! ## Guarantees
//! - Returns a verdict, never an error. Callers additionally treat a panic
//!   inside a validator as `false` (fail closed).
//! - Invalid input is reported on the `invalid_code` tracing target with the
//!   reason and position, never with the code itself.
//!
//! ## Checks ([`SyntaxValidator`])
//! 1. String literals (single, double, triple-quoted) are terminated.
//! 2. Brackets are balanced and correctly nested.
//! 3. Compound statement headers (`def`, `if`, `for`, ...) carry a colon,
//!    and a header ending in `:` is followed by an indented body.
//! 4. Dedents return to an indentation level that was opened before.
//!
//! ## NOT Responsible For
//! - Full grammar parsing or semantic checks (names, types, imports)

use thiserror::Error;

/// Syntax verdict for generated code.
pub trait CodeValidator: Send + Sync {
    /// `true` if `text` looks like valid code.
    fn is_valid_code(&self, text: &str) -> bool;
}

/// Why a blob was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyntaxIssue {
    /// A string literal opened on `line` never closes.
    #[error("unterminated string literal starting on line {line}")]
    UnterminatedString {
        /// 1-based line number.
        line: usize,
    },

    /// A closing bracket does not match the innermost open one.
    #[error("unexpected '{found}' on line {line}")]
    MismatchedBracket {
        /// 1-based line number.
        line: usize,
        /// The offending closing bracket.
        found: char,
    },

    /// A bracket opened on `line` is never closed.
    #[error("'{open}' opened on line {line} is never closed")]
    UnclosedBracket {
        /// 1-based line number.
        line: usize,
        /// The unclosed opening bracket.
        open: char,
    },

    /// A compound statement header has no colon.
    #[error("statement on line {line} is missing ':'")]
    MissingColon {
        /// 1-based logical line number.
        line: usize,
    },

    /// A block header is not followed by an indented body.
    #[error("expected an indented block after line {line}")]
    MissingBlock {
        /// 1-based logical line number.
        line: usize,
    },

    /// A line is indented without an enclosing block.
    #[error("unexpected indent on line {line}")]
    UnexpectedIndent {
        /// 1-based logical line number.
        line: usize,
    },

    /// A dedent lands on a level that was never opened.
    #[error("unindent on line {line} does not match any outer level")]
    InconsistentDedent {
        /// 1-based logical line number.
        line: usize,
    },
}

/// Structural Python syntax validator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntaxValidator;

impl SyntaxValidator {
    /// Create the default validator.
    pub fn new() -> Self {
        Self
    }

    /// Run every check and return the first issue found.
    ///
    /// # Errors
    ///
    /// Returns the [`SyntaxIssue`] that made the text invalid.
    pub fn check(&self, text: &str) -> Result<(), SyntaxIssue> {
        let masked = mask_literals(text)?;
        check_blocks(&masked)
    }
}

impl CodeValidator for SyntaxValidator {
    fn is_valid_code(&self, text: &str) -> bool {
        match self.check(text) {
            Ok(()) => true,
            Err(issue) => {
                tracing::warn!(
                    target: "invalid_code",
                    reason = %issue,
                    code_len = text.len(),
                    "generated code failed validation"
                );
                false
            }
        }
    }
}

const HEADER_KEYWORDS: &[&str] = &[
    "def", "class", "if", "elif", "else", "for", "while", "try", "except", "finally", "with",
];

enum Scan {
    Code,
    Comment,
    Str {
        quote: char,
        triple: bool,
        line: usize,
    },
}

/// Strip comments and string contents, join bracketed and backslash-continued
/// lines, and verify quoting and bracket nesting on the way.
///
/// Each string literal is replaced by a single `S` so the line stays
/// non-blank.
fn mask_literals(text: &str) -> Result<String, SyntaxIssue> {
    let chars: Vec<char> = text.chars().filter(|&c| c != '\r').collect();
    let mut out = String::with_capacity(chars.len());
    let mut brackets: Vec<(char, usize)> = Vec::new();
    let mut state = Scan::Code;
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match state {
            Scan::Comment => {
                if c == '\n' {
                    state = Scan::Code;
                    continue;
                }
            }
            Scan::Str {
                quote,
                triple,
                line: start,
            } => match c {
                '\\' => {
                    if chars.get(i + 1) == Some(&'\n') {
                        line += 1;
                    }
                    i += 1;
                }
                '\n' if !triple => return Err(SyntaxIssue::UnterminatedString { line: start }),
                '\n' => line += 1,
                q if q == quote => {
                    if !triple {
                        state = Scan::Code;
                    } else if chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote)
                    {
                        i += 2;
                        state = Scan::Code;
                    }
                }
                _ => {}
            },
            Scan::Code => match c {
                '#' => state = Scan::Comment,
                '\'' | '"' => {
                    let triple = chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c);
                    if triple {
                        i += 2;
                    }
                    state = Scan::Str {
                        quote: c,
                        triple,
                        line,
                    };
                    out.push('S');
                }
                '(' | '[' | '{' => {
                    brackets.push((c, line));
                    out.push(c);
                }
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match brackets.pop() {
                        Some((open, _)) if open == expected => out.push(c),
                        _ => return Err(SyntaxIssue::MismatchedBracket { line, found: c }),
                    }
                }
                '\\' if chars.get(i + 1) == Some(&'\n') => {
                    out.push(' ');
                    line += 1;
                    i += 1;
                }
                '\n' => {
                    line += 1;
                    out.push(if brackets.is_empty() { '\n' } else { ' ' });
                }
                _ => out.push(c),
            },
        }
        i += 1;
    }

    if let Scan::Str { line, .. } = state {
        return Err(SyntaxIssue::UnterminatedString { line });
    }
    if let Some((open, line)) = brackets.pop() {
        return Err(SyntaxIssue::UnclosedBracket { line, open });
    }
    Ok(out)
}

fn is_header(statement: &str) -> bool {
    let mut words = statement
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty());
    match words.next() {
        Some("async") => {
            statement.starts_with("async") && matches!(words.next(), Some("def" | "for" | "with"))
        }
        // The keyword must open the statement: `(for x in y)` is not a header.
        Some(first) if HEADER_KEYWORDS.contains(&first) => statement
            .strip_prefix(first)
            .and_then(|rest| rest.chars().next())
            .map_or(statement == first, |c| !(c.is_alphanumeric() || c == '_')),
        _ => false,
    }
}

/// Indentation and block-header checks over masked logical lines.
fn check_blocks(masked: &str) -> Result<(), SyntaxIssue> {
    let mut levels: Vec<usize> = vec![0];
    let mut open_block: Option<usize> = None;

    for (idx, raw) in masked.lines().enumerate() {
        let line = idx + 1;
        let statement = raw.trim();
        if statement.is_empty() {
            continue;
        }
        let indent = raw.len() - raw.trim_start().len();
        let current = levels.last().copied().unwrap_or(0);

        if open_block.take().is_some() {
            if indent <= current {
                return Err(SyntaxIssue::MissingBlock { line: line - 1 });
            }
            levels.push(indent);
        } else if indent > current {
            return Err(SyntaxIssue::UnexpectedIndent { line });
        } else if indent < current {
            while levels.last().is_some_and(|&l| l > indent) {
                levels.pop();
            }
            if levels.last() != Some(&indent) {
                return Err(SyntaxIssue::InconsistentDedent { line });
            }
        }

        if statement.ends_with(':') {
            open_block = Some(line);
        } else if is_header(statement) && !statement.contains(':') {
            return Err(SyntaxIssue::MissingColon { line });
        }
    }

    match open_block {
        Some(line) => Err(SyntaxIssue::MissingBlock { line }),
        None => Ok(()),
    }
}
