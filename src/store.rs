//! # Stage: Snippet Persistence
//!
//! ## Responsibility
//! Append `(prompt, code, model)` rows for code-bearing answers and answer
//! "which models have produced code", the routing candidate query.
//!
//! ## Guarantees
//! - Insert-only: rows are never updated or deleted here.
//! - Single writer: every call holds the connection mutex for its whole
//!   duration, on the blocking pool, so the async runtime is never stalled
//!   and `last_insert_rowid` always belongs to the caller's insert.
//! - Failures are returned, never swallowed; whether they are fatal is the
//!   caller's decision.
//!
//! ## NOT Responsible For
//! - Deciding *whether* to persist (that belongs to `orchestrator`)
//! - Migrations beyond create-if-absent

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// A persisted answer to a code-bearing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSnippet {
    /// Auto-increment identifier.
    pub id: i64,
    /// The user message that produced the code.
    pub prompt: String,
    /// Full cleaned response text.
    pub code: String,
    /// Model that produced it.
    pub model: String,
}

/// Errors from the snippet store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database directory could not be created.
    #[error("cannot create database directory {path}: {source}")]
    Io {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// SQLite rejected an operation.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A previous holder of the connection panicked.
    #[error("snippet store connection is poisoned")]
    Poisoned,

    /// The blocking task running the query failed.
    #[error("snippet store task failed: {0}")]
    Task(String),
}

/// Persistence surface used by the orchestrator.
#[async_trait]
pub trait SnippetStore: Send + Sync {
    /// Append one row and return its identifier.
    ///
    /// # Errors
    ///
    /// Any [`StoreError`]; the row is not written.
    async fn insert(&self, prompt: &str, code: &str, model: &str) -> Result<i64, StoreError>;

    /// Models with at least one row of non-empty code.
    ///
    /// # Errors
    ///
    /// Any [`StoreError`].
    async fn distinct_models_with_code(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Fetch one row by identifier.
    ///
    /// # Errors
    ///
    /// Any [`StoreError`]; a missing row is `Ok(None)`.
    async fn get(&self, id: i64) -> Result<Option<CodeSnippet>, StoreError>;
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS code_snippets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    prompt TEXT NOT NULL,
    code TEXT NOT NULL,
    model TEXT NOT NULL
)";

/// SQLite-backed [`SnippetStore`].
#[derive(Debug, Clone)]
pub struct SqliteSnippetStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSnippetStore {
    /// Open (or create) the database at `path`, creating its parent
    /// directory and the `code_snippets` table if absent.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] if the directory cannot be created, or
    /// [`StoreError::Sqlite`] if the file cannot be opened or initialised.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Self::init(Connection::open(path)?)
    }

    /// A private in-memory database, for tests and ephemeral runs.
    ///
    /// # Errors
    ///
    /// [`StoreError::Sqlite`] if SQLite cannot initialise.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(CREATE_TABLE, [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Total number of rows.
    ///
    /// # Errors
    ///
    /// Any [`StoreError`].
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM code_snippets", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .await
        .map(|n| u64::try_from(n).unwrap_or(0))
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl SnippetStore for SqliteSnippetStore {
    async fn insert(&self, prompt: &str, code: &str, model: &str) -> Result<i64, StoreError> {
        let (prompt, code, model) = (prompt.to_string(), code.to_string(), model.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO code_snippets (prompt, code, model) VALUES (?1, ?2, ?3)",
                params![prompt, code, model],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn distinct_models_with_code(&self) -> Result<BTreeSet<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT model FROM code_snippets WHERE code != ''")?;
            let models = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<BTreeSet<String>>>()?;
            Ok(models)
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<CodeSnippet>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, prompt, code, model FROM code_snippets WHERE id = ?1",
                params![id],
                |row| {
                    Ok(CodeSnippet {
                        id: row.get(0)?,
                        prompt: row.get(1)?,
                        code: row.get(2)?,
                        model: row.get(3)?,
                    })
                },
            )
            .optional()
        })
        .await
    }
}
