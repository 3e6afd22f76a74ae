//! SQLite full-text index of JSON documents.
//!
//! Each document is stored verbatim next to an FTS5 row holding the text
//! of its string and number leaves. A query is an FTS5 `MATCH` expression;
//! matches come back in insertion order.
//!
//! [`SqliteIndex`] is the [`QueryExecutor`] used by the server. The
//! returned [`SqliteCursor`] pages through the matches with keyset
//! pagination, so only `page_size` rows are resident at a time. A pooled
//! connection is checked out for one page fetch and returned straight
//! after; a cursor whose client has stalled holds no connection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::IndexConfig;
use crate::db;
use crate::error::QueryError;
use crate::migrate;
use crate::models::StoredDocument;
use crate::traits::{QueryExecutor, ResultSequence};

pub struct SqliteIndex {
    pool: SqlitePool,
    path: PathBuf,
    page_size: i64,
}

impl SqliteIndex {
    /// Opens the index at `path`, creating the file and schema if missing.
    pub async fn open(path: &Path, config: &IndexConfig) -> Result<Self> {
        let pool = db::connect(path, config)
            .await
            .with_context(|| format!("Failed to open index: {}", path.display()))?;
        migrate::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            path: path.to_path_buf(),
            page_size: config.page_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stores one document and returns its id.
    pub async fn add_document(&self, doc: &Value) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let id = insert_document(&mut tx, doc).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Loads newline-delimited JSON documents in one transaction.
    ///
    /// Blank lines are skipped. A malformed line aborts the whole load.
    pub async fn load_jsonl(&self, path: &Path) -> Result<usize> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read documents: {}", path.display()))?;

        let mut tx = self.pool.begin().await?;
        let mut loaded = 0;
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let doc: Value = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid JSON", path.display(), i + 1))?;
            insert_document(&mut tx, &doc).await?;
            loaded += 1;
        }
        tx.commit().await?;

        Ok(loaded)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Waits for in-flight page fetches, then closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn insert_document(conn: &mut SqliteConnection, doc: &Value) -> Result<i64> {
    let body = serde_json::to_string(doc)?;
    let id = sqlx::query("INSERT INTO documents (body) VALUES (?)")
        .bind(&body)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

    sqlx::query("INSERT INTO documents_fts (rowid, text) VALUES (?, ?)")
        .bind(id)
        .bind(indexable_text(doc))
        .execute(&mut *conn)
        .await?;

    Ok(id)
}

/// Space-joined text of every string and number leaf, in document order.
fn indexable_text(doc: &Value) -> String {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Number(n) => out.push(n.to_string()),
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            Value::Bool(_) | Value::Null => {}
        }
    }

    let mut parts = Vec::new();
    walk(doc, &mut parts);
    parts.join(" ")
}

async fn fetch_page(
    pool: &SqlitePool,
    query: &str,
    after_id: i64,
    limit: i64,
) -> Result<Vec<StoredDocument>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT documents.id AS id, documents.body AS body
        FROM documents_fts
        JOIN documents ON documents.id = documents_fts.rowid
        WHERE documents_fts MATCH ? AND documents.id > ?
        ORDER BY documents.id
        LIMIT ?
        "#,
    )
    .bind(query)
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| StoredDocument {
            id: row.get("id"),
            body: row.get("body"),
        })
        .collect())
}

#[async_trait]
impl QueryExecutor for SqliteIndex {
    type Sequence = SqliteCursor;

    async fn execute(&self, query: &str) -> Result<SqliteCursor, QueryError> {
        if query.trim().is_empty() {
            return Err(QueryError::new("query must not be empty"));
        }

        // The first page is fetched here so a malformed query is rejected
        // before the response is committed.
        let page = fetch_page(&self.pool, query, 0, self.page_size).await?;

        let mut cursor = SqliteCursor {
            pool: Some(self.pool.clone()),
            query: query.to_string(),
            page: VecDeque::new(),
            last_id: 0,
            page_size: self.page_size,
            exhausted: false,
        };
        cursor.refill(page);
        Ok(cursor)
    }
}

/// Lazy sequence of matches for one query.
///
/// Holds a pool handle rather than a connection; `None` once released.
pub struct SqliteCursor {
    pool: Option<SqlitePool>,
    query: String,
    page: VecDeque<StoredDocument>,
    last_id: i64,
    page_size: i64,
    exhausted: bool,
}

impl SqliteCursor {
    fn refill(&mut self, page: Vec<StoredDocument>) {
        if (page.len() as i64) < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.last_id = last.id;
        }
        self.page.extend(page);
    }

    pub fn is_released(&self) -> bool {
        self.pool.is_none()
    }
}

#[async_trait]
impl ResultSequence for SqliteCursor {
    type Record = StoredDocument;

    async fn next_record(&mut self) -> Result<Option<StoredDocument>> {
        if self.page.is_empty() && !self.exhausted {
            let pool = self.pool.as_ref().context("cursor used after release")?;
            let page = fetch_page(pool, &self.query, self.last_id, self.page_size).await?;
            self.refill(page);
        }
        Ok(self.page.pop_front())
    }

    fn release(&mut self) {
        if self.pool.take().is_some() {
            self.page.clear();
            self.exhausted = true;
            debug!(query = %self.query, "cursor released");
        }
    }
}

impl Drop for SqliteCursor {
    fn drop(&mut self) {
        self.release();
    }
}
