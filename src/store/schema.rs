//! Table definitions. Every statement is create-if-absent, so opening an
//! existing database is a no-op.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{debug, warn};

const BASE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        fingerprint TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        path TEXT NOT NULL,
        source TEXT NOT NULL,
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        text TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        embedding BLOB,
        dims INTEGER,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embedding_cache (
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        hash TEXT NOT NULL,
        embedding BLOB NOT NULL,
        dims INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (provider, model, hash)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source)",
    "CREATE INDEX IF NOT EXISTS idx_embedding_cache_updated_at ON embedding_cache(updated_at)",
];

pub(crate) async fn create_base_tables(pool: &SqlitePool) -> Result<()> {
    for statement in BASE_SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    // Databases created before files carried their index fingerprint.
    add_column_if_missing(pool, "files", "fingerprint", "TEXT NOT NULL DEFAULT ''").await?;
    Ok(())
}

async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    let present: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(pool)
            .await?;
    if !present {
        debug!(table, column, "adding missing column");
        sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition))
            .execute(pool)
            .await?;
    }
    Ok(())
}

pub(crate) async fn table_exists(pool: &SqlitePool, name: &str) -> Result<bool> {
    let exists: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?")
            .bind(name)
            .fetch_one(pool)
            .await?;
    Ok(exists)
}

/// Meta key recording how `chunks_fts` rows are keyed.
const META_KEYWORD_LAYOUT: &str = "keyword_index_layout";
/// FTS rows carry the rowid of their `chunks` row.
const KEYWORD_LAYOUT_ROWID: &str = "chunk-rowid";

/// Create the FTS5 keyword index. Returns false when FTS5 is not compiled
/// into this SQLite build; the base tables keep working either way.
pub(crate) async fn create_keyword_index(pool: &SqlitePool) -> bool {
    match table_exists(pool, "chunks_fts").await {
        Ok(true) => {}
        Ok(false) => {
            let created = sqlx::query(
                r#"
                CREATE VIRTUAL TABLE chunks_fts USING fts5(
                    chunk_id UNINDEXED,
                    path UNINDEXED,
                    text
                )
                "#,
            )
            .execute(pool)
            .await;
            if let Err(e) = created {
                warn!(error = %e, "FTS5 unavailable, keyword search falls back to LIKE");
                return false;
            }
        }
        Err(e) => {
            warn!(error = %e, "could not inspect schema for keyword index");
            return false;
        }
    }

    if let Err(e) = align_keyword_index(pool).await {
        warn!(error = %e, "could not rebuild keyword index from chunks");
    }
    true
}

/// Repopulate `chunks_fts` from `chunks` unless it is already keyed by
/// chunk rowid. Covers tables written by older layouts and a freshly
/// created index over existing chunks.
async fn align_keyword_index(pool: &SqlitePool) -> Result<()> {
    let layout: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(META_KEYWORD_LAYOUT)
        .fetch_optional(pool)
        .await?;
    if layout.as_deref() == Some(KEYWORD_LAYOUT_ROWID) {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunks_fts").execute(&mut *tx).await?;
    let rows = sqlx::query(
        "INSERT INTO chunks_fts (rowid, chunk_id, path, text) SELECT rowid, id, path, text FROM chunks",
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();
    sqlx::query(
        "INSERT INTO meta (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(META_KEYWORD_LAYOUT)
    .bind(KEYWORD_LAYOUT_ROWID)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    debug!(rows, "keyword index aligned with chunk rowids");
    Ok(())
}

pub(crate) fn vector_table_ddl(dims: usize) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_vec USING vec0(\
            chunk_id TEXT PRIMARY KEY, \
            embedding float[{}] distance_metric=cosine)",
        dims
    )
}
