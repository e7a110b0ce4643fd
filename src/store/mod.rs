//! SQLite-backed storage for files, chunks, the embedding cache and the
//! keyword and vector indexes.
//!
//! One [`MemoryStore`] owns one database. Capability state (whether FTS5 and
//! the native vector index are usable, and the vector table's dimensionality)
//! is detected once in [`MemoryStore::open`] and kept on the handle, so two
//! stores in one process never share it.
//!
//! # Concurrency
//!
//! Reads go straight to the pool. Every mutation takes the store's write
//! gate first, so there is at most one writer at a time.
//!
//! # Tables
//!
//! | Table | Contents |
//! |-------|----------|
//! | `meta` | key/value settings (vector dimensionality, last sync per scope) |
//! | `files` | one row per indexed file, with the settings fingerprint it was indexed under |
//! | `chunks` | chunk text, line range and optional embedding blob |
//! | `embedding_cache` | embeddings keyed by `(provider, model, text hash)` |
//! | `chunks_fts` | FTS5 index over chunk text (optional) |
//! | `chunks_vec` | sqlite-vec `vec0` table (optional) |

mod keyword;
mod schema;
mod vector;

pub use vector::VectorTableChange;

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db;
use crate::embedding::{decode_vector, vec_to_blob};
use crate::models::{Chunk, EmbeddingCacheEntry, FileEntry, IndexStats, Source, VectorStatus};

const META_VECTOR_DIMS: &str = "vector_dims";

/// Per-source breakdown for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStats {
    pub source: Source,
    pub files: i64,
    pub chunks: i64,
    pub embedded: i64,
}

pub struct MemoryStore {
    pool: SqlitePool,
    path: Option<PathBuf>,
    vector: VectorStatus,
    fts_available: bool,
    /// Dimensionality of `chunks_vec`; 0 while the table does not exist.
    vector_dims: AtomicUsize,
    write_gate: Mutex<()>,
}

impl MemoryStore {
    /// Open (or create) the database, create the schema and probe for the
    /// keyword and vector capabilities.
    pub async fn open(config: &Config) -> Result<Self> {
        let connected = db::connect(config)
            .await
            .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;
        let pool = connected.pool;

        schema::create_base_tables(&pool).await?;
        let fts_available = schema::create_keyword_index(&pool).await;

        let store = Self {
            pool,
            path: (!config.db.is_in_memory()).then(|| config.db.path.clone()),
            vector: connected.vector,
            fts_available,
            vector_dims: AtomicUsize::new(0),
            write_gate: Mutex::new(()),
        };

        if store.vector.available {
            let dims = store
                .get_meta(META_VECTOR_DIMS)
                .await?
                .and_then(|v| v.parse::<usize>().ok());
            if let Some(dims) = dims {
                if schema::table_exists(&store.pool, "chunks_vec").await? {
                    store.vector_dims.store(dims, Ordering::SeqCst);
                }
            }
            info!(
                fts = store.fts_available,
                vector_dims = dims,
                "native vector index available"
            );
        } else {
            warn!(
                reason = store.vector.reason.as_deref().unwrap_or("unknown"),
                "native vector index unavailable, using in-process cosine search"
            );
        }

        Ok(store)
    }

    pub fn vector_status(&self) -> VectorStatus {
        self.vector.clone()
    }

    pub fn is_vector_available(&self) -> bool {
        self.vector.available
    }

    pub fn is_keyword_index_available(&self) -> bool {
        self.fts_available
    }

    /// Dimensionality of the native vector table, if it exists.
    pub fn vector_table_dims(&self) -> Option<usize> {
        match self.vector_dims.load(Ordering::SeqCst) {
            0 => None,
            dims => Some(dims),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ---- meta ----

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        self.set_meta_unlocked(key, value).await
    }

    async fn set_meta_unlocked(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- files ----

    pub async fn upsert_file(&self, entry: &FileEntry) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        let mut conn = self.pool.acquire().await?;
        write_file(&mut *conn, entry).await
    }

    pub async fn get_file(&self, path: &str) -> Result<Option<FileEntry>> {
        let row = sqlx::query(
            "SELECT path, source, content_hash, size_bytes, updated_at, fingerprint
             FROM files WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<FileEntry> {
            Ok(FileEntry {
                path: row.get("path"),
                source: row.get::<String, _>("source").parse()?,
                content_hash: row.get("content_hash"),
                size_bytes: row.get("size_bytes"),
                updated_at: row.get("updated_at"),
                fingerprint: row.get("fingerprint"),
            })
        })
        .transpose()
    }

    pub async fn get_all_file_paths(&self) -> Result<Vec<String>> {
        let paths = sqlx::query_scalar("SELECT path FROM files ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        Ok(paths)
    }

    /// Delete a file row and all of its chunks from the base, keyword and
    /// vector tables.
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;

        if self.vector.available {
            if let Err(e) = sqlx::query(
                "DELETE FROM chunks_vec WHERE chunk_id IN (SELECT id FROM chunks WHERE path = ?)",
            )
            .bind(path)
            .execute(&mut *tx)
            .await
            {
                debug!(path, error = %e, "vector index delete skipped");
            }
        }
        if self.fts_available {
            if let Err(e) = sqlx::query(
                "DELETE FROM chunks_fts WHERE rowid IN (SELECT rowid FROM chunks WHERE path = ?)",
            )
            .bind(path)
            .execute(&mut *tx)
            .await
            {
                debug!(path, error = %e, "keyword index delete skipped");
            }
        }
        sqlx::query("DELETE FROM chunks WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ---- chunks ----

    pub async fn upsert_chunk(&self, chunk: &Chunk) -> Result<()> {
        self.upsert_chunks(std::slice::from_ref(chunk)).await
    }

    /// Upsert a batch of chunks in one transaction.
    pub async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        let change = self.prepare_vector_table(chunks).await?;

        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            self.write_chunk(&mut *tx, chunk).await?;
        }
        tx.commit().await?;

        self.finish_vector_table(change).await
    }

    /// Replace everything stored for one file in a single transaction: the
    /// file row is upserted, chunks of that path missing from `chunks` are
    /// deleted from every table, and `chunks` are upserted.
    pub async fn replace_file(&self, entry: &FileEntry, chunks: &[Chunk]) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        let change = self.prepare_vector_table(chunks).await?;

        let mut tx = self.pool.begin().await?;
        write_file(&mut *tx, entry).await?;

        let existing: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE path = ?")
            .bind(&entry.path)
            .fetch_all(&mut *tx)
            .await?;
        let keep: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        for stale in existing.iter().filter(|id| !keep.contains(id.as_str())) {
            self.delete_chunk_rows(&mut *tx, stale).await?;
        }

        for chunk in chunks {
            self.write_chunk(&mut *tx, chunk).await?;
        }
        tx.commit().await?;

        self.finish_vector_table(change).await
    }

    pub async fn chunks_for_path(&self, path: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, path, source, start_line, end_line, text, content_hash, embedding, dims
             FROM chunks WHERE path = ? ORDER BY start_line, end_line",
        )
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    pub async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query(
            "SELECT id, path, source, start_line, end_line, text, content_hash, embedding, dims
             FROM chunks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn write_chunk(&self, conn: &mut SqliteConnection, chunk: &Chunk) -> Result<()> {
        let blob = chunk.embedding.as_deref().map(vec_to_blob);
        let dims = chunk.embedding.as_ref().map(|v| v.len() as i64);

        let rowid: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO chunks (id, path, source, start_line, end_line, text, content_hash, embedding, dims, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                path = excluded.path,
                source = excluded.source,
                start_line = excluded.start_line,
                end_line = excluded.end_line,
                text = excluded.text,
                content_hash = excluded.content_hash,
                embedding = excluded.embedding,
                dims = excluded.dims,
                updated_at = excluded.updated_at
            RETURNING rowid
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.path)
        .bind(chunk.source.as_str())
        .bind(chunk.start_line)
        .bind(chunk.end_line)
        .bind(&chunk.text)
        .bind(&chunk.content_hash)
        .bind(&blob)
        .bind(dims)
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(&mut *conn)
        .await?;

        // FTS rows share the chunk's rowid so updates never scan the index.
        if self.fts_available {
            sqlx::query("DELETE FROM chunks_fts WHERE rowid = ?")
                .bind(rowid)
                .execute(&mut *conn)
                .await?;
            sqlx::query("INSERT INTO chunks_fts (rowid, chunk_id, path, text) VALUES (?, ?, ?, ?)")
                .bind(rowid)
                .bind(&chunk.id)
                .bind(&chunk.path)
                .bind(&chunk.text)
                .execute(&mut *conn)
                .await?;
        }

        let table_dims = self.vector_table_dims();
        if self.vector.available && table_dims.is_some() {
            if let Err(e) = sqlx::query("DELETE FROM chunks_vec WHERE chunk_id = ?")
                .bind(&chunk.id)
                .execute(&mut *conn)
                .await
            {
                debug!(chunk_id = %chunk.id, error = %e, "vector index delete skipped");
            }
            if let (Some(blob), Some(table_dims)) = (&blob, table_dims) {
                if chunk.embedding.as_ref().map(Vec::len) == Some(table_dims) {
                    sqlx::query("INSERT INTO chunks_vec (chunk_id, embedding) VALUES (?, ?)")
                        .bind(&chunk.id)
                        .bind(blob)
                        .execute(&mut *conn)
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn delete_chunk_rows(&self, conn: &mut SqliteConnection, id: &str) -> Result<()> {
        if self.vector.available {
            if let Err(e) = sqlx::query("DELETE FROM chunks_vec WHERE chunk_id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await
            {
                debug!(chunk_id = id, error = %e, "vector index delete skipped");
            }
        }
        if self.fts_available {
            if let Err(e) = sqlx::query(
                "DELETE FROM chunks_fts WHERE rowid = (SELECT rowid FROM chunks WHERE id = ?)",
            )
            .bind(id)
            .execute(&mut *conn)
            .await
            {
                debug!(chunk_id = id, error = %e, "keyword index delete skipped");
            }
        }
        sqlx::query("DELETE FROM chunks WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    // ---- embedding cache ----

    /// Look up cached embeddings by text hash. Rows whose blob does not
    /// decode are treated as misses.
    pub async fn get_cached_embeddings(
        &self,
        provider: &str,
        model: &str,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut found = HashMap::new();
        for batch in hashes.chunks(500) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT hash, embedding, dims FROM embedding_cache WHERE provider = ",
            );
            qb.push_bind(provider);
            qb.push(" AND model = ");
            qb.push_bind(model);
            qb.push(" AND hash IN (");
            let mut separated = qb.separated(", ");
            for hash in batch {
                separated.push_bind(hash);
            }
            separated.push_unseparated(")");

            for row in qb.build().fetch_all(&self.pool).await? {
                let hash: String = row.get("hash");
                let blob: Vec<u8> = row.get("embedding");
                let dims: i64 = row.get("dims");
                match decode_vector(&blob, dims as usize) {
                    Ok(vector) => {
                        found.insert(hash, vector);
                    }
                    Err(e) => warn!(hash = %hash, error = %e, "corrupt cache entry ignored"),
                }
            }
        }
        Ok(found)
    }

    pub async fn put_cached_embeddings(
        &self,
        provider: &str,
        model: &str,
        entries: &[EmbeddingCacheEntry],
    ) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO embedding_cache (provider, model, hash, embedding, dims, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(provider, model, hash) DO UPDATE SET
                    embedding = excluded.embedding,
                    dims = excluded.dims,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(provider)
            .bind(model)
            .bind(&entry.text_hash)
            .bind(vec_to_blob(&entry.vector))
            .bind(entry.dimensions as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn cache_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Delete the oldest cache rows so that at most `keep` remain. Returns
    /// the number of rows deleted.
    pub async fn evict_cache(&self, keep: usize) -> Result<usize> {
        let _guard = self.write_gate.lock().await;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        let excess = count - keep as i64;
        if excess <= 0 {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM embedding_cache WHERE rowid IN (
                SELECT rowid FROM embedding_cache ORDER BY updated_at ASC, rowid ASC LIMIT ?
            )",
        )
        .bind(excess)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    // ---- diagnostics ----

    pub async fn stats(&self) -> Result<IndexStats> {
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(IndexStats { files, chunks })
    }

    /// File, chunk and embedded-chunk counts per source kind.
    pub async fn stats_by_source(&self) -> Result<Vec<SourceStats>> {
        let rows = sqlx::query(
            r#"
            SELECT
                f.source,
                COUNT(DISTINCT f.path) AS file_count,
                COUNT(c.id) AS chunk_count,
                COUNT(c.embedding) AS embedded_count
            FROM files f
            LEFT JOIN chunks c ON c.path = f.path
            GROUP BY f.source
            ORDER BY file_count DESC, f.source
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<SourceStats> {
                Ok(SourceStats {
                    source: row.get::<String, _>("source").parse()?,
                    files: row.get("file_count"),
                    chunks: row.get("chunk_count"),
                    embedded: row.get("embedded_count"),
                })
            })
            .collect()
    }

    /// On-disk size of the database including its WAL; 0 for `:memory:`.
    pub fn db_size_bytes(&self) -> u64 {
        let Some(path) = &self.path else {
            return 0;
        };
        let mut wal = path.clone().into_os_string();
        wal.push("-wal");
        [path.clone(), PathBuf::from(wal)]
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }
}

async fn write_file(conn: &mut SqliteConnection, entry: &FileEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO files (path, source, content_hash, size_bytes, updated_at, fingerprint)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            source = excluded.source,
            content_hash = excluded.content_hash,
            size_bytes = excluded.size_bytes,
            updated_at = excluded.updated_at,
            fingerprint = excluded.fingerprint
        "#,
    )
    .bind(&entry.path)
    .bind(entry.source.as_str())
    .bind(&entry.content_hash)
    .bind(entry.size_bytes)
    .bind(entry.updated_at)
    .bind(&entry.fingerprint)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let id: String = row.get("id");
    let blob: Option<Vec<u8>> = row.get("embedding");
    let dims: Option<i64> = row.get("dims");

    let embedding = match (blob, dims) {
        (Some(blob), Some(dims)) => match decode_vector(&blob, dims as usize) {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(chunk_id = %id, error = %e, "corrupt chunk embedding ignored");
                None
            }
        },
        _ => None,
    };

    Ok(Chunk {
        path: row.get("path"),
        source: row.get::<String, _>("source").parse::<Source>()?,
        start_line: row.get("start_line"),
        end_line: row.get("end_line"),
        text: row.get("text"),
        content_hash: row.get("content_hash"),
        embedding,
        id,
    })
}
