//! SQLite connection setup and vector-extension probing.
//!
//! The native vector path needs the sqlite-vec loadable extension. Each
//! configured candidate location is tried on a throwaway connection; the
//! first one that loads and answers `vec_version()` is attached to every
//! pooled connection. When none load, a `vec0` virtual table is created as a
//! smoke test in case the extension was linked in statically.

use anyhow::Result;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::Connection;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::models::VectorStatus;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// An open pool plus the outcome of the one-time vector capability probe.
pub struct Connected {
    pub pool: SqlitePool,
    pub vector: VectorStatus,
}

fn base_options(config: &Config) -> Result<SqliteConnectOptions> {
    if config.db.is_in_memory() {
        return Ok(SqliteConnectOptions::from_str("sqlite::memory:")?);
    }

    let db_path = &config.db.path;
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    Ok(SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT))
}

pub async fn connect(config: &Config) -> Result<Connected> {
    let mut options = base_options(config)?;

    let mut vector = if config.vector.enabled {
        match load_vector_extension(&options, &config.vector.extension_paths).await {
            Some(path) => {
                options = options.extension(path);
                VectorStatus::available()
            }
            None => VectorStatus::unavailable("sqlite-vec extension could not be loaded"),
        }
    } else {
        VectorStatus::unavailable("disabled by configuration")
    };

    // An in-memory database is private to its connection, so the pool must
    // never open a second one.
    let max_connections = if config.db.is_in_memory() { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    if config.vector.enabled && !vector.available {
        vector = smoke_test_vec0(&pool).await;
    }

    Ok(Connected { pool, vector })
}

/// Returns the first candidate that loads and exposes `vec_version()`.
async fn load_vector_extension(
    options: &SqliteConnectOptions,
    candidates: &[String],
) -> Option<String> {
    for candidate in candidates {
        let attempt = options.clone().extension(candidate.clone());
        let mut conn = match SqliteConnection::connect_with(&attempt).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(candidate = %candidate, error = %e, "vector extension not loadable");
                continue;
            }
        };
        let version: Result<String, _> = sqlx::query_scalar("SELECT vec_version()")
            .fetch_one(&mut conn)
            .await;
        let _ = conn.close().await;
        match version {
            Ok(version) => {
                debug!(candidate = %candidate, %version, "vector extension loaded");
                return Some(candidate.clone());
            }
            Err(e) => debug!(candidate = %candidate, error = %e, "vec_version() failed"),
        }
    }
    None
}

async fn smoke_test_vec0(pool: &SqlitePool) -> VectorStatus {
    let created = sqlx::query("CREATE VIRTUAL TABLE temp.vec_probe USING vec0(embedding float[1])")
        .execute(pool)
        .await;
    match created {
        Ok(_) => {
            let _ = sqlx::query("DROP TABLE IF EXISTS temp.vec_probe")
                .execute(pool)
                .await;
            VectorStatus::available()
        }
        Err(e) => VectorStatus::unavailable(format!(
            "sqlite-vec extension not found and vec0 is unavailable: {}",
            e
        )),
    }
}
