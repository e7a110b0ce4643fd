//! Index status overview.
//!
//! Prints what's indexed and which capabilities are live: file and chunk
//! counts, embedding coverage per source, keyword and vector index state,
//! cache size and per-scope last sync. Used by `memx status` to confirm that
//! syncs and embeddings are working as expected.

use anyhow::Result;

use crate::manager::{IndexManager, IndexStatus};

/// Run the status command: gather a snapshot and print it.
pub async fn run_status(manager: &IndexManager) -> Result<()> {
    let status = manager.status().await?;
    print!("{}", render_status(manager, &status));
    Ok(())
}

fn render_status(manager: &IndexManager, status: &IndexStatus) -> String {
    let mut out = String::new();
    let db_path = manager.config().db.path.display();

    out.push_str("Memory Index Status\n");
    out.push_str("===================\n\n");
    out.push_str(&format!("  Database:    {}\n", db_path));
    out.push_str(&format!("  Size:        {}\n\n", format_bytes(status.db_size_bytes)));

    out.push_str(&format!("  Files:       {}\n", status.stats.files));
    out.push_str(&format!("  Chunks:      {}\n", status.stats.chunks));
    out.push_str(&format!(
        "  Embedding:   {}\n",
        status.embedding_model.as_deref().unwrap_or("disabled (keyword only)")
    ));
    out.push_str(&format!("  Cache:       {} entries\n", status.cache_entries));
    out.push_str(&format!(
        "  Keyword:     {}\n",
        if status.keyword_index { "fts5" } else { "substring scan" }
    ));
    let vector = if status.vector.available {
        "sqlite-vec".to_string()
    } else {
        format!(
            "in-process ({})",
            status.vector.reason.as_deref().unwrap_or("unavailable")
        )
    };
    out.push_str(&format!("  Vector:      {}\n", vector));

    if !status.by_source.is_empty() {
        out.push_str("\n  By source:\n");
        out.push_str(&format!(
            "  {:<12} {:>6} {:>8} {:>10}\n",
            "SOURCE", "FILES", "CHUNKS", "EMBEDDED"
        ));
        out.push_str(&format!("  {}\n", "-".repeat(40)));
        for s in &status.by_source {
            out.push_str(&format!(
                "  {:<12} {:>6} {:>8} {:>10}\n",
                s.source.as_str(),
                s.files,
                s.chunks,
                s.embedded
            ));
        }
    }

    if !status.scopes.is_empty() {
        out.push_str("\n  Scopes:\n");
        out.push_str(&format!("  {:<24} {}\n", "SCOPE", "LAST SYNC"));
        out.push_str(&format!("  {}\n", "-".repeat(40)));
        for scope in &status.scopes {
            let last = match scope.last_sync {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            out.push_str(&format!("  {:<24} {}\n", scope.name, last));
        }
    }

    out.push('\n');
    out
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now ("3 hours ago"); older than 30
/// days or in the future prints as a date.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{} min{} ago", delta / 60, plural(delta / 60))
    } else if delta < 86400 {
        format!("{} hour{} ago", delta / 3600, plural(delta / 3600))
    } else if delta < 86400 * 30 {
        format!("{} day{} ago", delta / 86400, plural(delta / 86400))
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
