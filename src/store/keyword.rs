//! Keyword search over chunk text.
//!
//! The primary path is an FTS5 `MATCH` ranked by `bm25()`. SQLite's bm25 is
//! negative with lower meaning better, so ranks are shifted to start at 0
//! for the best hit before `score = 1 / (1 + max(0, rank))` is applied; the
//! best hit scores 1.0 and weaker hits decay toward 0.
//!
//! Without FTS5 every query token must appear as a case-insensitive
//! substring, and any match scores [`LIKE_MATCH_SCORE`].

use anyhow::Result;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::warn;

use super::vector::candidate_from_row;
use super::MemoryStore;
use crate::models::Source;
use crate::search::Candidate;

/// Score given to every substring match when FTS5 is unavailable.
const LIKE_MATCH_SCORE: f64 = 0.1;

/// Alphanumeric terms of a free-text query, in order.
fn query_terms(query: &str) -> Vec<&str> {
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Quote every term so user input can't inject FTS5 syntax; all terms must match.
fn fts_match_expr(terms: &[&str]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl MemoryStore {
    /// Top-`limit` chunks matching every term of `query`, best first.
    pub async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        source: Option<Source>,
    ) -> Result<Vec<Candidate>> {
        let terms = query_terms(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        if self.fts_available {
            match self.fts_search(&terms, limit, source).await {
                Ok(candidates) => return Ok(candidates),
                Err(e) => warn!(error = %e, "FTS query failed, using substring scan"),
            }
        }
        self.like_search(&terms, limit, source).await
    }

    async fn fts_search(
        &self,
        terms: &[&str],
        limit: usize,
        source: Option<Source>,
    ) -> Result<Vec<Candidate>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text, \
             bm25(chunks_fts) AS rank \
             FROM chunks_fts f JOIN chunks c ON c.rowid = f.rowid AND c.id = f.chunk_id \
             WHERE chunks_fts MATCH ",
        );
        qb.push_bind(fts_match_expr(terms));
        if let Some(source) = source {
            qb.push(" AND c.source = ");
            qb.push_bind(source.as_str());
        }
        qb.push(" ORDER BY rank, c.path, c.start_line LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let Some(best) = rows.first().map(|r| r.get::<f64, _>("rank")) else {
            return Ok(Vec::new());
        };

        rows.iter()
            .map(|row| {
                let rank = row.get::<f64, _>("rank") - best;
                candidate_from_row(row, 1.0 / (1.0 + rank.max(0.0)))
            })
            .collect()
    }

    async fn like_search(
        &self,
        terms: &[&str],
        limit: usize,
        source: Option<Source>,
    ) -> Result<Vec<Candidate>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, path, source, start_line, end_line, text FROM chunks WHERE 1 = 1");
        for term in terms {
            qb.push(" AND text LIKE ");
            qb.push_bind(format!("%{}%", escape_like(term)));
            qb.push(" ESCAPE '\\'");
        }
        if let Some(source) = source {
            qb.push(" AND source = ");
            qb.push_bind(source.as_str());
        }
        qb.push(" ORDER BY path, start_line LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| candidate_from_row(row, LIKE_MATCH_SCORE))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{make_chunk, open_test_store};
    use super::*;
    use crate::models::FileEntry;

    fn entry(path: &str) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            source: Source::Agent,
            content_hash: "h".to_string(),
            size_bytes: 1,
            updated_at: 0,
            fingerprint: String::new(),
        }
    }

    #[test]
    fn test_query_terms_strip_syntax() {
        assert_eq!(query_terms("rust AND \"sqlite\"*"), vec!["rust", "AND", "sqlite"]);
        assert!(query_terms("  !!! ").is_empty());
    }

    #[test]
    fn test_escape_like_wildcards() {
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
    }

    #[tokio::test]
    async fn test_keyword_best_hit_scores_one() {
        let store = open_test_store().await;
        store
            .replace_file(
                &entry("a.md"),
                &[
                    make_chunk("a.md", 1, 1, "sqlite sqlite sqlite storage engine"),
                    make_chunk("a.md", 2, 2, "a long passage that mentions sqlite once among many other words"),
                    make_chunk("a.md", 3, 3, "nothing relevant here"),
                ],
            )
            .await
            .unwrap();

        let results = store.keyword_search("sqlite", 10, None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].start_line, 1);
        assert!((results[0].score - 1.0).abs() < 1e-9);
        assert!(results[1].score <= results[0].score);
        assert!(results[1].score > 0.0);
    }

    #[tokio::test]
    async fn test_keyword_requires_all_terms() {
        let store = open_test_store().await;
        store
            .replace_file(
                &entry("a.md"),
                &[
                    make_chunk("a.md", 1, 1, "rust memory index"),
                    make_chunk("a.md", 2, 2, "rust compiler"),
                ],
            )
            .await
            .unwrap();

        let results = store.keyword_search("rust memory", 10, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].start_line, 1);
    }

    #[tokio::test]
    async fn test_like_fallback_scores_fixed_low() {
        let store = open_test_store().await;
        store
            .replace_file(&entry("a.md"), &[make_chunk("a.md", 1, 1, "Hybrid Search notes")])
            .await
            .unwrap();

        let results = store.like_search(&["hybrid"], 10, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!((results[0].score - LIKE_MATCH_SCORE).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_punctuation_only_query_is_empty() {
        let store = open_test_store().await;
        assert!(store.keyword_search("***", 10, None).await.unwrap().is_empty());
    }
}
