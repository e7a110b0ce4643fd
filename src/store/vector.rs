//! Native vector table lifecycle and vector similarity search.
//!
//! When `chunks_vec` exists with the query's dimensionality, ranking runs in
//! SQLite as a sqlite-vec nearest-neighbor query over cosine distance, and
//! distances become scores via `1 / (1 + distance)`. Otherwise every stored chunk embedding
//! of the right length is decoded and ranked by cosine similarity in
//! process. Both paths return candidates best-first.

use anyhow::Result;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

use super::{schema, MemoryStore, META_VECTOR_DIMS};
use crate::embedding::{cosine_similarity, decode_vector, vec_to_blob};
use crate::models::{Chunk, Source};
use crate::search::Candidate;

/// What [`MemoryStore::ensure_vector_table`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorTableChange {
    /// The native index is unavailable; nothing was touched.
    Unavailable,
    /// The table already had the requested dimensionality.
    Unchanged,
    /// The table did not exist and was created empty.
    Created,
    /// The table existed with another dimensionality and was recreated empty.
    Rebuilt,
}

impl VectorTableChange {
    fn needs_repopulate(self) -> bool {
        matches!(self, VectorTableChange::Created | VectorTableChange::Rebuilt)
    }
}

impl MemoryStore {
    /// Make sure `chunks_vec` exists with `dims` dimensions. A table with
    /// another dimensionality is dropped and recreated; chunk rows are not
    /// touched, so the new table stays empty until
    /// [`rebuild_vector_index`](Self::rebuild_vector_index) runs.
    pub async fn ensure_vector_table(&self, dims: usize) -> Result<VectorTableChange> {
        let _guard = self.write_gate.lock().await;
        self.ensure_vector_table_unlocked(dims).await
    }

    async fn ensure_vector_table_unlocked(&self, dims: usize) -> Result<VectorTableChange> {
        if !self.vector.available || dims == 0 {
            return Ok(VectorTableChange::Unavailable);
        }

        let change = match self.vector_table_dims() {
            Some(current) if current == dims => return Ok(VectorTableChange::Unchanged),
            Some(current) => {
                info!(from = current, to = dims, "vector dimensionality changed, rebuilding index");
                sqlx::query("DROP TABLE IF EXISTS chunks_vec")
                    .execute(&self.pool)
                    .await?;
                VectorTableChange::Rebuilt
            }
            None => {
                // A table left behind without a matching meta row is stale.
                sqlx::query("DROP TABLE IF EXISTS chunks_vec")
                    .execute(&self.pool)
                    .await?;
                VectorTableChange::Created
            }
        };

        sqlx::query(&schema::vector_table_ddl(dims))
            .execute(&self.pool)
            .await?;
        self.set_meta_unlocked(META_VECTOR_DIMS, &dims.to_string())
            .await?;
        self.vector_dims.store(dims, Ordering::SeqCst);

        Ok(change)
    }

    /// Repopulate `chunks_vec` from every chunk whose stored embedding has
    /// the table's dimensionality. Returns the number of rows indexed.
    pub async fn rebuild_vector_index(&self) -> Result<u64> {
        let _guard = self.write_gate.lock().await;
        self.rebuild_vector_index_unlocked().await
    }

    async fn rebuild_vector_index_unlocked(&self) -> Result<u64> {
        let Some(dims) = self.vector_table_dims().filter(|_| self.vector.available) else {
            return Ok(0);
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_vec")
            .execute(&mut *tx)
            .await?;
        let inserted = sqlx::query(
            "INSERT INTO chunks_vec (chunk_id, embedding)
             SELECT id, embedding FROM chunks WHERE embedding IS NOT NULL AND dims = ?",
        )
        .bind(dims as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        debug!(dims, rows = inserted, "vector index repopulated");
        Ok(inserted)
    }

    /// Called with the write gate held, before chunk rows are written.
    pub(super) async fn prepare_vector_table(&self, chunks: &[Chunk]) -> Result<VectorTableChange> {
        let dims = chunks
            .iter()
            .find_map(|c| c.embedding.as_ref().map(Vec::len));
        match dims {
            Some(dims) => self.ensure_vector_table_unlocked(dims).await,
            None => Ok(VectorTableChange::Unchanged),
        }
    }

    /// Called with the write gate held, after the chunk transaction commits.
    pub(super) async fn finish_vector_table(&self, change: VectorTableChange) -> Result<()> {
        if change.needs_repopulate() {
            self.rebuild_vector_index_unlocked().await?;
        }
        Ok(())
    }

    /// Top-`limit` chunks by similarity to `query`, best first.
    pub async fn vector_search(
        &self,
        query: &[f32],
        limit: usize,
        source: Option<Source>,
    ) -> Result<Vec<Candidate>> {
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        if self.vector.available && self.vector_table_dims() == Some(query.len()) {
            match self.native_vector_search(query, limit, source).await {
                Ok(candidates) => return Ok(candidates),
                Err(e) => warn!(error = %e, "native vector query failed, scanning in process"),
            }
        }
        self.fallback_vector_search(query, limit, source).await
    }

    /// Unfiltered queries use the vec0 KNN scan. A source filter has to apply
    /// before the top-K cut, so filtered queries compute exact distances over
    /// that source's rows instead.
    async fn native_vector_search(
        &self,
        query: &[f32],
        limit: usize,
        source: Option<Source>,
    ) -> Result<Vec<Candidate>> {
        let mut qb: QueryBuilder<Sqlite> = match source {
            None => {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text, \
                     knn.distance AS distance \
                     FROM (SELECT chunk_id, distance FROM chunks_vec \
                           WHERE embedding MATCH ",
                );
                qb.push_bind(vec_to_blob(query));
                qb.push(" AND k = ");
                qb.push_bind(limit as i64);
                qb.push(") knn JOIN chunks c ON c.id = knn.chunk_id");
                qb
            }
            Some(source) => {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text, \
                     vec_distance_cosine(v.embedding, ",
                );
                qb.push_bind(vec_to_blob(query));
                qb.push(") AS distance FROM chunks_vec v JOIN chunks c ON c.id = v.chunk_id");
                qb.push(" WHERE c.source = ");
                qb.push_bind(source.as_str());
                qb
            }
        };
        qb.push(" ORDER BY distance ASC, c.path, c.start_line LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let distance: f64 = row.get("distance");
                let score = 1.0 / (1.0 + distance.max(0.0));
                candidate_from_row(row, score)
            })
            .collect()
    }

    async fn fallback_vector_search(
        &self,
        query: &[f32],
        limit: usize,
        source: Option<Source>,
    ) -> Result<Vec<Candidate>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, path, source, start_line, end_line, text, embedding, dims \
             FROM chunks WHERE embedding IS NOT NULL",
        );
        if let Some(source) = source {
            qb.push(" AND source = ");
            qb.push_bind(source.as_str());
        }
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut skipped_dims = 0usize;
        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let dims: Option<i64> = row.get("dims");
            if dims != Some(query.len() as i64) {
                skipped_dims += 1;
                continue;
            }
            let blob: Vec<u8> = row.get("embedding");
            let vector = match decode_vector(&blob, query.len()) {
                Ok(v) => v,
                Err(e) => {
                    let id: String = row.get("id");
                    warn!(chunk_id = %id, error = %e, "corrupt embedding excluded from ranking");
                    continue;
                }
            };
            let score = cosine_similarity(query, &vector) as f64;
            candidates.push(candidate_from_row(row, score)?);
        }
        if skipped_dims > 0 {
            debug!(
                skipped = skipped_dims,
                query_dims = query.len(),
                "chunks with other embedding dimensionality skipped"
            );
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| a.path.cmp(&b.path))
                .then_with(|| a.start_line.cmp(&b.start_line))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }
}

pub(super) fn candidate_from_row(row: &sqlx::sqlite::SqliteRow, score: f64) -> Result<Candidate> {
    Ok(Candidate {
        chunk_id: row.get("id"),
        path: row.get("path"),
        source: row.get::<String, _>("source").parse()?,
        start_line: row.get("start_line"),
        end_line: row.get("end_line"),
        text: row.get("text"),
        score,
    })
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

    fn embedded(path: &str, line: i64, vector: Vec<f32>) -> Chunk {
        let mut chunk = make_chunk(path, line, line, &format!("{} line {}", path, line));
        chunk.embedding = Some(vector);
        chunk
    }

    #[tokio::test]
    async fn test_fallback_matches_hand_computed_cosine_order() {
        let store = open_test_store().await;
        let query = [1.0f32, 0.0, 0.0, 0.0];
        let corpus = vec![
            embedded("c.md", 1, vec![1.0, 1.0, 0.0, 0.0]),
            embedded("c.md", 2, vec![0.0, 0.0, 1.0, 0.0]),
            embedded("c.md", 3, vec![1.0, 0.0, 0.0, 0.0]),
            embedded("c.md", 4, vec![-1.0, 0.0, 0.0, 0.0]),
            embedded("c.md", 5, vec![3.0, 1.0, 1.0, 0.0]),
        ];
        store.replace_file(&entry("c.md"), &corpus).await.unwrap();

        let mut expected: Vec<(i64, f32)> = corpus
            .iter()
            .map(|c| {
                let v = c.embedding.as_ref().unwrap();
                (c.start_line, cosine_similarity(&query, v))
            })
            .collect();
        expected.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

        let results = store.vector_search(&query, 5, None).await.unwrap();
        let got: Vec<i64> = results.iter().map(|c| c.start_line).collect();
        let want: Vec<i64> = expected.iter().map(|(line, _)| *line).collect();
        assert_eq!(got, want);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_fallback_skips_other_dimensionality() {
        let store = open_test_store().await;
        store
            .replace_file(
                &entry("a.md"),
                &[
                    embedded("a.md", 1, vec![1.0, 0.0, 0.0, 0.0]),
                    embedded("a.md", 2, vec![1.0; 8]),
                ],
            )
            .await
            .unwrap();

        let four = store.vector_search(&[1.0, 0.0, 0.0, 0.0], 10, None).await.unwrap();
        assert_eq!(four.len(), 1);
        assert_eq!(four[0].start_line, 1);

        let eight = store.vector_search(&[1.0; 8], 10, None).await.unwrap();
        assert_eq!(eight.len(), 1);
        assert_eq!(eight[0].start_line, 2);
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_excluded_not_fatal() {
        let store = open_test_store().await;
        store
            .replace_file(&entry("a.md"), &[embedded("a.md", 1, vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .replace_file(&entry("b.md"), &[embedded("b.md", 1, vec![0.5, 0.5])])
            .await
            .unwrap();
        // Claim two dims but store three bytes.
        sqlx::query("UPDATE chunks SET embedding = x'000102' WHERE path = 'a.md'")
            .execute(&store.pool)
            .await
            .unwrap();

        let results = store.vector_search(&[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "b.md");
    }

    #[tokio::test]
    async fn test_source_filter_applies_to_vector_search() {
        let store = open_test_store().await;
        let mut user_chunk = embedded("u.md", 1, vec![1.0, 0.0]);
        user_chunk.source = Source::User;
        store.replace_file(&entry("u.md"), &[user_chunk]).await.unwrap();
        store
            .replace_file(&entry("a.md"), &[embedded("a.md", 1, vec![1.0, 0.0])])
            .await
            .unwrap();

        let results = store
            .vector_search(&[1.0, 0.0], 10, Some(Source::User))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "u.md");
    }

    #[tokio::test]
    async fn test_ensure_vector_table_without_native_index() {
        let store = open_test_store().await;
        assert_eq!(
            store.ensure_vector_table(4).await.unwrap(),
            VectorTableChange::Unavailable
        );
        assert_eq!(store.rebuild_vector_index().await.unwrap(), 0);
    }
}
