//! Content-hash keyed embedding cache in front of a provider.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::EmbeddingProvider;
use crate::chunk::hash_text;
use crate::error::EmbeddingError;
use crate::models::EmbeddingCacheEntry;
use crate::store::MemoryStore;

/// How many distinct texts of one request came from the cache and how many
/// had to be sent to the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOutcome {
    pub cached: usize,
    pub computed: usize,
}

/// Wraps a provider with the `embedding_cache` table.
///
/// Entries are keyed by `(provider id, model, sha256(text))`, so identical
/// text anywhere in the corpus is embedded once per model. Misses are
/// deduplicated and sent in batches of `batch_size`; each batch call is
/// bounded by `timeout` and by the caller's cancellation token. Results are
/// persisted before they are returned.
pub struct CachedEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<MemoryStore>,
    batch_size: usize,
    timeout: Duration,
}

impl CachedEmbedder {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<MemoryStore>,
        batch_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            batch_size: batch_size.max(1),
            timeout,
        }
    }

    pub fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    /// Embed `texts`, returning one vector per input in input order.
    ///
    /// Provider failures are returned as [`EmbeddingError`] inside the
    /// `anyhow::Error`; nothing is substituted for a failed batch, though
    /// batches that succeeded before it stay cached.
    pub async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<(Vec<Vec<f32>>, CacheOutcome)> {
        if texts.is_empty() {
            return Ok((Vec::new(), CacheOutcome::default()));
        }

        let hashes: Vec<String> = texts.iter().map(|t| hash_text(t)).collect();
        let mut unique: Vec<String> = hashes.clone();
        unique.sort();
        unique.dedup();

        let provider_id = self.provider.id();
        let model = self.provider.model_name();
        let mut vectors = self
            .store
            .get_cached_embeddings(provider_id, model, &unique)
            .await?;
        let mut outcome = CacheOutcome {
            cached: vectors.len(),
            computed: 0,
        };

        // First text for every missing hash, in input order.
        let mut misses: Vec<(String, String)> = Vec::new();
        for (hash, text) in hashes.iter().zip(texts) {
            if !vectors.contains_key(hash) && !misses.iter().any(|(h, _)| h == hash) {
                misses.push((hash.clone(), text.clone()));
            }
        }

        for batch in misses.chunks(self.batch_size) {
            let batch_texts: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
            let embedded = self.call_provider(&batch_texts, cancel).await?;
            if embedded.len() != batch.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: batch.len(),
                    actual: embedded.len(),
                }
                .into());
            }
            self.check_vectors(&embedded)?;

            let entries: Vec<EmbeddingCacheEntry> = batch
                .iter()
                .zip(embedded)
                .map(|((hash, _), vector)| EmbeddingCacheEntry::new(hash.clone(), vector))
                .collect();
            self.store
                .put_cached_embeddings(provider_id, model, &entries)
                .await?;
            outcome.computed += entries.len();
            vectors.extend(entries.into_iter().map(|e| (e.text_hash, e.vector)));
        }

        debug!(
            provider = provider_id,
            cached = outcome.cached,
            computed = outcome.computed,
            "embedded batch"
        );

        let ordered = hashes
            .iter()
            .map(|h| {
                vectors.get(h).cloned().ok_or_else(|| {
                    anyhow::Error::from(EmbeddingError::Other(format!(
                        "no embedding produced for hash {}",
                        h
                    )))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((ordered, outcome))
    }

    /// Embed a search query. A cached vector for identical text is reused,
    /// but a freshly computed query vector is not stored, so queries never
    /// compete with chunk embeddings for cache capacity.
    pub async fn embed_query(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        let hash = hash_text(text);
        let mut cached = self
            .store
            .get_cached_embeddings(
                self.provider.id(),
                self.provider.model_name(),
                std::slice::from_ref(&hash),
            )
            .await?;
        if let Some(vector) = cached.remove(&hash) {
            return Ok(vector);
        }

        let mut embedded = self.call_provider(&[text.to_string()], cancel).await?;
        if embedded.len() != 1 {
            return Err(EmbeddingError::CountMismatch {
                expected: 1,
                actual: embedded.len(),
            }
            .into());
        }
        self.check_vectors(&embedded)?;
        embedded.pop().ok_or_else(|| {
            EmbeddingError::InvalidResponse("no embedding returned for query".to_string()).into()
        })
    }

    /// Reject empty vectors, and vectors whose length differs from the
    /// provider's declared dimensionality.
    fn check_vectors(&self, vectors: &[Vec<f32>]) -> Result<(), EmbeddingError> {
        if vectors.iter().any(Vec::is_empty) {
            return Err(EmbeddingError::InvalidResponse(
                "provider returned an empty vector".to_string(),
            ));
        }
        if let Some(expected) = self.provider.dims() {
            if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "expected {}-dimensional vectors, provider returned {}",
                    expected,
                    bad.len()
                )));
            }
        }
        Ok(())
    }

    async fn call_provider(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EmbeddingError::Cancelled),
            res = tokio::time::timeout(self.timeout, self.provider.embed(texts)) => match res {
                Ok(inner) => inner,
                Err(_) => Err(EmbeddingError::TimedOut(self.timeout)),
            },
        }
    }
}
