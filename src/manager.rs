//! Index manager: keeps the store in step with the configured sources and
//! answers queries.
//!
//! # Sync
//!
//! For every source (a named scope):
//!
//! 1. List files through the injected [`FileSource`].
//! 2. Read each file and compare its content hash with the stored one.
//! 3. For new or changed files: chunk, embed through the cache, and replace
//!    the file's rows in one transaction.
//! 4. Delete rows of files under the source root that were not listed.
//!
//! A file that can't be read is skipped for this cycle and keeps its old
//! rows. A listing failure skips the cleanup step so a transient error never
//! wipes a scope. Provider errors (including cancellation) stop the sync and
//! are returned; files committed before the failure stay indexed.
//!
//! When the provider, model or chunk settings differ from the ones the scope
//! was last indexed with, every file of that scope is re-indexed regardless
//! of its hash.
//!
//! # Search
//!
//! Hybrid when an embedding provider is configured, keyword-only otherwise.
//! See [`crate::search`] for the merge.

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::{assign_chunk_ids, chunk_text, hash_text};
use crate::config::{Config, SourceConfig};
use crate::embedding::{create_provider, CachedEmbedder, EmbeddingProvider};
use crate::models::{
    Chunk, FileEntry, IndexStats, SearchOptions, SearchResult, VectorStatus,
};
use crate::scan::{FileSource, FsSource, ScannedFile};
use crate::search::{merge_hybrid, MergeParams};
use crate::store::{MemoryStore, SourceStats};
use crate::watch::{watch_sources, ChangeCallback, WatchHandle};

/// Counters for one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub chunks_written: usize,
    pub embeddings_cached: usize,
    pub embeddings_computed: usize,
    pub cache_evicted: usize,
    pub errors: usize,
}

impl SyncReport {
    fn absorb(&mut self, other: &SyncReport) {
        self.files_indexed += other.files_indexed;
        self.files_unchanged += other.files_unchanged;
        self.files_removed += other.files_removed;
        self.chunks_written += other.chunks_written;
        self.embeddings_cached += other.embeddings_cached;
        self.embeddings_computed += other.embeddings_computed;
        self.cache_evicted += other.cache_evicted;
        self.errors += other.errors;
    }
}

/// When a scope last finished a sync without errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeStatus {
    pub name: String,
    /// Unix seconds; `None` if the scope was never synced cleanly.
    pub last_sync: Option<i64>,
}

/// Diagnostic snapshot for `memx status`.
#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub stats: IndexStats,
    pub by_source: Vec<SourceStats>,
    pub scopes: Vec<ScopeStatus>,
    pub vector: VectorStatus,
    pub keyword_index: bool,
    pub embedding_model: Option<String>,
    pub cache_entries: usize,
    pub db_size_bytes: u64,
}

pub struct IndexManager {
    config: Config,
    store: Arc<MemoryStore>,
    embedder: Option<CachedEmbedder>,
    files: Arc<dyn FileSource>,
    sync_gate: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    auto_sync: Mutex<Option<WatchHandle>>,
}

impl IndexManager {
    /// Open the configured database, provider and local filesystem source.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(MemoryStore::open(&config).await?);
        let provider = create_provider(&config.embedding)?;
        Ok(Self::new(config, store, provider, Arc::new(FsSource)))
    }

    /// Assemble a manager from explicit collaborators.
    pub fn new(
        config: Config,
        store: Arc<MemoryStore>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        files: Arc<dyn FileSource>,
    ) -> Self {
        let embedder = provider.map(|p| {
            CachedEmbedder::new(
                p,
                store.clone(),
                config.embedding.batch_size,
                Duration::from_secs(config.embedding.timeout_secs),
            )
        });
        Self {
            config,
            store,
            embedder,
            files,
            sync_gate: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            auto_sync: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    // ---- sync ----

    /// Sync every configured source.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let _guard = self.sync_gate.lock().await;
        let mut report = SyncReport::default();
        for source in &self.config.sources {
            let scope_report = self.sync_source(source, cancel).await?;
            report.absorb(&scope_report);
        }
        report.cache_evicted = self.evict_cache().await;
        Ok(report)
    }

    /// Sync one source by scope name.
    pub async fn sync_scope(&self, name: &str, cancel: &CancellationToken) -> Result<SyncReport> {
        let Some(source) = self.config.source(name) else {
            bail!("Unknown source scope: '{}'", name);
        };
        let _guard = self.sync_gate.lock().await;
        let mut report = self.sync_source(source, cancel).await?;
        report.cache_evicted = self.evict_cache().await;
        Ok(report)
    }

    async fn sync_source(
        &self,
        source: &SourceConfig,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let fingerprint = self.fingerprint();

        let listing = match self.files.list(source).await {
            Ok(listing) => Some(listing),
            Err(e) => {
                warn!(scope = %source.name, error = %e, "listing failed, skipping cleanup");
                report.errors += 1;
                None
            }
        };

        let mut listed: HashSet<String> = HashSet::new();
        for file in listing.iter().flatten() {
            let path = file.path.to_string_lossy().to_string();
            listed.insert(path.clone());
            self.sync_file(source, file, &path, &fingerprint, cancel, &mut report)
                .await?;
        }

        if listing.is_some() {
            for path in self.store.get_all_file_paths().await? {
                if Path::new(&path).starts_with(&source.root) && !listed.contains(&path) {
                    debug!(path = %path, "removing file no longer on disk");
                    self.store.delete_file(&path).await?;
                    report.files_removed += 1;
                }
            }
        }

        if report.errors == 0 {
            self.store
                .set_meta(
                    &format!("last_sync:{}", source.name),
                    &chrono::Utc::now().timestamp().to_string(),
                )
                .await?;
        }

        info!(
            scope = %source.name,
            indexed = report.files_indexed,
            unchanged = report.files_unchanged,
            removed = report.files_removed,
            errors = report.errors,
            "sync complete"
        );
        Ok(report)
    }

    async fn sync_file(
        &self,
        source: &SourceConfig,
        file: &ScannedFile,
        path: &str,
        fingerprint: &str,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<()> {
        let content = match self.files.read(&file.path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(path, error = %e, "skipping unreadable file this cycle");
                report.errors += 1;
                return Ok(());
            }
        };

        let content_hash = hash_text(&content);
        if let Some(existing) = self.store.get_file(path).await? {
            if existing.content_hash == content_hash {
                if existing.fingerprint == fingerprint {
                    report.files_unchanged += 1;
                    return Ok(());
                }
                debug!(path, "index settings changed, re-indexing");
            }
        }

        let raw = chunk_text(
            &content,
            self.config.chunking.max_tokens,
            self.config.chunking.overlap_tokens,
        );

        let embeddings = match &self.embedder {
            Some(embedder) if !raw.is_empty() => {
                let texts: Vec<String> = raw.iter().map(|c| c.text.clone()).collect();
                let (vectors, outcome) = embedder.embed(&texts, cancel).await?;
                report.embeddings_cached += outcome.cached;
                report.embeddings_computed += outcome.computed;
                Some(vectors)
            }
            _ => None,
        };

        let ids = assign_chunk_ids(path, &raw);
        let chunks: Vec<Chunk> = raw
            .into_iter()
            .zip(ids)
            .enumerate()
            .map(|(i, (c, id))| Chunk {
                id,
                path: path.to_string(),
                source: source.kind,
                start_line: c.start_line,
                end_line: c.end_line,
                text: c.text,
                content_hash: c.hash,
                embedding: embeddings.as_ref().and_then(|e| e.get(i).cloned()),
            })
            .collect();

        let entry = FileEntry {
            path: path.to_string(),
            source: source.kind,
            content_hash,
            size_bytes: file.size_bytes as i64,
            updated_at: file.modified,
            fingerprint: fingerprint.to_string(),
        };
        self.store.replace_file(&entry, &chunks).await?;

        report.files_indexed += 1;
        report.chunks_written += chunks.len();
        info!(path, chunks = chunks.len(), "indexed file");
        Ok(())
    }

    /// Identifies everything that shapes stored chunks and vectors.
    fn fingerprint(&self) -> String {
        let (provider, model) = match &self.embedder {
            Some(e) => (e.provider().id(), e.provider().model_name()),
            None => ("none", ""),
        };
        format!(
            "{}:{}:{}:{}",
            provider, model, self.config.chunking.max_tokens, self.config.chunking.overlap_tokens
        )
    }

    async fn evict_cache(&self) -> usize {
        let Some(max) = self.config.cache.max_entries else {
            return 0;
        };
        match self.store.evict_cache(max).await {
            Ok(0) => 0,
            Ok(evicted) => {
                info!(evicted, "embedding cache: evicted old entries");
                evicted
            }
            Err(e) => {
                warn!(error = %e, "embedding cache eviction failed");
                0
            }
        }
    }

    // ---- search ----

    /// Ranked passages for `query`. An empty store or blank query returns an
    /// empty list.
    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<SearchResult>> {
        let retrieval = &self.config.retrieval;
        let limit = options.limit.unwrap_or(retrieval.max_results);
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let candidates = limit.saturating_mul(retrieval.candidate_multiplier);

        let keyword = self
            .store
            .keyword_search(query, candidates, options.source_filter)
            .await?;

        let (vector, vector_weight, text_weight) = match &self.embedder {
            Some(embedder) => {
                let cancel = self.shutdown.child_token();
                let query_vec = embedder.embed_query(query, &cancel).await?;
                let vector = self
                    .store
                    .vector_search(&query_vec, candidates, options.source_filter)
                    .await?;
                (vector, retrieval.vector_weight, retrieval.text_weight)
            }
            None => (Vec::new(), 0.0, 1.0),
        };

        Ok(merge_hybrid(
            &vector,
            &keyword,
            MergeParams {
                vector_weight,
                text_weight,
                min_score: retrieval.min_score,
                limit,
                snippet_max_chars: retrieval.snippet_max_chars,
            },
        ))
    }

    // ---- status ----

    pub fn is_vector_available(&self) -> bool {
        self.store.is_vector_available()
    }

    pub fn vector_status(&self) -> VectorStatus {
        self.store.vector_status()
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        self.store.stats().await
    }

    pub async fn status(&self) -> Result<IndexStatus> {
        let mut scopes = Vec::with_capacity(self.config.sources.len());
        for source in &self.config.sources {
            let last_sync = self
                .store
                .get_meta(&format!("last_sync:{}", source.name))
                .await?
                .and_then(|v| v.parse::<i64>().ok());
            scopes.push(ScopeStatus {
                name: source.name.clone(),
                last_sync,
            });
        }

        Ok(IndexStatus {
            stats: self.store.stats().await?,
            by_source: self.store.stats_by_source().await?,
            scopes,
            vector: self.store.vector_status(),
            keyword_index: self.store.is_keyword_index_available(),
            embedding_model: self
                .embedder
                .as_ref()
                .map(|e| format!("{}/{}", e.provider().id(), e.provider().model_name())),
            cache_entries: self.store.cache_count().await?,
            db_size_bytes: self.store.db_size_bytes(),
        })
    }

    // ---- watching ----

    /// Watch every source root; `callback` gets the scope name once per
    /// debounced burst of changes. Dropping the handle stops watching.
    pub fn watch(&self, callback: ChangeCallback) -> Result<WatchHandle> {
        watch_sources(
            &self.config.sources,
            Duration::from_millis(self.config.watch.debounce_ms),
            callback,
        )
    }

    /// Watch every source and re-sync a scope after each burst of changes.
    /// Runs until [`close`](Self::close).
    pub fn spawn_auto_sync(self: &Arc<Self>) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let callback: ChangeCallback = Arc::new(move |scope: String| {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                let cancel = manager.shutdown.child_token();
                match manager.sync_scope(&scope, &cancel).await {
                    Ok(report) => debug!(scope = %scope, ?report, "auto-sync finished"),
                    Err(e) => warn!(scope = %scope, error = %e, "auto-sync failed"),
                }
            });
        });

        let handle = self.watch(callback)?;
        *self
            .auto_sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop watching, clear pending debounce timers, cancel in-flight
    /// embedding calls and close the database.
    pub async fn close(&self) {
        let handle = self
            .auto_sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(handle);
        self.shutdown.cancel();
        self.store.close().await;
    }
}
