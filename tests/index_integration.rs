//! End-to-end tests of the index manager against a real SQLite store and a
//! deterministic keyword-bag embedder.

use anyhow::Result;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use memory_index::config::{Config, SourceConfig};
use memory_index::embedding::EmbeddingProvider;
use memory_index::error::EmbeddingError;
use memory_index::manager::IndexManager;
use memory_index::models::{IndexStats, SearchOptions, Source};
use memory_index::scan::{FileSource, FsSource, ScannedFile};
use memory_index::store::MemoryStore;

const KEYWORDS: [&str; 8] = [
    "rust", "python", "database", "memory", "search", "network", "cooking", "music",
];

/// Embeds text as keyword counts over the first `dims` entries of [`KEYWORDS`].
struct KeywordEmbedder {
    model: &'static str,
    dims: usize,
    calls: AtomicUsize,
    broken: AtomicBool,
}

impl KeywordEmbedder {
    fn new(model: &'static str, dims: usize) -> Arc<Self> {
        Arc::new(Self {
            model,
            dims,
            calls: AtomicUsize::new(0),
            broken: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn id(&self) -> &str {
        "keywords"
    }

    fn model_name(&self) -> &str {
        self.model
    }

    fn dims(&self) -> Option<usize> {
        Some(self.dims)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Auth {
                status: 401,
                body: "invalid api key".to_string(),
            });
        }
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                KEYWORDS[..self.dims]
                    .iter()
                    .map(|k| lower.matches(k).count() as f32)
                    .collect()
            })
            .collect())
    }
}

/// Filesystem source whose reads fail for paths containing "locked" while
/// `locked` is set.
struct FlakySource {
    locked: AtomicBool,
}

#[async_trait]
impl FileSource for FlakySource {
    async fn list(&self, source: &SourceConfig) -> Result<Vec<ScannedFile>> {
        FsSource.list(source).await
    }

    async fn read(&self, path: &Path) -> Result<String> {
        if self.locked.load(Ordering::SeqCst) && path.to_string_lossy().contains("locked") {
            anyhow::bail!("permission denied: {}", path.display());
        }
        FsSource.read(path).await
    }
}

struct Fixture {
    tmp: TempDir,
    config: Config,
    store: Arc<MemoryStore>,
}

impl Fixture {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("agent")).unwrap();
        fs::create_dir_all(tmp.path().join("user")).unwrap();

        let mut config = Config::with_db_path(":memory:");
        config.vector.enabled = false;
        config.sources = vec![
            SourceConfig::new("agent", tmp.path().join("agent"), Source::Agent),
            SourceConfig::new("user", tmp.path().join("user"), Source::User),
        ];
        let store = Arc::new(MemoryStore::open(&config).await.unwrap());
        Self { tmp, config, store }
    }

    fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.tmp.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn manager(&self, provider: Option<Arc<KeywordEmbedder>>) -> IndexManager {
        self.manager_with_source(provider, Arc::new(FsSource))
    }

    fn manager_with_source(
        &self,
        provider: Option<Arc<KeywordEmbedder>>,
        files: Arc<dyn FileSource>,
    ) -> IndexManager {
        let provider = provider.map(|p| p as Arc<dyn EmbeddingProvider>);
        IndexManager::new(self.config.clone(), self.store.clone(), provider, files)
    }
}

#[tokio::test]
async fn test_empty_store_search_is_empty() {
    let fx = Fixture::new().await;
    let manager = fx.manager(Some(KeywordEmbedder::new("bag-8", 8)));

    assert_eq!(manager.stats().await.unwrap(), IndexStats::default());
    let results = manager
        .search("anything", SearchOptions::default())
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_sync_is_idempotent_and_detects_changes() {
    let fx = Fixture::new().await;
    let provider = KeywordEmbedder::new("bag-8", 8);
    let manager = fx.manager(Some(provider.clone()));
    fx.write("agent/MEMORY.md", "# Memory\nrust and database notes");
    fx.write("user/notes.md", "cooking and music");
    let cancel = CancellationToken::new();

    let first = manager.sync(&cancel).await.unwrap();
    assert_eq!(first.files_indexed, 2);
    assert_eq!(first.embeddings_computed, 2);
    let stats = manager.stats().await.unwrap();

    let second = manager.sync(&cancel).await.unwrap();
    assert_eq!(second.files_indexed, 0);
    assert_eq!(second.files_unchanged, 2);
    assert_eq!(second.embeddings_computed, 0);
    assert_eq!(manager.stats().await.unwrap(), stats);

    fx.write("user/notes.md", "cooking, music and search");
    let third = manager.sync(&cancel).await.unwrap();
    assert_eq!(third.files_indexed, 1);
    assert_eq!(third.files_unchanged, 1);
    assert_eq!(third.embeddings_computed, 1);
}

#[tokio::test]
async fn test_overlapping_chunks_share_a_line() {
    let mut fx = Fixture::new().await;
    fx.config.chunking.max_tokens = 5;
    fx.config.chunking.overlap_tokens = 1;
    let manager = fx.manager(None);
    let path = fx.write("agent/letters.md", "A\nB\nC\nD\nE\nF\nG\nH");

    manager.sync(&CancellationToken::new()).await.unwrap();

    let chunks = fx
        .store
        .chunks_for_path(&path.to_string_lossy())
        .await
        .unwrap();
    assert_eq!(chunks.len(), 2);
    let shared: Vec<&str> = chunks[0]
        .text
        .lines()
        .filter(|l| chunks[1].text.lines().any(|m| m == *l))
        .collect();
    assert_eq!(shared, vec!["E"]);
}

#[tokio::test]
async fn test_hybrid_search_prefers_semantic_and_keyword_match() {
    let fx = Fixture::new().await;
    let manager = fx.manager(Some(KeywordEmbedder::new("bag-8", 8)));
    fx.write("agent/rust.md", "rust memory layout and rust lifetimes");
    fx.write("agent/python.md", "python scripts for the database");
    fx.write("user/kitchen.md", "cooking with music on");
    manager.sync(&CancellationToken::new()).await.unwrap();

    let results = manager
        .search("rust", SearchOptions::default())
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results[0].path.ends_with("rust.md"));
    assert!((results[0].score - 1.0).abs() < 1e-9);
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn test_search_source_filter_and_limit() {
    let fx = Fixture::new().await;
    let manager = fx.manager(Some(KeywordEmbedder::new("bag-8", 8)));
    fx.write("agent/a.md", "music theory");
    fx.write("agent/b.md", "music history");
    fx.write("user/c.md", "music playlist");
    manager.sync(&CancellationToken::new()).await.unwrap();

    let user_only = manager
        .search(
            "music",
            SearchOptions {
                limit: None,
                source_filter: Some(Source::User),
            },
        )
        .await
        .unwrap();
    assert_eq!(user_only.len(), 1);
    assert_eq!(user_only[0].source, Source::User);

    let limited = manager
        .search(
            "music",
            SearchOptions {
                limit: Some(2),
                source_filter: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);
}

#[tokio::test]
async fn test_removed_files_leave_the_index() {
    let fx = Fixture::new().await;
    let manager = fx.manager(None);
    let doomed = fx.write("agent/old.md", "network outage notes");
    fx.write("agent/keep.md", "search tuning");
    manager.sync(&CancellationToken::new()).await.unwrap();

    fs::remove_file(&doomed).unwrap();
    let report = manager.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.files_removed, 1);
    assert!(manager
        .search("outage", SearchOptions::default())
        .await
        .unwrap()
        .is_empty());
    assert_eq!(manager.stats().await.unwrap().files, 1);
}

#[tokio::test]
async fn test_cached_embedding_survives_provider_failure() {
    let fx = Fixture::new().await;
    let provider = KeywordEmbedder::new("bag-8", 8);
    let manager = fx.manager(Some(provider.clone()));
    fx.write("agent/a.md", "shared database text");
    manager.sync(&CancellationToken::new()).await.unwrap();
    let calls = provider.calls.load(Ordering::SeqCst);

    provider.broken.store(true, Ordering::SeqCst);
    fx.write("user/copy.md", "shared database text");
    let report = manager.sync(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.files_indexed, 1);
    assert_eq!(report.embeddings_cached, 1);
    assert_eq!(report.embeddings_computed, 0);
    assert_eq!(provider.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_provider_failure_aborts_sync_unmasked() {
    let fx = Fixture::new().await;
    let provider = KeywordEmbedder::new("bag-8", 8);
    provider.broken.store(true, Ordering::SeqCst);
    let manager = fx.manager(Some(provider));
    fx.write("agent/a.md", "brand new text");

    let err = manager
        .sync(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EmbeddingError>(),
        Some(EmbeddingError::Auth { status: 401, .. })
    ));
    assert_eq!(manager.stats().await.unwrap().files, 0);
}

#[tokio::test]
async fn test_cancelled_sync_returns_cancelled() {
    let fx = Fixture::new().await;
    let manager = fx.manager(Some(KeywordEmbedder::new("bag-8", 8)));
    fx.write("agent/a.md", "rust");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = manager.sync(&cancel).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EmbeddingError>(),
        Some(EmbeddingError::Cancelled)
    ));
}

#[tokio::test]
async fn test_dimension_change_reindexes_with_new_vectors() {
    let fx = Fixture::new().await;
    let path = fx.write("agent/a.md", "rust database search");
    fx.write("user/b.md", "cooking music");

    let small = fx.manager(Some(KeywordEmbedder::new("bag-4", 4)));
    small.sync(&CancellationToken::new()).await.unwrap();
    let chunks = fx
        .store
        .chunks_for_path(&path.to_string_lossy())
        .await
        .unwrap();
    assert_eq!(chunks[0].embedding.as_ref().map(Vec::len), Some(4));

    let large = fx.manager(Some(KeywordEmbedder::new("bag-8", 8)));
    let report = large.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.files_indexed, 2);
    assert_eq!(report.embeddings_computed, 2);

    let chunks = fx
        .store
        .chunks_for_path(&path.to_string_lossy())
        .await
        .unwrap();
    assert_eq!(chunks[0].embedding.as_ref().map(Vec::len), Some(8));

    // Old 4-dimensional rows are gone, so a 4-dimensional probe matches nothing.
    let stale = fx
        .store
        .vector_search(&[1.0, 0.0, 0.0, 0.0], 10, None)
        .await
        .unwrap();
    assert!(stale.is_empty());

    let results = large
        .search("cooking", SearchOptions::default())
        .await
        .unwrap();
    assert!(results[0].path.ends_with("b.md"));
}

#[tokio::test]
async fn test_unreadable_file_is_skipped_then_retried() {
    let fx = Fixture::new().await;
    let files = Arc::new(FlakySource {
        locked: AtomicBool::new(true),
    });
    let manager = fx.manager_with_source(None, files.clone());
    fx.write("agent/open.md", "network notes");
    fx.write("agent/locked.md", "secret notes");
    fx.write("user/other.md", "music notes");

    let report = manager.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.files_indexed, 2);

    files.locked.store(false, Ordering::SeqCst);
    let report = manager.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.errors, 0);
    assert_eq!(report.files_indexed, 1);
    assert_eq!(report.files_unchanged, 2);
    assert_eq!(manager.stats().await.unwrap().files, 3);
}

#[tokio::test]
async fn test_persistently_unreadable_file_does_not_reindex_its_scope() {
    let fx = Fixture::new().await;
    let files = Arc::new(FlakySource {
        locked: AtomicBool::new(true),
    });
    let manager = fx.manager_with_source(None, files);
    fx.write("agent/open.md", "network notes");
    fx.write("agent/locked.md", "secret notes");

    let first = manager.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(first.files_indexed, 1);
    assert_eq!(first.errors, 1);

    for _ in 0..2 {
        let report = manager.sync(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.files_indexed, 0);
        assert_eq!(report.files_unchanged, 1);
        assert_eq!(report.chunks_written, 0);
        assert_eq!(report.errors, 1);
    }

    // A scope with a failing file is never marked as synced.
    let status = manager.status().await.unwrap();
    let agent = status.scopes.iter().find(|s| s.name == "agent").unwrap();
    assert!(agent.last_sync.is_none());
}

#[tokio::test]
async fn test_invalid_utf8_file_is_indexed_once() {
    let fx = Fixture::new().await;
    let manager = fx.manager(None);
    fx.write("agent/good.md", "rust notes");
    let latin1 = fx.tmp.path().join("agent/latin1.md");
    fs::write(&latin1, b"caf\xe9 r\xe9sum\xe9 rust").unwrap();

    let first = manager.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(first.files_indexed, 2);
    assert_eq!(first.errors, 0);

    let second = manager.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(second.files_indexed, 0);
    assert_eq!(second.files_unchanged, 2);

    let chunks = fx
        .store
        .chunks_for_path(&latin1.to_string_lossy())
        .await
        .unwrap();
    assert!(chunks[0].text.contains('\u{FFFD}'));
}

#[tokio::test]
async fn test_settings_change_reindexes_each_file_once() {
    let mut fx = Fixture::new().await;
    fx.write("agent/a.md", "rust");
    fx.write("user/b.md", "python");
    fx.manager(None)
        .sync(&CancellationToken::new())
        .await
        .unwrap();

    fx.config.chunking.max_tokens = 50;
    fx.config.chunking.overlap_tokens = 10;
    let manager = fx.manager(None);
    let report = manager.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.files_indexed, 2);

    let report = manager.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.files_indexed, 0);
    assert_eq!(report.files_unchanged, 2);
}

#[tokio::test]
async fn test_sync_scope_touches_only_that_scope() {
    let fx = Fixture::new().await;
    let manager = fx.manager(None);
    fx.write("agent/a.md", "rust");
    fx.write("user/b.md", "python");

    let report = manager
        .sync_scope("user", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.files_indexed, 1);
    let paths = fx.store.get_all_file_paths().await.unwrap();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].ends_with("b.md"));
}

#[tokio::test]
async fn test_cache_eviction_bounds_entries() {
    let mut fx = Fixture::new().await;
    fx.config.cache.max_entries = Some(2);
    let manager = fx.manager(Some(KeywordEmbedder::new("bag-8", 8)));
    fx.write("agent/a.md", "rust one");
    fx.write("agent/b.md", "rust two");
    fx.write("agent/c.md", "rust three");

    let report = manager.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.embeddings_computed, 3);
    assert_eq!(report.cache_evicted, 1);
    assert_eq!(fx.store.cache_count().await.unwrap(), 2);

    let status = manager.status().await.unwrap();
    assert_eq!(status.cache_entries, 2);
    assert_eq!(status.embedding_model.as_deref(), Some("keywords/bag-8"));
}
