//! TOML configuration for the memory index.
//!
//! Every section except `[db]` has defaults, so a minimal file only needs
//! a database path and at least one `[[sources]]` entry to be useful.
//!
//! ```toml
//! [db]
//! path = "./data/memory.sqlite"
//!
//! [chunking]
//! max_tokens = 400
//! overlap_tokens = 80
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//!
//! [[sources]]
//! name = "agent"
//! root = "./memory"
//! kind = "agent"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::Source;

/// Default chunk budget in estimated tokens.
pub const DEFAULT_CHUNK_TOKENS: usize = 400;
/// Default overlap between consecutive chunks in estimated tokens.
pub const DEFAULT_CHUNK_OVERLAP: usize = 80;
/// Default debounce window for filesystem change bursts.
pub const DEFAULT_WATCH_DEBOUNCE_MS: u64 = 1500;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Build a configuration with defaults for everything but the database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            cache: CacheConfig::default(),
            vector: VectorConfig::default(),
            watch: WatchConfig::default(),
            sources: Vec::new(),
        }
    }

    /// Look up a configured source by its scope name.
    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
        }

        let r = &self.retrieval;
        if !(0.0..=1.0).contains(&r.vector_weight) {
            bail!("retrieval.vector_weight must be in [0.0, 1.0]");
        }
        if !(0.0..=1.0).contains(&r.text_weight) {
            bail!("retrieval.text_weight must be in [0.0, 1.0]");
        }
        if r.candidate_multiplier == 0 {
            bail!("retrieval.candidate_multiplier must be >= 1");
        }
        if r.max_results == 0 {
            bail!("retrieval.max_results must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "disabled" => {}
            "openai" | "ollama" => {
                if self.embedding.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if self.embedding.dims == Some(0) {
                    bail!("embedding.dims must be > 0 when set");
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        for (i, source) in self.sources.iter().enumerate() {
            if source.name.trim().is_empty() {
                bail!("sources[{}].name must not be empty", i);
            }
            if self.sources[..i].iter().any(|s| s.name == source.name) {
                bail!("duplicate source name: '{}'", source.name);
            }
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl DbConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == ":memory:"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_CHUNK_TOKENS,
            overlap_tokens: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

fn default_chunk_tokens() -> usize {
    DEFAULT_CHUNK_TOKENS
}
fn default_chunk_overlap() -> usize {
    DEFAULT_CHUNK_OVERLAP
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_text_weight")]
    pub text_weight: f64,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub min_score: f64,
    #[serde(default = "default_snippet_max_chars")]
    pub snippet_max_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            text_weight: default_text_weight(),
            candidate_multiplier: default_candidate_multiplier(),
            max_results: default_max_results(),
            min_score: 0.0,
            snippet_max_chars: default_snippet_max_chars(),
        }
    }
}

fn default_vector_weight() -> f64 {
    0.7
}
fn default_text_weight() -> f64 {
    0.3
}
fn default_candidate_multiplier() -> usize {
    4
}
fn default_max_results() -> usize {
    6
}
fn default_snippet_max_chars() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible host or Ollama address).
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable the API key is read from at call time.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CacheConfig {
    /// Upper bound on cached embeddings; `None` keeps every entry.
    #[serde(default)]
    pub max_entries: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Candidate locations for the sqlite-vec loadable extension, tried in order.
    #[serde(default = "default_extension_paths")]
    pub extension_paths: Vec<String>,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extension_paths: default_extension_paths(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_extension_paths() -> Vec<String> {
    vec![
        "vec0".to_string(),
        "./vec0".to_string(),
        "/usr/local/lib/vec0".to_string(),
        "/usr/lib/sqlite3/vec0".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_WATCH_DEBOUNCE_MS,
        }
    }
}

fn default_debounce_ms() -> u64 {
    DEFAULT_WATCH_DEBOUNCE_MS
}

/// One watched directory. `name` is the scope identifier used by sync and
/// change notifications.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub root: PathBuf,
    #[serde(default)]
    pub kind: Source,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, kind: Source) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            kind,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.markdown".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
