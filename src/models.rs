//! Core data models used throughout the memory index.
//!
//! These types represent the files, chunks, and search results that flow
//! through the indexing and retrieval pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Who owns a memory file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    User,
    #[default]
    Agent,
    Workspace,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::User => "user",
            Source::Agent => "agent",
            Source::Workspace => "workspace",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Source::User),
            "agent" => Ok(Source::Agent),
            "workspace" => Ok(Source::Workspace),
            other => anyhow::bail!(
                "Unknown source kind: '{}'. Must be user, agent, or workspace.",
                other
            ),
        }
    }
}

/// One indexed file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub source: Source,
    pub content_hash: String,
    pub size_bytes: i64,
    /// Unix timestamp (seconds) of the file's last modification.
    pub updated_at: i64,
    /// Provider, model and chunking settings the file was indexed under.
    pub fingerprint: String,
}

/// A passage of a file, the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Deterministic id derived from `(path, start_line, end_line)`.
    pub id: String,
    pub path: String,
    pub source: Source,
    /// 1-based, inclusive.
    pub start_line: i64,
    /// 1-based, inclusive.
    pub end_line: i64,
    pub text: String,
    pub content_hash: String,
    pub embedding: Option<Vec<f32>>,
}

/// A memoized embedding keyed by the hash of the embedded text.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingCacheEntry {
    pub text_hash: String,
    pub vector: Vec<f32>,
    pub dimensions: usize,
}

impl EmbeddingCacheEntry {
    pub fn new(text_hash: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            text_hash: text_hash.into(),
            dimensions: vector.len(),
            vector,
        }
    }
}

/// A search hit returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub path: String,
    pub source: Source,
    pub start_line: i64,
    pub end_line: i64,
    pub snippet: String,
    pub score: f64,
}

/// Per-query options; unset fields fall back to the retrieval config.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub source_filter: Option<Source>,
}

/// Whether the native vector index can be used, and why not if it can't.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VectorStatus {
    pub available: bool,
    pub reason: Option<String>,
}

impl VectorStatus {
    pub fn available() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// Row counts for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IndexStats {
    pub files: i64,
    pub chunks: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_round_trips_through_str() {
        for s in [Source::User, Source::Agent, Source::Workspace] {
            assert_eq!(s.as_str().parse::<Source>().unwrap(), s);
        }
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        assert!("daily".parse::<Source>().is_err());
    }
}
