//! Typed errors for the embedding boundary and the vector codec.
//!
//! Orchestration code works in `anyhow::Result`; these types stay
//! recoverable through `downcast_ref` so callers can tell a provider
//! failure from a storage failure.

use std::time::Duration;
use thiserror::Error;

/// Failures raised by an embedding provider or the cache wrapping it.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("API key not found in environment variable {0}")]
    MissingApiKey(String),

    #[error("Embedding provider rejected credentials ({status}): {body}")]
    Auth { status: u16, body: String },

    #[error("Embedding API error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Embedding request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("Embedding provider returned {actual} vectors for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Embedding request cancelled")]
    Cancelled,

    #[error("Embedding request timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Other(String),
}

/// Failures decoding a stored vector blob.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("vector blob length {len} is not a multiple of 4")]
    Misaligned { len: usize },

    #[error("vector blob holds {actual} floats, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}
