//! Embedding provider abstraction and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait and its backends:
//! - **[`OpenAiProvider`]**: any OpenAI-compatible `/v1/embeddings` endpoint.
//! - **[`OllamaProvider`]**: a local Ollama instance's `/api/embed` endpoint.
//!
//! [`CachedEmbedder`] wraps any provider with a content-hash keyed cache
//! stored in SQLite, so identical text is only ever sent to the network once.
//!
//! Also provides the vector codec shared by the chunk table and the cache:
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes
//! - [`blob_to_vec`]: decode a BLOB, rejecting misaligned input
//! - [`decode_vector`]: decode and check the length against a known dimension
//! - [`cosine_similarity`]: similarity used by the in-process fallback search
//!
//! # Provider Selection
//!
//! ```rust
//! # use memory_index::config::EmbeddingConfig;
//! # use memory_index::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! assert!(create_provider(&config).unwrap().is_none());
//! ```
//!
//! Providers never retry. Authentication, HTTP and network failures surface
//! as [`EmbeddingError`] so that a broken provider can't quietly produce
//! meaningless rankings.

mod cache;
mod ollama;
mod openai;

pub use cache::{CacheOutcome, CachedEmbedder};
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::error::{CodecError, EmbeddingError};

/// Trait for embedding backends.
///
/// Every backend takes a batch of texts and returns one vector per text in
/// input order, whatever its authentication or request shape.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Short backend identifier (e.g. `"openai"`). Part of the cache key.
    fn id(&self) -> &str;
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Declared dimensionality; vectors of any other length are rejected.
    fn dims(&self) -> Option<usize> {
        None
    }
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Create the configured provider, or `None` when embeddings are disabled.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | none (keyword-only search) |
/// | `"openai"` | [`OpenAiProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiProvider::from_config(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaProvider::from_config(config)?))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use memory_index::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob).unwrap(), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Result<Vec<f32>, CodecError> {
    if blob.len() % 4 != 0 {
        return Err(CodecError::Misaligned { len: blob.len() });
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Decode a BLOB that must hold exactly `dims` floats.
pub fn decode_vector(blob: &[u8], dims: usize) -> Result<Vec<f32>, CodecError> {
    let vec = blob_to_vec(blob)?;
    if vec.len() != dims {
        return Err(CodecError::DimensionMismatch {
            expected: dims,
            actual: vec.len(),
        });
    }
    Ok(vec)
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` when either norm is zero or the lengths differ.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random_vec(dims: usize) -> Vec<f32> {
        (0..dims)
            .map(|i| ((i as f32 * 12.9898).sin() * 43758.547).fract() - 0.5)
            .collect()
    }

    #[test]
    fn test_blob_reencode_is_byte_identical() {
        for dims in [1usize, 4, 1536] {
            let v = pseudo_random_vec(dims);
            let first = vec_to_blob(&v);
            let decoded = decode_vector(&first, dims).unwrap();
            let second = vec_to_blob(&decoded);
            assert_eq!(first, second, "re-encode mismatch for dims={}", dims);
            assert_eq!(first.len(), dims * 4);
        }
    }

    #[test]
    fn test_special_values_survive_codec() {
        let v = vec![0.0f32, -0.0, f32::MAX, f32::MIN_POSITIVE, f32::INFINITY];
        let blob = vec_to_blob(&v);
        let back = blob_to_vec(&blob).unwrap();
        assert_eq!(vec_to_blob(&back), blob);
    }

    #[test]
    fn test_misaligned_blob_is_rejected() {
        assert_eq!(
            blob_to_vec(&[0u8; 7]),
            Err(CodecError::Misaligned { len: 7 })
        );
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let blob = vec_to_blob(&[1.0, 2.0, 3.0]);
        assert_eq!(
            decode_vector(&blob, 4),
            Err(CodecError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let sim = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_norm() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_disabled_config_creates_no_provider() {
        let config = EmbeddingConfig::default();
        assert!(create_provider(&config).unwrap().is_none());
    }
}
