//! Hybrid ranking: min-max normalization of each candidate list, weighted
//! merge, minimum-score cut and snippet bounding.
//!
//! Candidate retrieval lives in the store; this module only combines what
//! the vector and keyword paths return.
//!
//! ```text
//! final = vector_weight × norm(vector_score) + text_weight × norm(text_score)
//! ```
//!
//! A chunk found by only one path gets 0 for the other term.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{SearchResult, Source};

/// One scored chunk from either retrieval path. Higher is better.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: String,
    pub path: String,
    pub source: Source,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    pub score: f64,
}

/// Weights and cutoffs for one merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeParams {
    pub vector_weight: f64,
    pub text_weight: f64,
    pub min_score: f64,
    pub limit: usize,
    pub snippet_max_chars: usize,
}

/// Min-max normalize scores to [0, 1]. A single candidate, or a list whose
/// scores are all equal, normalizes to 1.0.
pub fn normalize_scores(candidates: &[Candidate]) -> Vec<(&Candidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// Merge the two candidate lists into the final ranked results.
///
/// Ties on the combined score are broken by path, then start line.
pub fn merge_hybrid(
    vector: &[Candidate],
    keyword: &[Candidate],
    params: MergeParams,
) -> Vec<SearchResult> {
    struct Merged<'a> {
        candidate: &'a Candidate,
        vector: f64,
        text: f64,
    }

    let mut merged: HashMap<&str, Merged<'_>> = HashMap::new();
    for (c, norm) in normalize_scores(vector) {
        merged
            .entry(c.chunk_id.as_str())
            .or_insert(Merged {
                candidate: c,
                vector: 0.0,
                text: 0.0,
            })
            .vector = norm;
    }
    for (c, norm) in normalize_scores(keyword) {
        merged
            .entry(c.chunk_id.as_str())
            .or_insert(Merged {
                candidate: c,
                vector: 0.0,
                text: 0.0,
            })
            .text = norm;
    }

    let mut scored: Vec<(&Candidate, f64)> = merged
        .into_values()
        .map(|m| {
            let score = params.vector_weight * m.vector + params.text_weight * m.text;
            (m.candidate, score)
        })
        .filter(|(_, score)| *score >= params.min_score)
        .collect();

    scored.sort_by(|(a, sa), (b, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });
    scored.truncate(params.limit);

    scored
        .into_iter()
        .map(|(c, score)| SearchResult {
            path: c.path.clone(),
            source: c.source,
            start_line: c.start_line,
            end_line: c.end_line,
            snippet: make_snippet(&c.text, params.snippet_max_chars),
            score,
        })
        .collect()
}

/// Trim and cut `text` to at most `max_chars` chars on a char boundary.
pub fn make_snippet(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => trimmed[..byte_idx].to_string(),
        None => trimmed.to_string(),
    }
}
