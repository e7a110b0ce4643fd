//! Line-oriented markdown chunker.
//!
//! Splits a file's text into overlapping passages bounded by an estimated
//! token budget. Chunks always cover whole lines (except for single lines
//! longer than the budget, which are cut into segments), so every chunk
//! carries an exact 1-based `start_line..=end_line` range back into the
//! source file.
//!
//! # Algorithm
//!
//! 1. Estimate each line's cost as `ceil((chars + 1) / 4)` tokens (the `+ 1`
//!    is the newline), with a floor of one token.
//! 2. Accumulate lines until the next one would push the chunk past
//!    `max_tokens`, then flush.
//! 3. Seed the next chunk with the trailing lines of the flushed one whose
//!    combined cost fits in `overlap_tokens`.
//! 4. Lines longer than the budget are hard-split on char boundaries; every
//!    segment keeps the original line number.
//!
//! Token counts are estimates, not tokenizer output; treat the budget as
//! approximate.
//!
//! # Example
//!
//! ```rust
//! use memory_index::chunk::chunk_text;
//!
//! let chunks = chunk_text("A\nB\nC\nD\nE\nF\nG\nH", 5, 1);
//! assert_eq!(chunks.len(), 2);
//! assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 5));
//! assert_eq!((chunks[1].start_line, chunks[1].end_line), (5, 8));
//! ```

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// A chunk before it is attached to a file.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    pub hash: String,
}

struct Line<'a> {
    number: i64,
    text: &'a str,
    tokens: usize,
}

/// Estimated token cost of one line, newline included.
pub fn estimate_tokens(line: &str) -> usize {
    let chars = line.chars().count() + 1;
    chars.div_ceil(CHARS_PER_TOKEN).max(1)
}

/// Split `text` into overlapping chunks of at most `max_tokens` estimated
/// tokens. Empty or whitespace-only text yields no chunks.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<RawChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let max_tokens = max_tokens.max(1);
    // A segment of this many chars costs at most `max_tokens` once the
    // newline is counted.
    let segment_chars = (max_tokens * CHARS_PER_TOKEN).saturating_sub(1).max(1);

    let mut chunks = Vec::new();
    let mut current: Vec<Line<'_>> = Vec::new();
    let mut current_tokens = 0usize;

    for (idx, raw_line) in text.lines().enumerate() {
        let number = idx as i64 + 1;
        for segment in split_long_line(raw_line, segment_chars) {
            let tokens = estimate_tokens(segment);

            if !current.is_empty() && current_tokens + tokens > max_tokens {
                flush(&current, &mut chunks);
                current = carry_overlap(current, overlap_tokens);
                current_tokens = current.iter().map(|l| l.tokens).sum();
                if current_tokens + tokens > max_tokens {
                    current.clear();
                    current_tokens = 0;
                }
            }

            current.push(Line {
                number,
                text: segment,
                tokens,
            });
            current_tokens += tokens;
        }
    }

    if !current.is_empty() {
        flush(&current, &mut chunks);
    }

    chunks
}

/// Keep the trailing lines whose combined cost fits in the overlap budget.
fn carry_overlap(lines: Vec<Line<'_>>, overlap_tokens: usize) -> Vec<Line<'_>> {
    if overlap_tokens == 0 {
        return Vec::new();
    }
    let mut acc = 0usize;
    let mut keep_from = lines.len();
    for (i, line) in lines.iter().enumerate().rev() {
        if acc + line.tokens > overlap_tokens {
            break;
        }
        acc += line.tokens;
        keep_from = i;
    }
    lines.into_iter().skip(keep_from).collect()
}

fn flush(lines: &[Line<'_>], out: &mut Vec<RawChunk>) {
    let (Some(first), Some(last)) = (lines.first(), lines.last()) else {
        return;
    };
    let text = lines.iter().map(|l| l.text).collect::<Vec<_>>().join("\n");
    if text.trim().is_empty() {
        return;
    }
    out.push(RawChunk {
        start_line: first.number,
        end_line: last.number,
        hash: hash_text(&text),
        text,
    });
}

/// Cut a line into segments of at most `max_chars` chars on char boundaries.
fn split_long_line(line: &str, max_chars: usize) -> Vec<&str> {
    if line.chars().count() <= max_chars {
        return vec![line];
    }
    let mut segments = Vec::new();
    let mut start = 0usize;
    let mut count = 0usize;
    for (byte_idx, _) in line.char_indices() {
        if count == max_chars {
            segments.push(&line[start..byte_idx]);
            start = byte_idx;
            count = 0;
        }
        count += 1;
    }
    if start < line.len() {
        segments.push(&line[start..]);
    }
    segments
}

/// Stable SHA-256 hex digest of `text`. Used for file change detection and
/// as the embedding cache key.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk id for a line range of a file, so re-indexing the
/// same region upserts the same row.
pub fn chunk_id(path: &str, start_line: i64, end_line: i64) -> String {
    let key = format!("{}#L{}-L{}", path, start_line, end_line);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

/// Ids for every chunk of one file. Segments of a split long line share a
/// line range, so repeats of a range get an ordinal in their key.
pub fn assign_chunk_ids(path: &str, chunks: &[RawChunk]) -> Vec<String> {
    let mut seen: HashMap<(i64, i64), usize> = HashMap::new();
    chunks
        .iter()
        .map(|c| {
            let n = seen.entry((c.start_line, c.end_line)).or_insert(0);
            let id = if *n == 0 {
                chunk_id(path, c.start_line, c.end_line)
            } else {
                let key = format!("{}#L{}-L{}~{}", path, c.start_line, c.end_line, n);
                Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
            };
            *n += 1;
            id
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(chunk_text("", 400, 80).is_empty());
        assert!(chunk_text("  \n\n \t\n", 400, 80).is_empty());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 400, 80);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].hash, hash_text("Hello, world!"));
    }

    #[test]
    fn test_two_chunks_share_one_overlapping_line() {
        let chunks = chunk_text("A\nB\nC\nD\nE\nF\nG\nH", 5, 1);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "A\nB\nC\nD\nE");
        assert_eq!(chunks[1].text, "E\nF\nG\nH");
        assert!(chunks[0].text.lines().any(|l| l == "E"));
        assert!(chunks[1].text.lines().any(|l| l == "E"));
    }

    #[test]
    fn test_no_overlap_partitions_lines() {
        let chunks = chunk_text("A\nB\nC\nD\nE\nF", 2, 0);
        let ranges: Vec<(i64, i64)> = chunks.iter().map(|c| (c.start_line, c.end_line)).collect();
        assert_eq!(ranges, vec![(1, 2), (3, 4), (5, 6)]);
    }

    #[test]
    fn test_line_ranges_are_monotonic_and_cover_file() {
        let text = (1..=60)
            .map(|i| format!("line number {} with some filler words", i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_text(&text, 40, 10);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.first().unwrap().start_line, 1);
        assert_eq!(chunks.last().unwrap().end_line, 60);
        for pair in chunks.windows(2) {
            assert!(pair[1].start_line > pair[0].start_line);
            assert!(pair[1].start_line <= pair[0].end_line + 1);
        }
    }

    #[test]
    fn test_long_line_is_split_into_segments() {
        let line = "x".repeat(100);
        let chunks = chunk_text(&line, 5, 0);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert_eq!(c.start_line, 1);
            assert_eq!(c.end_line, 1);
            assert!(estimate_tokens(&c.text) <= 5);
        }
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, line);
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = chunk_text(text, 3, 1);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\nBeta\nGamma\nDelta\nEpsilon";
        let c1 = chunk_text(text, 3, 1);
        let c2 = chunk_text(text, 3, 1);
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_hash_text_known_value() {
        assert_eq!(
            hash_text("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_chunk_id_is_deterministic_per_range() {
        assert_eq!(chunk_id("a.md", 1, 5), chunk_id("a.md", 1, 5));
        assert_ne!(chunk_id("a.md", 1, 5), chunk_id("a.md", 5, 8));
        assert_ne!(chunk_id("a.md", 1, 5), chunk_id("b.md", 1, 5));
    }

    #[test]
    fn test_split_line_segments_get_distinct_ids() {
        let chunks = chunk_text(&"y".repeat(60), 5, 0);
        let ids = assign_chunk_ids("a.md", &chunks);
        assert_eq!(ids[0], chunk_id("a.md", 1, 1));
        let unique: std::collections::HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(ids, assign_chunk_ids("a.md", &chunks));
    }
}
