//! # Memory Index
//!
//! A local hybrid search index over an agent's markdown memory files.
//!
//! Files under each configured source root are chunked by line with a token
//! budget and overlap, embedded through a content-hash keyed cache, and
//! stored in SQLite alongside an FTS5 keyword index and, when the sqlite-vec
//! extension loads, a native `vec0` vector index. Queries run both retrieval
//! paths and merge them with a weighted sum of min-max normalized scores.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//! │  Sources    │──▶│   Manager   │──▶│   SQLite    │
//! │ scan+watch  │   │ chunk+embed │   │ FTS5 + vec0 │
//! └─────────────┘   └──────┬──────┘   └──────┬──────┘
//!                          │                 │
//!                   ┌──────▼──────┐          │
//!                   │ Embed cache │◀─────────┘
//!                   └──────┬──────┘
//!                          ▼
//!                 OpenAI / Ollama API
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! memx init                     # create the database
//! memx sync                     # index every source
//! memx search "deploy runbook"  # hybrid search
//! memx watch                    # re-sync on file changes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`db`] | Connection pool and sqlite-vec loading |
//! | [`store`] | Tables, keyword and vector search |
//! | [`chunk`] | Line-based chunking and hashing |
//! | [`embedding`] | Providers and the embedding cache |
//! | [`scan`] | Source listing and file reads |
//! | [`search`] | Hybrid score merge |
//! | [`manager`] | Sync, search and auto-sync orchestration |
//! | [`watch`] | Debounced filesystem watching |
//! | [`stats`] | Status output |
//! | [`error`] | Typed provider and codec errors |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod manager;
pub mod models;
pub mod scan;
pub mod search;
pub mod stats;
pub mod store;
pub mod watch;
