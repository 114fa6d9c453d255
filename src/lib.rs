//! # memvault
//!
//! A persistent, multi-tenant memory store for AI agents with hybrid
//! retrieval: memories are ranked by a fused combination of semantic
//! similarity, lexical match, recency and importance.
//!
//! ## Architecture
//!
//! - **TenantPool** - one isolated SQLite store per validated tenant slug
//! - **MemoryStore** - memories, their vectors and the query-result cache,
//!   with transactional vector attachment
//! - **HybridSearchEngine** - multi-signal scoring with a TTL result cache
//! - **EmbedReconciler** - background loop that embeds vectorless memories
//!   via an external provider, with circuit-breaker failure containment
//! - **Reranker** - optional cross-encoder second stage for the top-K slice
//!
//! ## Usage
//!
//! ```rust,ignore
//! use memvault::{Config, MemoryService};
//!
//! let service = MemoryService::new(Config::default())?;
//! service.start_reconciler().await;
//!
//! service.store("main", "the deploy script lives in ops/", None, Some(0.8))?;
//! let results = service.recall("main", "where is the deploy script?", 10, 0.0, None).await?;
//! ```

pub mod config;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod reconciler;
pub mod rerank;
pub mod search;
pub mod service;
pub mod storage;
pub mod tenant;

pub use config::Config;
pub use embedding::{EmbeddingProvider, HttpEmbeddingProvider};
pub use error::{Error, Result};
pub use memory::{ImportReport, Memory, ScoredMemory, SignalSet, TenantStats};
pub use rerank::{RerankConfig, Reranker};
pub use search::SearchWeights;
pub use service::MemoryService;
pub use tenant::{Access, TenantId, TenantPool};
