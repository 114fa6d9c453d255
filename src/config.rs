//! Configuration for memvault

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::rerank::RerankConfig;
use crate::search::SearchWeights;
use crate::tenant::TenantId;

/// Configuration for the memory system
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all tenant stores
    pub data_dir: PathBuf,

    /// Base URL of the OpenAI-compatible embedding endpoint (".../v1")
    pub embed_base_url: String,

    /// Optional bearer token for the embedding endpoint
    pub embed_api_key: Option<String>,

    /// Embedding model identifier sent with every request
    pub embed_model: String,

    /// Embedding dimensionality; every stored vector must match
    pub embed_dimensions: usize,

    /// Texts are truncated to this many characters before embedding
    pub max_embed_chars: usize,

    /// Interval between reconciler sweeps
    pub reconciler_interval: Duration,

    /// Pending memories processed per attach batch
    pub reconciler_batch_size: usize,

    /// Upper bound on texts per provider call
    pub reconciler_sub_batch: usize,

    /// Pacing sleep between batches
    pub reconciler_sleep_between: Duration,

    /// Consecutive embedding failures before the circuit breaker trips
    pub breaker_threshold: u32,

    /// Cooldown slept once when the breaker trips
    pub breaker_backoff: Duration,

    /// Fusion weights for hybrid search (must sum to 1.0)
    pub weights: SearchWeights,

    /// Half-life of the recency decay signal
    pub recency_half_life: Duration,

    /// Time-to-live for cached search results
    pub search_cache_ttl: Duration,

    /// Reranker settings
    pub rerank: RerankConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("memvault");

        Self {
            data_dir,
            embed_base_url: "http://localhost:8090/v1".to_string(),
            embed_api_key: None,
            embed_model: "qwen/qwen3-embedding-4b".to_string(),
            embed_dimensions: 2560,
            max_embed_chars: 3500,
            reconciler_interval: Duration::from_secs(300),
            reconciler_batch_size: 2,
            reconciler_sub_batch: 2,
            reconciler_sleep_between: Duration::from_secs(1),
            breaker_threshold: 5,
            breaker_backoff: Duration::from_secs(300),
            weights: SearchWeights::default(),
            recency_half_life: Duration::from_secs(7 * 24 * 3600),
            search_cache_ttl: Duration::from_secs(300),
            rerank: RerankConfig::default(),
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Directory holding one SQLite database per tenant
    pub fn tenants_dir(&self) -> PathBuf {
        self.data_dir.join("tenants")
    }

    /// Path to a tenant's SQLite database
    pub fn tenant_db_path(&self, tenant: &TenantId) -> PathBuf {
        self.tenants_dir().join(format!("{}.sqlite", tenant))
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.tenants_dir())
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.embed_dimensions == 0 {
            return Err(Error::config("embed_dimensions must be non-zero"));
        }
        self.weights.validate()?;
        Ok(())
    }
}
