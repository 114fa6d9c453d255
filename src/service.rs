//! The memory service context object.
//!
//! Owns the tenant pool, search engine, embedding provider, reranker and
//! reconciler handle; constructed once at process start and passed to the
//! transport layer. There are no module-level singletons.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::embedding::{EmbeddingProvider, HttpEmbeddingProvider};
use crate::error::{Error, Result};
use crate::memory::{ImportReport, Memory, ScoredMemory, TenantStats};
use crate::reconciler::{EmbedReconciler, ReconcilerHandle};
use crate::rerank::Reranker;
use crate::search::{HybridSearchEngine, SearchWeights};
use crate::tenant::{Access, TenantId, TenantPool};

/// Entry point for every core operation exposed to the transport layer
pub struct MemoryService {
    config: Config,
    pool: Arc<TenantPool>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Arc<Reranker>,
    engine: HybridSearchEngine,
    reconciler: Mutex<Option<ReconcilerHandle>>,
}

impl MemoryService {
    /// Create a service backed by the configured HTTP embedding endpoint
    pub fn new(config: Config) -> Result<Self> {
        let embedder = Arc::new(HttpEmbeddingProvider::new(&config));
        Self::with_embedder(config, embedder)
    }

    /// Create a service with a custom embedding provider
    pub fn with_embedder(config: Config, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let pool = Arc::new(TenantPool::new(config.clone()));
        let reranker = Arc::new(Reranker::new(config.rerank.clone()));
        let engine = HybridSearchEngine::new(
            embedder.clone(),
            reranker.clone(),
            config.weights,
            config.recency_half_life,
        );

        Ok(Self {
            config,
            pool,
            embedder,
            reranker,
            engine,
            reconciler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Store a new memory. The text is persisted immediately; its vector is
    /// attached later by the reconciler.
    pub fn store(
        &self,
        agent: &str,
        text: &str,
        category: Option<String>,
        importance: Option<f32>,
    ) -> Result<Memory> {
        let tenant = TenantId::normalize(agent, Access::Write)?;
        if text.trim().is_empty() {
            return Err(Error::invalid_input("text must not be empty"));
        }

        let store = self.pool.get(&tenant)?;
        let memory = Memory::new(text, category, importance);
        store.insert(&memory)?;
        debug!(tenant = %tenant, memory = %memory.id, "stored memory");
        Ok(memory)
    }

    /// Rank a tenant's memories against a query by hybrid relevance.
    /// A tenant that has never been written to yields no results.
    pub async fn recall(
        &self,
        agent: &str,
        query: &str,
        limit: usize,
        min_score: f32,
        weights: Option<SearchWeights>,
    ) -> Result<Vec<ScoredMemory>> {
        let tenant = TenantId::normalize(agent, Access::Read)?;
        let Some(store) = self.pool.get_existing(&tenant)? else {
            return Ok(Vec::new());
        };
        self.engine
            .recall(&store, query, limit, min_score.clamp(0.0, 1.0), weights)
            .await
    }

    /// Soft-delete a memory; false if it was absent or already deleted
    pub fn delete(&self, agent: &str, id: &str) -> Result<bool> {
        let tenant = TenantId::normalize(agent, Access::Write)?;
        match self.pool.get_existing(&tenant)? {
            Some(store) => store.soft_delete(id),
            None => Ok(false),
        }
    }

    /// All non-deleted memories for a tenant
    pub fn export(&self, agent: &str) -> Result<Vec<Memory>> {
        let tenant = TenantId::normalize(agent, Access::Read)?;
        match self.pool.get_existing(&tenant)? {
            Some(store) => store.export(),
            None => Ok(Vec::new()),
        }
    }

    /// Bulk-insert memories, skipping ids that already exist
    pub fn import(&self, agent: &str, memories: &[Memory]) -> Result<ImportReport> {
        let tenant = TenantId::normalize(agent, Access::Write)?;
        self.pool.get(&tenant)?.import(memories)
    }

    pub fn stats(&self, agent: &str) -> Result<TenantStats> {
        let tenant = TenantId::normalize(agent, Access::Read)?;
        match self.pool.get_existing(&tenant)? {
            Some(store) => store.stats(),
            None => Ok(TenantStats::default()),
        }
    }

    /// Start the background reconciler; a no-op if it is already running
    pub async fn start_reconciler(&self) {
        let mut slot = self.reconciler.lock().await;
        if slot.is_some() {
            debug!("embed reconciler already running");
            return;
        }
        let reconciler =
            EmbedReconciler::new(self.pool.clone(), self.embedder.clone(), &self.config);
        *slot = Some(reconciler.start());
    }

    /// Stop the reconciler: cooperative exit within `timeout`, then abort
    pub async fn stop_reconciler(&self, timeout: Duration) {
        if let Some(handle) = self.reconciler.lock().await.take() {
            handle.stop(timeout).await;
        }
    }

    /// Eagerly load the reranker model; returns whether it is ready
    pub async fn warmup_reranker(&self) -> bool {
        self.reranker.warmup().await
    }

    /// Stop background work and release every tenant store
    pub async fn shutdown(&self, timeout: Duration) {
        self.stop_reconciler(timeout).await;
        self.pool.close_all();
    }
}
