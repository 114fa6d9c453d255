//! Hybrid retrieval: fused semantic/lexical/recency/strength ranking

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::memory::{ScoredMemory, SignalSet};
use crate::rerank::Reranker;
use crate::storage::MemoryStore;

/// Minimum number of nearest neighbors fetched regardless of `limit`
const MIN_CANDIDATE_POOL: usize = 32;

/// Relative weight of the rerank signal when blending with fused scores
const RERANK_BLEND: f32 = 0.5;

/// Fusion weights; must sum to 1.0
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchWeights {
    pub semantic: f32,
    pub keyword: f32,
    pub recency: f32,
    pub strength: f32,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            semantic: 0.55,
            keyword: 0.25,
            recency: 0.10,
            strength: 0.10,
        }
    }
}

impl SearchWeights {
    pub fn validate(&self) -> Result<()> {
        let parts = [self.semantic, self.keyword, self.recency, self.strength];
        if parts.iter().any(|w| !(0.0..=1.0).contains(w)) {
            return Err(Error::config("search weights must each be in [0,1]"));
        }
        let sum: f32 = parts.iter().sum();
        if (sum - 1.0).abs() > 1e-3 {
            return Err(Error::config(format!(
                "search weights must sum to 1.0 (got {sum:.4})"
            )));
        }
        Ok(())
    }

    fn fuse(&self, signals: &SignalSet) -> f32 {
        let fused = self.semantic * signals.semantic
            + self.keyword * signals.keyword
            + self.recency * signals.recency
            + self.strength * signals.strength;
        fused.clamp(0.0, 1.0)
    }
}

/// Case-fold and whitespace-collapse a query so distinct surface forms that
/// normalize identically share one cache entry
pub fn normalize_query(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Normalized term overlap in [0,1], with a full-substring shortcut
fn keyword_score(query_norm: &str, text: &str) -> f32 {
    if query_norm.is_empty() {
        return 0.0;
    }
    let text_lower = text.to_lowercase();
    if text_lower.contains(query_norm) {
        return 1.0;
    }

    let terms: Vec<&str> = query_norm.split(' ').collect();
    let matched = terms.iter().filter(|t| text_lower.contains(**t)).count();
    matched as f32 / terms.len() as f32
}

/// Exponential half-life decay of memory age, in (0,1]
fn recency_score(created_at: DateTime<Utc>, now: DateTime<Utc>, half_life: Duration) -> f32 {
    let age = (now - created_at).num_seconds().max(0) as f64;
    let half_life = half_life.as_secs_f64().max(1.0);
    (0.5f64.powf(age / half_life) as f32).clamp(0.0, 1.0)
}

/// Fused desc, then recency desc, then id asc for determinism
fn rank_cmp(a: &ScoredMemory, b: &ScoredMemory) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.signals
                .recency
                .partial_cmp(&a.signals.recency)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.memory.id.cmp(&b.memory.id))
}

/// Fuses semantic, lexical, recency and strength signals into a ranked,
/// cached result list, with an optional second-stage rerank of the top slice
pub struct HybridSearchEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Arc<Reranker>,
    weights: SearchWeights,
    recency_half_life: Duration,
}

impl HybridSearchEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Arc<Reranker>,
        weights: SearchWeights,
        recency_half_life: Duration,
    ) -> Self {
        Self {
            embedder,
            reranker,
            weights,
            recency_half_life,
        }
    }

    /// Rank a tenant's memories against a query.
    ///
    /// Results are cached per (normalized query, limit, min_score) in the
    /// tenant's own database; calls that override the configured weights
    /// bypass the cache since the key does not capture them.
    pub async fn recall(
        &self,
        store: &MemoryStore,
        query: &str,
        limit: usize,
        min_score: f32,
        weights: Option<SearchWeights>,
    ) -> Result<Vec<ScoredMemory>> {
        let query_norm = normalize_query(query);
        if query_norm.is_empty() {
            return Err(Error::invalid_input("query must not be empty"));
        }
        let limit = limit.max(1);
        let cacheable = weights.is_none();
        let weights = weights.unwrap_or(self.weights);
        weights.validate()?;

        if cacheable {
            if let Some(cached) = store.cache_lookup(&query_norm, limit, min_score)? {
                debug!(tenant = %store.tenant(), query = %query_norm, "search cache hit");
                return Ok(cached);
            }
        }

        // A memory without a vector still ranks via its other signals, so
        // every live memory is a candidate; the NN pass only contributes the
        // semantic component.
        let mut degraded = false;
        let semantic = match self.embedder.embed(&query_norm).await {
            Ok(vector) => {
                let pool = (limit * 4).max(MIN_CANDIDATE_POOL);
                store.semantic_candidates(&vector, pool)?
            }
            Err(e) => {
                warn!(tenant = %store.tenant(), "query embedding failed, lexical-only recall: {e}");
                degraded = true;
                Default::default()
            }
        };

        let now = Utc::now();
        let mut results: Vec<ScoredMemory> = Vec::new();
        for memory in store.live_memories()? {
            let signals = SignalSet {
                semantic: semantic.get(&memory.id).copied().unwrap_or(0.0),
                keyword: keyword_score(&query_norm, &memory.text),
                recency: recency_score(memory.created_at, now, self.recency_half_life),
                strength: memory.strength.clamp(0.0, 1.0),
            };
            let score = weights.fuse(&signals);
            if score >= min_score {
                results.push(ScoredMemory {
                    memory,
                    score,
                    signals,
                });
            }
        }

        results.sort_by(rank_cmp);
        results.truncate(limit);

        self.apply_rerank(&query_norm, &mut results).await;

        // A lexical-only fallback is recomputed on the next call rather than
        // served for the full TTL after the provider recovers.
        if cacheable && !degraded {
            store.cache_store(&query_norm, limit, min_score, &results)?;
        }
        Ok(results)
    }

    /// Blend reranker scores into the top slice, leaving the remainder in
    /// fused order. A missing/failed reranker leaves the order untouched.
    async fn apply_rerank(&self, query_norm: &str, results: &mut [ScoredMemory]) {
        if results.is_empty() || !self.reranker.available() {
            return;
        }

        let slice_len = results.len().min(self.reranker.top_k());
        let slice = &mut results[..slice_len];
        let docs: Vec<String> = slice.iter().map(|r| r.memory.text.clone()).collect();
        let ids: Vec<String> = slice.iter().map(|r| r.memory.id.clone()).collect();

        let scores = self.reranker.score(query_norm, &docs, &ids).await;
        if scores.len() != slice.len() {
            return;
        }

        for (result, rerank) in slice.iter_mut().zip(scores) {
            result.score =
                ((1.0 - RERANK_BLEND) * result.score + RERANK_BLEND * rerank).clamp(0.0, 1.0);
        }
        slice.sort_by(rank_cmp);
    }
}
