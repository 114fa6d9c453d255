//! Cross-encoder reranker for high-precision top-K ordering.
//!
//! Optional-by-design: if the reranker is disabled or its model fails to
//! load, `score` returns an empty list and callers keep the fused order.
//! Scores are sigmoid-normalized to [0,1] for easier blending.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Reranker settings. `model` accepts the presets fast|balanced|quality.
#[derive(Debug, Clone)]
pub struct RerankConfig {
    pub enabled: bool,
    pub model: String,
    pub top_k: usize,
    pub cache_ttl: Duration,
    pub cache_max: usize,
    pub max_doc_chars: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: "quality".to_string(),
            top_k: 12,
            cache_ttl: Duration::from_secs(600),
            cache_max: 5000,
            max_doc_chars: 1000,
        }
    }
}

fn resolve_preset(value: &str) -> RerankerModel {
    match value.trim().to_lowercase().as_str() {
        "fast" => RerankerModel::JINARerankerV1TurboEn,
        "balanced" => RerankerModel::BGERerankerBase,
        _ => RerankerModel::BGERerankerV2M3,
    }
}

enum ModelState {
    Unloaded,
    Ready(TextRerank),
    Failed,
}

/// TTL score cache with oldest-20% overflow eviction (cheaper than strict
/// LRU and good enough to bound memory)
struct ScoreCache {
    map: HashMap<String, (f32, Instant)>,
    ttl: Duration,
    max: usize,
}

impl ScoreCache {
    fn new(ttl: Duration, max: usize) -> Self {
        Self {
            map: HashMap::new(),
            ttl,
            max: max.max(1),
        }
    }

    fn get(&mut self, key: &str) -> Option<f32> {
        let (score, inserted) = *self.map.get(key)?;
        if inserted.elapsed() > self.ttl {
            self.map.remove(key);
            return None;
        }
        Some(score)
    }

    fn put(&mut self, key: String, score: f32) {
        self.map.insert(key, (score, Instant::now()));
        if self.map.len() > self.max {
            let drop_count = (self.max / 5).max(1);
            let mut entries: Vec<(String, Instant)> = self
                .map
                .iter()
                .map(|(k, (_, at))| (k.clone(), *at))
                .collect();
            entries.sort_by_key(|(_, at)| *at);
            for (key, _) in entries.into_iter().take(drop_count) {
                self.map.remove(&key);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Lazy-loaded cross-encoder with serialized inference.
///
/// One async lock guards both model loading and inference: the load is
/// single-flight, and at most one inference runs at a time no matter how
/// many recall calls are in flight. Load failures stick until `warmup`
/// is called again.
pub struct Reranker {
    config: RerankConfig,
    model: Mutex<ModelState>,
    load_failed: AtomicBool,
    cache: StdMutex<ScoreCache>,
}

impl Reranker {
    pub fn new(config: RerankConfig) -> Self {
        let cache = ScoreCache::new(config.cache_ttl, config.cache_max);
        Self {
            config,
            model: Mutex::new(ModelState::Unloaded),
            load_failed: AtomicBool::new(false),
            cache: StdMutex::new(cache),
        }
    }

    /// Capability flag; callers branch on this rather than on errors
    pub fn available(&self) -> bool {
        self.config.enabled && !self.load_failed.load(Ordering::Relaxed)
    }

    pub fn top_k(&self) -> usize {
        self.config.top_k.max(1)
    }

    /// Load the model eagerly, clearing a cached load failure first.
    /// Safe to call repeatedly; returns whether the model is ready.
    pub async fn warmup(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.load_failed.store(false, Ordering::Relaxed);

        let mut state = self.model.lock().await;
        if matches!(*state, ModelState::Failed) {
            *state = ModelState::Unloaded;
        }
        self.ensure_loaded(&mut state)
    }

    fn ensure_loaded(&self, state: &mut ModelState) -> bool {
        if let ModelState::Unloaded = state {
            let preset = resolve_preset(&self.config.model);
            info!(model = ?preset, "loading cross-encoder reranker model");
            match TextRerank::try_new(
                RerankInitOptions::new(preset).with_show_download_progress(false),
            ) {
                Ok(model) => {
                    info!(top_k = self.config.top_k, "cross-encoder reranker ready");
                    *state = ModelState::Ready(model);
                }
                Err(e) => {
                    warn!("cross-encoder load failed: {e}");
                    *state = ModelState::Failed;
                    self.load_failed.store(true, Ordering::Relaxed);
                }
            }
        }
        matches!(state, ModelState::Ready(_))
    }

    fn cache_key(&self, query: &str, doc_id: &str, text: &str) -> String {
        let discriminant = if doc_id.is_empty() { text } else { doc_id };
        format!("{query}\u{1f}{discriminant}")
    }

    /// Normalized scores in [0,1] for the first `top_k` documents.
    ///
    /// An empty result means the reranker is unavailable or scoring
    /// failed; it is never an error.
    pub async fn score(&self, query: &str, docs: &[String], doc_ids: &[String]) -> Vec<f32> {
        if docs.is_empty() || !self.available() {
            return Vec::new();
        }

        let cut = docs.len().min(self.top_k());
        let truncated: Vec<String> = docs[..cut]
            .iter()
            .map(|d| d.chars().take(self.config.max_doc_chars).collect())
            .collect();
        let keys: Vec<String> = truncated
            .iter()
            .enumerate()
            .map(|(i, text)| {
                self.cache_key(query, doc_ids.get(i).map(String::as_str).unwrap_or(""), text)
            })
            .collect();

        let mut scores: Vec<Option<f32>> = vec![None; cut];
        let mut pending: Vec<usize> = Vec::new();
        if let Ok(mut cache) = self.cache.lock() {
            for (i, key) in keys.iter().enumerate() {
                match cache.get(key) {
                    Some(score) => scores[i] = Some(score),
                    None => pending.push(i),
                }
            }
        } else {
            pending = (0..cut).collect();
        }

        if !pending.is_empty() {
            let mut state = self.model.lock().await;
            if !self.ensure_loaded(&mut state) {
                return Vec::new();
            }
            let ModelState::Ready(model) = &mut *state else {
                return Vec::new();
            };

            let pairs: Vec<&str> = pending.iter().map(|&i| truncated[i].as_str()).collect();
            match model.rerank(query, pairs, false, None) {
                Ok(results) => {
                    for result in results {
                        let Some(&slot) = pending.get(result.index) else {
                            continue;
                        };
                        let normalized = sigmoid(result.score);
                        scores[slot] = Some(normalized);
                        if let Ok(mut cache) = self.cache.lock() {
                            cache.put(keys[slot].clone(), normalized);
                        }
                    }
                }
                Err(e) => {
                    warn!("cross-encoder scoring failed: {e}");
                    return Vec::new();
                }
            }
        }

        scores.into_iter().map(|s| s.unwrap_or(0.0)).collect()
    }
}

/// Numerically stable logistic transform: no overflow for large-magnitude
/// inputs in either direction
fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_is_bounded_and_stable() {
        for x in [-1.0e4f32, -80.0, -1.0, 0.0, 1.0, 80.0, 1.0e4] {
            let y = sigmoid(x);
            assert!(y.is_finite());
            assert!((0.0..=1.0).contains(&y), "sigmoid({x}) = {y}");
        }
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(5.0) > 0.99);
        assert!(sigmoid(-5.0) < 0.01);
    }

    #[test]
    fn score_cache_expires_and_evicts() {
        let mut cache = ScoreCache::new(Duration::from_secs(60), 10);
        cache.put("a".to_string(), 0.7);
        assert_eq!(cache.get("a"), Some(0.7));

        for i in 0..11 {
            cache.put(format!("k{i}"), 0.1);
        }
        assert!(cache.len() <= 11);

        let mut expired = ScoreCache::new(Duration::from_millis(0), 10);
        expired.put("b".to_string(), 0.3);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(expired.get("b"), None);
    }

    #[tokio::test]
    async fn disabled_reranker_is_a_noop() {
        let reranker = Reranker::new(RerankConfig::default());
        assert!(!reranker.available());
        let scores = reranker
            .score("query", &["doc".to_string()], &["id".to_string()])
            .await;
        assert!(scores.is_empty());
        assert!(!reranker.warmup().await);
    }

    #[test]
    fn presets_resolve() {
        assert!(matches!(
            resolve_preset("fast"),
            RerankerModel::JINARerankerV1TurboEn
        ));
        assert!(matches!(
            resolve_preset("balanced"),
            RerankerModel::BGERerankerBase
        ));
        assert!(matches!(
            resolve_preset("anything-else"),
            RerankerModel::BGERerankerV2M3
        ));
    }
}
