//! Memory record types and their retrieval annotations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_category() -> String {
    "general".to_string()
}

fn default_importance() -> f32 {
    0.5
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// One stored fact for a tenant.
///
/// Created with `vector_ref = None`; the reconciler attaches the embedding
/// later. Soft-deleted records keep their row (for audit/export tooling)
/// but are excluded from every read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Unique per tenant; caller-assignable on import, generated otherwise
    pub id: String,

    /// The memory content (non-empty)
    pub text: String,

    #[serde(default = "default_category")]
    pub category: String,

    /// Importance in [0,1]
    #[serde(default = "default_importance")]
    pub importance: f32,

    /// Reinforcement weight in [0,1]; defaults from importance
    #[serde(default = "default_importance")]
    pub strength: f32,

    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,

    /// Soft-delete marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    /// Rowid of the attached vector, if one has been embedded
    #[serde(skip)]
    pub vector_ref: Option<i64>,
}

impl Memory {
    /// Create a new memory with a generated id and no vector yet
    pub fn new(text: impl Into<String>, category: Option<String>, importance: Option<f32>) -> Self {
        let importance = importance.unwrap_or_else(default_importance).clamp(0.0, 1.0);
        let created = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            category: category.unwrap_or_else(default_category),
            importance,
            strength: importance,
            created_at: created,
            updated_at: created,
            deleted_at: None,
            vector_ref: None,
        }
    }

    /// Whether this memory has been soft-deleted
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Per-signal breakdown of a fused relevance score
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SignalSet {
    pub semantic: f32,
    pub keyword: f32,
    pub recency: f32,
    pub strength: f32,
}

/// A memory annotated with its fused relevance score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub memory: Memory,

    /// Fused (possibly rerank-blended) score in [0,1]
    pub score: f32,

    pub signals: SignalSet,
}

/// Counts reported by `stats`
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TenantStats {
    /// Live (non-deleted) memories
    pub total: u64,

    /// Live memories still awaiting an embedding
    pub vectorless: u64,

    /// Soft-deleted rows retained on disk
    pub deleted: u64,

    /// Cached search results currently stored
    pub cache_entries: u64,
}

/// Outcome of a bulk import
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}
