//! Embedding generation via an external OpenAI-compatible endpoint

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::Config;
use crate::error::{Error, Result};

/// Seam between the core and whatever produces embeddings.
///
/// Implementations must return exactly one vector per input text, in order;
/// a short response is surfaced as an error, never as partial results.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, one vector per text
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Dimensionality of the vectors this provider returns
    fn dimensions(&self) -> usize;
}

/// Embedding provider backed by a `POST {base}/embeddings` endpoint
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    max_chars: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.embed_base_url.trim_end_matches('/').to_string(),
            api_key: config.embed_api_key.clone(),
            model: config.embed_model.clone(),
            dimensions: config.embed_dimensions,
            max_chars: config.max_embed_chars,
        }
    }

    /// Truncate to the configured character cap before sending
    fn truncate(&self, text: &str) -> String {
        text.chars().take(self.max_chars).collect()
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::embedding("no embedding returned"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let input: Vec<String> = texts.iter().map(|t| self.truncate(t)).collect();
        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&json!({ "input": input, "model": self.model }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::embedding(format!("embedding request failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::embedding(format!("embedding endpoint error: {e}")))?;

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::embedding(format!("invalid embedding response: {e}")))?;

        let mut rows = body.data;
        rows.sort_by_key(|row| row.index);
        if rows.len() != texts.len() {
            return Err(Error::embedding(format!(
                "embedding count mismatch: got {} for {} texts",
                rows.len(),
                texts.len()
            )));
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let mut vector = row.embedding;
                vector.truncate(self.dimensions);
                vector
            })
            .collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
