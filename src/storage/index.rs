//! Vector index abstraction over the tenant database.
//!
//! `MemoryStore` owns the transaction logic; the index only knows how to
//! insert a vector inside a caller-provided transaction and how to find
//! nearest neighbors. Swapping in a different index technology (e.g. a
//! virtual-table extension) only requires a new implementation here.

use rusqlite::{params, Connection, Transaction};

use crate::error::{Error, Result};

/// Minimal interface to the vector-similarity index
pub trait VectorIndex: Send + Sync {
    /// Insert a vector inside the caller's transaction, returning its ref
    fn insert(&self, tx: &Transaction<'_>, vector: &[f32]) -> Result<i64>;

    /// Top-k nearest vectors as (ref, similarity in [0,1]), best first.
    /// May return refs whose memory was deleted; callers filter those.
    fn nearest(&self, conn: &Connection, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>>;
}

/// Brute-force index over the `memory_vectors` blob table
pub struct BlobVectorIndex {
    dimensions: usize,
}

impl BlobVectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl VectorIndex for BlobVectorIndex {
    fn insert(&self, tx: &Transaction<'_>, vector: &[f32]) -> Result<i64> {
        if vector.len() != self.dimensions {
            return Err(Error::embedding(format!(
                "vector dimension mismatch: expected {}, got {}",
                self.dimensions,
                vector.len()
            )));
        }

        tx.execute(
            "INSERT INTO memory_vectors (embedding) VALUES (?1)",
            params![vector_to_blob(vector)],
        )?;
        Ok(tx.last_insert_rowid())
    }

    fn nearest(&self, conn: &Connection, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>> {
        if query.len() != self.dimensions || k == 0 {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare("SELECT rowid, embedding FROM memory_vectors")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut scored = Vec::new();
        for row in rows {
            let (rowid, blob) = row?;
            let vector = blob_to_vector(&blob);
            if vector.len() != self.dimensions {
                continue;
            }
            scored.push((rowid, cosine_similarity(query, &vector)));
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

/// Encode a vector as little-endian f32 bytes
pub(crate) fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode little-endian f32 bytes back into a vector
pub(crate) fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity clamped to [0,1] so closer always means higher
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}
