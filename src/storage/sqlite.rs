//! SQLite storage for one tenant's memories, vectors and result cache

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::error::{Error, Result};
use crate::memory::{ImportReport, Memory, ScoredMemory, TenantStats};
use crate::storage::index::{BlobVectorIndex, VectorIndex};
use crate::tenant::TenantId;

const MEMORY_COLUMNS: &str =
    "id, text, category, importance, strength, created_at, updated_at, deleted_at, vector_rowid";

/// Durable record of memories, their vectors and the query cache for one
/// tenant. All three relations live in a single database so the
/// vector/memory relationship can be updated under one transaction.
pub struct MemoryStore {
    tenant: TenantId,
    conn: Mutex<Connection>,
    index: Box<dyn VectorIndex>,
    cache_ttl: Duration,
}

impl MemoryStore {
    /// Open (or create) the tenant database and initialize its schema.
    ///
    /// Failure here is the one process-fatal condition in the core and is
    /// reported as `Error::StoreInit`.
    pub fn open(
        tenant: TenantId,
        path: impl AsRef<Path>,
        dimensions: usize,
        cache_ttl: Duration,
    ) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| Error::store_init(format!("open {:?}: {e}", path.as_ref())))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| Error::store_init(format!("enable WAL: {e}")))?;
        conn.execute_batch(include_str!("schema.sql"))
            .map_err(|e| Error::store_init(format!("create schema: {e}")))?;

        Ok(Self {
            tenant,
            conn: Mutex::new(conn),
            index: Box::new(BlobVectorIndex::new(dimensions)),
            cache_ttl,
        })
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::storage(e.to_string()))
    }

    /// Insert a new memory with no vector attached.
    ///
    /// The memory is immediately visible to lexical search; semantic search
    /// sees it once the reconciler attaches its embedding.
    pub fn insert(&self, memory: &Memory) -> Result<()> {
        if memory.text.trim().is_empty() {
            return Err(Error::invalid_input("memory text must not be empty"));
        }

        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO memories (id, text, category, importance, strength, \
                 created_at, updated_at, deleted_at, vector_rowid) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
                params![
                    memory.id,
                    memory.text,
                    memory.category,
                    memory.importance.clamp(0.0, 1.0),
                    memory.strength.clamp(0.0, 1.0),
                    ts(&memory.created_at),
                    ts(&memory.updated_at),
                    memory.deleted_at.as_ref().map(ts),
                ],
            )?;
        }

        self.invalidate_cache()
    }

    /// Fetch a memory by id, including soft-deleted rows
    pub fn get(&self, id: &str) -> Result<Option<Memory>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
            params![id],
            row_to_memory,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Mark a memory deleted. Returns false if it was absent or already
    /// deleted. Invalidates the tenant cache on success.
    pub fn soft_delete(&self, id: &str) -> Result<bool> {
        let updated = {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE memories SET deleted_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND deleted_at IS NULL",
                params![ts(&Utc::now()), id],
            )?
        };

        if updated == 0 {
            return Ok(false);
        }
        self.invalidate_cache()?;
        Ok(true)
    }

    /// Count live memories still awaiting an embedding
    pub fn count_pending_vectors(&self) -> Result<u64> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE vector_rowid IS NULL AND deleted_at IS NULL",
            [],
            |row| row.get(0),
        )
        .map_err(Error::from)
    }

    /// Pending (id, text) pairs, oldest first so no memory starves
    pub fn list_pending_vectors(&self) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, text FROM memories \
             WHERE vector_rowid IS NULL AND deleted_at IS NULL \
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Transactionally insert a vector and point the memory at it.
    ///
    /// If the memory was deleted (or removed) since it was fetched as
    /// pending, the vector insert is rolled back and `Ok(false)` is
    /// returned: the delete wins, and the vector table does not grow.
    pub fn attach_vector(&self, memory_id: &str, vector: &[f32]) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let vector_ref = self.index.insert(&tx, vector)?;
        let updated = tx.execute(
            "UPDATE memories SET vector_rowid = ?1, updated_at = ?2 \
             WHERE id = ?3 AND deleted_at IS NULL",
            params![vector_ref, ts(&Utc::now()), memory_id],
        )?;

        if updated == 0 {
            tx.rollback()?;
            return Ok(false);
        }

        tx.commit()?;
        Ok(true)
    }

    /// All live memories (lexical candidate set)
    pub fn live_memories(&self) -> Result<Vec<Memory>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE deleted_at IS NULL ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([], row_to_memory)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Nearest-neighbor semantic scores for live memories, by memory id.
    /// Orphaned vectors (memory deleted after embedding) are filtered here.
    pub fn semantic_candidates(&self, query: &[f32], k: usize) -> Result<HashMap<String, f32>> {
        let conn = self.lock()?;
        let refs = self.index.nearest(&conn, query, k)?;
        if refs.is_empty() {
            return Ok(HashMap::new());
        }

        let mut by_ref: HashMap<i64, String> = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT vector_rowid, id FROM memories \
             WHERE deleted_at IS NULL AND vector_rowid IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (vector_ref, id) = row?;
            by_ref.insert(vector_ref, id);
        }

        Ok(refs
            .into_iter()
            .filter_map(|(vector_ref, similarity)| {
                by_ref.remove(&vector_ref).map(|id| (id, similarity))
            })
            .collect())
    }

    /// All non-deleted memories, oldest first
    pub fn export(&self) -> Result<Vec<Memory>> {
        self.live_memories()
    }

    /// Insert records preserving caller-supplied ids; an id that already
    /// exists is skipped, making re-imports idempotent.
    pub fn import(&self, memories: &[Memory]) -> Result<ImportReport> {
        let mut report = ImportReport::default();

        {
            let conn = self.lock()?;
            for memory in memories {
                if memory.id.trim().is_empty() || memory.text.trim().is_empty() {
                    warn!(tenant = %self.tenant, "skipping import record with empty id or text");
                    report.skipped += 1;
                    continue;
                }

                let exists: bool = conn
                    .query_row(
                        "SELECT 1 FROM memories WHERE id = ?1",
                        params![memory.id],
                        |_| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false);
                if exists {
                    report.skipped += 1;
                    continue;
                }

                conn.execute(
                    "INSERT INTO memories (id, text, category, importance, strength, \
                     created_at, updated_at, deleted_at, vector_rowid) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
                    params![
                        memory.id,
                        memory.text,
                        memory.category,
                        memory.importance.clamp(0.0, 1.0),
                        memory.strength.clamp(0.0, 1.0),
                        ts(&memory.created_at),
                        ts(&memory.updated_at),
                        memory.deleted_at.as_ref().map(ts),
                    ],
                )?;
                report.imported += 1;
            }
        }

        if report.imported > 0 {
            self.invalidate_cache()?;
        }
        Ok(report)
    }

    pub fn stats(&self) -> Result<TenantStats> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<u64> {
            conn.query_row(sql, [], |row| row.get(0)).map_err(Error::from)
        };

        Ok(TenantStats {
            total: count("SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL")?,
            vectorless: count(
                "SELECT COUNT(*) FROM memories WHERE vector_rowid IS NULL AND deleted_at IS NULL",
            )?,
            deleted: count("SELECT COUNT(*) FROM memories WHERE deleted_at IS NOT NULL")?,
            cache_entries: count("SELECT COUNT(*) FROM search_result_cache")?,
        })
    }

    /// Look up a cached result list. Entries past their TTL are dropped on
    /// the way out, never served.
    pub fn cache_lookup(
        &self,
        query_norm: &str,
        limit: usize,
        min_score: f32,
    ) -> Result<Option<Vec<ScoredMemory>>> {
        let conn = self.lock()?;
        let row: Option<(String, f64)> = conn
            .query_row(
                "SELECT results, created_at FROM search_result_cache \
                 WHERE query_norm = ?1 AND limit_val = ?2 AND min_score = ?3",
                params![query_norm, limit as i64, min_score as f64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((results, created_at)) = row else {
            return Ok(None);
        };

        if unix_now() - created_at > self.cache_ttl.as_secs_f64() {
            conn.execute(
                "DELETE FROM search_result_cache \
                 WHERE query_norm = ?1 AND limit_val = ?2 AND min_score = ?3",
                params![query_norm, limit as i64, min_score as f64],
            )?;
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(&results)?))
    }

    pub fn cache_store(
        &self,
        query_norm: &str,
        limit: usize,
        min_score: f32,
        results: &[ScoredMemory],
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO search_result_cache \
             (query_norm, limit_val, min_score, results, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                query_norm,
                limit as i64,
                min_score as f64,
                serde_json::to_string(results)?,
                unix_now(),
            ],
        )?;
        Ok(())
    }

    /// Coarse wipe of every cached result for this tenant. Idempotent and
    /// safe to call concurrently with lookups.
    pub fn invalidate_cache(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM search_result_cache", [])?;
        Ok(())
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    let deleted_at: Option<String> = row.get(7)?;

    Ok(Memory {
        id: row.get(0)?,
        text: row.get(1)?,
        category: row.get(2)?,
        importance: row.get(3)?,
        strength: row.get(4)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        deleted_at: deleted_at.as_deref().map(parse_ts).transpose()?,
        vector_ref: row.get(8)?,
    })
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SignalSet;
    use crate::tenant::Access;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, MemoryStore) {
        let dir = TempDir::new().unwrap();
        let tenant = TenantId::normalize("main", Access::Write).unwrap();
        let store = MemoryStore::open(
            tenant,
            dir.path().join("main.sqlite"),
            4,
            Duration::from_secs(60),
        )
        .unwrap();
        (dir, store)
    }

    fn scored(memory: &Memory, score: f32) -> ScoredMemory {
        ScoredMemory {
            memory: memory.clone(),
            score,
            signals: SignalSet::default(),
        }
    }

    #[test]
    fn insert_and_attach_lifecycle() {
        let (_dir, store) = test_store();
        let first = Memory::new("first fact", None, None);
        let second = Memory::new("second fact", None, Some(0.9));
        store.insert(&first).unwrap();
        store.insert(&second).unwrap();

        assert_eq!(store.count_pending_vectors().unwrap(), 2);
        let pending = store.list_pending_vectors().unwrap();
        assert_eq!(pending[0].0, first.id);

        assert!(store.attach_vector(&first.id, &[1.0, 0.0, 0.0, 0.0]).unwrap());
        assert_eq!(store.count_pending_vectors().unwrap(), 1);

        let reloaded = store.get(&first.id).unwrap().unwrap();
        assert!(reloaded.vector_ref.is_some());
        assert!(reloaded.updated_at >= reloaded.created_at);
    }

    #[test]
    fn attach_after_delete_is_a_noop() {
        let (_dir, store) = test_store();
        let memory = Memory::new("about to vanish", None, None);
        store.insert(&memory).unwrap();

        assert!(store.soft_delete(&memory.id).unwrap());
        assert!(!store.attach_vector(&memory.id, &[0.5, 0.5, 0.0, 0.0]).unwrap());

        let reloaded = store.get(&memory.id).unwrap().unwrap();
        assert!(reloaded.vector_ref.is_none());
        assert!(reloaded.is_deleted());

        // Second delete of the same id reports false
        assert!(!store.soft_delete(&memory.id).unwrap());
    }

    #[test]
    fn attach_rejects_wrong_dimensions() {
        let (_dir, store) = test_store();
        let memory = Memory::new("dim check", None, None);
        store.insert(&memory).unwrap();
        assert!(store.attach_vector(&memory.id, &[1.0, 2.0]).is_err());
    }

    #[test]
    fn import_is_idempotent_by_id() {
        let (_dir, store) = test_store();
        let memory: Memory =
            serde_json::from_str(r#"{"id": "test-123", "text": "idempotent", "category": "test"}"#)
                .unwrap();

        let first = store.import(std::slice::from_ref(&memory)).unwrap();
        assert_eq!(first.imported, 1);
        assert_eq!(first.skipped, 0);

        let second = store.import(std::slice::from_ref(&memory)).unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.skipped, 1);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 1);

        let ids: Vec<String> = store.export().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["test-123".to_string()]);
    }

    #[test]
    fn export_excludes_soft_deleted() {
        let (_dir, store) = test_store();
        let keep = Memory::new("keep me", None, None);
        let drop = Memory::new("drop me", None, None);
        store.insert(&keep).unwrap();
        store.insert(&drop).unwrap();
        store.soft_delete(&drop.id).unwrap();

        let exported = store.export().unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].id, keep.id);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.deleted, 1);
    }

    #[test]
    fn cache_keys_include_min_score() {
        let (_dir, store) = test_store();
        let memory = Memory::new("cached", None, None);
        let results = vec![scored(&memory, 0.8)];

        store.cache_store("python", 10, 0.0, &results).unwrap();
        store.cache_store("python", 10, 0.5, &[]).unwrap();

        let low = store.cache_lookup("python", 10, 0.0).unwrap().unwrap();
        assert_eq!(low.len(), 1);
        let high = store.cache_lookup("python", 10, 0.5).unwrap().unwrap();
        assert!(high.is_empty());
        assert_eq!(store.stats().unwrap().cache_entries, 2);
    }

    #[test]
    fn cache_entries_expire_and_writes_invalidate() {
        let dir = TempDir::new().unwrap();
        let tenant = TenantId::normalize("main", Access::Write).unwrap();
        let store = MemoryStore::open(
            tenant,
            dir.path().join("main.sqlite"),
            4,
            Duration::from_secs(0),
        )
        .unwrap();

        let memory = Memory::new("expiring", None, None);
        store.cache_store("q", 5, 0.0, &[scored(&memory, 0.4)]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(store.cache_lookup("q", 5, 0.0).unwrap().is_none());

        store.cache_store("q", 5, 0.0, &[scored(&memory, 0.4)]).unwrap();
        store.insert(&memory).unwrap();
        assert_eq!(store.stats().unwrap().cache_entries, 0);
    }
}
