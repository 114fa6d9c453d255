//! Tenant identifiers and the per-tenant store pool

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::MemoryStore;

/// Default tenant used when the caller omits an agent id
pub const DEFAULT_TENANT: &str = "main";

/// Reserved read-side aggregate name; never a valid store target
pub const RESERVED_ALL: &str = "all";

const MAX_TENANT_LEN: usize = 64;

/// Whether an identifier is being normalized for a read or a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// A validated tenant slug: lowercase letters, digits and hyphens only.
///
/// The validation rules double as path-safety rules since the slug becomes
/// a file name under the tenants directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    /// Normalize and validate a raw identifier.
    ///
    /// Lowercases and trims, maps empty input to the default tenant, and
    /// rejects anything outside `[a-z0-9-]` (which also rules out path
    /// separators and traversal sequences). The reserved name `all` is
    /// rejected for both accesses; writes get the more specific message.
    pub fn normalize(raw: &str, access: Access) -> Result<Self> {
        let slug = raw.trim().to_ascii_lowercase();
        if slug.is_empty() {
            return Ok(Self(DEFAULT_TENANT.to_string()));
        }

        if slug == RESERVED_ALL {
            return Err(match access {
                Access::Write => Error::invalid_input("cannot store to 'all': reserved name"),
                Access::Read => Error::invalid_input("agent id 'all' is reserved"),
            });
        }

        if slug.len() > MAX_TENANT_LEN
            || !slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::invalid_input(format!("invalid agent id: {raw:?}")));
        }

        Ok(Self(slug))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct PoolState {
    stores: HashMap<TenantId, Arc<MemoryStore>>,
    closed: bool,
}

/// Owns one lazily-created `MemoryStore` per tenant for the process lifetime
pub struct TenantPool {
    config: Config,
    state: Mutex<PoolState>,
}

impl TenantPool {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                stores: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Return the tenant's store, opening and initializing it on first use
    pub fn get(&self, tenant: &TenantId) -> Result<Arc<MemoryStore>> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| Error::storage(e.to_string()))?;

        if state.closed {
            return Err(Error::storage("tenant pool is closed"));
        }

        if let Some(store) = state.stores.get(tenant) {
            return Ok(store.clone());
        }

        self.config.ensure_dirs()?;
        let store = Arc::new(MemoryStore::open(
            tenant.clone(),
            self.config.tenant_db_path(tenant),
            self.config.embed_dimensions,
            self.config.search_cache_ttl,
        )?);
        debug!(tenant = %tenant, "opened tenant store");
        state.stores.insert(tenant.clone(), store.clone());
        Ok(store)
    }

    /// Return the tenant's store only if it already exists: open in this
    /// process, or present on disk from an earlier run. Read paths use this
    /// so probing an unknown tenant never materializes an empty database
    /// (which would then join every reconciler sweep).
    pub fn get_existing(&self, tenant: &TenantId) -> Result<Option<Arc<MemoryStore>>> {
        {
            let state = self
                .state
                .lock()
                .map_err(|e| Error::storage(e.to_string()))?;
            if state.closed {
                return Err(Error::storage("tenant pool is closed"));
            }
            if let Some(store) = state.stores.get(tenant) {
                return Ok(Some(store.clone()));
            }
        }

        if !self.config.tenant_db_path(tenant).exists() {
            return Ok(None);
        }
        self.get(tenant).map(Some)
    }

    /// Enumerate all known tenants: open stores plus databases on disk.
    ///
    /// Used by the reconciler to sweep every tenant each cycle, so it must
    /// see tenants from previous process runs too.
    pub fn list_tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = Vec::new();

        if let Ok(state) = self.state.lock() {
            tenants.extend(state.stores.keys().cloned());
        }

        if let Ok(entries) = std::fs::read_dir(self.config.tenants_dir()) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("sqlite") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if let Ok(tenant) = TenantId::normalize(stem, Access::Read) {
                    if !tenants.contains(&tenant) {
                        tenants.push(tenant);
                    }
                }
            }
        }

        tenants.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        tenants
    }

    /// Release every store. No new stores may be created afterwards.
    pub fn close_all(&self) {
        if let Ok(mut state) = self.state.lock() {
            let count = state.stores.len();
            state.stores.clear();
            state.closed = true;
            info!(stores = count, "tenant pool closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::with_data_dir(dir);
        config.embed_dimensions = 4;
        config
    }

    #[test]
    fn normalize_accepts_valid_slugs() {
        for raw in ["main", "devops", "my-agent-1", "  Mixed-Case  "] {
            let tenant = TenantId::normalize(raw, Access::Write).unwrap();
            assert_eq!(tenant.as_str(), raw.trim().to_ascii_lowercase());
        }
    }

    #[test]
    fn normalize_maps_empty_to_default() {
        let tenant = TenantId::normalize("", Access::Write).unwrap();
        assert_eq!(tenant.as_str(), DEFAULT_TENANT);
        let tenant = TenantId::normalize("   ", Access::Read).unwrap();
        assert_eq!(tenant.as_str(), DEFAULT_TENANT);
    }

    #[test]
    fn normalize_rejects_traversal_and_separators() {
        for raw in ["../etc", "foo/bar", "a\\b", "a.b", "..", "a b"] {
            let err = TenantId::normalize(raw, Access::Write).unwrap_err();
            assert!(err.is_validation(), "{raw} should be rejected");
        }
    }

    #[test]
    fn normalize_rejects_reserved_all() {
        let err = TenantId::normalize("all", Access::Write).unwrap_err();
        assert!(err.to_string().to_lowercase().contains("cannot store to 'all'"));
        assert!(TenantId::normalize("ALL", Access::Read).is_err());
    }

    #[test]
    fn pool_reuses_store_and_lists_tenants() {
        let dir = tempdir().unwrap();
        let pool = TenantPool::new(test_config(dir.path()));

        let a = TenantId::normalize("alpha", Access::Write).unwrap();
        let first = pool.get(&a).unwrap();
        let second = pool.get(&a).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let b = TenantId::normalize("beta", Access::Write).unwrap();
        pool.get(&b).unwrap();

        let tenants = pool.list_tenants();
        assert_eq!(
            tenants.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            vec!["alpha", "beta"]
        );
    }

    #[test]
    fn get_existing_never_creates_a_database() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let pool = TenantPool::new(config.clone());

        let ghost = TenantId::normalize("ghost", Access::Read).unwrap();
        assert!(pool.get_existing(&ghost).unwrap().is_none());
        assert!(!config.tenant_db_path(&ghost).exists());

        pool.get(&ghost).unwrap();
        assert!(pool.get_existing(&ghost).unwrap().is_some());

        // A database left on disk by an earlier process is picked up
        let fresh = TenantPool::new(config);
        assert!(fresh.get_existing(&ghost).unwrap().is_some());
    }

    #[test]
    fn closed_pool_rejects_new_stores() {
        let dir = tempdir().unwrap();
        let pool = TenantPool::new(test_config(dir.path()));
        pool.close_all();

        let tenant = TenantId::normalize("main", Access::Write).unwrap();
        assert!(pool.get(&tenant).is_err());
    }
}
