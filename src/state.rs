use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::types::TenantState;

/// Shared in-memory tenant table (§5). Keyed by tenant id; each entry is
/// behind its own mutex so the change-stream consumer and the error-queue
/// worker can both hold a reference to the table concurrently while still
/// serializing whole logical actions (add-or-update, reconcile-connectors,
/// delete tenant) against the same tenant.
#[derive(Clone, Default)]
pub struct TenantTable {
    inner: Arc<DashMap<String, Arc<Mutex<TenantState>>>>,
}

impl TenantTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Get (creating on first sighting, per §3's lifecycle note) the
    /// per-tenant lock. Callers must hold the returned guard for the
    /// duration of one logical action.
    pub fn entry(&self, tenant: &str) -> Arc<Mutex<TenantState>> {
        self.inner
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TenantState::new())))
            .clone()
    }

    /// True iff a tenant has been sighted at all (does not lock it).
    pub fn contains(&self, tenant: &str) -> bool {
        self.inner.contains_key(tenant)
    }

    /// Destroy tenant state after a successful namespace teardown (§3).
    pub fn remove(&self, tenant: &str) {
        self.inner.remove(tenant);
    }

    /// Every tenant id currently known, for the bootstrap mark-and-sweep
    /// pass (§4.6).
    pub fn tenant_ids(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn first_sighting_creates_default_state() {
        let table = TenantTable::new();
        assert!(!table.contains("acme"));
        let lock = table.entry("acme");
        let guard = lock.lock().await;
        assert!(!guard.created);
        assert_eq!(guard.deploy_version, -1);
        drop(guard);
        assert!(table.contains("acme"));
    }

    #[tokio::test]
    async fn remove_destroys_state() {
        let table = TenantTable::new();
        let _ = table.entry("acme");
        table.remove("acme");
        assert!(!table.contains("acme"));
    }
}
