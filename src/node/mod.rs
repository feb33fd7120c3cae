//! Process-wide cache of the backend-assigned node identity.

use crate::db::{DbError, IdentityStore, NodeIdentity};

use std::sync::{Arc, RwLock};

/// Read-mostly snapshot of the node identity shared by the publisher and the
/// heartbeat reporter.
///
/// Once resolved, the identity is monotonic: updates may change fields but
/// never clear them.
pub struct NodeIdentityCache {
    current: RwLock<NodeIdentity>,
    store: Arc<dyn IdentityStore>,
}

impl NodeIdentityCache {
    /// Create a cache primed from durable storage, if a record exists.
    pub fn load(store: Arc<dyn IdentityStore>) -> Self {
        let current = match store.load_identity() {
            Ok(Some(identity)) => {
                tracing::info!(
                    node_id = identity.node_id,
                    node_ip = %identity.node_ip,
                    "Loaded node identity from storage"
                );
                identity
            }
            Ok(None) => NodeIdentity::default(),
            Err(e) => {
                tracing::warn!("Failed to load node identity, starting unresolved: {}", e);
                NodeIdentity::default()
            }
        };

        Self {
            current: RwLock::new(current),
            store,
        }
    }

    pub fn get(&self) -> NodeIdentity {
        self.current.read().unwrap().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.current.read().unwrap().is_resolved()
    }

    /// Merge an identity reported by the backend into the cache.
    ///
    /// Returns `Ok(true)` when anything changed, in which case the merged
    /// record is also written to storage. Empty or zero fields in `update`
    /// never overwrite known values. A storage failure is reported but the
    /// in-memory identity is still updated.
    pub fn apply(&self, update: &NodeIdentity) -> Result<bool, DbError> {
        let mut current = self.current.write().unwrap();
        let merged = merge_identity(&current, update);
        if merged == *current {
            return Ok(false);
        }

        let saved = self.store.save_identity(&merged);
        *current = merged;
        saved.map(|_| true)
    }
}

fn merge_identity(current: &NodeIdentity, update: &NodeIdentity) -> NodeIdentity {
    fn pick(current: &str, update: &str) -> String {
        if update.is_empty() {
            current.to_string()
        } else {
            update.to_string()
        }
    }

    NodeIdentity {
        node_id: if update.node_id > 0 {
            update.node_id
        } else {
            current.node_id
        },
        node_ip: pick(&current.node_ip, &update.node_ip),
        country: pick(&current.country, &update.country),
        province: pick(&current.province, &update.province),
        city: pick(&current.city, &update.city),
        isp: pick(&current.isp, &update.isp),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory identity store that counts writes.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub(crate) record: Mutex<Option<NodeIdentity>>,
        pub(crate) saves: AtomicUsize,
    }

    impl IdentityStore for MemoryStore {
        fn load_identity(&self) -> Result<Option<NodeIdentity>, DbError> {
            Ok(self.record.lock().unwrap().clone())
        }

        fn save_identity(&self, identity: &NodeIdentity) -> Result<(), DbError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            *self.record.lock().unwrap() = Some(identity.clone());
            Ok(())
        }
    }

    pub(crate) fn identity(node_id: u64, node_ip: &str) -> NodeIdentity {
        NodeIdentity {
            node_id,
            node_ip: node_ip.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_starts_unresolved_without_record() {
        let cache = NodeIdentityCache::load(Arc::new(MemoryStore::default()));
        assert!(!cache.is_resolved());
        assert_eq!(cache.get(), NodeIdentity::default());
    }

    #[test]
    fn test_loads_persisted_record() {
        let store = MemoryStore::default();
        *store.record.lock().unwrap() = Some(identity(9, "9.9.9.9"));
        let cache = NodeIdentityCache::load(Arc::new(store));
        assert!(cache.is_resolved());
        assert_eq!(cache.get().node_id, 9);
    }

    #[test]
    fn test_empty_refresh_never_clears_identity() {
        let store = Arc::new(MemoryStore::default());
        let cache = NodeIdentityCache::load(store.clone());

        let mut first = identity(42, "1.2.3.4");
        first.city = "Hangzhou".to_string();
        assert!(cache.apply(&first).unwrap());

        assert!(!cache.apply(&NodeIdentity::default()).unwrap());
        let current = cache.get();
        assert_eq!(current.node_id, 42);
        assert_eq!(current.node_ip, "1.2.3.4");
        assert_eq!(current.city, "Hangzhou");
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_changed_fields_are_persisted_once() {
        let store = Arc::new(MemoryStore::default());
        let cache = NodeIdentityCache::load(store.clone());

        assert!(cache.apply(&identity(42, "1.2.3.4")).unwrap());
        assert!(!cache.apply(&identity(42, "1.2.3.4")).unwrap());
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);

        let mut moved = identity(0, "5.6.7.8");
        moved.isp = "Unicom".to_string();
        assert!(cache.apply(&moved).unwrap());
        assert_eq!(store.saves.load(Ordering::SeqCst), 2);

        let persisted = store.record.lock().unwrap().clone().unwrap();
        assert_eq!(persisted.node_id, 42);
        assert_eq!(persisted.node_ip, "5.6.7.8");
        assert_eq!(persisted.isp, "Unicom");
        assert_eq!(cache.get().isp, "Unicom");
    }
}
