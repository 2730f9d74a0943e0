//! Cache Store Connector Module
//!
//! Interface to the key/value cache store holding the cached values, plus an
//! in-memory implementation that applies each batch under a single lock.

use crate::cache_types::{CacheOpResult, ItemRecord};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

/// Key/value cache store.
#[async_trait]
pub trait CacheConnector: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Read `select_keys`, delete `delete_keys` and write `put_items` in one
    /// transaction. Results are ordered as `select_keys ++ delete_keys ++ put_items`.
    async fn batch_execute(
        &self,
        select_keys: &[String],
        delete_keys: &[String],
        put_items: &[ItemRecord],
    ) -> Result<Vec<CacheOpResult>>;

    /// Non-transactional write of `items`
    async fn batch_insert(&self, items: &[ItemRecord]) -> Result<()>;

    /// Non-transactional read of `keys`, positionally aligned
    async fn batch_select(&self, keys: &[String]) -> Result<Vec<Option<String>>>;
}

/// In-memory cache store
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, String>>,
    connected: AtomicBool,
    available: AtomicBool,
    transaction_count: AtomicU64,
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            available: AtomicBool::new(true),
            transaction_count: AtomicU64::new(0),
        }
    }

    /// Simulate an outage; every call fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove a value behind the proxy's back, as an external eviction would
    pub fn remove(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `batch_execute` transactions applied
    pub fn transaction_count(&self) -> u64 {
        self.transaction_count.load(Ordering::Relaxed)
    }

    fn lock_entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ProxyError::CacheStoreError("Cache store unavailable".to_string()));
        }
        self.entries
            .lock()
            .map_err(|_| ProxyError::CacheStoreError("Cache store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CacheConnector for InMemoryCacheStore {
    async fn connect(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ProxyError::ConnectionError(
                "Cache store unavailable".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to in-memory cache store");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from in-memory cache store");
        Ok(())
    }

    async fn batch_execute(
        &self,
        select_keys: &[String],
        delete_keys: &[String],
        put_items: &[ItemRecord],
    ) -> Result<Vec<CacheOpResult>> {
        let mut entries = self.lock_entries()?;
        let mut results =
            Vec::with_capacity(select_keys.len() + delete_keys.len() + put_items.len());

        for key in select_keys {
            results.push(CacheOpResult::Value(entries.get(key).cloned()));
        }
        for key in delete_keys {
            results.push(CacheOpResult::Deleted(entries.remove(key).is_some()));
        }
        for item in put_items {
            entries.insert(item.key.clone(), item.value.clone());
            results.push(CacheOpResult::Stored);
        }

        self.transaction_count.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Cache store batch: select={} delete={} put={}",
            select_keys.len(),
            delete_keys.len(),
            put_items.len()
        );
        Ok(results)
    }

    async fn batch_insert(&self, items: &[ItemRecord]) -> Result<()> {
        let mut entries = self.lock_entries()?;
        for item in items {
            entries.insert(item.key.clone(), item.value.clone());
        }
        Ok(())
    }

    async fn batch_select(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let entries = self.lock_entries()?;
        Ok(keys.iter().map(|key| entries.get(key).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_batch_execute_result_order() {
        let store = InMemoryCacheStore::new();
        store
            .batch_insert(&[ItemRecord::new("a", "1", 1), ItemRecord::new("b", "2", 1)])
            .await
            .unwrap();

        let results = store
            .batch_execute(
                &keys(&["a", "missing"]),
                &keys(&["b", "missing"]),
                &[ItemRecord::new("c", "3", 2)],
            )
            .await
            .unwrap();

        assert_eq!(
            results,
            vec![
                CacheOpResult::Value(Some("1".to_string())),
                CacheOpResult::Value(None),
                CacheOpResult::Deleted(true),
                CacheOpResult::Deleted(false),
                CacheOpResult::Stored,
            ]
        );
        assert_eq!(
            store.batch_select(&keys(&["a", "b", "c"])).await.unwrap(),
            vec![Some("1".to_string()), None, Some("3".to_string())]
        );
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_select_sees_state_before_same_batch_writes() {
        let store = InMemoryCacheStore::new();
        let results = store
            .batch_execute(&keys(&["a"]), &[], &[ItemRecord::new("a", "new", 1)])
            .await
            .unwrap();
        assert_eq!(results[0], CacheOpResult::Value(None));
        assert_eq!(store.get("a"), Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_outage_leaves_store_untouched() {
        let store = InMemoryCacheStore::new();
        store.batch_insert(&[ItemRecord::new("a", "1", 1)]).await.unwrap();
        store.set_available(false);
        assert!(store
            .batch_execute(&[], &keys(&["a"]), &[])
            .await
            .is_err());
        assert!(store.connect().await.is_err());
        store.set_available(true);
        assert_eq!(store.get("a"), Some("1".to_string()));
        assert_eq!(store.transaction_count(), 0);
    }
}
