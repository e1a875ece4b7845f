//! In-memory storage adapter (default feature, thread-safe, async).
//!
//! Uses DashMap for concurrent access with per-key sharding. Mostly useful for
//! tests and for processes that only want persistence across cache instances.

use super::StorageAdapter;
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Thread-safe in-memory storage adapter.
///
/// Like a real database handle it must be initialized before use; every
/// operation issued earlier fails with `Error::ConfigError`.
///
/// # Example
///
/// ```no_run
/// use query_kit::storage::{InMemoryStorage, StorageAdapter};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let storage = InMemoryStorage::new();
///     storage.initialize().await?;
///
///     storage.set("key1", b"value".to_vec()).await?;
///     assert!(storage.get("key1").await?.is_some());
///     Ok(())
/// }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    store: Arc<DashMap<String, Vec<u8>>>,
    initialized: Arc<AtomicBool>,
}

impl InMemoryStorage {
    /// Create a new, not yet initialized adapter.
    pub fn new() -> Self {
        InMemoryStorage {
            store: Arc::new(DashMap::new()),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::ConfigError(
                "InMemoryStorage used before initialize()".to_string(),
            ))
        }
    }

    /// Total bytes held, for diagnostics.
    pub fn total_bytes(&self) -> usize {
        self.store.iter().map(|entry| entry.value().len()).sum()
    }
}

impl StorageAdapter for InMemoryStorage {
    async fn initialize(&self) -> Result<()> {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            debug!("✓ InMemory storage initialized");
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        if self.initialized.swap(false, Ordering::AcqRel) {
            debug!("✓ InMemory storage disposed");
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_ready()?;
        let value = self.store.get(key).map(|entry| entry.value().clone());
        debug!(
            "✓ InMemory GET {} -> {}",
            key,
            if value.is_some() { "HIT" } else { "MISS" }
        );
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.ensure_ready()?;
        self.store.insert(key.to_string(), value);
        debug!("✓ InMemory SET {}", key);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.ensure_ready()?;
        let removed = self.store.remove(key).is_some();
        debug!("✓ InMemory REMOVE {} ({})", key, removed);
        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_ready()?;
        self.store.clear();
        warn!("⚠ InMemory CLEAR executed - all records removed!");
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.ensure_ready()?;
        Ok(self.store.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn values(&self) -> Result<Vec<Vec<u8>>> {
        self.ensure_ready()?;
        Ok(self.store.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn entries(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.ensure_ready()?;
        Ok(self
            .store
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn length(&self) -> Result<usize> {
        self.ensure_ready()?;
        Ok(self.store.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ready() -> InMemoryStorage {
        let storage = InMemoryStorage::new();
        storage.initialize().await.expect("Failed to initialize");
        storage
    }

    #[tokio::test]
    async fn test_use_before_initialize_is_config_error() {
        let storage = InMemoryStorage::new();
        assert!(!storage.is_ready());

        let err = storage.get("key").await.unwrap_err();
        assert!(err.is_config());
        let err = storage.set("key", vec![1]).await.unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_initialize_and_dispose_are_idempotent() {
        let storage = InMemoryStorage::new();
        storage.initialize().await.expect("Failed to initialize");
        storage.initialize().await.expect("Failed to initialize");
        assert!(storage.is_ready());

        storage.dispose().await.expect("Failed to dispose");
        storage.dispose().await.expect("Failed to dispose");
        assert!(!storage.is_ready());
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let storage = ready().await;

        storage
            .set("key1", b"value1".to_vec())
            .await
            .expect("Failed to set");
        assert_eq!(
            storage.get("key1").await.expect("Failed to get"),
            Some(b"value1".to_vec())
        );

        assert!(storage.remove("key1").await.expect("Failed to remove"));
        assert!(!storage.remove("key1").await.expect("Failed to remove"));
        assert_eq!(storage.get("key1").await.expect("Failed to get"), None);
    }

    #[tokio::test]
    async fn test_listing_operations() {
        let storage = ready().await;
        storage.set("a", vec![1]).await.expect("Failed to set");
        storage.set("b", vec![2, 2]).await.expect("Failed to set");

        let mut keys = storage.keys().await.expect("Failed to list keys");
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        let mut entries = storage.entries().await.expect("Failed to list entries");
        entries.sort();
        assert_eq!(
            entries,
            vec![("a".to_string(), vec![1]), ("b".to_string(), vec![2, 2])]
        );

        assert_eq!(storage.values().await.expect("Failed to list").len(), 2);
        assert_eq!(storage.length().await.expect("Failed to count"), 2);
        assert_eq!(storage.total_bytes(), 3);

        storage.clear().await.expect("Failed to clear");
        assert_eq!(storage.length().await.expect("Failed to count"), 0);
    }

    #[tokio::test]
    async fn test_clones_share_store() {
        let storage = ready().await;
        let other = storage.clone();
        storage.set("k", vec![9]).await.expect("Failed to set");
        assert!(other.contains_key("k").await.expect("Failed to check"));
    }
}
