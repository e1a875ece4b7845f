//! Persistent storage contract consulted by the query cache.
//!
//! The cache persists successful query results through a [`StorageAdapter`]
//! and hydrates new entities from it. Adapter failures never reach consumers:
//! a failed read is a miss, a failed write is as if persistence were off.
//!
//! **ASYNC:** all operations return `Send` futures so the cache can run them
//! on spawned tasks. Implementations may simply write `async fn`.

use crate::error::Result;
use crate::serialization::{decode_envelope, encode_envelope};
use crate::state::QueryStatus;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[cfg(feature = "inmemory")]
pub mod inmemory;

#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryStorage;

/// Async key/value backend.
///
/// `initialize`/`dispose` are idempotent. Adapters that need initialization
/// report it through [`is_ready`](Self::is_ready) so a client refuses to be
/// built on top of them too early.
pub trait StorageAdapter: Send + Sync + 'static {
    /// Prepare the adapter for use.
    fn initialize(&self) -> impl Future<Output = Result<()>> + Send;

    /// Release resources. Later calls fail until `initialize` runs again.
    fn dispose(&self) -> impl Future<Output = Result<()>> + Send;

    /// Whether operations may be issued right now.
    fn is_ready(&self) -> bool {
        true
    }

    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Upsert `value` under `key`.
    fn set(&self, key: &str, value: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Delete `key`; returns whether something was removed.
    fn remove(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Delete everything.
    fn clear(&self) -> impl Future<Output = Result<()>> + Send;

    fn keys(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn values(&self) -> impl Future<Output = Result<Vec<Vec<u8>>>> + Send;

    fn entries(&self) -> impl Future<Output = Result<Vec<(String, Vec<u8>)>>> + Send;

    /// Default implementation reads the value.
    fn contains_key(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }

    /// Default implementation lists keys.
    fn length(&self) -> impl Future<Output = Result<usize>> + Send {
        async move { Ok(self.keys().await?.len()) }
    }
}

/// Object-safe view of a [`StorageAdapter`], used by the cache so that the
/// client does not carry the adapter type around.
pub(crate) trait DynStorage: Send + Sync {
    fn ready(&self) -> bool;
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;
    fn store<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>>;
    fn erase<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>>;
}

impl<S: StorageAdapter> DynStorage for S {
    fn ready(&self) -> bool {
        StorageAdapter::is_ready(self)
    }

    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(StorageAdapter::get(self, key))
    }

    fn store<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(StorageAdapter::set(self, key, value))
    }

    fn erase<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(StorageAdapter::remove(self, key))
    }
}

/// Record persisted for a query: `{data (encoded), dataUpdatedAt, status}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredQuery {
    /// Data encoded by the query's [`Serializer`](crate::serialization::Serializer)
    pub data: Vec<u8>,
    /// Milliseconds since the Unix epoch
    pub data_updated_at: u64,
    pub status: QueryStatus,
}

impl StoredQuery {
    pub fn new(data: Vec<u8>, updated_at: SystemTime, status: QueryStatus) -> Self {
        let millis = updated_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        StoredQuery {
            data,
            data_updated_at: millis,
            status,
        }
    }

    pub fn updated_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.data_updated_at)
    }

    /// Age at `now`; a record from the future has age zero.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.updated_at()).unwrap_or(Duration::ZERO)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_envelope(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_envelope(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_query_envelope() {
        let now = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        let record = StoredQuery::new(vec![1, 2, 3], now, QueryStatus::Success);
        let bytes = record.to_bytes().unwrap();
        let back = StoredQuery::from_bytes(&bytes).unwrap();

        assert_eq!(back, record);
        assert_eq!(back.updated_at(), now);
    }

    #[test]
    fn test_stored_query_age() {
        let then = UNIX_EPOCH + Duration::from_secs(100);
        let record = StoredQuery::new(vec![], then, QueryStatus::Success);
        assert_eq!(
            record.age(then + Duration::from_secs(5)),
            Duration::from_secs(5)
        );
        assert_eq!(record.age(then - Duration::from_secs(5)), Duration::ZERO);
    }

    #[cfg(feature = "inmemory")]
    #[tokio::test]
    async fn test_contains_and_length() {
        let storage = InMemoryStorage::new();
        storage.initialize().await.expect("Failed to initialize");
        storage.set("a", vec![1]).await.expect("Failed to set");

        assert!(storage.contains_key("a").await.expect("Failed to check"));
        assert!(!storage.contains_key("b").await.expect("Failed to check"));
        assert_eq!(storage.length().await.expect("Failed to count"), 1);
    }
}
