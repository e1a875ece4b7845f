//! Registry of query entities, keyed by canonical [`QueryKey`].
//!
//! The cache owns entity lifecycles: `build` finds or creates, eviction
//! happens either explicitly through `remove` or by an entity's GC timer.
//! When a storage adapter is configured, new entities are hydrated from it
//! and successful results are written back. Storage failures never escape:
//! a failed read is a miss and a failed write is logged and dropped.

use crate::config::QueryConfig;
use crate::error::{Error, Result};
use crate::key::QueryKey;
use crate::notify::{ListenerSet, Subscription};
use crate::query::{AnyQuery, Codec, Query, QueryValue};
use crate::storage::{DynStorage, StoredQuery};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::SystemTime;

/// Change notification broadcast by the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheEvent {
    Added(QueryKey),
    Removed(QueryKey),
    /// An entity's state changed.
    Updated(QueryKey),
}

impl CacheEvent {
    pub fn key(&self) -> &QueryKey {
        match self {
            CacheEvent::Added(key) | CacheEvent::Removed(key) | CacheEvent::Updated(key) => key,
        }
    }
}

/// State shared between the cache handle and its entities.
pub(crate) struct CacheShared {
    queries: DashMap<QueryKey, Arc<dyn AnyQuery>>,
    storage: Option<Arc<dyn DynStorage>>,
    listeners: ListenerSet<CacheEvent>,
}

impl CacheShared {
    pub(crate) fn has_storage(&self) -> bool {
        self.storage.is_some()
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        self.listeners.notify(event);
    }

    /// GC eviction: remove `key` only if it still maps to the entity at `identity`.
    pub(crate) fn evict(&self, key: &QueryKey, identity: *const ()) {
        let removed = self
            .queries
            .remove_if(key, |_, query| {
                Arc::as_ptr(query) as *const () == identity && query.observer_count() == 0
            })
            .is_some();
        if removed {
            debug!("✓ Query {} garbage collected", key);
            self.emit(CacheEvent::Removed(key.clone()));
        }
    }

    /// Write a persisted record in the background.
    pub(crate) fn persist(&self, key: &QueryKey, record: Vec<u8>) {
        let storage = match &self.storage {
            Some(storage) => Arc::clone(storage),
            None => return,
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("Query {} not persisted: no runtime", key);
                return;
            }
        };
        let key = key.clone();
        runtime.spawn(async move {
            match storage.store(&key.storage_key(), record).await {
                Ok(()) => debug!("✓ Query {} persisted", key),
                Err(e) => report_storage_error("write", &key, &e),
            }
        });
    }

    fn erase(&self, key: &QueryKey) {
        let storage = match &self.storage {
            Some(storage) => Arc::clone(storage),
            None => return,
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("Stored record for {} not deleted: no runtime", key);
                return;
            }
        };
        let key = key.clone();
        runtime.spawn(async move {
            if let Err(e) = storage.erase(&key.storage_key()).await {
                report_storage_error("delete", &key, &e);
            }
        });
    }
}

fn report_storage_error(operation: &str, key: &QueryKey, error: &Error) {
    if error.is_config() {
        error!("Storage {} for {} failed: {}", operation, key, error);
    } else {
        warn!("Storage {} for {} failed, ignored: {}", operation, key, error);
    }
}

/// Load a persisted record for `query` and hydrate it if fresh enough.
async fn try_load_from_storage(storage: Arc<dyn DynStorage>, query: Arc<dyn AnyQuery>) {
    let key = query.key().clone();
    let bytes = match storage.load(&key.storage_key()).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            debug!("Storage MISS {}", key);
            return;
        }
        Err(e) => {
            report_storage_error("read", &key, &e);
            return;
        }
    };

    let record = match StoredQuery::from_bytes(&bytes) {
        Ok(record) => record,
        Err(e) => {
            warn!("Stored record for {} unreadable, ignored: {}", key, e);
            return;
        }
    };

    let age = record.age(SystemTime::now());
    if age > query.cache_duration() {
        debug!("Stored record for {} too old ({:?}), ignored", key, age);
        return;
    }

    match query.hydrate_from(&record) {
        Ok(true) => debug!("✓ Query {} hydrated from storage", key),
        Ok(false) => debug!("Stored record for {} superseded, discarded", key),
        Err(e) => warn!("Stored record for {} failed to decode, ignored: {}", key, e),
    }
}

/// Registry of query entities.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct QueryCache {
    shared: Arc<CacheShared>,
}

impl QueryCache {
    /// A cache without persistence.
    pub fn new() -> Self {
        Self::with_shared(None)
    }

    pub(crate) fn with_storage(storage: Arc<dyn DynStorage>) -> Self {
        Self::with_shared(Some(storage))
    }

    fn with_shared(storage: Option<Arc<dyn DynStorage>>) -> Self {
        QueryCache {
            shared: Arc::new(CacheShared {
                queries: DashMap::new(),
                storage,
                listeners: ListenerSet::new(),
            }),
        }
    }

    /// Whether a storage adapter is configured.
    pub fn is_persistent(&self) -> bool {
        self.shared.has_storage()
    }

    /// Look up the entity registered under `key`.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if nothing is registered under `key`
    /// - `Error::TypeMismatch` if the entity has other data/error types
    pub fn get<T: QueryValue, E: QueryValue>(&self, key: &QueryKey) -> Result<Arc<Query<T, E>>> {
        let query = self
            .shared
            .queries
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        downcast(query)
    }

    /// Find or create the entity for `key`.
    ///
    /// A newly created entity starts in `Loading`. If the cache is persistent
    /// and `codec` is given, a background load from storage is started.
    ///
    /// # Errors
    ///
    /// `Error::TypeMismatch` if `key` is registered with other data/error types.
    pub fn build<T: QueryValue, E: QueryValue>(
        &self,
        key: QueryKey,
        config: QueryConfig,
        codec: Option<Codec<T>>,
    ) -> Result<Arc<Query<T, E>>> {
        let created = match self.shared.queries.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let existing = Arc::clone(entry.get());
                drop(entry);
                let query = downcast::<T, E>(existing)?;
                if let Some(codec) = codec {
                    query.set_codec(codec);
                }
                return Ok(query);
            }
            Entry::Vacant(entry) => {
                let persistent = codec.is_some();
                let query = Arc::new(Query::<T, E>::new(
                    key.clone(),
                    config,
                    codec,
                    Arc::downgrade(&self.shared),
                ));
                entry.insert(Arc::clone(&query) as Arc<dyn AnyQuery>);
                (query, persistent)
            }
        };

        let (query, persistent) = created;
        debug!("✓ Query {} registered", key);
        self.shared.emit(CacheEvent::Added(key));
        query.schedule_gc();

        if persistent {
            self.spawn_hydration(Arc::clone(&query) as Arc<dyn AnyQuery>);
        }
        Ok(query)
    }

    fn spawn_hydration(&self, query: Arc<dyn AnyQuery>) {
        let storage = match &self.shared.storage {
            Some(storage) => Arc::clone(storage),
            None => return,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(try_load_from_storage(storage, query));
            }
            Err(_) => warn!("Query {} not hydrated: no runtime", query.key()),
        }
    }

    /// Deregister `key` and delete its persisted record.
    ///
    /// Returns whether an entity was registered.
    pub fn remove(&self, key: &QueryKey) -> bool {
        let removed = self.shared.queries.remove(key).is_some();
        if removed {
            debug!("✓ Query {} removed", key);
            self.shared.emit(CacheEvent::Removed(key.clone()));
        }
        self.shared.erase(key);
        removed
    }

    /// Whether `query` is the entity currently registered under its key.
    pub fn is_registered<T: QueryValue, E: QueryValue>(&self, query: &Arc<Query<T, E>>) -> bool {
        self.shared
            .queries
            .get(query.key())
            .map(|entry| Arc::as_ptr(entry.value()) as *const () == Arc::as_ptr(query) as *const ())
            .unwrap_or(false)
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.shared.queries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shared.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queries.is_empty()
    }

    /// Registered keys, in no particular order.
    pub fn keys(&self) -> Vec<QueryKey> {
        self.shared
            .queries
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Entities whose key starts with `prefix`.
    pub fn find_all(&self, prefix: &QueryKey) -> Vec<Arc<dyn AnyQuery>> {
        self.shared
            .queries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Deregister every entity. Persisted records are kept.
    pub fn clear(&self) {
        let keys = self.keys();
        for key in keys {
            if self.shared.queries.remove(&key).is_some() {
                self.shared.emit(CacheEvent::Removed(key));
            }
        }
    }

    /// Listen to add/remove/update events, delivered in per-tick batches.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&[CacheEvent]) + Send + Sync + 'static,
    {
        self.shared.listeners.subscribe(listener)
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

fn downcast<T: QueryValue, E: QueryValue>(query: Arc<dyn AnyQuery>) -> Result<Arc<Query<T, E>>> {
    let key = query.key().to_string();
    query
        .as_any()
        .downcast::<Query<T, E>>()
        .map_err(|_| Error::TypeMismatch { key })
}
