//! The client: one query cache, one mutation cache, one set of defaults.
//!
//! ```no_run
//! use query_kit::{QueryClient, QueryConfig};
//! use query_kit::storage::{InMemoryStorage, StorageAdapter};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> query_kit::Result<()> {
//!     let storage = InMemoryStorage::new();
//!     storage.initialize().await?;
//!
//!     let client = QueryClient::builder()
//!         .config(QueryConfig::default().with_stale_duration(Duration::from_secs(30)))
//!         .storage(storage)
//!         .build()?;
//!
//!     let state = client
//!         .fetch_query::<u32, String, _, _>("answer", || async { Ok(42) })
//!         .await?;
//!     assert_eq!(state.data, Some(42));
//!     Ok(())
//! }
//! ```

use crate::cache::QueryCache;
use crate::config::QueryConfig;
use crate::error::{Error, Result};
use crate::key::QueryKey;
use crate::mutation::MutationCache;
use crate::query::{Fetcher, Query, QueryValue};
use crate::state::{FetchTrigger, QueryAction, QueryState};
use crate::storage::{DynStorage, StorageAdapter};
use futures::future::{join_all, FutureExt};
use std::future::Future;
use std::sync::Arc;

struct ClientInner {
    queries: QueryCache,
    mutations: MutationCache,
    config: QueryConfig,
}

/// Entry point owning both caches.
///
/// Cheap to clone; clones share the same caches.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    /// A client with default configuration and no persistence.
    pub fn new() -> Self {
        QueryClient::from_parts(QueryCache::new(), QueryConfig::default())
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    fn from_parts(queries: QueryCache, config: QueryConfig) -> Self {
        QueryClient {
            inner: Arc::new(ClientInner {
                queries,
                mutations: MutationCache::new(),
                config,
            }),
        }
    }

    /// Client-wide defaults.
    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.inner.queries
    }

    pub fn mutation_cache(&self) -> &MutationCache {
        &self.inner.mutations
    }

    /// Fetch `key` unless fresh data is cached, and return the settled state.
    ///
    /// The entity is created with the client defaults if needed. Fetch
    /// failures are reported in the returned state, not as `Err`.
    ///
    /// # Errors
    ///
    /// `Error::TypeMismatch` if `key` is registered with other types.
    pub async fn fetch_query<T, E, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        fetcher: F,
    ) -> Result<QueryState<T, E>>
    where
        T: QueryValue,
        E: QueryValue,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let query = self
            .inner
            .queries
            .build::<T, E>(key.into(), self.inner.config.clone(), None)?;
        query.set_fetcher(boxed_fetcher(fetcher));

        let state = query.state();
        if state.has_data() && !state.is_invalidated && !state.is_stale(query.config().stale_duration) {
            debug!("Query {} served from cache", query.key());
            return Ok(state);
        }
        Ok(query.fetch(FetchTrigger::Manual).await)
    }

    /// Cached data for `key`, if any.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if nothing is registered under `key`
    /// - `Error::TypeMismatch` if `key` is registered with other types
    pub fn get_query_data<T: QueryValue, E: QueryValue>(&self, key: &QueryKey) -> Result<Option<T>> {
        Ok(self.inner.queries.get::<T, E>(key)?.state().data)
    }

    /// Write `data` into the cache as if a fetch had just succeeded.
    ///
    /// # Errors
    ///
    /// `Error::TypeMismatch` if `key` is registered with other types.
    pub fn set_query_data<T: QueryValue, E: QueryValue>(
        &self,
        key: impl Into<QueryKey>,
        data: T,
    ) -> Result<QueryState<T, E>> {
        let query: Arc<Query<T, E>> =
            self.inner
                .queries
                .build(key.into(), self.inner.config.clone(), None)?;
        Ok(query.dispatch(QueryAction::Success {
            data,
            updated_at: None,
            from_storage: false,
        }))
    }

    /// Invalidate every query whose key starts with `prefix`; observed ones
    /// are refetched in the background. Returns how many were invalidated.
    pub fn invalidate_queries(&self, prefix: &QueryKey) -> usize {
        let matches = self.inner.queries.find_all(prefix);
        for query in &matches {
            query.mark_invalidated();
            if query.observer_count() > 0 {
                let _ = Arc::clone(query).refetch(FetchTrigger::Invalidation);
            }
        }
        debug!("Invalidated {} queries under {}", matches.len(), prefix);
        matches.len()
    }

    /// Refetch every query whose key starts with `prefix` and has a fetch
    /// function bound. Resolves when all of them settled.
    pub async fn refetch_queries(&self, prefix: &QueryKey) -> usize {
        let matches = self.inner.queries.find_all(prefix);
        let count = matches.len();
        join_all(
            matches
                .into_iter()
                .map(|query| query.refetch(FetchTrigger::Manual)),
        )
        .await;
        count
    }

    /// Deregister `key` and delete its persisted record.
    pub fn remove_query(&self, key: &QueryKey) -> bool {
        self.inner.queries.remove(key)
    }

    /// Number of pending mutations, optionally only those tagged with `key`.
    pub fn is_mutating(&self, key: Option<&QueryKey>) -> usize {
        self.inner.mutations.is_pending(key)
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("queries", &self.inner.queries.len())
            .field("mutations", &self.inner.mutations.len())
            .field("persistent", &self.inner.queries.is_persistent())
            .finish()
    }
}

/// Builder for [`QueryClient`].
#[derive(Default)]
pub struct ClientBuilder {
    config: QueryConfig,
    storage: Option<Arc<dyn DynStorage>>,
}

impl ClientBuilder {
    /// Client-wide query defaults.
    pub fn config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist query results through `storage`.
    pub fn storage<S: StorageAdapter>(mut self, storage: S) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// # Errors
    ///
    /// `Error::ConfigError` if the storage adapter is not initialized yet.
    pub fn build(self) -> Result<QueryClient> {
        let queries = match self.storage {
            Some(storage) => {
                if !storage.ready() {
                    error!("✗ Storage adapter not initialized");
                    return Err(Error::ConfigError(
                        "storage adapter must be initialized before building the client"
                            .to_string(),
                    ));
                }
                info!("✓ QueryClient built with persistent storage");
                QueryCache::with_storage(storage)
            }
            None => QueryCache::new(),
        };
        Ok(QueryClient::from_parts(queries, self.config))
    }
}

pub(crate) fn boxed_fetcher<T, E, F, Fut>(fetcher: F) -> Fetcher<T, E>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
{
    Arc::new(move || fetcher().boxed())
}
