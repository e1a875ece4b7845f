//! Consumer-side handle on a query.
//!
//! An observer registers with the cache entity for its key, keeps it alive,
//! drives mount and interval fetching, and republishes the entity's state as
//! [`QueryResult`] snapshots. Dropping the observer unsubscribes it; the last
//! observer out starts the entity's garbage-collection timer.

use crate::client::{boxed_fetcher, QueryClient};
use crate::config::{QueryConfig, RefetchOnMount};
use crate::error::Result;
use crate::key::QueryKey;
use crate::notify::{ListenerSet, Subscription};
use crate::query::{Codec, Fetcher, Query, QueryValue};
use crate::retry::RetryPolicy;
use crate::serialization::{PostcardSerializer, Serializer};
use crate::state::{FetchTrigger, QueryState};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Per-observer overrides of the client's [`QueryConfig`].
///
/// `None` fields fall back to the client defaults.
pub struct QueryOptions<T> {
    pub enabled: Option<bool>,
    pub stale_duration: Option<Duration>,
    pub cache_duration: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub refetch_interval: Option<Duration>,
    pub refetch_on_mount: Option<RefetchOnMount>,
    serializer: Option<Codec<T>>,
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        QueryOptions {
            enabled: None,
            stale_duration: None,
            cache_duration: None,
            retry: None,
            refetch_interval: None,
            refetch_on_mount: None,
            serializer: None,
        }
    }
}

impl<T> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        QueryOptions {
            enabled: self.enabled,
            stale_duration: self.stale_duration,
            cache_duration: self.cache_duration,
            retry: self.retry.clone(),
            refetch_interval: self.refetch_interval,
            refetch_on_mount: self.refetch_on_mount,
            serializer: self.serializer.clone(),
        }
    }
}

impl<T> QueryOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn stale_duration(mut self, duration: Duration) -> Self {
        self.stale_duration = Some(duration);
        self
    }

    pub fn cache_duration(mut self, duration: Duration) -> Self {
        self.cache_duration = Some(duration);
        self
    }

    /// Fixed retry budget: `count` retries, `delay` apart.
    pub fn retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry = Some(RetryPolicy::fixed(count, delay));
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn refetch_on_mount(mut self, policy: RefetchOnMount) -> Self {
        self.refetch_on_mount = Some(policy);
        self
    }

    /// Persist this query's data with `serializer`.
    pub fn serializer<S: Serializer<T> + 'static>(mut self, serializer: S) -> Self {
        self.serializer = Some(Arc::new(serializer));
        self
    }

    /// Merge over the client defaults.
    pub fn resolve(&self, defaults: &QueryConfig) -> QueryConfig {
        QueryConfig {
            stale_duration: self.stale_duration.unwrap_or(defaults.stale_duration),
            cache_duration: self.cache_duration.unwrap_or(defaults.cache_duration),
            retry: self.retry.clone().unwrap_or_else(|| defaults.retry.clone()),
            refetch_interval: self.refetch_interval.or(defaults.refetch_interval),
            refetch_on_mount: self.refetch_on_mount.unwrap_or(defaults.refetch_on_mount),
            enabled: self.enabled.unwrap_or(defaults.enabled),
        }
    }
}

impl<T: Serialize + DeserializeOwned> QueryOptions<T> {
    /// Persist this query's data with the postcard envelope encoding.
    pub fn persisted(self) -> Self {
        self.serializer(PostcardSerializer)
    }
}

/// Snapshot published by a [`QueryObserver`].
#[derive(Clone, Debug)]
pub struct QueryResult<T, E> {
    pub state: QueryState<T, E>,
    /// Data absent or older than the stale duration.
    pub is_stale: bool,
    /// Set once a lazy observer has been executed. Always true for eager ones.
    pub called: bool,
}

impl<T, E> QueryResult<T, E> {
    pub fn data(&self) -> Option<&T> {
        self.state.data.as_ref()
    }

    pub fn error(&self) -> Option<&E> {
        self.state.error.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.state.is_loading()
    }

    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }

    pub fn is_error(&self) -> bool {
        self.state.is_error()
    }

    pub fn is_fetching(&self) -> bool {
        self.state.is_fetching
    }
}

struct Binding<T, E> {
    query: Arc<Query<T, E>>,
    subscription: Subscription,
}

struct ObserverInner<T: QueryValue, E: QueryValue> {
    id: u64,
    key: QueryKey,
    client: QueryClient,
    fetcher: Fetcher<T, E>,
    options: Mutex<QueryOptions<T>>,
    binding: Mutex<Option<Binding<T, E>>>,
    listeners: ListenerSet<QueryResult<T, E>>,
    called: AtomicBool,
}

impl<T: QueryValue, E: QueryValue> ObserverInner<T, E> {
    fn config(&self) -> QueryConfig {
        self.options.lock().resolve(self.client.config())
    }

    fn interval(config: &QueryConfig) -> Option<Duration> {
        if config.enabled {
            config.refetch_interval
        } else {
            None
        }
    }

    /// Build (or find) the entity and attach to it.
    fn bind(self: &Arc<Self>) -> Result<Arc<Query<T, E>>> {
        let (config, codec) = {
            let options = self.options.lock();
            (options.resolve(self.client.config()), options.serializer.clone())
        };
        let query = self
            .client
            .query_cache()
            .build::<T, E>(self.key.clone(), config.clone(), codec)?;
        query.set_config(config.clone());
        query.set_fetcher(Arc::clone(&self.fetcher));
        query.attach_observer(self.id, Self::interval(&config));

        let weak: Weak<ObserverInner<T, E>> = Arc::downgrade(self);
        let subscription = query.subscribe(move |state| {
            if let Some(observer) = weak.upgrade() {
                observer.publish(state.clone());
            }
        });

        *self.binding.lock() = Some(Binding {
            query: Arc::clone(&query),
            subscription,
        });
        Ok(query)
    }

    /// The bound entity, rebinding if it was removed from the cache.
    ///
    /// A failed rebind leaves the previous binding in place.
    fn query(self: &Arc<Self>) -> Result<Arc<Query<T, E>>> {
        let orphan = match self.bound() {
            Some(query) if self.client.query_cache().is_registered(&query) => return Ok(query),
            orphan => orphan,
        };

        if orphan.is_some() {
            debug!("Observer {} rebinding {}: entity was removed", self.id, self.key);
        }
        let query = self.bind().map_err(|e| {
            error!("Observer {} failed to rebind {}: {}", self.id, self.key, e);
            e
        })?;
        if let Some(orphan) = orphan {
            orphan.detach_observer(self.id);
        }
        Ok(query)
    }

    /// The entity last bound, without checking registration.
    fn bound(&self) -> Option<Arc<Query<T, E>>> {
        self.binding
            .lock()
            .as_ref()
            .map(|binding| Arc::clone(&binding.query))
    }

    fn mount(self: &Arc<Self>, query: &Arc<Query<T, E>>) {
        let config = self.config();
        if !config.enabled {
            return;
        }
        let state = query.state();
        let fetch = match config.refetch_on_mount {
            RefetchOnMount::Always => true,
            RefetchOnMount::IfStale => {
                !state.has_data() || state.is_invalidated || state.is_stale(config.stale_duration)
            }
            RefetchOnMount::Never => false,
        };
        if fetch {
            let _ = query.fetch(FetchTrigger::Mount);
        } else {
            debug!("Observer {} mounted {} without fetching", self.id, self.key);
        }
    }

    fn result_from(&self, state: QueryState<T, E>) -> QueryResult<T, E> {
        let config = self.config();
        QueryResult {
            is_stale: !state.has_data() || state.is_stale(config.stale_duration),
            called: self.called.load(Ordering::Acquire),
            state,
        }
    }

    fn publish(&self, state: QueryState<T, E>) {
        self.listeners.notify(self.result_from(state));
    }
}

impl<T: QueryValue, E: QueryValue> Drop for ObserverInner<T, E> {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.get_mut().take() {
            drop(binding.subscription);
            binding.query.detach_observer(self.id);
            debug!("Observer {} detached from {}", self.id, self.key);
        }
    }
}

/// Subscribes a consumer to one query key.
pub struct QueryObserver<T: QueryValue, E: QueryValue> {
    inner: Arc<ObserverInner<T, E>>,
}

impl<T: QueryValue, E: QueryValue> QueryObserver<T, E> {
    /// Observe `key`, fetching with `fetcher` according to `options`.
    ///
    /// Outside a tokio runtime the observer binds but does not fetch.
    ///
    /// # Errors
    ///
    /// `Error::TypeMismatch` if `key` is registered with other types.
    pub fn new<F, Fut>(
        client: &QueryClient,
        key: impl Into<QueryKey>,
        fetcher: F,
        options: QueryOptions<T>,
    ) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let enabled = options.resolve(client.config()).enabled;
        let inner = Arc::new(ObserverInner {
            id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
            key: key.into(),
            client: client.clone(),
            fetcher: boxed_fetcher(fetcher),
            options: Mutex::new(options),
            binding: Mutex::new(None),
            listeners: ListenerSet::new(),
            called: AtomicBool::new(enabled),
        });

        let query = inner.bind()?;
        debug!("Observer {} attached to {}", inner.id, inner.key);
        inner.mount(&query);
        Ok(QueryObserver { inner })
    }

    /// A disabled observer that fetches only once [`execute`](Self::execute) is called.
    pub fn lazy<F, Fut>(
        client: &QueryClient,
        key: impl Into<QueryKey>,
        fetcher: F,
        options: QueryOptions<T>,
    ) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        Self::new(client, key, fetcher, options.enabled(false))
    }

    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    /// The entity this observer is bound to, rebinding if it was removed.
    ///
    /// # Errors
    ///
    /// `Error::TypeMismatch` if the key was re-registered with other types.
    pub fn query(&self) -> Result<Arc<Query<T, E>>> {
        self.inner.query()
    }

    /// State of the bound entity. Falls back to the last bound entity when
    /// rebinding fails.
    pub fn state(&self) -> QueryState<T, E> {
        match self.inner.query() {
            Ok(query) => query.state(),
            Err(_) => self
                .inner
                .bound()
                .map(|query| query.state())
                .unwrap_or_default(),
        }
    }

    /// Current snapshot.
    pub fn result(&self) -> QueryResult<T, E> {
        self.inner.result_from(self.state())
    }

    /// Whether a lazy observer has been executed.
    pub fn called(&self) -> bool {
        self.inner.called.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config().enabled
    }

    /// Listen to snapshots, delivered once per scheduling tick.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&QueryResult<T, E>) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(move |batch| {
            if let Some(result) = batch.last() {
                listener(result);
            }
        })
    }

    /// Fetch now, joining any fetch already in flight.
    ///
    /// # Errors
    ///
    /// `Error::TypeMismatch` if the entity was removed and its key
    /// re-registered with other types.
    pub fn refetch(&self) -> BoxFuture<'static, Result<QueryState<T, E>>> {
        match self.inner.query() {
            Ok(query) => query.fetch(FetchTrigger::Manual).map(Ok).boxed(),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    /// Enable a lazy observer and fetch. Sets `called`.
    ///
    /// # Errors
    ///
    /// Same as [`refetch`](Self::refetch).
    pub fn execute(&self) -> BoxFuture<'static, Result<QueryState<T, E>>> {
        self.inner.called.store(true, Ordering::Release);
        if !self.is_enabled() {
            self.inner.options.lock().enabled = Some(true);
            let query = match self.inner.query() {
                Ok(query) => query,
                Err(e) => return Box::pin(async move { Err(e) }),
            };
            let config = self.inner.config();
            query.set_config(config.clone());
            query.set_observer_interval(self.inner.id, ObserverInner::<T, E>::interval(&config));
        }
        self.refetch()
    }

    /// Replace this observer's options. Enabling a disabled observer mounts it.
    ///
    /// # Errors
    ///
    /// Same as [`query`](Self::query); the new options are kept either way.
    pub fn update_options(&self, options: QueryOptions<T>) -> Result<()> {
        let was_enabled = self.is_enabled();
        *self.inner.options.lock() = options;

        let query = self.inner.query()?;
        let (config, codec) = {
            let options = self.inner.options.lock();
            (options.resolve(self.inner.client.config()), options.serializer.clone())
        };
        query.set_config(config.clone());
        if let Some(codec) = codec {
            query.set_codec(codec);
        }
        query.set_observer_interval(self.inner.id, ObserverInner::<T, E>::interval(&config));

        if config.enabled {
            self.inner.called.store(true, Ordering::Release);
            if !was_enabled {
                self.inner.mount(&query);
            }
        }
        Ok(())
    }
}

impl<T: QueryValue, E: QueryValue> std::fmt::Debug for QueryObserver<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .finish()
    }
}
