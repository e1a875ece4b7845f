//! The query entity: one key's state, its in-flight fetch, retry loop,
//! garbage-collection timer and observer registry.

use crate::cache::{CacheEvent, CacheShared};
use crate::config::QueryConfig;
use crate::error::Result;
use crate::key::QueryKey;
use crate::notify::{ListenerSet, Subscription};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::serialization::Serializer;
use crate::state::{reduce, FetchMeta, FetchTrigger, QueryAction, QueryState};
use crate::storage::StoredQuery;
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

/// Bound shared by query data and error types.
pub trait QueryValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> QueryValue for T {}

/// Caller-supplied fetch function. Must be safely re-invocable.
pub type Fetcher<T, E> =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<T, E>> + Send + Sync>;

/// Encode/decode pair used to persist a query's data.
pub type Codec<T> = Arc<dyn Serializer<T>>;

type FetchChannel<T, E> = Shared<oneshot::Receiver<QueryState<T, E>>>;

/// State plus the bookkeeping that must change atomically with it.
struct Core<T, E> {
    state: QueryState<T, E>,
    /// A live `success`/`error` has landed; storage hydration must yield to it.
    live_settled: bool,
}

/// A cached query for one [`QueryKey`].
///
/// Entities are created and evicted by the [`QueryCache`](crate::cache::QueryCache);
/// consumers reach them through observers or the client.
pub struct Query<T, E> {
    key: QueryKey,
    core: Mutex<Core<T, E>>,
    config: Mutex<QueryConfig>,
    fetcher: Mutex<Option<Fetcher<T, E>>>,
    codec: Mutex<Option<Codec<T>>>,

    /// At most one fetch per entity; concurrent callers share it.
    in_flight: Mutex<Option<FetchChannel<T, E>>>,
    invocations: AtomicU64,

    /// Observer id -> requested refetch interval.
    observers: Mutex<HashMap<u64, Option<Duration>>>,
    gc_timer: Mutex<Option<JoinHandle<()>>>,
    interval_timer: Mutex<Option<(Duration, JoinHandle<()>)>>,

    listeners: ListenerSet<QueryState<T, E>>,
    cache: Weak<CacheShared>,
}

impl<T: QueryValue, E: QueryValue> Query<T, E> {
    pub(crate) fn new(
        key: QueryKey,
        config: QueryConfig,
        codec: Option<Codec<T>>,
        cache: Weak<CacheShared>,
    ) -> Self {
        Query {
            key,
            core: Mutex::new(Core {
                state: QueryState::default(),
                live_settled: false,
            }),
            config: Mutex::new(config),
            fetcher: Mutex::new(None),
            codec: Mutex::new(codec),
            in_flight: Mutex::new(None),
            invocations: AtomicU64::new(0),
            observers: Mutex::new(HashMap::new()),
            gc_timer: Mutex::new(None),
            interval_timer: Mutex::new(None),
            listeners: ListenerSet::new(),
            cache,
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Current state snapshot.
    pub fn state(&self) -> QueryState<T, E> {
        self.core.lock().state.clone()
    }

    /// Effective configuration.
    pub fn config(&self) -> QueryConfig {
        self.config.lock().clone()
    }

    /// Adopt an observer's configuration. `cache_duration` only ever grows,
    /// so the longest-lived observer decides garbage collection.
    pub(crate) fn set_config(&self, config: QueryConfig) {
        let mut current = self.config.lock();
        let cache_duration = current.cache_duration.max(config.cache_duration);
        *current = QueryConfig {
            cache_duration,
            ..config
        };
    }

    /// Bind the fetch function used by subsequent fetches.
    pub fn set_fetcher(&self, fetcher: Fetcher<T, E>) {
        *self.fetcher.lock() = Some(fetcher);
    }

    pub fn has_fetcher(&self) -> bool {
        self.fetcher.lock().is_some()
    }

    pub(crate) fn set_codec(&self, codec: Codec<T>) {
        *self.codec.lock() = Some(codec);
    }

    /// Number of times the fetch function has been invoked, retries included.
    pub fn fetch_invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Listen to state changes, coalesced to one call per scheduling tick.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&QueryState<T, E>) + Send + Sync + 'static,
    {
        self.listeners.subscribe(move |batch| {
            if let Some(state) = batch.last() {
                listener(state);
            }
        })
    }

    /// Apply `action` through the reducer and publish the new state.
    pub fn dispatch(&self, action: QueryAction<T, E>) -> QueryState<T, E> {
        match self.apply(action, |_| true) {
            Some(state) => state,
            None => self.state(),
        }
    }

    /// Mark the data as outdated without clearing it.
    pub fn invalidate(&self) -> QueryState<T, E> {
        self.dispatch(QueryAction::Invalidate)
    }

    fn apply<G>(&self, action: QueryAction<T, E>, guard: G) -> Option<QueryState<T, E>>
    where
        G: FnOnce(&Core<T, E>) -> bool,
    {
        let name = action.name();
        let live_settle = matches!(
            action,
            QueryAction::Success {
                from_storage: false,
                ..
            } | QueryAction::Error(_)
        );
        let persist = matches!(
            action,
            QueryAction::Success {
                from_storage: false,
                ..
            }
        );

        let next = {
            let mut core = self.core.lock();
            if !guard(&core) {
                return None;
            }
            let next = reduce(&core.state, action, SystemTime::now());
            core.state = next.clone();
            if live_settle {
                core.live_settled = true;
            }
            next
        };

        debug!("» Query {} dispatch {} -> {:?}", self.key, name, next.status);

        if persist {
            self.persist(&next);
        }
        self.listeners.notify(next.clone());
        if let Some(cache) = self.cache.upgrade() {
            cache.emit(CacheEvent::Updated(self.key.clone()));
        }
        Some(next)
    }

    /// Run the fetch function, or join the fetch already in flight.
    ///
    /// The fetch is spawned eagerly on the current tokio runtime; awaiting the
    /// returned future is optional. It resolves to the state after the fetch
    /// (and its retries) settled.
    ///
    /// Outside a tokio runtime nothing is fetched and the current state is
    /// returned.
    pub fn fetch(self: &Arc<Self>, trigger: FetchTrigger) -> BoxFuture<'static, QueryState<T, E>> {
        let mut in_flight = self.in_flight.lock();
        if let Some(channel) = in_flight.as_ref() {
            debug!("Query {} fetch deduplicated ({:?})", self.key, trigger);
            return self.await_channel(channel.clone());
        }

        let fetcher = match self.fetcher.lock().clone() {
            Some(fetcher) => fetcher,
            None => {
                warn!("Query {} has no fetch function bound, fetch skipped", self.key);
                let state = self.state();
                return Box::pin(async move { state });
            }
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("Query {} fetch skipped: no tokio runtime", self.key);
                let state = self.state();
                return Box::pin(async move { state });
            }
        };
        let retry = self.config.lock().retry.clone();

        self.dispatch(QueryAction::Fetch(FetchMeta::new(trigger)));

        let (sender, receiver) = oneshot::channel();
        let this = Arc::clone(self);
        runtime.spawn(async move {
            let state = this.run(fetcher, retry).await;
            // Evict the channel before answering so that later callers either
            // join a live channel or start a new fetch.
            this.in_flight.lock().take();
            sender.send(state).ok();
        });

        let channel = receiver.shared();
        *in_flight = Some(channel.clone());
        drop(in_flight);

        self.await_channel(channel)
    }

    fn await_channel(
        self: &Arc<Self>,
        channel: FetchChannel<T, E>,
    ) -> BoxFuture<'static, QueryState<T, E>> {
        let this = Arc::clone(self);
        channel
            .map(move |result| result.unwrap_or_else(|_cancelled| this.state()))
            .boxed()
    }

    async fn run(&self, fetcher: Fetcher<T, E>, retry: RetryPolicy) -> QueryState<T, E> {
        let mut retries = 0;
        loop {
            self.invocations.fetch_add(1, Ordering::Relaxed);
            match fetcher().await {
                Ok(data) => {
                    return self.dispatch(QueryAction::Success {
                        data,
                        updated_at: None,
                        from_storage: false,
                    });
                }
                Err(error) => {
                    match retry.decide(retries) {
                        RetryDecision::Stop => {
                            debug!(
                                "Query {} failed after {} retries, settling",
                                self.key, retries
                            );
                            return self.dispatch(QueryAction::Error(error));
                        }
                        RetryDecision::RetryAfter(delay) => {
                            retries += 1;
                            debug!(
                                "Query {} failed (retry {}/{}), retrying in {:?}",
                                self.key,
                                retries,
                                retry.max_retries(),
                                delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    }

    /// Apply a storage record, unless a live result already landed or the
    /// current data is at least as new.
    pub(crate) fn hydrate(&self, record: &StoredQuery) -> Result<bool> {
        let codec = match self.codec.lock().clone() {
            Some(codec) => codec,
            None => return Ok(false),
        };
        let data = codec.deserialize(&record.data)?;
        let stored_at = record.updated_at();

        let applied = self.apply(
            QueryAction::Success {
                data,
                updated_at: Some(stored_at),
                from_storage: true,
            },
            |core| {
                !core.live_settled
                    && core
                        .state
                        .data_updated_at
                        .map_or(true, |current| current < stored_at)
            },
        );
        Ok(applied.is_some())
    }

    fn persist(&self, state: &QueryState<T, E>) {
        let cache = match self.cache.upgrade() {
            Some(cache) if cache.has_storage() => cache,
            _ => return,
        };
        let codec = match self.codec.lock().clone() {
            Some(codec) => codec,
            None => return,
        };
        let (data, updated_at) = match (&state.data, state.data_updated_at) {
            (Some(data), Some(updated_at)) => (data, updated_at),
            _ => return,
        };

        let record = codec
            .serialize(data)
            .and_then(|bytes| StoredQuery::new(bytes, updated_at, state.status).to_bytes());
        match record {
            Ok(bytes) => cache.persist(&self.key, bytes),
            Err(e) => warn!("Query {} not persisted: {}", self.key, e),
        }
    }

    // ------------------------------------------------------------------
    // Observer registry, GC and refetch interval
    // ------------------------------------------------------------------

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Register an observer; cancels any pending garbage collection.
    pub(crate) fn attach_observer(self: &Arc<Self>, id: u64, interval: Option<Duration>) {
        self.observers.lock().insert(id, interval);
        if let Some(timer) = self.gc_timer.lock().take() {
            debug!("Query {} GC cancelled by observer {}", self.key, id);
            timer.abort();
        }
        self.reconcile_interval();
    }

    pub(crate) fn set_observer_interval(self: &Arc<Self>, id: u64, interval: Option<Duration>) {
        if let Some(slot) = self.observers.lock().get_mut(&id) {
            *slot = interval;
        }
        self.reconcile_interval();
    }

    /// Deregister an observer; the last one out starts the GC timer.
    pub(crate) fn detach_observer(self: &Arc<Self>, id: u64) {
        let remaining = {
            let mut observers = self.observers.lock();
            observers.remove(&id);
            observers.len()
        };
        self.reconcile_interval();
        if remaining == 0 {
            self.schedule_gc();
        }
    }

    /// Start (or restart) the eviction timer of length `cache_duration`.
    pub(crate) fn schedule_gc(self: &Arc<Self>) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!("Query {} GC not scheduled: no runtime", self.key);
                return;
            }
        };
        let duration = self.config.lock().cache_duration;
        let cache = self.cache.clone();
        let query = Arc::downgrade(self);

        let timer = handle.spawn(async move {
            tokio::time::sleep(duration).await;
            if let (Some(cache), Some(query)) = (cache.upgrade(), query.upgrade()) {
                if query.observer_count() == 0 {
                    let identity = Arc::as_ptr(&query) as *const ();
                    cache.evict(&query.key, identity);
                }
            }
        });

        if let Some(previous) = self.gc_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    fn reconcile_interval(self: &Arc<Self>) {
        let wanted = self
            .observers
            .lock()
            .values()
            .filter_map(|interval| *interval)
            .min();

        let mut timer = self.interval_timer.lock();
        if let (Some(period), Some((current, _))) = (wanted, timer.as_ref()) {
            if period == *current {
                return;
            }
        }
        if let Some((_, handle)) = timer.take() {
            handle.abort();
        }

        let period = match wanted {
            Some(period) if !period.is_zero() => period,
            _ => return,
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => return,
        };

        debug!("Query {} refetch interval set to {:?}", self.key, period);
        let query = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match query.upgrade() {
                    Some(query) => {
                        let _ = query.fetch(FetchTrigger::Interval);
                    }
                    None => break,
                }
            }
        });
        *timer = Some((period, handle));
    }
}

impl<T, E> Drop for Query<T, E> {
    fn drop(&mut self) {
        if let Some(timer) = self.gc_timer.get_mut().take() {
            timer.abort();
        }
        if let Some((_, timer)) = self.interval_timer.get_mut().take() {
            timer.abort();
        }
    }
}

/// Type-erased view of a [`Query`], as held by the cache registry.
pub trait AnyQuery: Send + Sync {
    fn key(&self) -> &QueryKey;
    fn observer_count(&self) -> usize;
    fn is_fetching(&self) -> bool;
    fn cache_duration(&self) -> Duration;
    fn mark_invalidated(&self);
    /// Refetch if a fetch function is bound; resolves once settled.
    fn refetch(self: Arc<Self>, trigger: FetchTrigger) -> BoxFuture<'static, ()>;
    fn hydrate_from(&self, record: &StoredQuery) -> Result<bool>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: QueryValue, E: QueryValue> AnyQuery for Query<T, E> {
    fn key(&self) -> &QueryKey {
        &self.key
    }

    fn observer_count(&self) -> usize {
        Query::observer_count(self)
    }

    fn is_fetching(&self) -> bool {
        Query::is_fetching(self)
    }

    fn cache_duration(&self) -> Duration {
        self.config.lock().cache_duration
    }

    fn mark_invalidated(&self) {
        self.invalidate();
    }

    fn refetch(self: Arc<Self>, trigger: FetchTrigger) -> BoxFuture<'static, ()> {
        if !self.has_fetcher() {
            return Box::pin(async {});
        }
        self.fetch(trigger).map(|_| ()).boxed()
    }

    fn hydrate_from(&self, record: &StoredQuery) -> Result<bool> {
        self.hydrate(record)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::PostcardSerializer;
    use crate::state::QueryStatus;
    use std::sync::atomic::AtomicUsize;

    type TestQuery = Query<String, String>;

    fn query(config: QueryConfig) -> Arc<TestQuery> {
        Arc::new(Query::new(
            QueryKey::from("test"),
            config,
            None,
            Weak::new(),
        ))
    }

    fn counting_fetcher(
        calls: Arc<AtomicUsize>,
        result: std::result::Result<&'static str, &'static str>,
    ) -> Fetcher<String, String> {
        Arc::new(move || {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                result.map(str::to_string).map_err(str::to_string)
            })
        })
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let q = query(QueryConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        q.set_fetcher(counting_fetcher(calls.clone(), Ok("X")));

        let state = q.fetch(FetchTrigger::Manual).await;
        assert!(state.is_success());
        assert_eq!(state.data.as_deref(), Some("X"));
        assert!(!q.is_fetching());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_are_deduplicated() {
        let q = query(QueryConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        q.set_fetcher(counting_fetcher(calls.clone(), Ok("X")));

        let fetches: Vec<_> = (0..5).map(|_| q.fetch(FetchTrigger::Manual)).collect();
        assert!(q.state().is_fetching);
        let states = futures::future::join_all(fetches).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(states.iter().all(|s| s.data.as_deref() == Some("X")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion() {
        let q = query(
            QueryConfig::default().with_retry(RetryPolicy::fixed(2, Duration::from_millis(100))),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        q.set_fetcher(counting_fetcher(calls.clone(), Err("boom")));

        let state = q.fetch(FetchTrigger::Manual).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(q.fetch_invocations(), 3);
        assert!(state.is_error());
        assert_eq!(state.error.as_deref(), Some("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_survives_external_settles() {
        let q = query(
            QueryConfig::default().with_retry(RetryPolicy::fixed(2, Duration::from_millis(100))),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        q.set_fetcher(counting_fetcher(calls.clone(), Err("boom")));

        let fetch = q.fetch(FetchTrigger::Manual);
        let writer = {
            let q = q.clone();
            tokio::spawn(async move {
                for n in 0..5 {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    q.dispatch(QueryAction::Success {
                        data: format!("set-{}", n),
                        updated_at: None,
                        from_storage: false,
                    });
                }
            })
        };

        let state = fetch.await;
        writer.await.expect("writer task");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(state.is_refetch_error);
    }

    #[test]
    fn test_fetch_outside_runtime_returns_current_state() {
        let q = query(QueryConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        q.set_fetcher(counting_fetcher(calls.clone(), Ok("X")));

        let state = futures::executor::block_on(q.fetch(FetchTrigger::Manual));
        assert!(state.is_loading());
        assert!(!q.is_fetching());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_retries_fail_once() {
        let q = query(QueryConfig::default().with_retry(RetryPolicy::fixed(0, Duration::ZERO)));
        let calls = Arc::new(AtomicUsize::new(0));
        q.set_fetcher(counting_fetcher(calls.clone(), Err("boom")));

        q.fetch(FetchTrigger::Manual).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refetch_error_preserves_data() {
        let q = query(QueryConfig::default().with_retry(RetryPolicy::Never));
        let calls = Arc::new(AtomicUsize::new(0));
        q.set_fetcher(counting_fetcher(calls.clone(), Ok("X")));
        q.fetch(FetchTrigger::Manual).await;

        q.set_fetcher(counting_fetcher(calls.clone(), Err("boom")));
        let state = q.fetch(FetchTrigger::Manual).await;

        assert_eq!(state.status, QueryStatus::Success);
        assert!(state.is_refetch_error);
        assert_eq!(state.data.as_deref(), Some("X"));
    }

    #[tokio::test]
    async fn test_fetch_without_fetcher_returns_current_state() {
        let q = query(QueryConfig::default());
        let state = q.fetch(FetchTrigger::Manual).await;
        assert!(state.is_loading());
        assert!(!state.is_fetching);
    }

    #[tokio::test]
    async fn test_hydration_yields_to_live_result() {
        let q = Arc::new(TestQuery::new(
            QueryKey::from("test"),
            QueryConfig::default(),
            Some(Arc::new(PostcardSerializer)),
            Weak::new(),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        q.set_fetcher(counting_fetcher(calls, Ok("live")));
        q.fetch(FetchTrigger::Mount).await;

        let stored = PostcardSerializer.serialize(&"stored".to_string()).unwrap();
        let record = StoredQuery::new(stored, SystemTime::now(), QueryStatus::Success);
        assert!(!q.hydrate(&record).unwrap());
        assert_eq!(q.state().data.as_deref(), Some("live"));
    }

    #[tokio::test]
    async fn test_hydration_applies_before_live_result() {
        let q = Arc::new(TestQuery::new(
            QueryKey::from("test"),
            QueryConfig::default(),
            Some(Arc::new(PostcardSerializer)),
            Weak::new(),
        ));
        let stored_at = SystemTime::now() - Duration::from_secs(3);
        let stored = PostcardSerializer.serialize(&"stored".to_string()).unwrap();
        let record = StoredQuery::new(stored, stored_at, QueryStatus::Success);

        assert!(q.hydrate(&record).unwrap());
        let state = q.state();
        assert_eq!(state.data.as_deref(), Some("stored"));
        assert!(state.is_success());
    }

    #[tokio::test]
    async fn test_subscribe_receives_coalesced_state() {
        let q = query(QueryConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = q.subscribe(move |state| sink.lock().push(state.is_invalidated));

        q.invalidate();
        q.dispatch(QueryAction::Fetch(FetchMeta::new(FetchTrigger::Manual)));
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Two dispatches within one tick arrive as the latest state only.
        assert_eq!(*seen.lock(), vec![false]);
    }

    #[test]
    fn test_longest_cache_duration_wins() {
        let q = query(QueryConfig::default());
        q.set_config(QueryConfig::default().with_cache_duration(Duration::from_secs(3_600)));
        q.set_config(
            QueryConfig::default()
                .with_cache_duration(Duration::from_secs(300))
                .with_retry(RetryPolicy::Never),
        );

        let config = q.config();
        assert_eq!(config.cache_duration, Duration::from_secs(3_600));
        assert_eq!(config.retry, RetryPolicy::Never);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_interval_follows_observers() {
        let q = query(QueryConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        q.set_fetcher(counting_fetcher(calls.clone(), Ok("X")));

        q.attach_observer(1, Some(Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        q.set_observer_interval(1, None);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
