//! Mutations: one-shot remote writes and their registry.
//!
//! Each [`MutationObserver::mutate`] call creates a fresh [`Mutation`] entity
//! registered in the client's [`MutationCache`]. Entities are removed when
//! superseded by a later call from the same observer, or when that observer
//! is dropped.

use crate::client::QueryClient;
use crate::error::{Error, Result};
use crate::key::QueryKey;
use crate::notify::{ListenerSet, Subscription};
use crate::query::QueryValue;
use crate::retry::{RetryDecision, RetryPolicy};
use dashmap::DashMap;
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MutationStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

/// State of one mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationState<T, E> {
    pub status: MutationStatus,
    pub data: Option<T>,
    pub error: Option<E>,
    pub submitted_at: Option<SystemTime>,
    pub updated_at: Option<SystemTime>,
    /// Retries performed by the last run.
    pub failure_count: u32,
}

impl<T, E> Default for MutationState<T, E> {
    fn default() -> Self {
        MutationState {
            status: MutationStatus::Idle,
            data: None,
            error: None,
            submitted_at: None,
            updated_at: None,
            failure_count: 0,
        }
    }
}

impl<T, E> MutationState<T, E> {
    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

/// Caller-supplied write function.
pub type Mutator<V, T, E> =
    Arc<dyn Fn(V) -> BoxFuture<'static, std::result::Result<T, E>> + Send + Sync>;

/// One execution of a write.
pub struct Mutation<T, E> {
    id: u64,
    key: Option<QueryKey>,
    state: Mutex<MutationState<T, E>>,
    listeners: ListenerSet<MutationState<T, E>>,
}

impl<T: QueryValue, E: QueryValue> Mutation<T, E> {
    fn new(id: u64, key: Option<QueryKey>) -> Self {
        Mutation {
            id,
            key,
            state: Mutex::new(MutationState::default()),
            listeners: ListenerSet::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> Option<&QueryKey> {
        self.key.as_ref()
    }

    pub fn state(&self) -> MutationState<T, E> {
        self.state.lock().clone()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&MutationState<T, E>) + Send + Sync + 'static,
    {
        self.listeners.subscribe(move |batch| {
            if let Some(state) = batch.last() {
                listener(state);
            }
        })
    }

    fn update<F: FnOnce(&mut MutationState<T, E>)>(&self, change: F) -> MutationState<T, E> {
        let next = {
            let mut state = self.state.lock();
            change(&mut state);
            state.clone()
        };
        self.listeners.notify(next.clone());
        next
    }

    /// Run `mutator` with `variables`, retrying per `retry`.
    pub async fn execute<V: Clone>(
        &self,
        mutator: &Mutator<V, T, E>,
        variables: V,
        retry: &RetryPolicy,
    ) -> MutationState<T, E> {
        self.start();
        self.run(mutator, variables, retry).await
    }

    fn start(&self) {
        self.update(|state| {
            state.status = MutationStatus::Pending;
            state.error = None;
            state.failure_count = 0;
            state.submitted_at = Some(SystemTime::now());
        });
        debug!("» Mutation {} pending", self.id);
    }

    async fn run<V: Clone>(
        &self,
        mutator: &Mutator<V, T, E>,
        variables: V,
        retry: &RetryPolicy,
    ) -> MutationState<T, E> {
        let mut retries = 0;
        loop {
            match mutator(variables.clone()).await {
                Ok(data) => {
                    debug!("✓ Mutation {} succeeded", self.id);
                    return self.update(|state| {
                        state.status = MutationStatus::Success;
                        state.data = Some(data);
                        state.updated_at = Some(SystemTime::now());
                        state.failure_count = retries;
                    });
                }
                Err(error) => match retry.decide(retries) {
                    RetryDecision::Stop => {
                        warn!("Mutation {} failed after {} retries", self.id, retries);
                        return self.update(|state| {
                            state.status = MutationStatus::Error;
                            state.error = Some(error);
                            state.updated_at = Some(SystemTime::now());
                            state.failure_count = retries;
                        });
                    }
                    RetryDecision::RetryAfter(delay) => {
                        retries += 1;
                        debug!("Mutation {} retry {} in {:?}", self.id, retries, delay);
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }
    }
}

/// Type-erased view of a [`Mutation`].
pub trait AnyMutation: Send + Sync {
    fn id(&self) -> u64;
    fn key(&self) -> Option<&QueryKey>;
    fn is_pending(&self) -> bool;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: QueryValue, E: QueryValue> AnyMutation for Mutation<T, E> {
    fn id(&self) -> u64 {
        self.id
    }

    fn key(&self) -> Option<&QueryKey> {
        self.key.as_ref()
    }

    fn is_pending(&self) -> bool {
        self.state.lock().is_pending()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct MutationShared {
    next_id: AtomicU64,
    mutations: DashMap<u64, Arc<dyn AnyMutation>>,
}

/// Registry of mutation entities.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct MutationCache {
    shared: Arc<MutationShared>,
}

impl MutationCache {
    pub fn new() -> Self {
        MutationCache {
            shared: Arc::new(MutationShared {
                next_id: AtomicU64::new(1),
                mutations: DashMap::new(),
            }),
        }
    }

    /// Register a new idle mutation, optionally tagged with `key`.
    pub fn build<T: QueryValue, E: QueryValue>(&self, key: Option<QueryKey>) -> Arc<Mutation<T, E>> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mutation = Arc::new(Mutation::new(id, key));
        self.shared
            .mutations
            .insert(id, Arc::clone(&mutation) as Arc<dyn AnyMutation>);
        mutation
    }

    /// # Errors
    ///
    /// - `Error::NotFound` if `id` is not registered
    /// - `Error::TypeMismatch` if it has other data/error types
    pub fn get<T: QueryValue, E: QueryValue>(&self, id: u64) -> Result<Arc<Mutation<T, E>>> {
        let mutation = self
            .shared
            .mutations
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::NotFound(format!("mutation {}", id)))?;
        mutation
            .as_any()
            .downcast::<Mutation<T, E>>()
            .map_err(|_| Error::TypeMismatch {
                key: format!("mutation {}", id),
            })
    }

    pub fn remove(&self, id: u64) -> bool {
        self.shared.mutations.remove(&id).is_some()
    }

    /// Number of pending mutations; with `key`, only those tagged with it.
    pub fn is_pending(&self, key: Option<&QueryKey>) -> usize {
        self.shared
            .mutations
            .iter()
            .filter(|entry| entry.value().is_pending())
            .filter(|entry| key.map_or(true, |key| entry.value().key() == Some(key)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.shared.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.mutations.is_empty()
    }
}

impl Default for MutationCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-observer mutation settings.
#[derive(Clone, Debug)]
pub struct MutationOptions {
    /// Tag used by [`MutationCache::is_pending`].
    pub key: Option<QueryKey>,
    /// Mutations do not retry unless asked to.
    pub retry: RetryPolicy,
    /// Query key prefixes invalidated after a successful run.
    pub invalidates: Vec<QueryKey>,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationOptions {
    pub fn new() -> Self {
        MutationOptions {
            key: None,
            retry: RetryPolicy::Never,
            invalidates: Vec::new(),
        }
    }

    pub fn key(mut self, key: impl Into<QueryKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn invalidates<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<QueryKey>,
    {
        self.invalidates.extend(keys.into_iter().map(Into::into));
        self
    }
}

/// Consumer-side handle that triggers mutations.
pub struct MutationObserver<V, T: QueryValue, E: QueryValue> {
    client: QueryClient,
    mutator: Mutator<V, T, E>,
    options: MutationOptions,
    current: Mutex<Option<Arc<Mutation<T, E>>>>,
    owned: Mutex<Vec<u64>>,
    listeners: ListenerSet<MutationState<T, E>>,
    forward: Mutex<Option<Subscription>>,
}

impl<V, T, E> MutationObserver<V, T, E>
where
    V: Clone + Send + Sync + 'static,
    T: QueryValue,
    E: QueryValue,
{
    pub fn new<F, Fut>(client: &QueryClient, mutator: F, options: MutationOptions) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        MutationObserver {
            client: client.clone(),
            mutator: Arc::new(move |variables| mutator(variables).boxed()),
            options,
            current: Mutex::new(None),
            owned: Mutex::new(Vec::new()),
            listeners: ListenerSet::new(),
            forward: Mutex::new(None),
        }
    }

    /// Start a new mutation with `variables`.
    ///
    /// The write runs on a spawned task; awaiting the returned future is
    /// optional. Outside a tokio runtime nothing runs and the current state
    /// is returned.
    pub fn mutate(&self, variables: V) -> BoxFuture<'static, MutationState<T, E>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("Mutation skipped: no tokio runtime");
                let state = self.state();
                return Box::pin(async move { state });
            }
        };
        let cache = self.client.mutation_cache();
        let mutation = cache.build::<T, E>(self.options.key.clone());

        let previous = self.current.lock().replace(Arc::clone(&mutation));
        if let Some(previous) = previous {
            if !previous.state().is_pending() {
                cache.remove(previous.id());
                self.owned.lock().retain(|id| *id != previous.id());
            }
        }
        self.owned.lock().push(mutation.id());

        let listeners = self.listeners.clone();
        *self.forward.lock() = Some(mutation.subscribe(move |state| listeners.notify(state.clone())));

        let (sender, receiver) = oneshot::channel();
        let client = self.client.clone();
        let mutator = Arc::clone(&self.mutator);
        let retry = self.options.retry.clone();
        let invalidates = self.options.invalidates.clone();
        let task_mutation = Arc::clone(&mutation);
        mutation.start();
        runtime.spawn(async move {
            let state = task_mutation.run(&mutator, variables, &retry).await;
            if state.is_success() {
                for key in &invalidates {
                    client.invalidate_queries(key);
                }
            }
            sender.send(state).ok();
        });

        receiver
            .map(move |result| result.unwrap_or_else(|_cancelled| mutation.state()))
            .boxed()
    }

    /// State of the latest mutation, `Idle` before the first call.
    pub fn state(&self) -> MutationState<T, E> {
        self.current
            .lock()
            .as_ref()
            .map(|mutation| mutation.state())
            .unwrap_or_default()
    }

    /// Forget the latest mutation and return to `Idle`.
    pub fn reset(&self) {
        self.forward.lock().take();
        if let Some(mutation) = self.current.lock().take() {
            self.client.mutation_cache().remove(mutation.id());
            self.owned.lock().retain(|id| *id != mutation.id());
        }
        self.listeners.notify(MutationState::default());
    }

    /// Listen to the latest mutation's state, once per scheduling tick.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&MutationState<T, E>) + Send + Sync + 'static,
    {
        self.listeners.subscribe(move |batch| {
            if let Some(state) = batch.last() {
                listener(state);
            }
        })
    }
}

impl<V, T: QueryValue, E: QueryValue> Drop for MutationObserver<V, T, E> {
    fn drop(&mut self) {
        let cache = self.client.mutation_cache();
        for id in self.owned.get_mut().drain(..) {
            cache.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_mutate_success() {
        let client = QueryClient::new();
        let observer = MutationObserver::new(
            &client,
            |n: u32| async move { Ok::<_, String>(n * 2) },
            MutationOptions::new(),
        );
        assert!(observer.state().is_idle());

        let state = observer.mutate(21).await;
        assert!(state.is_success());
        assert_eq!(state.data, Some(42));
        assert_eq!(observer.state().data, Some(42));
    }

    #[tokio::test]
    async fn test_pending_count_by_key() {
        let client = QueryClient::new();
        let observer = MutationObserver::new(
            &client,
            |_: ()| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, String>(())
            },
            MutationOptions::new().key("todos"),
        );

        let pending = observer.mutate(());
        assert_eq!(client.is_mutating(None), 1);
        assert_eq!(client.is_mutating(Some(&QueryKey::from("todos"))), 1);
        assert_eq!(client.is_mutating(Some(&QueryKey::from("users"))), 0);

        pending.await;
        assert_eq!(client.is_mutating(None), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_retry() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let observer = MutationObserver::new(
            &client,
            move |_: ()| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("offline".to_string())
                }
            },
            MutationOptions::new().retry(RetryPolicy::fixed(2, Duration::from_secs(1))),
        );

        let state = observer.mutate(()).await;
        assert!(state.is_error());
        assert_eq!(state.failure_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_superseded_and_dropped_mutations_are_removed() {
        let client = QueryClient::new();
        let observer = MutationObserver::new(
            &client,
            |n: u32| async move { Ok::<_, String>(n) },
            MutationOptions::new(),
        );

        observer.mutate(1).await;
        observer.mutate(2).await;
        assert_eq!(client.mutation_cache().len(), 1);

        drop(observer);
        assert!(client.mutation_cache().is_empty());
    }

    #[tokio::test]
    async fn test_success_invalidates_queries() {
        let client = QueryClient::new();
        client
            .set_query_data::<u32, String>(QueryKey::new(["todos", "1"]), 1)
            .expect("Failed to set data");

        let observer = MutationObserver::new(
            &client,
            |_: ()| async move { Ok::<_, String>(()) },
            MutationOptions::new().invalidates([QueryKey::new(["todos"])]),
        );
        observer.mutate(()).await;

        let query = client
            .query_cache()
            .get::<u32, String>(&QueryKey::new(["todos", "1"]))
            .expect("Failed to get");
        assert!(query.state().is_invalidated);
    }

    #[test]
    fn test_mutate_outside_runtime_stays_idle() {
        let client = QueryClient::new();
        let observer = MutationObserver::new(
            &client,
            |n: u32| async move { Ok::<_, String>(n) },
            MutationOptions::new(),
        );

        let state = futures::executor::block_on(observer.mutate(1));
        assert!(state.is_idle());
        assert_eq!(client.is_mutating(None), 0);
        assert!(client.mutation_cache().is_empty());
    }

    #[test]
    fn test_get_by_id() {
        let cache = MutationCache::new();
        let mutation = cache.build::<u32, String>(None);
        assert!(cache.get::<u32, String>(mutation.id()).is_ok());
        assert!(matches!(
            cache.get::<String, String>(mutation.id()),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(cache.remove(mutation.id()));
        assert!(matches!(
            cache.get::<u32, String>(mutation.id()),
            Err(Error::NotFound(_))
        ));
    }
}
