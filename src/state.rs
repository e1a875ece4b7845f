//! Query state snapshots and the pure dispatch reducer.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Coarse lifecycle status of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueryStatus {
    /// No data has landed yet.
    #[default]
    Loading,
    /// Data is present.
    Success,
    /// The last settled attempt failed and no data exists.
    Error,
}

/// What started a fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchTrigger {
    /// Observer mount policy.
    Mount,
    /// Explicit `refetch()` / `execute()`.
    Manual,
    /// Refetch interval timer.
    Interval,
    /// `invalidate_queries` on an observed entity.
    Invalidation,
}

/// Metadata attached to the fetch currently (or last) in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchMeta {
    pub trigger: FetchTrigger,
    pub started_at: SystemTime,
}

impl FetchMeta {
    pub fn new(trigger: FetchTrigger) -> Self {
        FetchMeta {
            trigger,
            started_at: SystemTime::now(),
        }
    }
}

/// Immutable-per-version snapshot of a query.
///
/// Invariants held by [`reduce`]: `status == Success` implies `data` is set,
/// `status == Error` implies `error` is set, and `is_refetch_error` only ever
/// accompanies retained data.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryState<T, E> {
    pub data: Option<T>,
    pub error: Option<E>,
    pub data_updated_at: Option<SystemTime>,
    pub error_updated_at: Option<SystemTime>,
    pub is_fetching: bool,
    pub status: QueryStatus,
    pub is_invalidated: bool,
    pub is_refetch_error: bool,
    pub fetch_meta: Option<FetchMeta>,
}

impl<T, E> Default for QueryState<T, E> {
    fn default() -> Self {
        QueryState {
            data: None,
            error: None,
            data_updated_at: None,
            error_updated_at: None,
            is_fetching: false,
            status: QueryStatus::Loading,
            is_invalidated: false,
            is_refetch_error: false,
            fetch_meta: None,
        }
    }
}

impl<T, E> QueryState<T, E> {
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Whether data is older than `stale_duration` right now.
    pub fn is_stale(&self, stale_duration: Duration) -> bool {
        self.is_stale_at(stale_duration, SystemTime::now())
    }

    /// Whether data is older than `stale_duration` at `now`.
    ///
    /// A state without `data_updated_at` is never stale; use [`has_data`](Self::has_data)
    /// to detect the empty case.
    pub fn is_stale_at(&self, stale_duration: Duration, now: SystemTime) -> bool {
        match self.data_updated_at {
            Some(updated_at) => match updated_at.checked_add(stale_duration) {
                Some(deadline) => now > deadline,
                None => false,
            },
            None => false,
        }
    }
}

/// State transitions understood by [`reduce`].
#[derive(Clone, Debug)]
pub enum QueryAction<T, E> {
    /// A fetch started.
    Fetch(FetchMeta),
    /// Data landed, either live or from storage.
    Success {
        data: T,
        /// Defaults to the dispatch time. Hydration passes the stored timestamp.
        updated_at: Option<SystemTime>,
        from_storage: bool,
    },
    /// The fetch settled with a failure after retries.
    Error(E),
    /// Data is marked outdated without being cleared.
    Invalidate,
}

impl<T, E> QueryAction<T, E> {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            QueryAction::Fetch(_) => "fetch",
            QueryAction::Success {
                from_storage: true, ..
            } => "success(storage)",
            QueryAction::Success { .. } => "success",
            QueryAction::Error(_) => "error",
            QueryAction::Invalidate => "invalidate",
        }
    }
}

/// Apply `action` to `state`, producing the next state.
pub fn reduce<T: Clone, E: Clone>(
    state: &QueryState<T, E>,
    action: QueryAction<T, E>,
    now: SystemTime,
) -> QueryState<T, E> {
    let mut next = state.clone();
    match action {
        QueryAction::Fetch(meta) => {
            next.is_fetching = true;
            next.is_invalidated = false;
            next.fetch_meta = Some(meta);
        }
        QueryAction::Success {
            data,
            updated_at,
            from_storage,
        } => {
            next.data = Some(data);
            next.data_updated_at = Some(updated_at.unwrap_or(now));
            next.status = QueryStatus::Success;
            next.error = None;
            next.is_refetch_error = false;
            // A storage load does not settle a live fetch that may be in flight.
            if !from_storage {
                next.is_fetching = false;
            }
        }
        QueryAction::Error(error) => {
            next.error = Some(error);
            next.error_updated_at = Some(now);
            next.is_fetching = false;
            if state.status == QueryStatus::Success {
                next.is_refetch_error = true;
            } else {
                next.status = QueryStatus::Error;
            }
        }
        QueryAction::Invalidate => {
            next.is_invalidated = true;
        }
    }
    next
}
