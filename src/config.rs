//! Client-wide query defaults.
//!
//! A [`QueryConfig`] is set once on the client. Observers carry
//! [`QueryOptions`](crate::observer::QueryOptions) whose `Some(..)` fields
//! override it; `None` falls back to the client value.

use crate::retry::RetryPolicy;
use std::time::Duration;

/// Whether an observer fetches immediately when it becomes enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RefetchOnMount {
    /// Always fetch on mount.
    Always,
    /// Fetch only if the cached data is stale (or absent).
    #[default]
    IfStale,
    /// Never fetch on mount; manual and interval triggers still apply.
    Never,
}

/// Effective configuration of a query entity.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryConfig {
    /// How long data stays fresh after `data_updated_at`.
    pub stale_duration: Duration,

    /// How long an entity with no observers survives before eviction.
    /// Also bounds the age of a storage record accepted during hydration.
    pub cache_duration: Duration,

    /// Retry policy for fetch failures.
    pub retry: RetryPolicy,

    /// Repeating refetch period while observed. `None` disables it.
    pub refetch_interval: Option<Duration>,

    /// Mount policy.
    pub refetch_on_mount: RefetchOnMount,

    /// Whether observers start enabled.
    pub enabled: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            stale_duration: Duration::ZERO,
            cache_duration: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
            refetch_interval: None,
            refetch_on_mount: RefetchOnMount::default(),
            enabled: true,
        }
    }
}

impl QueryConfig {
    pub fn with_stale_duration(mut self, duration: Duration) -> Self {
        self.stale_duration = duration;
        self
    }

    pub fn with_cache_duration(mut self, duration: Duration) -> Self {
        self.cache_duration = duration;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn with_refetch_on_mount(mut self, policy: RefetchOnMount) -> Self {
        self.refetch_on_mount = policy;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueryConfig::default();
        assert_eq!(config.stale_duration, Duration::ZERO);
        assert_eq!(config.cache_duration, Duration::from_secs(300));
        assert_eq!(config.refetch_on_mount, RefetchOnMount::IfStale);
        assert!(config.enabled);
        assert!(config.refetch_interval.is_none());
    }

    #[test]
    fn test_builder() {
        let config = QueryConfig::default()
            .with_stale_duration(Duration::from_secs(30))
            .with_retry(RetryPolicy::Never)
            .with_refetch_interval(Duration::from_secs(10))
            .with_enabled(false);

        assert_eq!(config.stale_duration, Duration::from_secs(30));
        assert_eq!(config.retry, RetryPolicy::Never);
        assert_eq!(config.refetch_interval, Some(Duration::from_secs(10)));
        assert!(!config.enabled);
    }
}
