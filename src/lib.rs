//! # query-kit
//!
//! An async, client-side cache for remote data.
//!
//! ## Features
//!
//! - **Deduplicated fetches:** at most one fetch per key is in flight; concurrent callers share it
//! - **Staleness tracking:** data carries its age and is refetched on mount, interval or invalidation
//! - **Retries:** fixed or exponential back-off policies, configurable per observer
//! - **Garbage collection:** unobserved queries are evicted after a configurable cache duration
//! - **Mutations:** tracked writes with pending counts and post-success invalidation
//! - **Optional persistence:** results written through any [`StorageAdapter`](storage::StorageAdapter)
//!   and hydrated back when fresh enough
//!
//! ## Quick Start
//!
//! ```no_run
//! use query_kit::{QueryClient, QueryObserver, QueryOptions};
//!
//! #[derive(Clone, Debug)]
//! struct Todo {
//!     id: u64,
//!     title: String,
//! }
//!
//! async fn fetch_todos() -> Result<Vec<Todo>, String> {
//!     Ok(vec![Todo { id: 1, title: "write docs".to_string() }])
//! }
//!
//! #[tokio::main]
//! async fn main() -> query_kit::Result<()> {
//!     let client = QueryClient::new();
//!
//!     // 1. Observe a key; the first observer triggers the fetch
//!     let todos = QueryObserver::new(&client, "todos", fetch_todos, QueryOptions::new())?;
//!
//!     // 2. React to changes
//!     let _sub = todos.subscribe(|result| println!("todos: {:?}", result.data()));
//!
//!     // 3. Await the fetch (it runs either way)
//!     let state = todos.refetch().await?;
//!     assert!(state.is_success());
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate log;

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod key;
pub mod mutation;
pub mod notify;
pub mod observer;
pub mod query;
pub mod retry;
pub mod serialization;
pub mod state;
pub mod storage;

// Re-exports for convenience
pub use cache::{CacheEvent, QueryCache};
pub use client::{ClientBuilder, QueryClient};
pub use config::{QueryConfig, RefetchOnMount};
pub use error::{Error, Result};
pub use key::QueryKey;
pub use mutation::{
    MutationCache, MutationObserver, MutationOptions, MutationState, MutationStatus,
};
pub use notify::Subscription;
pub use observer::{QueryObserver, QueryOptions, QueryResult};
pub use query::Query;
pub use retry::RetryPolicy;
pub use state::{FetchTrigger, QueryState, QueryStatus};

#[doc(hidden)]
pub use serde_json as __serde_json;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
