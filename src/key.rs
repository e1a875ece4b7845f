//! Query key canonicalization.
//!
//! A [`QueryKey`] is built from an ordered sequence of parts (strings, numbers,
//! structured values). Two keys are equal iff their canonical JSON forms are
//! equal, so `["todos", 1]` and `[1, "todos"]` are different keys.

use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Namespace prefix for persisted query records.
pub const STORAGE_PREFIX: &str = "query";

/// Canonical, hashable identity of a query.
///
/// # Example
///
/// ```
/// use query_kit::{query_key, QueryKey};
///
/// let a = query_key!["todos", 1];
/// let b = QueryKey::new(vec![serde_json::json!("todos"), serde_json::json!(1)]);
/// assert_eq!(a, b);
/// assert_ne!(a, query_key![1, "todos"]);
/// assert_eq!(a.as_str(), r#"["todos",1]"#);
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    canonical: Arc<str>,
}

impl QueryKey {
    /// Build a key from ordered parts.
    pub fn new<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Value>,
    {
        let parts: Vec<Value> = parts.into_iter().map(Into::into).collect();
        // Object keys are kept sorted by serde_json's default map, which makes
        // the compact rendering canonical.
        QueryKey {
            canonical: Value::Array(parts).to_string().into(),
        }
    }

    /// Build a key from any serializable value.
    ///
    /// Sequences become the key parts; any other value becomes a single-part key.
    ///
    /// # Errors
    ///
    /// Returns `Error::SerializationError` if the value cannot be represented as JSON.
    pub fn from_serialize<S: Serialize + ?Sized>(parts: &S) -> Result<Self> {
        let value = serde_json::to_value(parts)
            .map_err(|e| crate::error::Error::SerializationError(e.to_string()))?;
        Ok(match value {
            Value::Array(parts) => QueryKey::new(parts),
            single => QueryKey::new([single]),
        })
    }

    /// Canonical (serialized) form.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The ordered parts this key was built from.
    pub fn parts(&self) -> Vec<Value> {
        serde_json::from_str(&self.canonical).unwrap_or_default()
    }

    /// Whether `prefix`'s parts are a leading subsequence of this key's parts.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        let parts = self.parts();
        let prefix = prefix.parts();
        prefix.len() <= parts.len() && parts.iter().zip(prefix.iter()).all(|(a, b)| a == b)
    }

    /// Key under which the query's record is persisted.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", STORAGE_PREFIX, self.canonical)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.canonical)
    }
}

impl From<&str> for QueryKey {
    fn from(part: &str) -> Self {
        QueryKey::new([part])
    }
}

impl From<String> for QueryKey {
    fn from(part: String) -> Self {
        QueryKey::new([part])
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(key: &QueryKey) -> Self {
        key.clone()
    }
}

/// Build a [`QueryKey`] from heterogeneous parts.
///
/// Each part goes through `serde_json::json!`, so literals, variables and
/// JSON-like object syntax are all accepted.
#[macro_export]
macro_rules! query_key {
    ($($part:tt),* $(,)?) => {
        $crate::QueryKey::new(::std::vec![$($crate::__serde_json::json!($part)),*])
    };
}
