//! Encoding of query results for persistent storage.
//!
//! Two layers:
//!
//! - A [`Serializer<T>`] turns a query's typed data into bytes and back. It is
//!   chosen per query at the call site, so the cache core never inspects data
//!   types at runtime.
//! - Every persisted record is wrapped in a versioned postcard envelope:
//!
//! ```text
//! ┌─────────────────┬─────────────────┬──────────────────────────┐
//! │  MAGIC (4 bytes)│VERSION (varint) │POSTCARD PAYLOAD (N bytes)│
//! └─────────────────┴─────────────────┴──────────────────────────┘
//!   "QKIT"              u32                postcard::to_allocvec(T)
//! ```
//!
//! # Example
//!
//! ```rust
//! use query_kit::serialization::{JsonSerializer, PostcardSerializer, Serializer};
//!
//! # fn main() -> query_kit::Result<()> {
//! let postcard = PostcardSerializer;
//! let bytes = postcard.serialize(&vec![1u32, 2, 3])?;
//! let back: Vec<u32> = postcard.deserialize(&bytes)?;
//! assert_eq!(back, vec![1, 2, 3]);
//!
//! let json = JsonSerializer;
//! assert_eq!(Serializer::<String>::serialize(&json, &"hi".to_string())?, b"\"hi\"".to_vec());
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// Magic header for persisted records: b"QKIT"
pub const STORAGE_MAGIC: [u8; 4] = *b"QKIT";

/// Current schema version of persisted records.
///
/// Increment when the shape of [`StoredQuery`](crate::storage::StoredQuery)
/// changes; older records then fail validation and are ignored.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Versioned envelope around every persisted record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    /// Magic header: must be b"QKIT"
    pub magic: [u8; 4],
    /// Schema version: must match CURRENT_SCHEMA_VERSION
    pub version: u32,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            magic: STORAGE_MAGIC,
            version: CURRENT_SCHEMA_VERSION,
            payload,
        }
    }
}

/// Serialize a value inside an envelope.
///
/// # Errors
///
/// Returns `Error::SerializationError` if postcard serialization fails.
pub fn encode_envelope<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(&Envelope::new(value)).map_err(|e| {
        log::error!("Record serialization failed: {}", e);
        Error::SerializationError(e.to_string())
    })
}

/// Deserialize an enveloped value, validating magic and version.
///
/// # Errors
///
/// - `Error::DeserializationError`: corrupted postcard payload
/// - `Error::InvalidStoredEntry`: bad magic header
/// - `Error::VersionMismatch`: record written by another schema version
pub fn decode_envelope<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let envelope: Envelope<T> = postcard::from_bytes(bytes).map_err(|e| {
        log::warn!("Record deserialization failed: {}", e);
        Error::DeserializationError(e.to_string())
    })?;

    if envelope.magic != STORAGE_MAGIC {
        log::warn!(
            "Invalid stored entry: expected magic {:?}, got {:?}",
            STORAGE_MAGIC,
            envelope.magic
        );
        return Err(Error::InvalidStoredEntry(format!(
            "Invalid magic: expected {:?}, got {:?}",
            STORAGE_MAGIC, envelope.magic
        )));
    }

    if envelope.version != CURRENT_SCHEMA_VERSION {
        log::warn!(
            "Stored record version mismatch: expected {}, got {}",
            CURRENT_SCHEMA_VERSION,
            envelope.version
        );
        return Err(Error::VersionMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: envelope.version,
        });
    }

    Ok(envelope.payload)
}

/// Bridge between a query's typed data and the storage representation.
pub trait Serializer<T>: Send + Sync {
    /// Encode `value` for storage.
    fn serialize(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode a stored payload. Invoked only on freshness-checked hydration.
    fn deserialize(&self, raw: &[u8]) -> Result<T>;
}

/// Postcard encoding inside the versioned envelope. Compact; the default for
/// [`QueryOptions::persisted`](crate::observer::QueryOptions::persisted).
#[derive(Clone, Copy, Debug, Default)]
pub struct PostcardSerializer;

impl<T: Serialize + DeserializeOwned> Serializer<T> for PostcardSerializer {
    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        encode_envelope(value)
    }

    fn deserialize(&self, raw: &[u8]) -> Result<T> {
        decode_envelope(raw)
    }
}

/// Plain JSON encoding, readable by other tooling.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl<T: Serialize + DeserializeOwned> Serializer<T> for JsonSerializer {
    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, raw: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Encode/decode pair supplied as closures.
pub struct FnSerializer<T, S, D> {
    encode: S,
    decode: D,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S, D> FnSerializer<T, S, D>
where
    S: Fn(&T) -> Result<Vec<u8>> + Send + Sync,
    D: Fn(&[u8]) -> Result<T> + Send + Sync,
{
    pub fn new(encode: S, decode: D) -> Self {
        FnSerializer {
            encode,
            decode,
            _marker: PhantomData,
        }
    }
}

impl<T, S, D> Serializer<T> for FnSerializer<T, S, D>
where
    S: Fn(&T) -> Result<Vec<u8>> + Send + Sync,
    D: Fn(&[u8]) -> Result<T> + Send + Sync,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        (self.encode)(value)
    }

    fn deserialize(&self, raw: &[u8]) -> Result<T> {
        (self.decode)(raw)
    }
}
