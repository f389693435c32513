//! Store protocol spoken to every key-value backend
//!
//! The ring never talks to a socket directly. It holds `Arc<dyn Store>`
//! handles produced by a [`Connector`], which lets the same routing code run
//! against real RESP backends ([`RespStore`]) and against in-process
//! backends ([`MemoryStore`]) in tests.
//!
//! Optimistic concurrency is exposed through [`Store::watch`], which returns
//! a [`Transaction`] bound to exactly one key. The transaction reads the
//! key under the watch and then either commits one mutation of that key or
//! reports [`TxOutcome::Conflict`] when somebody else touched it first.

mod client;
mod descriptor;
mod error;
mod memory;
pub mod resp;

pub use client::{DefaultConnector, RespConnection, RespManager, RespStore};
pub use descriptor::BackendDescriptor;
pub use error::StoreError;
pub use memory::{MemoryConnector, MemoryStore};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Mutation applied to a watched key when its transaction commits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOp {
    /// Replace the value
    Set(Vec<u8>),
    /// Remove the key
    Delete,
}

/// Result of committing a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// The mutation was applied atomically
    Committed,
    /// The watched key changed after the watch; nothing was applied
    Conflict,
}

impl TxOutcome {
    #[must_use]
    #[inline]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Operations every backend supports
///
/// Every method is a single backend round trip and atomic at the backend.
/// Nothing here composes operations across keys.
#[async_trait]
pub trait Store: Send + Sync + fmt::Debug {
    /// Canonical descriptor string, used for logging and hashing
    fn name(&self) -> &str;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Set a value and its time-to-live in one step (`SET key value EX ttl`)
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Append bytes to a string value, creating it if absent
    ///
    /// Returns the length of the value after the append.
    async fn append(&self, key: &str, value: &[u8]) -> Result<u64, StoreError>;

    /// Set a time-to-live, returns false if the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remove a key, returns false if it did not exist
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Fetch several keys in one round trip, results in request order
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Add a sorted-set member, returns true if it was newly added
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, StoreError>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    /// 0-based rank of a member in ascending score order
    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Members between two ranks, inclusive; negative ranks count from the end
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Start an optimistic transaction on one key
    async fn watch(&self, key: &str) -> Result<Box<dyn Transaction>, StoreError>;
}

/// Optimistic transaction bound to a single watched key
#[async_trait]
pub trait Transaction: Send {
    /// The watched key
    fn key(&self) -> &str;

    /// Read the watched key
    async fn get(&mut self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Apply `op` to the watched key unless it changed since the watch
    async fn execute(self: Box<Self>, op: TxOp) -> Result<TxOutcome, StoreError>;

    /// Abandon the transaction without writing
    async fn discard(self: Box<Self>) -> Result<(), StoreError>;
}

/// Establishes backend handles from descriptors
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self, descriptor: &BackendDescriptor) -> Result<Arc<dyn Store>, StoreError>;
}

/// Clamp a TTL to the whole seconds a backend accepts (minimum 1)
#[must_use]
#[inline]
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Resolve Redis-style inclusive rank bounds against a collection length
///
/// Returns `None` when the range is empty.
#[must_use]
pub(crate) fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}
