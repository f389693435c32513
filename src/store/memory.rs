//! In-process backend
//!
//! Implements the whole store protocol over a mutex-guarded map. Every key
//! carries a version counter that is bumped on each mutation, including
//! deletion and lazy expiry, which is what a [`MemoryTransaction`] compares
//! against to detect conflicts. While a key is watched its version outlives
//! the value, so a delete-then-recreate between watch and commit is still a
//! conflict; the versions of absent, unwatched keys are forgotten.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{
    BackendDescriptor, Connector, Store, StoreError, Transaction, TxOp, TxOutcome, resolve_range,
    ttl_secs,
};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
    SortedSet(HashMap<String, f64>),
}

impl Value {
    const fn type_name(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "string",
            Self::Set(_) => "set",
            Self::SortedSet(_) => "zset",
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    versions: HashMap<String, u64>,
    /// Open transactions per key
    watchers: HashMap<String, usize>,
    /// Watches still to be spoiled by a simulated concurrent write
    contended: HashMap<String, u32>,
}

impl State {
    fn bump(&mut self, key: &str) {
        if self.entries.contains_key(key) || self.watchers.contains_key(key) {
            *self.versions.entry(key.to_string()).or_insert(0) += 1;
        } else {
            self.versions.remove(key);
        }
    }

    fn watch(&mut self, key: &str) {
        *self.watchers.entry(key.to_string()).or_insert(0) += 1;
    }

    fn unwatch(&mut self, key: &str) {
        if let Some(count) = self.watchers.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.watchers.remove(key);
                if !self.entries.contains_key(key) {
                    self.versions.remove(key);
                }
            }
        }
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// Drop the key if its TTL has passed
    fn purge_expired(&mut self, key: &str) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
            self.bump(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_expired(key);
        self.entries.get_mut(key)
    }

    fn wrong_type(key: &str, found: &Value) -> StoreError {
        StoreError::Server(format!(
            "WRONGTYPE key {key:?} holds a {}",
            found.type_name()
        ))
    }

    fn bytes(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Bytes(b),
                ..
            }) => Ok(Some(b.clone())),
            Some(other) => Err(Self::wrong_type(key, &other.value)),
        }
    }

    fn set_bytes(&mut self, key: &str, value: Vec<u8>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value),
                expires_at: None,
            },
        );
        self.bump(key);
    }

    fn remove(&mut self, key: &str) -> bool {
        self.purge_expired(key);
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.bump(key);
        }
        removed
    }

    fn set_members(&mut self, key: &str) -> Result<Option<&mut BTreeSet<String>>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(Some(members)),
            Some(other) => Err(Self::wrong_type(key, &other.value)),
        }
    }

    fn zset(&mut self, key: &str) -> Result<Option<&mut HashMap<String, f64>>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::SortedSet(members),
                ..
            }) => Ok(Some(members)),
            Some(other) => Err(Self::wrong_type(key, &other.value)),
        }
    }

    /// Sorted-set members ordered by (score, member)
    fn zset_sorted(&mut self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        let Some(members) = self.zset(key)? else {
            return Ok(Vec::new());
        };
        let mut sorted: Vec<(String, f64)> =
            members.iter().map(|(m, s)| (m.clone(), *s)).collect();
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(sorted)
    }
}

#[derive(Debug)]
struct Inner {
    name: String,
    state: Mutex<State>,
    offline: AtomicBool,
}

/// In-memory [`Store`]
///
/// Cloning yields another handle to the same data.
///
/// # Examples
///
/// ```
/// use driftwatch::store::{MemoryStore, Store};
///
/// # tokio_test_block_on(async {
/// let store = MemoryStore::new("memory://doc");
/// store.append("full.cpu", b"ab").await.unwrap();
/// store.append("full.cpu", b"cd").await.unwrap();
/// assert_eq!(store.get("full.cpu").await.unwrap(), Some(b"abcd".to_vec()));
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// Make every call fail as if the backend went away
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    /// Spoil the next `times` transactions on `key`
    ///
    /// Each watch on the key is immediately followed by a simulated write
    /// from another client, so the transaction commits as a conflict.
    pub fn contend(&self, key: &str, times: u32) {
        let mut state = self.lock_unchecked();
        if times == 0 {
            state.contended.remove(key);
        } else {
            state.contended.insert(key.to_string(), times);
        }
    }

    /// Number of live keys
    #[must_use]
    pub fn key_count(&self) -> usize {
        let mut state = self.lock_unchecked();
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in &keys {
            state.purge_expired(key);
        }
        state.entries.len()
    }

    /// Remaining time to live of a key
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.lock_unchecked();
        state
            .live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    #[cfg(test)]
    fn tracked_versions(&self) -> usize {
        self.lock_unchecked().versions.len()
    }

    fn lock_unchecked(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves the map consistent
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if self.is_offline() {
            return Err(StoreError::Offline(self.inner.name.clone()));
        }
        Ok(self.lock_unchecked())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.lock()?.bytes(key)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.lock()?.set_bytes(key, value.to_vec());
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.set_bytes(key, value.to_vec());
        if let Some(entry) = state.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs(ttl)));
        }
        Ok(())
    }

    async fn append(&self, key: &str, value: &[u8]) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let len = match state.live(key) {
            None => {
                state.set_bytes(key, value.to_vec());
                value.len()
            }
            Some(Entry {
                value: Value::Bytes(existing),
                ..
            }) => {
                existing.extend_from_slice(value);
                let len = existing.len();
                state.bump(key);
                len
            }
            Some(other) => return Err(State::wrong_type(key, &other.value)),
        };
        Ok(len as u64)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let Some(entry) = state.live(key) else {
            return Ok(false);
        };
        entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs(ttl)));
        state.bump(key);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(key))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        let mut state = self.lock()?;
        // MGET reports nil for keys of the wrong type
        Ok(keys
            .iter()
            .map(|key| state.bytes(key).unwrap_or(None))
            .collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let added = match state.set_members(key)? {
            Some(members) => members.insert(member.to_string()),
            None => {
                let mut members = BTreeSet::new();
                members.insert(member.to_string());
                state.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(members),
                        expires_at: None,
                    },
                );
                true
            }
        };
        if added {
            state.bump(key);
        }
        Ok(added)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let (removed, now_empty) = match state.set_members(key)? {
            Some(members) => (members.remove(member), members.is_empty()),
            None => (false, false),
        };
        if removed {
            if now_empty {
                state.entries.remove(key);
            }
            state.bump(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut state = self.lock()?;
        Ok(state
            .set_members(key)?
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let added = match state.zset(key)? {
            Some(members) => members.insert(member.to_string(), score).is_none(),
            None => {
                let mut members = HashMap::new();
                members.insert(member.to_string(), score);
                state.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::SortedSet(members),
                        expires_at: None,
                    },
                );
                true
            }
        };
        state.bump(key);
        Ok(added)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let mut state = self.lock()?;
        Ok(state.zset(key)?.and_then(|m| m.get(member).copied()))
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError> {
        let sorted = self.lock()?.zset_sorted(key)?;
        Ok(sorted
            .iter()
            .position(|(m, _)| m == member)
            .map(|p| p as u64))
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        Ok(state.zset(key)?.map_or(0, |m| m.len() as u64))
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let sorted = self.lock()?.zset_sorted(key)?;
        Ok(match resolve_range(sorted.len(), start, stop) {
            Some((from, to)) => sorted[from..=to].iter().map(|(m, _)| m.clone()).collect(),
            None => Vec::new(),
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let (removed, now_empty) = match state.zset(key)? {
            Some(members) => (members.remove(member).is_some(), members.is_empty()),
            None => (false, false),
        };
        if removed {
            if now_empty {
                state.entries.remove(key);
            }
            state.bump(key);
        }
        Ok(removed)
    }

    async fn watch(&self, key: &str) -> Result<Box<dyn Transaction>, StoreError> {
        let version = {
            let mut state = self.lock()?;
            state.purge_expired(key);
            state.watch(key);
            let version = state.version(key);
            if let Some(left) = state.contended.get_mut(key) {
                *left -= 1;
                if *left == 0 {
                    state.contended.remove(key);
                }
                state.bump(key);
            }
            version
        };
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            key: key.to_string(),
            version,
        }))
    }
}

/// Transaction over a [`MemoryStore`], committed under the store lock
#[derive(Debug)]
pub struct MemoryTransaction {
    store: MemoryStore,
    key: String,
    version: u64,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn key(&self) -> &str {
        &self.key
    }

    async fn get(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.lock()?.bytes(&self.key)
    }

    async fn execute(self: Box<Self>, op: TxOp) -> Result<TxOutcome, StoreError> {
        let mut state = self.store.lock()?;
        state.purge_expired(&self.key);
        if state.version(&self.key) != self.version {
            return Ok(TxOutcome::Conflict);
        }
        match op {
            TxOp::Set(value) => state.set_bytes(&self.key, value),
            TxOp::Delete => {
                state.remove(&self.key);
            }
        }
        Ok(TxOutcome::Committed)
    }

    async fn discard(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.store.lock_unchecked().unwatch(&self.key);
    }
}

/// Connector resolving `memory://name` descriptors to shared stores
///
/// Connecting twice with the same name yields handles to the same data,
/// so a ring that drops and reconnects a backend sees its old contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    stores: Arc<Mutex<HashMap<String, MemoryStore>>>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the store registered under `name`
    #[must_use]
    pub fn store(&self, name: &str) -> MemoryStore {
        let mut stores = self
            .stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stores
            .entry(name.to_string())
            .or_insert_with(|| MemoryStore::new(format!("memory://{name}")))
            .clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, descriptor: &BackendDescriptor) -> Result<Arc<dyn Store>, StoreError> {
        let BackendDescriptor::Memory { name } = descriptor else {
            return Err(StoreError::InvalidDescriptor {
                descriptor: descriptor.to_string(),
                reason: "only memory:// backends are available".into(),
            });
        };
        let store = self.store(name);
        store.ping().await?;
        Ok(Arc::new(store))
    }
}
