//! Consistent-hash routing over key-value backends
//!
//! A [`Ring`] tracks every configured backend as either live (placed on the
//! continuum) or failed (off it). Routing only ever considers live backends.
//! [`Ring::check_connections`] pings live backends and walks failed ones
//! through reconnection until they run out of attempts.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use driftwatch::ring::Ring;
//! use driftwatch::store::{BackendDescriptor, MemoryConnector};
//! use driftwatch::types::MaxFailures;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let backends = vec![
//!     BackendDescriptor::memory("a"),
//!     BackendDescriptor::memory("b"),
//! ];
//! let ring = Ring::connect(&backends, Arc::new(MemoryConnector::new()), MaxFailures::DEFAULT)
//!     .await
//!     .unwrap();
//!
//! ring.append("full.cpu", b"\x92\x01\x02").await.unwrap();
//! assert_eq!(ring.get("full.cpu").await.unwrap(), Some(b"\x92\x01\x02".to_vec()));
//! # });
//! ```

mod continuum;
mod error;
mod health;

pub use continuum::{Continuum, hash_key};
pub use error::RingError;
pub use health::{BackendHealth, BackendStatus};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::constants::ring::REBUILD_BACKOFF;
use crate::liveness::{Liveness, LivenessError};
use crate::store::{BackendDescriptor, Connector, Store, StoreError, Transaction};
use crate::types::{BackendId, MaxFailures};

#[derive(Debug)]
struct Backend {
    descriptor: BackendDescriptor,
    name: String,
    /// Present while the backend is live
    store: Option<Arc<dyn Store>>,
    health: BackendHealth,
}

#[derive(Debug, Default)]
struct RingState {
    backends: Vec<Backend>,
    continuum: Continuum,
}

impl RingState {
    fn mark_live(&mut self, id: BackendId, store: Arc<dyn Store>) {
        let backend = &mut self.backends[id.as_index()];
        backend.store = Some(store);
        backend.health.record_success();
        self.continuum.add(id, &backend.name);
    }

    fn mark_down(&mut self, id: BackendId, max_failures: MaxFailures) -> BackendStatus {
        self.continuum.remove(id);
        let backend = &mut self.backends[id.as_index()];
        backend.store = None;
        backend.health.record_failure(max_failures)
    }

    fn live_count(&self) -> usize {
        self.backends.iter().filter(|b| b.health.is_live()).count()
    }
}

/// Health snapshot of one backend
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub id: BackendId,
    pub name: String,
    pub status: BackendStatus,
    pub consecutive_failures: u32,
    pub total_failures: u64,
}

/// Router mapping keys to live backends
#[derive(Debug)]
pub struct Ring {
    state: RwLock<RingState>,
    connector: Arc<dyn Connector>,
    max_failures: MaxFailures,
}

impl Ring {
    /// Empty ring; add backends with [`Ring::add_backend`]
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, max_failures: MaxFailures) -> Self {
        Self {
            state: RwLock::new(RingState::default()),
            connector,
            max_failures,
        }
    }

    /// Build a ring over `descriptors`
    ///
    /// Backends that cannot be reached are kept in the failed set and retried
    /// by [`Ring::check_connections`]. Fails only if none could be reached.
    pub async fn connect(
        descriptors: &[BackendDescriptor],
        connector: Arc<dyn Connector>,
        max_failures: MaxFailures,
    ) -> Result<Self, RingError> {
        let ring = Self::new(connector, max_failures);
        for descriptor in descriptors {
            if let Err(e) = ring.add_backend(descriptor.clone()).await {
                warn!("Could not connect to {}: {}", descriptor, e);
            }
        }
        if ring.live_count().await == 0 {
            return Err(RingError::NoLiveBackends);
        }
        info!(
            "Ring ready with {}/{} live backends",
            ring.live_count().await,
            descriptors.len()
        );
        Ok(ring)
    }

    /// Connect a backend and place it on the continuum
    ///
    /// The backend is tracked even when the connection fails: it then starts
    /// in the failed set with one failure recorded, and the error is returned.
    pub async fn add_backend(&self, descriptor: BackendDescriptor) -> Result<BackendId, RingError> {
        let mut state = self.state.write().await;
        let id = BackendId::from_index(state.backends.len());
        let name = descriptor.to_string();
        debug!("Adding {} as {}", name, id);

        let connected = self.connector.connect(&descriptor).await;
        state.backends.push(Backend {
            descriptor,
            name,
            store: None,
            health: BackendHealth::new(),
        });

        match connected {
            Ok(store) => {
                state.mark_live(id, store);
                Ok(id)
            }
            Err(source) => {
                state.mark_down(id, self.max_failures);
                Err(RingError::unavailable(id, source))
            }
        }
    }

    /// Backend owning `key`
    pub async fn route(&self, key: &str) -> Result<BackendId, RingError> {
        self.state
            .read()
            .await
            .continuum
            .locate(key)
            .ok_or(RingError::NoLiveBackends)
    }

    async fn store_for(&self, key: &str) -> Result<(BackendId, Arc<dyn Store>), RingError> {
        let state = self.state.read().await;
        let id = state.continuum.locate(key).ok_or(RingError::NoLiveBackends)?;
        let store = state.backends[id.as_index()]
            .store
            .clone()
            .ok_or(RingError::NoLiveBackends)?;
        Ok((id, store))
    }

    /// Route `key` and run `op` against its backend
    async fn on_key<T, F, Fut>(&self, key: &str, op: F) -> Result<T, RingError>
    where
        F: FnOnce(Arc<dyn Store>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let (id, store) = self.store_for(key).await?;
        op(store)
            .await
            .map_err(|source| RingError::unavailable(id, source))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RingError> {
        self.on_key(key, |s| async move { s.get(key).await }).await
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<(), RingError> {
        self.on_key(key, |s| async move { s.set(key, value).await })
            .await
    }

    pub async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), RingError> {
        self.on_key(key, |s| async move { s.set_ex(key, value, ttl).await })
            .await
    }

    pub async fn append(&self, key: &str, value: &[u8]) -> Result<u64, RingError> {
        self.on_key(key, |s| async move { s.append(key, value).await })
            .await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, RingError> {
        self.on_key(key, |s| async move { s.expire(key, ttl).await })
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, RingError> {
        self.on_key(key, |s| async move { s.delete(key).await }).await
    }

    /// Fetch many keys, possibly spread over several backends
    ///
    /// Keys are grouped by owning backend, one `MGET` per backend, and the
    /// results are put back in request order.
    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, RingError> {
        let mut groups: BTreeMap<BackendId, (Arc<dyn Store>, Vec<usize>)> = BTreeMap::new();
        {
            let state = self.state.read().await;
            for (i, key) in keys.iter().enumerate() {
                let id = state.continuum.locate(key).ok_or(RingError::NoLiveBackends)?;
                let store = state.backends[id.as_index()]
                    .store
                    .clone()
                    .ok_or(RingError::NoLiveBackends)?;
                groups.entry(id).or_insert_with(|| (store, Vec::new())).1.push(i);
            }
        }

        let mut results: Vec<Option<Vec<u8>>> = vec![None; keys.len()];
        for (id, (store, indices)) in groups {
            let batch: Vec<String> = indices.iter().map(|&i| keys[i].clone()).collect();
            let values = store
                .mget(&batch)
                .await
                .map_err(|source| RingError::unavailable(id, source))?;
            for (i, value) in indices.into_iter().zip(values) {
                results[i] = value;
            }
        }
        Ok(results)
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool, RingError> {
        self.on_key(key, |s| async move { s.sadd(key, member).await })
            .await
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<bool, RingError> {
        self.on_key(key, |s| async move { s.srem(key, member).await })
            .await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, RingError> {
        self.on_key(key, |s| async move { s.smembers(key).await })
            .await
    }

    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, RingError> {
        self.on_key(key, |s| async move { s.zadd(key, score, member).await })
            .await
    }

    pub async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, RingError> {
        self.on_key(key, |s| async move { s.zscore(key, member).await })
            .await
    }

    pub async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>, RingError> {
        self.on_key(key, |s| async move { s.zrank(key, member).await })
            .await
    }

    pub async fn zcard(&self, key: &str) -> Result<u64, RingError> {
        self.on_key(key, |s| async move { s.zcard(key).await }).await
    }

    pub async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, RingError> {
        self.on_key(key, |s| async move { s.zrange(key, start, stop).await })
            .await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool, RingError> {
        self.on_key(key, |s| async move { s.zrem(key, member).await })
            .await
    }

    /// Start an optimistic transaction on the backend owning `key`
    pub async fn watch(&self, key: &str) -> Result<Box<dyn Transaction>, RingError> {
        self.on_key(key, |s| async move { s.watch(key).await })
            .await
    }

    /// Ping every backend, demoting and reconnecting as needed
    ///
    /// The write lock is held for the whole pass, so reconnection of any one
    /// backend is never attempted twice concurrently. A live backend that
    /// fails its ping leaves the continuum and is reconnected right away
    /// while it has attempts left; a down backend gets one attempt per pass
    /// until exhausted. Fails with [`RingError::NoLiveBackends`] when nothing
    /// is left live.
    pub async fn check_connections(&self) -> Result<(), RingError> {
        let mut state = self.state.write().await;

        for index in 0..state.backends.len() {
            let id = BackendId::from_index(index);
            if state.backends[index].health.is_exhausted() {
                continue;
            }

            if let Some(store) = state.backends[index].store.clone() {
                match store.ping().await {
                    Ok(()) => {
                        state.backends[index].health.record_success();
                        continue;
                    }
                    Err(e) => {
                        let status = state.mark_down(id, self.max_failures);
                        warn!(
                            "{} ({}) failed ping: {} [{:?}]",
                            id, state.backends[index].name, e, status
                        );
                    }
                }
            }

            if state.backends[index].health.is_exhausted() {
                warn!("{} ({}) dropped from the ring", id, state.backends[index].name);
                continue;
            }

            // One reconnection attempt per pass
            let descriptor = state.backends[index].descriptor.clone();
            let attempt = match self.connector.connect(&descriptor).await {
                Ok(store) => store.ping().await.map(|()| store),
                Err(e) => Err(e),
            };
            match attempt {
                Ok(store) => {
                    info!("{} ({}) reconnected", id, descriptor);
                    state.mark_live(id, store);
                }
                Err(e) => {
                    let status = state.mark_down(id, self.max_failures);
                    warn!("{} ({}) reconnect failed: {} [{:?}]", id, descriptor, e, status);
                }
            }
        }

        if state.live_count() == 0 {
            return Err(RingError::NoLiveBackends);
        }
        Ok(())
    }

    /// Number of live backends
    pub async fn live_count(&self) -> usize {
        self.state.read().await.live_count()
    }

    /// Live backend ids, in configuration order
    pub async fn live_backends(&self) -> Vec<BackendId> {
        self.state
            .read()
            .await
            .backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.health.is_live())
            .map(|(i, _)| BackendId::from_index(i))
            .collect()
    }

    /// Backends currently off the continuum
    pub async fn failed_backends(&self) -> Vec<BackendId> {
        self.state
            .read()
            .await
            .backends
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.health.is_live())
            .map(|(i, _)| BackendId::from_index(i))
            .collect()
    }

    /// Health of every tracked backend
    pub async fn snapshot(&self) -> Vec<BackendSnapshot> {
        self.state
            .read()
            .await
            .backends
            .iter()
            .enumerate()
            .map(|(i, b)| BackendSnapshot {
                id: BackendId::from_index(i),
                name: b.name.clone(),
                status: b.health.status,
                consecutive_failures: b.health.consecutive_failures,
                total_failures: b.health.total_failures,
            })
            .collect()
    }
}

/// Everything needed to (re)build a [`Ring`]
///
/// Services keep one of these so a ring that lost every backend can be
/// thrown away and constructed afresh.
#[derive(Debug, Clone)]
pub struct RingFactory {
    descriptors: Vec<BackendDescriptor>,
    connector: Arc<dyn Connector>,
    max_failures: MaxFailures,
}

impl RingFactory {
    #[must_use]
    pub fn new(
        descriptors: Vec<BackendDescriptor>,
        connector: Arc<dyn Connector>,
        max_failures: MaxFailures,
    ) -> Self {
        Self {
            descriptors,
            connector,
            max_failures,
        }
    }

    #[must_use]
    pub fn descriptors(&self) -> &[BackendDescriptor] {
        &self.descriptors
    }

    /// Connect a new ring
    pub async fn build(&self) -> Result<Ring, RingError> {
        Ring::connect(&self.descriptors, self.connector.clone(), self.max_failures).await
    }

    /// Connect a new ring, retrying after [`REBUILD_BACKOFF`] until one comes up
    pub async fn build_until_ready(&self, liveness: &Liveness) -> Result<Ring, LivenessError> {
        loop {
            match self.build().await {
                Ok(ring) => return Ok(ring),
                Err(e) => {
                    warn!("Ring unavailable: {}, retrying in {:?}", e, REBUILD_BACKOFF);
                    liveness.sleep(REBUILD_BACKOFF).await?;
                }
            }
        }
    }

    /// Health-check `ring`, replacing it if no backend is left
    ///
    /// Returns `true` if the ring was usable as is.
    pub async fn ensure_ready(
        &self,
        ring: &mut Ring,
        liveness: &Liveness,
    ) -> Result<bool, LivenessError> {
        match ring.check_connections().await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Ring check failed: {}, rebuilding in {:?}", e, REBUILD_BACKOFF);
                liveness.sleep(REBUILD_BACKOFF).await?;
                *ring = self.build_until_ready(liveness).await?;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConnector;

    async fn ring_of(connector: &MemoryConnector, names: &[&str]) -> Ring {
        let descriptors: Vec<BackendDescriptor> =
            names.iter().map(|n| BackendDescriptor::memory(*n)).collect();
        Ring::connect(
            &descriptors,
            Arc::new(connector.clone()),
            MaxFailures::new(3).unwrap(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_requires_one_live_backend() {
        let connector = MemoryConnector::new();
        connector.store("a").set_offline(true);
        let result = Ring::connect(
            &[BackendDescriptor::memory("a")],
            Arc::new(connector),
            MaxFailures::DEFAULT,
        )
        .await;
        assert!(matches!(result, Err(RingError::NoLiveBackends)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_starts_failed() {
        let connector = MemoryConnector::new();
        connector.store("b").set_offline(true);
        let ring = ring_of(&connector, &["a", "b"]).await;
        assert_eq!(ring.live_backends().await, vec![BackendId::from_index(0)]);
        assert_eq!(ring.failed_backends().await, vec![BackendId::from_index(1)]);
    }

    #[tokio::test]
    async fn test_routing_is_deterministic() {
        let connector = MemoryConnector::new();
        let ring = ring_of(&connector, &["a", "b", "c"]).await;
        for i in 0..50 {
            let key = format!("full.metric.{i}");
            assert_eq!(ring.route(&key).await.unwrap(), ring.route(&key).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_ops_land_on_owning_backend() {
        let connector = MemoryConnector::new();
        let ring = ring_of(&connector, &["a", "b"]).await;
        for i in 0..20 {
            let key = format!("k{i}");
            ring.set(&key, b"v").await.unwrap();
            let owner = ring.route(&key).await.unwrap();
            let name = if owner.as_index() == 0 { "a" } else { "b" };
            assert_eq!(
                connector.store(name).get(&key).await.unwrap(),
                Some(b"v".to_vec())
            );
        }
    }

    #[tokio::test]
    async fn test_mget_reassembles_across_backends() {
        let connector = MemoryConnector::new();
        let ring = ring_of(&connector, &["a", "b", "c"]).await;
        let keys: Vec<String> = (0..30).map(|i| format!("full.m{i}")).collect();
        for (i, key) in keys.iter().enumerate() {
            if i % 3 != 0 {
                ring.set(key, i.to_string().as_bytes()).await.unwrap();
            }
        }

        let values = ring.mget(&keys).await.unwrap();
        assert_eq!(values.len(), keys.len());
        for (i, value) in values.into_iter().enumerate() {
            if i % 3 == 0 {
                assert_eq!(value, None);
            } else {
                assert_eq!(value, Some(i.to_string().into_bytes()));
            }
        }
        assert!(ring.mget(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_surfaces_as_unavailable() {
        let connector = MemoryConnector::new();
        let ring = ring_of(&connector, &["a"]).await;
        connector.store("a").set_offline(true);
        let err = ring.get("x").await.unwrap_err();
        assert!(matches!(
            err,
            RingError::BackendUnavailable { backend, .. } if backend == BackendId::from_index(0)
        ));
    }

    #[tokio::test]
    async fn test_check_connections_demotes_and_recovers() {
        let connector = MemoryConnector::new();
        let ring = ring_of(&connector, &["a", "b"]).await;

        // b fails its ping and one reconnect per pass until it comes back
        connector.store("b").set_offline(true);
        ring.check_connections().await.unwrap();
        assert_eq!(ring.failed_backends().await, vec![BackendId::from_index(1)]);
        for i in 0..20 {
            assert_eq!(
                ring.route(&format!("k{i}")).await.unwrap(),
                BackendId::from_index(0)
            );
        }

        connector.store("b").set_offline(false);
        ring.check_connections().await.unwrap();
        assert_eq!(ring.live_count().await, 2);
        assert!(ring.failed_backends().await.is_empty());
    }

    #[tokio::test]
    async fn test_check_connections_exhausts_backend() {
        let connector = MemoryConnector::new();
        let ring = ring_of(&connector, &["a", "b"]).await;
        connector.store("b").set_offline(true);

        for _ in 0..5 {
            ring.check_connections().await.unwrap();
        }
        let snapshot = ring.snapshot().await;
        assert_eq!(snapshot[1].status, BackendStatus::Failed);
        assert_eq!(snapshot[1].consecutive_failures, 3);

        // Exhausted backends stay out even once reachable again
        connector.store("b").set_offline(false);
        ring.check_connections().await.unwrap();
        assert_eq!(ring.failed_backends().await, vec![BackendId::from_index(1)]);
    }

    #[tokio::test]
    async fn test_check_connections_reports_no_live_backends() {
        let connector = MemoryConnector::new();
        let ring = ring_of(&connector, &["a"]).await;
        connector.store("a").set_offline(true);
        assert!(matches!(
            ring.check_connections().await,
            Err(RingError::NoLiveBackends)
        ));
        assert!(matches!(ring.route("k").await, Err(RingError::NoLiveBackends)));
    }

    #[tokio::test]
    async fn test_watch_goes_through_owning_backend() {
        use crate::store::{TxOp, TxOutcome};

        let connector = MemoryConnector::new();
        let ring = ring_of(&connector, &["a", "b"]).await;
        ring.set("full.cpu", b"1").await.unwrap();

        let mut tx = ring.watch("full.cpu").await.unwrap();
        assert_eq!(tx.get().await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(
            tx.execute(TxOp::Set(b"2".to_vec())).await.unwrap(),
            TxOutcome::Committed
        );
        assert_eq!(ring.get("full.cpu").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_factory_builds_fresh_rings() {
        let connector = MemoryConnector::new();
        let factory = RingFactory::new(
            vec![BackendDescriptor::memory("a"), BackendDescriptor::memory("b")],
            Arc::new(connector.clone()),
            MaxFailures::DEFAULT,
        );
        let mut ring = factory.build().await.unwrap();
        assert_eq!(ring.live_count().await, 2);

        let liveness = crate::liveness::Shutdown::new().liveness(None);
        assert!(factory.ensure_ready(&mut ring, &liveness).await.unwrap());

        connector.store("a").set_offline(true);
        connector.store("b").set_offline(true);
        assert!(matches!(factory.build().await, Err(RingError::NoLiveBackends)));
    }
}
