//! Retention enforcement
//!
//! Each cycle snapshots every namespace's unique-metrics set once, then runs
//! one sweep per (rank, namespace) over that snapshot. A sweep first takes
//! the lease for its rank so two hosts never vacuum the same slice, then
//! walks its slice of the snapshot. Every series is read and
//! rewritten under an optimistic transaction: points older than the
//! retention window and duplicate timestamps are dropped, and series with
//! nothing recent left are deleted.

mod lease;

pub use lease::claim_lease;

use std::collections::VecDeque;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clock::unix_now;
use crate::config::{NamespaceConfig, VacuumConfig};
use crate::constants::ring::REBUILD_BACKOFF;
use crate::constants::vacuum::{IDLE_SLEEP, MIN_CYCLE};
use crate::liveness::{Liveness, LivenessError};
use crate::partition::assigned_range;
use crate::ring::{Ring, RingError, RingFactory};
use crate::series::{SeriesError, TrimPlan, decode_series, encode_series, plan_trim};
use crate::store::{StoreError, TxOp, TxOutcome};
use crate::types::{KeyPrefix, Namespace, WorkerIndex};

/// Counters from one sweep, or the sum of several
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumReport {
    /// Distinct keys looked at
    pub examined: u64,
    /// Keys deleted, either expired or unreadable
    pub euthanized: u64,
    /// Transactions lost to a concurrent writer
    pub blocked: u64,
    /// Series rewritten with fewer points
    pub trimmed: u64,
}

impl AddAssign for VacuumReport {
    fn add_assign(&mut self, other: Self) {
        self.examined += other.examined;
        self.euthanized += other.euthanized;
        self.blocked += other.blocked;
        self.trimmed += other.trimmed;
    }
}

/// Why a key could not be vacuumed
///
/// Only `Series` is the key's own fault; backend trouble aborts the sweep.
#[derive(Debug, Error)]
enum VacuumError {
    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Series(#[from] SeriesError),
}

/// What happened to one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyOutcome {
    Kept,
    Trimmed,
    Purged,
    /// Listed in the set but already gone
    Missing,
    Conflict,
}

/// One (rank, namespace) unit of work
#[derive(Debug, Clone)]
struct Sweep {
    rank: WorkerIndex,
    namespace: Namespace,
    retention: Duration,
    /// Sorted unique-metrics set, shared by every rank of the namespace
    universe: Arc<Vec<String>>,
}

/// Settings every sweep of a cycle shares
#[derive(Debug)]
struct SweepContext {
    ring: Arc<Ring>,
    prefix: KeyPrefix,
    hostname: String,
    processes: usize,
    max_retries: u32,
}

/// The vacuum service
#[derive(Debug)]
pub struct Vacuum {
    config: VacuumConfig,
    namespaces: NamespaceConfig,
    prefix: KeyPrefix,
    hostname: String,
    factory: RingFactory,
}

impl Vacuum {
    #[must_use]
    pub fn new(
        config: VacuumConfig,
        namespaces: NamespaceConfig,
        prefix: KeyPrefix,
        hostname: impl Into<String>,
        factory: RingFactory,
    ) -> Self {
        Self {
            config,
            namespaces,
            prefix,
            hostname: hostname.into(),
            factory,
        }
    }

    /// Run cycles until stopped
    pub async fn run(&self, liveness: Liveness) -> LivenessError {
        info!("Vacuum starting on {}", self.hostname);
        let mut ring = match self.factory.build_until_ready(&liveness).await {
            Ok(ring) => Arc::new(ring),
            Err(e) => return e,
        };

        loop {
            if let Err(e) = liveness.check() {
                return e;
            }
            if let Err(e) = ring.check_connections().await {
                warn!("Ring check failed: {}, rebuilding in {:?}", e, REBUILD_BACKOFF);
                if let Err(e) = liveness.sleep(REBUILD_BACKOFF).await {
                    return e;
                }
                match self.factory.build_until_ready(&liveness).await {
                    Ok(fresh) => ring = Arc::new(fresh),
                    Err(e) => return e,
                }
                continue;
            }

            let started = Instant::now();
            let report = match self.run_cycle(&ring, &liveness).await {
                Ok(report) => report,
                Err(e) => {
                    // The next ring check demotes the backend or rebuilds
                    error!("Vacuum cycle failed: {}, retrying in {:?}", e, REBUILD_BACKOFF);
                    if let Err(e) = liveness.sleep(REBUILD_BACKOFF).await {
                        return e;
                    }
                    continue;
                }
            };
            let elapsed = started.elapsed();
            info!(
                "Vacuum cycle took {:.2}s: {} examined, {} trimmed, {} euthanized, blocked {} times",
                elapsed.as_secs_f64(),
                report.examined,
                report.trimmed,
                report.euthanized,
                report.blocked
            );

            if elapsed < MIN_CYCLE {
                debug!("Sleeping due to low run time");
                if let Err(e) = liveness.sleep(IDLE_SLEEP).await {
                    return e;
                }
            }
        }
    }

    /// Sweep every (rank, namespace) pair once, concurrently
    ///
    /// Fails with the first backend error any sweep hit, preferring
    /// [`RingError::NoLiveBackends`]; the counters of that cycle are only logged.
    pub async fn run_cycle(
        &self,
        ring: &Arc<Ring>,
        liveness: &Liveness,
    ) -> Result<VacuumReport, RingError> {
        let context = Arc::new(SweepContext {
            ring: ring.clone(),
            prefix: self.prefix.clone(),
            hostname: self.hostname.clone(),
            processes: self.config.processes.get(),
            max_retries: self.config.max_retries_per_key,
        });

        let mut snapshots = Vec::with_capacity(2);
        for (namespace, retention) in [
            self.namespaces.mini_retention(),
            self.namespaces.full_retention(),
        ] {
            let mut universe = ring.smembers(&namespace.unique_metrics_key()).await?;
            universe.sort();
            snapshots.push((namespace, retention, Arc::new(universe)));
        }

        let mut tasks = JoinSet::new();
        for (namespace, retention, universe) in snapshots {
            for rank in WorkerIndex::range(self.config.processes) {
                let sweep = Sweep {
                    rank,
                    namespace: namespace.clone(),
                    retention,
                    universe: universe.clone(),
                };
                tasks.spawn(run_sweep(context.clone(), sweep, liveness.clone()));
            }
        }

        let mut total = VacuumReport::default();
        let mut failure: Option<RingError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => total += report,
                Ok(Err(e)) => {
                    failure = match failure {
                        Some(fatal) if fatal.is_fatal() => Some(fatal),
                        _ => Some(e),
                    };
                }
                Err(e) => error!("Vacuum sweep panicked: {}", e),
            }
        }
        match failure {
            Some(e) => {
                warn!(
                    "Vacuum cycle aborted after {} examined, {} trimmed, {} euthanized",
                    total.examined, total.trimmed, total.euthanized
                );
                Err(e)
            }
            None => Ok(total),
        }
    }
}

async fn run_sweep(
    context: Arc<SweepContext>,
    sweep: Sweep,
    liveness: Liveness,
) -> Result<VacuumReport, RingError> {
    let started = Instant::now();
    let report = match sweep_partition(&context, &sweep, &liveness).await {
        Ok(report) => report,
        Err(e) => {
            error!(
                "Vacuum of {} rank {} failed: {}",
                sweep.namespace.as_str(),
                sweep.rank,
                e
            );
            return Err(e);
        }
    };
    info!(
        "Operated on {} rank {} in {:.2}s: {} keys, {} trimmed, {} euthanized, blocked {} times",
        sweep.namespace.as_str(),
        sweep.rank,
        started.elapsed().as_secs_f64(),
        report.examined,
        report.trimmed,
        report.euthanized,
        report.blocked
    );
    Ok(report)
}

/// Vacuum this sweep's slice of its namespace
async fn sweep_partition(
    context: &SweepContext,
    sweep: &Sweep,
    liveness: &Liveness,
) -> Result<VacuumReport, RingError> {
    let mut report = VacuumReport::default();
    let ring = context.ring.as_ref();

    let lease_key = context
        .prefix
        .join(&["vacuum", &format!("{}{}", sweep.namespace.as_str(), sweep.rank)]);
    if !claim_lease(ring, &lease_key, &context.hostname).await? {
        debug!("Skipping {}, leased by another host", lease_key);
        return Ok(report);
    }

    let unique_key = sweep.namespace.unique_metrics_key();
    let universe = sweep.universe.as_slice();
    let range = assigned_range(universe.len(), sweep.rank.get(), context.processes);

    let mut queue: VecDeque<(&str, u32)> =
        universe[range].iter().map(|key| (key.as_str(), 0)).collect();
    while let Some((key, conflicts)) = queue.pop_front() {
        if let Err(e) = liveness.check() {
            warn!("Vacuum of {} stopping early: {}", sweep.namespace.as_str(), e);
            break;
        }
        if conflicts == 0 {
            report.examined += 1;
        }

        match vacuum_key(ring, &unique_key, key, unix_now(), sweep.retention).await {
            Ok(KeyOutcome::Kept | KeyOutcome::Missing) => {}
            Ok(KeyOutcome::Trimmed) => report.trimmed += 1,
            Ok(KeyOutcome::Purged) => report.euthanized += 1,
            Ok(KeyOutcome::Conflict) => {
                report.blocked += 1;
                if conflicts < context.max_retries {
                    queue.push_back((key, conflicts + 1));
                } else {
                    debug!("Giving up on {} until next cycle", key);
                }
            }
            Err(VacuumError::Series(e)) => {
                info!("Euthanizing {}: {}", key, e);
                euthanize(ring, &unique_key, key).await;
                report.euthanized += 1;
            }
            Err(VacuumError::Ring(e)) => return Err(e),
        }
    }
    Ok(report)
}

/// Trim one series under a transaction
async fn vacuum_key(
    ring: &Ring,
    unique_key: &str,
    key: &str,
    now: i64,
    retention: Duration,
) -> Result<KeyOutcome, VacuumError> {
    let backend = ring.route(key).await?;
    let failed = |source: StoreError| VacuumError::Ring(RingError::unavailable(backend, source));

    let mut tx = ring.watch(key).await?;
    let Some(raw) = tx.get().await.map_err(failed)? else {
        tx.discard().await.map_err(failed)?;
        ring.srem(unique_key, key).await?;
        return Ok(KeyOutcome::Missing);
    };
    let series = match decode_series(&raw) {
        Ok(series) => series,
        Err(e) => {
            tx.discard().await.map_err(failed)?;
            return Err(e.into());
        }
    };

    let (op, done) = match plan_trim(&series, now, retention) {
        TrimPlan::Keep => {
            tx.discard().await.map_err(failed)?;
            return Ok(KeyOutcome::Kept);
        }
        TrimPlan::Delete => (TxOp::Delete, KeyOutcome::Purged),
        TrimPlan::Rewrite(points) => (TxOp::Set(encode_series(&points)?), KeyOutcome::Trimmed),
    };

    match tx.execute(op).await.map_err(failed)? {
        TxOutcome::Conflict => Ok(KeyOutcome::Conflict),
        TxOutcome::Committed => {
            if done == KeyOutcome::Purged {
                ring.srem(unique_key, key).await?;
            }
            Ok(done)
        }
    }
}

/// Remove a key that could not be vacuumed
async fn euthanize(ring: &Ring, unique_key: &str, key: &str) {
    if let Err(e) = ring.delete(key).await {
        warn!("Could not delete {}: {}", key, e);
    }
    if let Err(e) = ring.srem(unique_key, key).await {
        warn!("Could not unlist {}: {}", key, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::Shutdown;
    use crate::series::Datapoint;
    use crate::store::{BackendDescriptor, MemoryConnector};
    use crate::types::{MaxFailures, WorkerCount};

    const UNIQUE: &str = "full.unique_metrics";

    async fn ring(connector: &MemoryConnector) -> Ring {
        Ring::connect(
            &[BackendDescriptor::memory("vac")],
            Arc::new(connector.clone()),
            MaxFailures::DEFAULT,
        )
        .await
        .unwrap()
    }

    async fn store(ring: &Ring, key: &str, points: &[Datapoint]) {
        ring.set(key, &encode_series(points).unwrap()).await.unwrap();
        ring.sadd(UNIQUE, key).await.unwrap();
    }

    fn vacuum(connector: &MemoryConnector, processes: usize, hostname: &str) -> Vacuum {
        Vacuum::new(
            VacuumConfig {
                processes: WorkerCount::new(processes).unwrap(),
                max_retries_per_key: 3,
            },
            NamespaceConfig::default(),
            KeyPrefix::new("dw".to_string()).unwrap(),
            hostname,
            RingFactory::new(
                vec![BackendDescriptor::memory("vac")],
                Arc::new(connector.clone()),
                MaxFailures::DEFAULT,
            ),
        )
    }

    #[tokio::test]
    async fn test_single_old_point_is_purged() {
        let connector = MemoryConnector::new();
        let ring = ring(&connector).await;
        store(&ring, "full.m", &[Datapoint::new(10, 1.0)]).await;

        let outcome = vacuum_key(&ring, UNIQUE, "full.m", 1000, Duration::from_secs(500))
            .await
            .unwrap();
        assert_eq!(outcome, KeyOutcome::Purged);
        assert_eq!(ring.get("full.m").await.unwrap(), None);
        assert!(ring.smembers(UNIQUE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trim_rewrites_sorted_unique_points() {
        let connector = MemoryConnector::new();
        let ring = ring(&connector).await;
        store(
            &ring,
            "full.m",
            &[
                Datapoint::new(700, 1.0),
                Datapoint::new(100, 9.0),
                Datapoint::new(600, 2.0),
                Datapoint::new(700, 3.0),
            ],
        )
        .await;

        let outcome = vacuum_key(&ring, UNIQUE, "full.m", 1000, Duration::from_secs(500))
            .await
            .unwrap();
        assert_eq!(outcome, KeyOutcome::Trimmed);
        let raw = ring.get("full.m").await.unwrap().unwrap();
        assert_eq!(
            decode_series(&raw).unwrap(),
            vec![Datapoint::new(600, 2.0), Datapoint::new(700, 3.0)]
        );

        // A second pass has nothing left to do
        let again = vacuum_key(&ring, UNIQUE, "full.m", 1000, Duration::from_secs(500))
            .await
            .unwrap();
        assert_eq!(again, KeyOutcome::Kept);
    }

    #[tokio::test]
    async fn test_missing_key_is_unlisted() {
        let connector = MemoryConnector::new();
        let ring = ring(&connector).await;
        ring.sadd(UNIQUE, "full.gone").await.unwrap();

        let outcome = vacuum_key(&ring, UNIQUE, "full.gone", 1000, Duration::from_secs(500))
            .await
            .unwrap();
        assert_eq!(outcome, KeyOutcome::Missing);
        assert!(ring.smembers(UNIQUE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_euthanizes_garbage_and_retries_conflicts() {
        let connector = MemoryConnector::new();
        let ring = Arc::new(ring(&connector).await);
        let now = unix_now();
        // Old enough for the full namespace's retention plus grace
        let ancient = now - 200_000;
        store(&ring, "full.old", &[Datapoint::new(ancient, 1.0)]).await;
        store(
            &ring,
            "full.busy",
            &[Datapoint::new(ancient, 1.0), Datapoint::new(now, 2.0)],
        )
        .await;
        store(&ring, "full.fresh", &[Datapoint::new(now, 1.0)]).await;
        ring.set("full.garbage", b"\xc1").await.unwrap();
        ring.sadd(UNIQUE, "full.garbage").await.unwrap();
        connector.store("vac").contend("full.busy", 2);

        let vacuum = vacuum(&connector, 1, "host-a");
        let report = vacuum
            .run_cycle(&ring, &Shutdown::new().liveness(None))
            .await
            .unwrap();

        assert_eq!(
            report,
            VacuumReport {
                examined: 4,
                euthanized: 2,
                blocked: 2,
                trimmed: 1,
            }
        );
        let mut left = ring.smembers(UNIQUE).await.unwrap();
        left.sort();
        assert_eq!(left, vec!["full.busy".to_string(), "full.fresh".to_string()]);
        let busy = decode_series(&ring.get("full.busy").await.unwrap().unwrap()).unwrap();
        assert_eq!(busy, vec![Datapoint::new(now, 2.0)]);
    }

    #[tokio::test]
    async fn test_conflicts_give_up_after_retries() {
        let connector = MemoryConnector::new();
        let ring = Arc::new(ring(&connector).await);
        store(&ring, "full.hot", &[Datapoint::new(1, 1.0)]).await;
        connector.store("vac").contend("full.hot", 100);

        let report = vacuum(&connector, 1, "host-a")
            .run_cycle(&ring, &Shutdown::new().liveness(None))
            .await
            .unwrap();
        // First attempt plus three retries
        assert_eq!(report.blocked, 4);
        assert_eq!(report.euthanized, 0);
        assert!(ring.get("full.hot").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_foreign_lease_skips_sweep() {
        let connector = MemoryConnector::new();
        let ring = Arc::new(ring(&connector).await);
        store(&ring, "full.old", &[Datapoint::new(1, 1.0)]).await;
        ring.set("dw.vacuum.full.1", b"host-b").await.unwrap();

        let report = vacuum(&connector, 1, "host-a")
            .run_cycle(&ring, &Shutdown::new().liveness(None))
            .await
            .unwrap();
        assert_eq!(report, VacuumReport::default());
        assert!(ring.get("full.old").await.unwrap().is_some());
        // The mini sweep still took its own lease
        assert_eq!(
            ring.get("dw.vacuum.mini.1").await.unwrap(),
            Some(b"host-a".to_vec())
        );
    }

    #[tokio::test]
    async fn test_ranks_split_the_namespace() {
        let connector = MemoryConnector::new();
        let ring = Arc::new(ring(&connector).await);
        for i in 0..5 {
            store(&ring, &format!("full.m{i}"), &[Datapoint::new(1, 1.0)]).await;
        }

        let report = vacuum(&connector, 2, "host-a")
            .run_cycle(&ring, &Shutdown::new().liveness(None))
            .await
            .unwrap();
        assert_eq!(report.examined, 5);
        assert_eq!(report.euthanized, 5);
        assert!(ring.get("dw.vacuum.full.2").await.unwrap().is_some());
        assert!(ring.smembers(UNIQUE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_every_rank_sees_the_same_snapshot() {
        let connector = MemoryConnector::new();
        let ring = Arc::new(ring(&connector).await);
        // Everything expired, so earlier ranks shrink the set as they go
        for i in 0..7 {
            store(&ring, &format!("full.m{i}"), &[Datapoint::new(1, 1.0)]).await;
        }

        let report = vacuum(&connector, 3, "host-a")
            .run_cycle(&ring, &Shutdown::new().liveness(None))
            .await
            .unwrap();
        assert_eq!(report.examined, 7);
        assert_eq!(report.euthanized, 7);
        for i in 0..7 {
            assert_eq!(ring.get(&format!("full.m{i}")).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_offline_backend_aborts_without_deleting() {
        let connector = MemoryConnector::new();
        let ring = Arc::new(
            Ring::connect(
                &[BackendDescriptor::memory("a"), BackendDescriptor::memory("b")],
                Arc::new(connector.clone()),
                MaxFailures::DEFAULT,
            )
            .await
            .unwrap(),
        );
        let now = unix_now();
        let mut keys: Vec<String> = (0..20).map(|i| format!("full.fresh{i}")).collect();
        keys.sort();
        for key in &keys {
            store(&ring, key, &[Datapoint::new(now, 1.0)]).await;
        }

        // Keep the lease reachable so the sweep gets as far as the series
        let mut prefix = None;
        for i in 0..64 {
            let candidate = KeyPrefix::new(format!("dw{i}")).unwrap();
            let lease = candidate.join(&["vacuum", "full.1"]);
            if ring.route(&lease).await.unwrap().as_index() == 1 {
                prefix = Some(candidate);
                break;
            }
        }
        let prefix = prefix.expect("some prefix routes to the second backend");
        let mut orphaned = 0;
        for key in &keys {
            if ring.route(key).await.unwrap().as_index() == 0 {
                orphaned += 1;
            }
        }
        assert!(orphaned > 0);
        connector.store("a").set_offline(true);

        let context = SweepContext {
            ring: ring.clone(),
            prefix,
            hostname: "host-a".to_string(),
            processes: 1,
            max_retries: 3,
        };
        let sweep = Sweep {
            rank: WorkerIndex::new(1).unwrap(),
            namespace: Namespace::new("full.".to_string()).unwrap(),
            retention: Duration::from_secs(3600),
            universe: Arc::new(keys.clone()),
        };
        let err = sweep_partition(&context, &sweep, &Shutdown::new().liveness(None))
            .await
            .unwrap_err();
        assert!(matches!(err, RingError::BackendUnavailable { .. }), "{err}");

        connector.store("a").set_offline(false);
        for key in &keys {
            assert!(ring.get(key).await.unwrap().is_some(), "{key} was deleted");
        }
        assert_eq!(ring.smembers(UNIQUE).await.unwrap().len(), keys.len());
    }

    #[tokio::test]
    async fn test_stopped_sweep_examines_nothing() {
        let connector = MemoryConnector::new();
        let ring = Arc::new(ring(&connector).await);
        store(&ring, "full.old", &[Datapoint::new(1, 1.0)]).await;

        let shutdown = Shutdown::new();
        let liveness = shutdown.liveness(None);
        shutdown.trigger();
        let report = vacuum(&connector, 1, "host-a")
            .run_cycle(&ring, &liveness)
            .await
            .unwrap();
        assert_eq!(report.examined, 0);
        assert!(ring.get("full.old").await.unwrap().is_some());
    }
}
