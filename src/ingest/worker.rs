use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{Admission, IngestPolicy, WorkerStats};
use crate::clock::unix_now;
use crate::constants::ingest::CANARY_INTERVAL;
use crate::listener::IngestItem;
use crate::liveness::{Liveness, LivenessError};
use crate::metrics::{GraphiteSink, IngestMetrics, Metric};
use crate::ring::{Ring, RingFactory};
use crate::series::encode_point;
use crate::types::Namespace;

/// Most items drained from the queue per batch
const MAX_BATCH: usize = 1_000;

/// Settings shared by all workers of one pool
#[derive(Debug)]
pub struct WorkerShared {
    pub policy: IngestPolicy,
    pub namespaces: Vec<Namespace>,
    pub factory: RingFactory,
    pub metrics: IngestMetrics,
    pub graphite: GraphiteSink,
    pub recv_timeout: Duration,
}

/// One ingestion worker draining the shared queue
#[derive(Debug)]
pub struct IngestWorker {
    index: usize,
    queue: flume::Receiver<IngestItem>,
    shared: Arc<WorkerShared>,
    stats: WorkerStats,
}

impl IngestWorker {
    #[must_use]
    pub fn new(index: usize, queue: flume::Receiver<IngestItem>, shared: Arc<WorkerShared>) -> Self {
        Self {
            index,
            queue,
            shared,
            stats: WorkerStats::default(),
        }
    }

    /// Worker 0 doubles as the canary
    #[must_use]
    pub fn is_canary(&self) -> bool {
        self.index == 0
    }

    /// Drain the queue until stopped, returning what this worker did
    pub async fn run(mut self, liveness: Liveness) -> WorkerStats {
        info!("Ingestion worker {} started", self.index);
        let stop = match self.shared.factory.build_until_ready(&liveness).await {
            Ok(mut ring) => self.drain(&mut ring, &liveness).await,
            Err(e) => e,
        };
        info!(
            "Ingestion worker {} stopping ({}): {} accepted, {} skipped, {} stale, {} future, {} failed writes",
            self.index,
            stop,
            self.stats.accepted,
            self.stats.skipped,
            self.stats.stale,
            self.stats.future,
            self.stats.failed_writes
        );
        self.stats
    }

    async fn drain(&mut self, ring: &mut Ring, liveness: &Liveness) -> LivenessError {
        let mut last_report = Instant::now();
        loop {
            if let Err(e) = liveness.check() {
                return e;
            }
            if self.is_canary() && last_report.elapsed() >= CANARY_INTERVAL {
                self.report(ring).await;
                last_report = Instant::now();
            }

            let first = tokio::select! {
                received = tokio::time::timeout(self.shared.recv_timeout, self.queue.recv_async()) => received,
                () = liveness.cancelled() => continue,
            };
            let first = match first {
                Ok(Ok(item)) => item,
                // Nothing arrived in time
                Err(_) => continue,
                Ok(Err(_)) => {
                    info!("Ingestion queue closed, worker {} exiting", self.index);
                    return LivenessError::ShutdownRequested;
                }
            };
            let mut batch = Vec::with_capacity(64);
            batch.push(first);
            batch.extend(self.queue.try_iter().take(MAX_BATCH - 1));

            match self.shared.factory.ensure_ready(ring, liveness).await {
                Ok(true) => {}
                Ok(false) => warn!(
                    "Worker {} rebuilt its ring with {} datapoints pending",
                    self.index,
                    batch.len()
                ),
                Err(e) => return e,
            }
            self.process(ring, batch).await;
        }
    }

    /// Admit and persist a batch
    pub async fn process(&mut self, ring: &Ring, batch: Vec<IngestItem>) {
        let now = unix_now();
        for item in batch {
            match self.shared.policy.admit(&item, now) {
                Admission::Accept => self.persist(ring, &item).await,
                Admission::Skipped => {
                    self.stats.skipped += 1;
                    self.shared.metrics.record_skipped(1);
                }
                Admission::Stale => {
                    self.stats.stale += 1;
                    self.shared.metrics.record_stale(1);
                }
                Admission::Future => {
                    self.stats.future += 1;
                    self.shared.metrics.record_future(1);
                    debug!(
                        "Rejecting {} stamped {} ahead of now ({})",
                        item.metric, item.datapoint.timestamp, now
                    );
                }
            }
        }
    }

    /// Append to every namespace; one namespace failing does not stop the others
    async fn persist(&mut self, ring: &Ring, item: &IngestItem) {
        let encoded = match encode_point(&item.datapoint) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot encode datapoint for {}: {}", item.metric, e);
                self.stats.failed_writes += 1;
                self.shared.metrics.record_failed_write(1);
                return;
            }
        };
        let mut written = false;
        for ns in &self.shared.namespaces {
            let key = ns.series_key(&item.metric);
            let result = match ring.append(&key, &encoded).await {
                Ok(_) => ring.sadd(&ns.unique_metrics_key(), &key).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => written = true,
                Err(e) => {
                    warn!("Failed to write {}: {}", key, e);
                    self.stats.failed_writes += 1;
                    self.shared.metrics.record_failed_write(1);
                }
            }
        }
        if written {
            self.stats.accepted += 1;
            self.shared.metrics.record_accepted(1);
        }
    }

    /// Canary report: queue depth, ring health and counters
    async fn report(&self, ring: &Ring) {
        let depth = self.queue.len();
        let live = ring.live_count().await;
        let snap = self.shared.metrics.snapshot();
        info!(
            "Queue size: {}, live backends: {}, received: {}, accepted: {}, dropped: {}",
            depth, live, snap.received, snap.accepted, snap.dropped
        );

        let graphite = &self.shared.graphite;
        if graphite.is_enabled() {
            let now = unix_now();
            let metric = |name: &str, value: u64| {
                Metric::new(graphite.name(&["ingest", name]), value as f64, now)
            };
            graphite
                .emit(&[
                    metric("queue_size", depth as u64),
                    metric("live_backends", live as u64),
                    metric("received", snap.received),
                    metric("accepted", snap.accepted),
                    metric("dropped", snap.dropped),
                    metric("stale", snap.stale),
                ])
                .await;
        }
    }
}
