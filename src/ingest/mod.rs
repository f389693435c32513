//! Ingestion worker pool
//!
//! Workers pull [`IngestItem`]s off the bounded queue the listener feeds,
//! drop skipped, stale and future datapoints, and append the rest to the
//! series in every namespace. Each worker owns its own ring.

mod policy;
mod worker;

pub use policy::{Admission, IngestPolicy};
pub use worker::{IngestWorker, WorkerShared};

use std::ops::AddAssign;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::listener::IngestItem;
use crate::liveness::Shutdown;

/// What one worker did before it stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub accepted: u64,
    pub skipped: u64,
    pub stale: u64,
    pub future: u64,
    pub failed_writes: u64,
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.accepted += other.accepted;
        self.skipped += other.skipped;
        self.stale += other.stale;
        self.future += other.future;
        self.failed_writes += other.failed_writes;
    }
}

/// Spawn `count` workers on the queue; worker 0 is the canary
pub fn spawn_workers(
    count: usize,
    queue: &flume::Receiver<IngestItem>,
    shared: Arc<WorkerShared>,
    shutdown: &Shutdown,
    parent: Option<i32>,
) -> JoinSet<WorkerStats> {
    let mut workers = JoinSet::new();
    for index in 0..count {
        let worker = IngestWorker::new(index, queue.clone(), shared.clone());
        workers.spawn(worker.run(shutdown.liveness(parent)));
    }
    workers
}

/// Wait for every worker and sum their stats
pub async fn join_workers(mut workers: JoinSet<WorkerStats>) -> WorkerStats {
    let mut total = WorkerStats::default();
    while let Some(result) = workers.join_next().await {
        match result {
            Ok(stats) => total += stats,
            Err(e) => tracing::error!("Ingestion worker panicked: {}", e),
        }
    }
    total
}
