use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use driftwatch::args::{CommonArgs, Mode};
use driftwatch::constants::ingest::QUEUE_RECV_TIMEOUT;
use driftwatch::ingest::{IngestPolicy, WorkerShared, join_workers, spawn_workers};
use driftwatch::listener::{Listener, ListenerError};
use driftwatch::liveness::Shutdown;
use driftwatch::metrics::IngestMetrics;
use driftwatch::runtime::{self, ServiceContext};

const SERVICE: &str = "ingest";

#[derive(Parser, Debug)]
#[command(author, version, about = "Receive datapoints and store them on the ring", long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    mode: Mode,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let context = runtime::prepare(SERVICE, &args.common, args.mode)?;
    runtime::build_runtime()?.block_on(run(context))
}

async fn run(context: ServiceContext) -> Result<()> {
    let config = &context.config;
    let shutdown = Arc::new(Shutdown::new());
    runtime::spawn_signal_watcher(&shutdown);
    runtime::spawn_parent_watcher(&shutdown, context.parent);

    let (queue_tx, queue_rx) = flume::bounded(config.listen.queue_capacity);
    let metrics = IngestMetrics::new();

    let shared = Arc::new(WorkerShared {
        policy: IngestPolicy::new(
            config.ingest.skip_list.clone(),
            config.namespaces.max_resolution,
            config.ingest.max_future,
        ),
        namespaces: vec![config.namespaces.full.clone(), config.namespaces.mini.clone()],
        factory: context.ring_factory(),
        metrics: metrics.clone(),
        graphite: context.graphite(),
        recv_timeout: QUEUE_RECV_TIMEOUT,
    });
    let workers = spawn_workers(
        config.ingest.workers.get(),
        &queue_rx,
        shared,
        &shutdown,
        context.parent,
    );
    drop(queue_rx);

    info!(
        "Ingesting over {} on {}:{} with {} workers",
        config.listen.protocol, config.listen.host, config.listen.port, config.ingest.workers
    );
    let listener = Listener::new(config.listen.clone(), queue_tx, metrics.clone());
    let result = listener.run(&shutdown.liveness(context.parent)).await;

    shutdown.trigger();
    drop(listener);
    let stats = join_workers(workers).await;
    let totals = metrics.snapshot();
    info!(
        "Ingestion stopped: {} received, {} accepted, {} skipped, {} stale, {} future, {} dropped, {} failed writes",
        totals.received,
        stats.accepted,
        stats.skipped,
        stats.stale,
        stats.future,
        totals.dropped,
        stats.failed_writes
    );

    match result {
        Ok(()) | Err(ListenerError::Stopped(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
