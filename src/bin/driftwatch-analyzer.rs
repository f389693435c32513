use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use driftwatch::analyzer::{Analyzer, collect_anomalies};
use driftwatch::args::{CommonArgs, Mode};
use driftwatch::config::load_config;
use driftwatch::liveness::Shutdown;
use driftwatch::runtime::{self, ServiceContext};

const SERVICE: &str = "analyzer";

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the anomaly-detection ensemble over every series", long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(flatten)]
    Service(Mode),

    /// Print the anomalies currently published by all workers as JSON
    Anomalies,
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Service(mode) => {
            let context = runtime::prepare(SERVICE, &args.common, mode)?;
            runtime::build_runtime()?.block_on(run(context))
        }
        Command::Anomalies => runtime::build_runtime()?.block_on(print_anomalies(&args.common)),
    }
}

async fn run(context: ServiceContext) -> Result<()> {
    let shutdown = Arc::new(Shutdown::new());
    runtime::spawn_signal_watcher(&shutdown);
    runtime::spawn_parent_watcher(&shutdown, context.parent);

    let config = &context.config;
    let analyzer = Analyzer::new(
        config.analyzer.clone(),
        config.namespaces.full.clone(),
        config.service.prefix.clone(),
        context.hostname.clone(),
        context.ring_factory(),
        context.graphite(),
    );
    let reason = analyzer.run(shutdown.liveness(context.parent)).await;
    info!("Analyzer stopped: {}", reason);
    Ok(())
}

async fn print_anomalies(common: &CommonArgs) -> Result<()> {
    let config = load_config(&common.config)?;
    let ring = runtime::ring_factory(&config)
        .build()
        .await
        .context("No backend reachable")?;
    let anomalies = collect_anomalies(&ring, &config.analyzer.anomalies_key).await?;
    println!("{}", serde_json::to_string_pretty(&anomalies)?);
    Ok(())
}
