use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use driftwatch::args::{CommonArgs, Mode};
use driftwatch::liveness::Shutdown;
use driftwatch::runtime::{self, ServiceContext};
use driftwatch::vacuum::Vacuum;

const SERVICE: &str = "vacuum";

#[derive(Parser, Debug)]
#[command(author, version, about = "Trim stored series to their retention window", long_about = None)]
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
    let shutdown = Arc::new(Shutdown::new());
    runtime::spawn_signal_watcher(&shutdown);
    runtime::spawn_parent_watcher(&shutdown, context.parent);

    let config = &context.config;
    let vacuum = Vacuum::new(
        config.vacuum.clone(),
        config.namespaces.clone(),
        config.service.prefix.clone(),
        context.hostname.clone(),
        context.ring_factory(),
    );
    let reason = vacuum.run(shutdown.liveness(context.parent)).await;
    info!("Vacuum stopped: {}", reason);
    Ok(())
}
