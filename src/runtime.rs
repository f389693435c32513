//! Process setup shared by the binaries
//!
//! Everything that has to happen before the async runtime exists (config,
//! detaching, pidfile, logging) plus the runtime itself and signal
//! handling.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::args::{CommonArgs, Mode};
use crate::config::{Config, load_or_create_config};
use crate::daemon::{self, PidFile};
use crate::liveness::Shutdown;
use crate::logging::{LogOutput, init_logging};
use crate::metrics::GraphiteSink;
use crate::ring::RingFactory;
use crate::store::DefaultConnector;

/// A prepared service process
#[derive(Debug)]
pub struct ServiceContext {
    pub config: Config,
    pub hostname: String,
    pub parent: Option<i32>,
    /// Held for the life of a detached process
    pub pidfile: Option<PidFile>,
}

impl ServiceContext {
    /// Factory for rings over the configured backends
    #[must_use]
    pub fn ring_factory(&self) -> RingFactory {
        ring_factory(&self.config)
    }

    #[must_use]
    pub fn graphite(&self) -> GraphiteSink {
        GraphiteSink::new(
            self.config.graphite.endpoint(),
            self.config.service.prefix.clone(),
        )
    }
}

/// Ring factory over `config`'s backends using the RESP client
#[must_use]
pub fn ring_factory(config: &Config) -> RingFactory {
    let store = &config.store;
    RingFactory::new(
        config.backends.clone(),
        Arc::new(DefaultConnector::new(store.pool_size, store.command_timeout)),
        store.max_failures,
    )
}

/// Load config and set up the process for `service`
///
/// The pid and log directories are validated first in either mode; for
/// [`Mode::Start`] the process then detaches and writes its pidfile. Must be
/// called before the async runtime is built.
///
/// # Errors
/// Returns error if the configuration is invalid, a directory is missing or
/// detaching fails
pub fn prepare(service: &str, common: &CommonArgs, mode: Mode) -> Result<ServiceContext> {
    let config = load_or_create_config(&common.config)?;
    daemon::validate_paths(&config.service)?;

    let pidfile = if mode.is_detached() {
        daemon::detach()?;
        init_logging(&config.service.log_path, service, LogOutput::FileOnly);
        Some(PidFile::create(&config.service.pid_path, service)?)
    } else {
        init_logging(&config.service.log_path, service, LogOutput::Dual);
        None
    };

    let hostname = daemon::hostname().context("Failed to identify this host")?;
    log_config(&config, &common.config.display().to_string());

    Ok(ServiceContext {
        config,
        hostname,
        parent: common.parent_pid,
        pidfile,
    })
}

fn log_config(config: &Config, source: &str) {
    info!("Loaded configuration from {}", source);
    info!("Loaded {} backends:", config.backends.len());
    for backend in &config.backends {
        info!("  - {}", backend);
    }
}

/// Build the multi-threaded tokio runtime
///
/// # Errors
/// Returns error if runtime creation fails
pub fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Trigger `shutdown` once a signal arrives
pub fn spawn_signal_watcher(shutdown: &Arc<Shutdown>) {
    let shutdown = Arc::clone(shutdown);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown.trigger();
    });
}

/// Trigger `shutdown` once the supervising process `parent` is gone
pub fn spawn_parent_watcher(shutdown: &Arc<Shutdown>, parent: Option<i32>) {
    if parent.is_none() {
        return;
    }
    let liveness = shutdown.liveness(parent);
    let shutdown = Arc::clone(shutdown);
    tokio::spawn(async move {
        loop {
            if let Err(e) = liveness.sleep(Duration::from_secs(1)).await {
                if !shutdown.is_triggered() {
                    warn!("Stopping: {}", e);
                    shutdown.trigger();
                }
                return;
            }
        }
    });
}
