//! Cooperative cancellation for worker tasks
//!
//! A worker polls [`Liveness::check`] between items. It fails once the
//! service has started shutting down or, when a supervising process id was
//! given, once that process no longer exists. The worker then stops and
//! returns whatever it has accumulated so far.
//!
//! Only [`Shutdown::trigger`] requests a stop. Dropping the [`Shutdown`]
//! without triggering it leaves every guard live for good.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Why a worker has to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LivenessError {
    #[error("supervising process {0} is gone")]
    ParentGone(i32),

    #[error("shutdown requested")]
    ShutdownRequested,
}

/// Service-wide stop switch
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Ask every worker to stop
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Liveness guard tied to this switch and an optional supervisor
    #[must_use]
    pub fn liveness(&self, parent: Option<i32>) -> Liveness {
        Liveness {
            parent: parent.map(Pid::from_raw),
            shutdown: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker liveness guard
#[derive(Debug, Clone)]
pub struct Liveness {
    parent: Option<Pid>,
    shutdown: watch::Receiver<bool>,
}

impl Liveness {
    /// Fail if the worker should stop
    pub fn check(&self) -> Result<(), LivenessError> {
        if *self.shutdown.borrow() {
            return Err(LivenessError::ShutdownRequested);
        }
        if let Some(pid) = self.parent {
            // Signal 0 only checks existence; EPERM still means it exists
            match kill(pid, None) {
                Ok(()) | Err(Errno::EPERM) => {}
                Err(_) => return Err(LivenessError::ParentGone(pid.as_raw())),
            }
        }
        Ok(())
    }

    /// Resolve once shutdown has been requested
    ///
    /// Never resolves if the switch was dropped untriggered.
    pub async fn cancelled(&self) {
        let mut shutdown = self.shutdown.clone();
        if shutdown.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration`, waking early if shutdown is requested
    pub async fn sleep(&self, duration: Duration) -> Result<(), LivenessError> {
        tokio::select! {
            () = tokio::time::sleep(duration) => self.check(),
            () = self.cancelled() => Err(LivenessError::ShutdownRequested),
        }
    }
}
