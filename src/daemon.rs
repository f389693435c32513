//! Detaching, pidfiles and host identity
//!
//! `run` and `start` both validate the configured directories before
//! anything else, so a typo fails loudly on the terminal instead of silently
//! in the background.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ServiceConfig;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("{what} directory {path} does not exist")]
    MissingDirectory { what: &'static str, path: PathBuf },

    #[error("cannot write pidfile {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot detach: {0}")]
    Detach(#[source] nix::Error),

    #[error("cannot determine hostname: {0}")]
    Hostname(String),
}

/// Check that the pid and log directories exist
pub fn validate_paths(service: &ServiceConfig) -> Result<(), DaemonError> {
    for (what, path) in [("pid", &service.pid_path), ("log", &service.log_path)] {
        if !path.is_dir() {
            return Err(DaemonError::MissingDirectory {
                what,
                path: path.clone(),
            });
        }
    }
    Ok(())
}

/// Fork into the background, keeping the working directory
///
/// Must run before the async runtime exists.
pub fn detach() -> Result<(), DaemonError> {
    nix::unistd::daemon(true, false).map_err(DaemonError::Detach)
}

/// Pidfile removed again when dropped
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write this process's pid to `<dir>/<service>.pid`
    pub fn create(dir: &Path, service: &str) -> Result<Self, DaemonError> {
        let path = dir.join(format!("{service}.pid"));
        fs::write(&path, format!("{}\n", std::process::id())).map_err(|source| {
            DaemonError::PidFile {
                path: path.clone(),
                source,
            }
        })?;
        debug!("Wrote pidfile {}", path.display());
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove pidfile {}: {}", self.path.display(), e);
        }
    }
}

/// This machine's hostname, used to key leases and worker registrations
pub fn hostname() -> Result<String, DaemonError> {
    let name = nix::unistd::gethostname().map_err(|e| DaemonError::Hostname(e.to_string()))?;
    name.into_string()
        .map_err(|raw| DaemonError::Hostname(format!("not UTF-8: {raw:?}")))
}
