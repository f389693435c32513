//! Command-line arguments shared by the driftwatch binaries
//!
//! Each binary flattens [`CommonArgs`] into its own parser and picks a
//! [`Mode`] subcommand.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Arguments every service accepts
///
/// Use `#[command(flatten)]` in binary-specific Args to include these fields.
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Configuration file path, created with defaults if missing
    #[arg(short, long, default_value = "driftwatch.toml", env = "DRIFTWATCH_CONFIG")]
    pub config: PathBuf,

    /// Stop once this process id no longer exists
    #[arg(long, env = "DRIFTWATCH_PARENT_PID")]
    pub parent_pid: Option<i32>,
}

/// How a service runs
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Run in the foreground, logging to stdout and the log file
    Run,
    /// Detach, write a pidfile and log to the log file only
    Start,
}

impl Mode {
    #[must_use]
    pub const fn is_detached(&self) -> bool {
        matches!(self, Self::Start)
    }
}
