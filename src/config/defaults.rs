//! Default values for configuration fields
//!
//! Used both by serde when a field is missing and by the `Default` impls.

use std::path::PathBuf;
use std::time::Duration;

use crate::constants;
use crate::store::BackendDescriptor;
use crate::types::{KeyPrefix, Namespace, Port, WorkerCount};

#[inline]
pub fn backends() -> Vec<BackendDescriptor> {
    vec![BackendDescriptor::tcp("127.0.0.1", Port::REDIS.get())]
}

#[inline]
pub fn pool_size() -> usize {
    constants::store::POOL_MAX_SIZE
}

#[inline]
pub fn command_timeout() -> Duration {
    constants::store::COMMAND_TIMEOUT
}

#[inline]
pub fn full_namespace() -> Namespace {
    Namespace::new("full.".to_string()).expect("valid namespace")
}

#[inline]
pub fn mini_namespace() -> Namespace {
    Namespace::new("mini.".to_string()).expect("valid namespace")
}

/// Retention of the full-resolution namespace (one day)
#[inline]
pub fn full_duration() -> Duration {
    Duration::from_secs(86_400)
}

/// Retention of the decimated namespace (one hour)
#[inline]
pub fn mini_duration() -> Duration {
    Duration::from_secs(3_600)
}

/// Extra time added to both retentions before the vacuum trims
#[inline]
pub fn grace_period() -> Duration {
    Duration::from_secs(600)
}

/// Oldest datapoint accepted at ingestion, relative to now
#[inline]
pub fn max_resolution() -> Duration {
    Duration::from_secs(1_000)
}

#[inline]
pub fn key_prefix() -> KeyPrefix {
    KeyPrefix::new("driftwatch".to_string()).expect("valid key prefix")
}

#[inline]
pub fn pid_path() -> PathBuf {
    PathBuf::from("/var/run/driftwatch")
}

#[inline]
pub fn log_path() -> PathBuf {
    PathBuf::from("/var/log/driftwatch")
}

#[inline]
pub fn listen_host() -> String {
    "0.0.0.0".to_string()
}

#[inline]
pub fn ingest_workers() -> WorkerCount {
    WorkerCount::DEFAULT
}

#[inline]
pub fn analyzer_processes() -> WorkerCount {
    WorkerCount::DEFAULT
}

#[inline]
pub fn vacuum_processes() -> WorkerCount {
    WorkerCount::new(1).expect("1 is non-zero")
}

#[inline]
pub fn processes_key() -> String {
    "analyzer.processes".to_string()
}

#[inline]
pub fn anomalies_key() -> String {
    "analyzer.anomalies".to_string()
}

#[inline]
pub fn canary_metric() -> String {
    "driftwatch.canary".to_string()
}

/// Detectors that must agree before a series counts as anomalous
#[inline]
pub fn consensus() -> usize {
    2
}

#[inline]
pub fn stale_period() -> Duration {
    Duration::from_secs(500)
}

#[inline]
pub fn min_points() -> usize {
    10
}

#[inline]
pub fn min_span() -> Duration {
    Duration::from_secs(600)
}

#[inline]
pub fn boredom_window() -> usize {
    100
}

#[inline]
pub fn boredom_set_size() -> usize {
    1
}
