//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::defaults;
use crate::analyzer::AlertRule;
use crate::constants;
use crate::store::BackendDescriptor;
use crate::types::{KeyPrefix, MaxFailures, Namespace, Port, WorkerCount, duration_serde};

/// Top-level configuration shared by all three services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Backends the ring shards over
    #[serde(default = "defaults::backends")]
    pub backends: Vec<BackendDescriptor>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub namespaces: NamespaceConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub vacuum: VacuumConfig,
    #[serde(default)]
    pub graphite: GraphiteConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backends: defaults::backends(),
            store: StoreConfig::default(),
            namespaces: NamespaceConfig::default(),
            service: ServiceConfig::default(),
            listen: ListenConfig::default(),
            ingest: IngestConfig::default(),
            analyzer: AnalyzerConfig::default(),
            vacuum: VacuumConfig::default(),
            graphite: GraphiteConfig::default(),
        }
    }
}

/// Backend client and ring health settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Pooled connections per backend
    pub pool_size: usize,
    #[serde(with = "duration_serde")]
    pub command_timeout: Duration,
    /// Consecutive failed health checks before a backend is given up on
    pub max_failures: MaxFailures,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pool_size: defaults::pool_size(),
            command_timeout: defaults::command_timeout(),
            max_failures: MaxFailures::DEFAULT,
        }
    }
}

/// The two retention classes and their windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    pub full: Namespace,
    pub mini: Namespace,
    #[serde(with = "duration_serde")]
    pub full_duration: Duration,
    #[serde(with = "duration_serde")]
    pub mini_duration: Duration,
    /// Added to both durations before the vacuum trims
    #[serde(with = "duration_serde")]
    pub grace_period: Duration,
    /// Datapoints older than this are rejected at ingestion
    #[serde(with = "duration_serde")]
    pub max_resolution: Duration,
}

impl NamespaceConfig {
    /// Full-resolution namespace and its effective retention
    #[must_use]
    pub fn full_retention(&self) -> (Namespace, Duration) {
        (self.full.clone(), self.full_duration + self.grace_period)
    }

    /// Decimated namespace and its effective retention
    #[must_use]
    pub fn mini_retention(&self) -> (Namespace, Duration) {
        (self.mini.clone(), self.mini_duration + self.grace_period)
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            full: defaults::full_namespace(),
            mini: defaults::mini_namespace(),
            full_duration: defaults::full_duration(),
            mini_duration: defaults::mini_duration(),
            grace_period: defaults::grace_period(),
            max_resolution: defaults::max_resolution(),
        }
    }
}

/// Bookkeeping keys and daemon paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Prefix for bookkeeping keys and Graphite metric names
    pub prefix: KeyPrefix,
    /// Directory holding `<service>.pid`
    pub pid_path: PathBuf,
    /// Directory holding `<service>.log`
    pub log_path: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            prefix: defaults::key_prefix(),
            pid_path: defaults::pid_path(),
            log_path: defaults::log_path(),
        }
    }
}

/// Transport the ingestion listener accepts batches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ListenProtocol {
    /// Length-prefixed frames over TCP
    #[default]
    Tcp,
    /// One batch per datagram
    Udp,
}

impl std::fmt::Display for ListenProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        })
    }
}

/// Ingestion listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub protocol: ListenProtocol,
    pub host: String,
    pub port: Port,
    /// When non-empty, only metrics named `<access_key>.*` are accepted
    pub access_key: String,
    pub max_frame_bytes: usize,
    pub max_datagram_bytes: usize,
    /// Capacity of the queue between listener and workers
    pub queue_capacity: usize,
    #[serde(with = "duration_serde")]
    pub queue_send_timeout: Duration,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            protocol: ListenProtocol::default(),
            host: defaults::listen_host(),
            port: Port::LISTEN,
            access_key: String::new(),
            max_frame_bytes: constants::listener::MAX_FRAME_BYTES,
            max_datagram_bytes: constants::listener::MAX_DATAGRAM_BYTES,
            queue_capacity: constants::listener::QUEUE_CAPACITY,
            queue_send_timeout: constants::listener::QUEUE_SEND_TIMEOUT,
        }
    }
}

/// Ingestion worker pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub workers: WorkerCount,
    /// Metrics whose name contains any of these are discarded
    pub skip_list: Vec<String>,
    /// How far ahead of now a datapoint may be stamped
    #[serde(with = "duration_serde")]
    pub max_future: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: defaults::ingest_workers(),
            skip_list: Vec::new(),
            max_future: constants::ingest::MAX_FUTURE,
        }
    }
}

/// Guard rules and consensus of the statistical ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Detectors that must vote anomalous
    pub consensus: usize,
    /// Series with fewer points are too short to judge
    pub min_points: usize,
    /// Series covering less time than this are incomplete
    #[serde(with = "duration_serde")]
    pub min_span: Duration,
    /// Series whose newest point is older than this are stale
    #[serde(with = "duration_serde")]
    pub stale_period: Duration,
    /// Trailing points inspected for boredom
    pub boredom_window: usize,
    /// A window with this many distinct values or fewer is boring
    pub boredom_set_size: usize,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            consensus: defaults::consensus(),
            min_points: defaults::min_points(),
            min_span: defaults::min_span(),
            stale_period: defaults::stale_period(),
            boredom_window: defaults::boredom_window(),
            boredom_set_size: defaults::boredom_set_size(),
        }
    }
}

/// Partitioned analyzer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Worker tasks per cycle
    pub processes: WorkerCount,
    /// Sorted set ranking live analyzer workers
    pub processes_key: String,
    /// Set indexing the per-worker anomaly lists
    pub anomalies_key: String,
    /// Metric (without namespace) used for the run-time projection
    pub canary_metric: String,
    pub ensemble: EnsembleConfig,
    pub enable_alerts: bool,
    pub alerts: Vec<AlertRule>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            processes: defaults::analyzer_processes(),
            processes_key: defaults::processes_key(),
            anomalies_key: defaults::anomalies_key(),
            canary_metric: defaults::canary_metric(),
            ensemble: EnsembleConfig::default(),
            enable_alerts: false,
            alerts: Vec::new(),
        }
    }
}

/// Vacuum settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VacuumConfig {
    /// Ranks this instance vacuums, `1..=processes`
    pub processes: WorkerCount,
    /// Retries of a conflicting key within one cycle
    pub max_retries_per_key: u32,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            processes: defaults::vacuum_processes(),
            max_retries_per_key: constants::vacuum::MAX_RETRIES_PER_KEY,
        }
    }
}

/// Graphite collector; an empty host disables it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphiteConfig {
    pub host: String,
    pub port: Port,
}

impl GraphiteConfig {
    /// `host:port` to send to, if configured
    ///
    /// A leading `http://` on the host is ignored.
    #[must_use]
    pub fn endpoint(&self) -> Option<(String, u16)> {
        let host = self.host.trim();
        let host = host.strip_prefix("http://").unwrap_or(host);
        let host = host.trim_end_matches('/');
        (!host.is_empty()).then(|| (host.to_string(), self.port.get()))
    }
}

impl Default for GraphiteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: Port::GRAPHITE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.namespaces.full.as_str(), "full.");
        assert_eq!(config.listen.port, Port::LISTEN);
        assert_eq!(config.vacuum.processes.get(), 1);
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            backends = ["memory://a", "redis://10.0.0.2:6380"]

            [namespaces]
            full_duration = 7200
            grace_period = 60

            [listen]
            protocol = "udp"
            access_key = "team"

            [[analyzer.alerts]]
            pattern = "cpu"
            channel = "email"
            cooldown = 300
            "#,
        )
        .unwrap();

        assert_eq!(config.backends.len(), 2);
        assert_eq!(
            config.namespaces.full_retention().1,
            Duration::from_secs(7260)
        );
        assert_eq!(
            config.namespaces.mini_retention().1,
            Duration::from_secs(3660)
        );
        assert_eq!(config.listen.protocol, ListenProtocol::Udp);
        assert_eq!(config.listen.max_frame_bytes, constants::listener::MAX_FRAME_BYTES);
        assert_eq!(config.analyzer.alerts[0].cooldown, Duration::from_secs(300));
    }

    #[test]
    fn test_rejects_zero_worker_count() {
        assert!(toml::from_str::<Config>("[ingest]\nworkers = 0").is_err());
    }

    #[test]
    fn test_graphite_endpoint() {
        let mut graphite = GraphiteConfig::default();
        assert_eq!(graphite.endpoint(), None);

        graphite.host = "http://graphite.local/".to_string();
        assert_eq!(
            graphite.endpoint(),
            Some(("graphite.local".to_string(), 2003))
        );
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(toml::from_str::<Config>(&text).unwrap(), config);
    }
}
