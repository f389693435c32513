//! Configuration validation
//!
//! Most invariants are carried by the types (non-zero counts, validated
//! namespaces and ports). This pass checks the ones that span fields.

use anyhow::{Result, bail};

use super::types::Config;
use crate::constants::listener::UDP_BUFFER;

/// Detectors in the default ensemble
const DETECTORS: usize = 3;

impl Config {
    /// Validate configuration for correctness
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            bail!("Configuration must have at least one backend");
        }

        let ns = &self.namespaces;
        if ns.full == ns.mini {
            bail!("Full and mini namespaces must differ (both are {:?})", ns.full.as_str());
        }
        if ns.full.starts_with(ns.mini.as_str()) || ns.mini.starts_with(ns.full.as_str()) {
            bail!(
                "Namespaces {:?} and {:?} overlap; one is a prefix of the other",
                ns.full.as_str(),
                ns.mini.as_str()
            );
        }
        if ns.full_duration.is_zero() || ns.mini_duration.is_zero() {
            bail!("Retention durations must be positive");
        }
        if ns.max_resolution.is_zero() {
            bail!("max_resolution must be positive");
        }
        if ns.mini_duration > ns.full_duration {
            tracing::warn!(
                "mini_duration ({:?}) is longer than full_duration ({:?})",
                ns.mini_duration,
                ns.full_duration
            );
        }

        if self.store.pool_size == 0 {
            bail!("store.pool_size must be at least 1");
        }
        if self.store.command_timeout.is_zero() {
            bail!("store.command_timeout must be positive");
        }

        let listen = &self.listen;
        if listen.max_frame_bytes == 0 {
            bail!("listen.max_frame_bytes must be positive");
        }
        if listen.max_datagram_bytes == 0 || listen.max_datagram_bytes > UDP_BUFFER {
            bail!(
                "listen.max_datagram_bytes must be between 1 and {} (got {})",
                UDP_BUFFER,
                listen.max_datagram_bytes
            );
        }
        if listen.queue_capacity == 0 {
            bail!("listen.queue_capacity must be positive");
        }

        if let Some(pattern) = self.ingest.skip_list.iter().find(|p| p.is_empty()) {
            bail!("ingest.skip_list contains an empty pattern {pattern:?}, which would skip every metric");
        }

        let ensemble = &self.analyzer.ensemble;
        if ensemble.consensus == 0 || ensemble.consensus > DETECTORS {
            bail!(
                "analyzer.ensemble.consensus must be between 1 and {} (got {})",
                DETECTORS,
                ensemble.consensus
            );
        }
        if ensemble.boredom_window == 0 {
            bail!("analyzer.ensemble.boredom_window must be positive");
        }
        if self.analyzer.processes_key.is_empty() || self.analyzer.anomalies_key.is_empty() {
            bail!("analyzer registry keys cannot be empty");
        }
        for rule in &self.analyzer.alerts {
            if rule.channel.is_empty() {
                bail!("Alert rule for {:?} has no channel", rule.pattern);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Namespace;

    #[test]
    fn test_default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_empty_backends() {
        let mut config = Config::default();
        config.backends.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_overlapping_namespaces() {
        let mut config = Config::default();
        config.namespaces.mini = Namespace::new("full.mini.".to_string()).unwrap();
        assert!(config.validate().is_err());

        config.namespaces.mini = config.namespaces.full.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_skip_pattern() {
        let mut config = Config::default();
        config.ingest.skip_list = vec!["statsd".to_string(), String::new()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_impossible_consensus() {
        let mut config = Config::default();
        config.analyzer.ensemble.consensus = 4;
        assert!(config.validate().is_err());
        config.analyzer.ensemble.consensus = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_datagram_limit_above_buffer() {
        let mut config = Config::default();
        config.listen.max_datagram_bytes = UDP_BUFFER + 1;
        assert!(config.validate().is_err());
    }
}
