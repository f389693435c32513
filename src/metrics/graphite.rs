//! Graphite plaintext sink
//!
//! Each metric is one `name value timestamp\n` line. Every emit opens a
//! fresh TCP connection with a short timeout; an unreachable collector is
//! logged and otherwise ignored.

use std::fmt::Write as _;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::constants::metrics::SEND_TIMEOUT;
use crate::types::KeyPrefix;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("graphite I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("graphite send timed out after {0:?}")]
    Timeout(Duration),
}

/// One sample for the collector
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub timestamp: i64,
}

impl Metric {
    #[must_use]
    pub fn new(name: impl Into<String>, value: f64, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
        }
    }
}

/// Render metrics in the plaintext protocol
///
/// # Examples
/// ```
/// use driftwatch::metrics::{Metric, format_lines};
///
/// let lines = format_lines(&[Metric::new("dw.analyzer.run_time", 1.5, 1700000000)]);
/// assert_eq!(lines, "dw.analyzer.run_time 1.5 1700000000\n");
/// ```
#[must_use]
pub fn format_lines(metrics: &[Metric]) -> String {
    let mut out = String::with_capacity(metrics.len() * 48);
    for metric in metrics {
        let _ = writeln!(out, "{} {} {}", metric.name, metric.value, metric.timestamp);
    }
    out
}

/// Client for a Graphite carbon endpoint
#[derive(Debug, Clone)]
pub struct GraphiteSink {
    endpoint: Option<(String, u16)>,
    prefix: KeyPrefix,
    timeout: Duration,
}

impl GraphiteSink {
    /// Sink sending to `host:port`; `None` disables sending
    #[must_use]
    pub fn new(endpoint: Option<(String, u16)>, prefix: KeyPrefix) -> Self {
        Self {
            endpoint,
            prefix,
            timeout: SEND_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Full metric name under the configured prefix
    #[must_use]
    pub fn name(&self, parts: &[&str]) -> String {
        self.prefix.join(parts)
    }

    /// Send metrics, failing on any connection or write error
    pub async fn send(&self, metrics: &[Metric]) -> Result<(), MetricsError> {
        let Some((host, port)) = &self.endpoint else {
            return Ok(());
        };
        if metrics.is_empty() {
            return Ok(());
        }
        let payload = format_lines(metrics);
        let write = async {
            let mut stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.write_all(payload.as_bytes()).await?;
            stream.shutdown().await?;
            Ok::<_, MetricsError>(())
        };
        tokio::time::timeout(self.timeout, write)
            .await
            .map_err(|_| MetricsError::Timeout(self.timeout))??;
        debug!("Sent {} metrics to {}:{}", metrics.len(), host, port);
        Ok(())
    }

    /// Send metrics, logging instead of failing
    pub async fn emit(&self, metrics: &[Metric]) {
        if let Err(e) = self.send(metrics).await {
            warn!("Could not send metrics to graphite: {}", e);
        }
    }
}
