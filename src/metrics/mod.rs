//! Operational metrics
//!
//! Ingestion keeps lock-free counters shared between the listener and its
//! workers. Analyzer and ingestion figures are shipped to Graphite over its
//! plaintext protocol.

mod graphite;
mod ingest;

pub use graphite::{GraphiteSink, Metric, MetricsError, format_lines};
pub use ingest::{IngestMetrics, IngestSnapshot};
