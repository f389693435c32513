//! Sharded time-series ingestion and anomaly detection
//!
//! Three services share this library and talk to each other only through
//! a set of Redis-protocol backends addressed by a consistent-hash [`Ring`]:
//!
//! - ingestion: a [`Listener`] feeds a bounded queue drained by
//!   [`ingest`] workers, which append every datapoint to its series in
//!   both namespaces;
//! - the [`Analyzer`] splits the metric universe across workers each cycle
//!   and judges every series with an [`analyzer::Ensemble`];
//! - the [`Vacuum`] trims series to their retention window.

pub mod analyzer;
pub mod args;
pub mod clock;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod ingest;
pub mod listener;
pub mod liveness;
pub mod logging;
pub mod metrics;
pub mod partition;
pub mod ring;
pub mod runtime;
pub mod series;
pub mod store;
pub mod stream;
pub mod types;
pub mod vacuum;

pub use analyzer::Analyzer;
pub use config::{Config, load_config, load_or_create_config};
pub use listener::Listener;
pub use liveness::{Liveness, LivenessError, Shutdown};
pub use ring::{Ring, RingError, RingFactory};
pub use vacuum::Vacuum;
