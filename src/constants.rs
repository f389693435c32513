//! Constants used throughout driftwatch
//!
//! Timeouts, expiries and limits that are not worth exposing in the
//! configuration file live here; configurable values take their defaults
//! from these.

use std::time::Duration;

/// Backend client tuning
pub mod store {
    use super::Duration;

    /// Per-command timeout, including connection establishment
    pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

    /// Maximum pooled connections per backend
    pub const POOL_MAX_SIZE: usize = 8;

    /// BufReader capacity for reply parsing (16KB)
    pub const READ_BUFFER_SIZE: usize = 16 * 1024;
}

/// Consistent-hash ring
pub mod ring {
    use super::Duration;

    /// Virtual points placed on the continuum per backend
    pub const VIRTUAL_NODES: usize = 160;

    /// Sleep before rebuilding a ring that lost every backend
    pub const REBUILD_BACKOFF: Duration = Duration::from_secs(10);
}

/// Ingestion listener and queue
pub mod listener {
    use super::Duration;

    /// Largest TCP frame accepted (16MB)
    pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

    /// Buffer reserved up front for a frame body; larger bodies grow as bytes arrive
    pub const FRAME_CHUNK: usize = 64 * 1024;

    /// UDP receive buffer, the largest possible datagram payload
    pub const UDP_BUFFER: usize = 64 * 1024;

    /// Default limit on an accepted datagram
    pub const MAX_DATAGRAM_BYTES: usize = 1024;

    /// Wait before retrying a failed bind
    pub const BIND_RETRY: Duration = Duration::from_secs(10);

    /// Longest a listener waits for queue space per batch before dropping the rest
    pub const QUEUE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

    /// Internal queue capacity
    pub const QUEUE_CAPACITY: usize = 100_000;
}

/// Ingestion workers
pub mod ingest {
    use super::Duration;

    /// Bounded wait on an empty queue
    pub const QUEUE_RECV_TIMEOUT: Duration = Duration::from_secs(15);

    /// How often the canary worker reports queue depth
    pub const CANARY_INTERVAL: Duration = Duration::from_secs(60);

    /// Furthest into the future a datapoint may be stamped
    pub const MAX_FUTURE: Duration = Duration::from_secs(60);
}

/// Partitioned analyzer
pub mod analyzer {
    use super::Duration;

    /// Expiry of a worker's alive key
    pub const ALIVE_TTL: Duration = Duration::from_secs(30);

    /// Expiry of the membership sorted set
    pub const PROCESSES_TTL: Duration = Duration::from_secs(60);

    /// Expiry of a worker's published anomaly list
    pub const ANOMALY_TTL: Duration = Duration::from_secs(30);

    /// Expiry of the anomaly index set
    pub const ANOMALY_INDEX_TTL: Duration = Duration::from_secs(60);

    /// Cycles shorter than this are followed by [`IDLE_SLEEP`]
    pub const MIN_CYCLE: Duration = Duration::from_secs(5);

    /// Sleep after a short cycle or an empty universe
    pub const IDLE_SLEEP: Duration = Duration::from_secs(10);
}

/// Vacuum
pub mod vacuum {
    use super::Duration;

    /// Expiry of a (rank, namespace) lease
    pub const LEASE_TTL: Duration = Duration::from_secs(600);

    /// Cycles shorter than this are followed by [`IDLE_SLEEP`]
    pub const MIN_CYCLE: Duration = Duration::from_secs(30);

    /// Sleep after a short cycle
    pub const IDLE_SLEEP: Duration = Duration::from_secs(10);

    /// Conflicted keys are retried at most this many times per cycle
    pub const MAX_RETRIES_PER_KEY: u32 = 3;
}

/// Graphite sink
pub mod metrics {
    use super::Duration;

    /// Connect and write timeout
    pub const SEND_TIMEOUT: Duration = Duration::from_secs(3);
}
