use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by the listener and ingestion workers
///
/// Cloning yields another handle to the same counters.
#[derive(Debug, Clone, Default)]
pub struct IngestMetrics {
    inner: Arc<IngestInner>,
}

#[derive(Debug, Default)]
struct IngestInner {
    received: AtomicU64,
    filtered: AtomicU64,
    dropped: AtomicU64,
    decode_errors: AtomicU64,
    accepted: AtomicU64,
    skipped: AtomicU64,
    stale: AtomicU64,
    future: AtomicU64,
    failed_writes: AtomicU64,
}

/// Point-in-time copy of [`IngestMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSnapshot {
    /// Datapoints decoded by the listener
    pub received: u64,
    /// Rejected by the access-key filter
    pub filtered: u64,
    /// Dropped because the queue stayed full
    pub dropped: u64,
    /// Frames or datagrams that failed to decode
    pub decode_errors: u64,
    /// Written by a worker
    pub accepted: u64,
    /// Matched the skip list
    pub skipped: u64,
    /// Older than the maximum resolution
    pub stale: u64,
    /// Stamped too far in the future
    pub future: u64,
    /// Namespace writes that failed
    pub failed_writes: u64,
}

macro_rules! counter {
    ($($record:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $record(&self, n: u64) {
                self.inner.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl IngestMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        record_received => received,
        record_filtered => filtered,
        record_dropped => dropped,
        record_decode_error => decode_errors,
        record_accepted => accepted,
        record_skipped => skipped,
        record_stale => stale,
        record_future => future,
        record_failed_write => failed_writes,
    }

    #[must_use]
    pub fn snapshot(&self) -> IngestSnapshot {
        let i = &self.inner;
        IngestSnapshot {
            received: i.received.load(Ordering::Relaxed),
            filtered: i.filtered.load(Ordering::Relaxed),
            dropped: i.dropped.load(Ordering::Relaxed),
            decode_errors: i.decode_errors.load(Ordering::Relaxed),
            accepted: i.accepted.load(Ordering::Relaxed),
            skipped: i.skipped.load(Ordering::Relaxed),
            stale: i.stale.load(Ordering::Relaxed),
            future: i.future.load(Ordering::Relaxed),
            failed_writes: i.failed_writes.load(Ordering::Relaxed),
        }
    }
}
