use std::time::Instant;

use crate::types::MaxFailures;

/// Where a backend stands in the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    /// Connected and placed on the continuum
    Live,
    /// Off the continuum, will be reconnected on the next check
    Down,
    /// Out of reconnection attempts; never retried
    Failed,
}

/// Health information for a single backend
#[derive(Debug, Clone)]
pub struct BackendHealth {
    /// Current status
    pub status: BackendStatus,
    /// Failures since the backend was last healthy
    pub consecutive_failures: u32,
    /// Total number of failed checks or connects
    pub total_failures: u64,
    /// When the backend was last seen as healthy
    pub last_healthy: Option<Instant>,
    /// When the backend last failed
    pub last_failure: Option<Instant>,
}

impl BackendHealth {
    /// Tracker for a freshly connected backend
    pub fn new() -> Self {
        Self {
            status: BackendStatus::Live,
            consecutive_failures: 0,
            total_failures: 0,
            last_healthy: Some(Instant::now()),
            last_failure: None,
        }
    }

    /// Record a successful ping or reconnect
    pub fn record_success(&mut self) {
        self.status = BackendStatus::Live;
        self.consecutive_failures = 0;
        self.last_healthy = Some(Instant::now());
    }

    /// Record a failed ping or connect
    ///
    /// Returns the new status: `Down` while reconnection attempts remain,
    /// `Failed` once `max_failures` consecutive failures have been seen.
    pub fn record_failure(&mut self, max_failures: MaxFailures) -> BackendStatus {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures += 1;
        self.last_failure = Some(Instant::now());
        self.status = if self.consecutive_failures >= max_failures.get() {
            BackendStatus::Failed
        } else {
            BackendStatus::Down
        };
        self.status
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.status == BackendStatus::Live
    }

    /// Reconnection attempts are used up
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.status == BackendStatus::Failed
    }
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self::new()
    }
}
