use std::time::Duration;

use crate::listener::IngestItem;

/// What happens to an incoming datapoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Metric name matched the skip list
    Skipped,
    /// Older than the maximum resolution
    Stale,
    /// Stamped too far ahead of now
    Future,
}

/// Admission rules applied by every ingestion worker
#[derive(Debug, Clone)]
pub struct IngestPolicy {
    skip_list: Vec<String>,
    max_resolution: i64,
    max_future: i64,
}

impl IngestPolicy {
    #[must_use]
    pub fn new(skip_list: Vec<String>, max_resolution: Duration, max_future: Duration) -> Self {
        Self {
            skip_list,
            max_resolution: max_resolution.as_secs() as i64,
            max_future: max_future.as_secs() as i64,
        }
    }

    /// Whether any skip pattern occurs in `metric`
    #[must_use]
    pub fn is_skipped(&self, metric: &str) -> bool {
        self.skip_list.iter().any(|pattern| metric.contains(pattern.as_str()))
    }

    /// Decide on `item` at unix time `now`
    ///
    /// A point survives if `now - max_resolution <= timestamp <= now + max_future`.
    ///
    /// # Examples
    /// ```
    /// use std::time::Duration;
    /// use driftwatch::ingest::{Admission, IngestPolicy};
    /// use driftwatch::listener::IngestItem;
    /// use driftwatch::series::Datapoint;
    ///
    /// let policy = IngestPolicy::new(vec![], Duration::from_secs(60), Duration::ZERO);
    /// let item = IngestItem::new("x", Datapoint::new(100, 5.0));
    /// assert_eq!(policy.admit(&item, 50), Admission::Future);
    /// assert_eq!(policy.admit(&item, 150), Admission::Accept);
    /// assert_eq!(policy.admit(&item, 200), Admission::Stale);
    /// ```
    #[must_use]
    pub fn admit(&self, item: &IngestItem, now: i64) -> Admission {
        if self.is_skipped(&item.metric) {
            return Admission::Skipped;
        }
        let ts = item.datapoint.timestamp;
        if ts < now.saturating_sub(self.max_resolution) {
            Admission::Stale
        } else if ts > now.saturating_add(self.max_future) {
            Admission::Future
        } else {
            Admission::Accept
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::Datapoint;

    fn item(metric: &str, ts: i64) -> IngestItem {
        IngestItem::new(metric, Datapoint::new(ts, 5.0))
    }

    fn policy(max_future: u64) -> IngestPolicy {
        IngestPolicy::new(
            vec!["statsd".to_string(), ".tmp.".to_string()],
            Duration::from_secs(60),
            Duration::from_secs(max_future),
        )
    }

    #[test]
    fn test_skip_list_matches_substrings() {
        let policy = policy(60);
        assert_eq!(policy.admit(&item("app.statsd.count", 100), 100), Admission::Skipped);
        assert_eq!(policy.admit(&item("host.tmp.disk", 100), 100), Admission::Skipped);
        assert_eq!(policy.admit(&item("host.tmpdisk", 100), 100), Admission::Accept);
    }

    #[test]
    fn test_future_point_rejected_without_allowance() {
        // t=100 arriving at now=50
        assert_eq!(policy(0).admit(&item("x", 100), 50), Admission::Future);
    }

    #[test]
    fn test_future_allowance() {
        let policy = policy(60);
        assert_eq!(policy.admit(&item("x", 160), 100), Admission::Accept);
        assert_eq!(policy.admit(&item("x", 161), 100), Admission::Future);
    }

    #[test]
    fn test_stale_boundary() {
        let policy = policy(60);
        // now=200, max_resolution=60 → cutoff 140
        assert_eq!(policy.admit(&item("x", 100), 200), Admission::Stale);
        assert_eq!(policy.admit(&item("x", 139), 200), Admission::Stale);
        assert_eq!(policy.admit(&item("x", 140), 200), Admission::Accept);
        assert_eq!(policy.admit(&item("x", 150), 200), Admission::Accept);
    }
}
