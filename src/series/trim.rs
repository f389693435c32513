use std::collections::BTreeMap;
use std::time::Duration;

use super::Datapoint;

/// What the vacuum should do with one series
#[derive(Debug, Clone, PartialEq)]
pub enum TrimPlan {
    /// Nothing newer than the cutoff remains; remove the key
    Delete,
    /// Write back these points, sorted and de-duplicated
    Rewrite(Vec<Datapoint>),
    /// Already trimmed, sorted and free of duplicates
    Keep,
}

/// Decide how to trim `points` for a retention window ending at `now`
///
/// A point survives iff `timestamp >= now - retention`; the series is
/// deleted iff its newest point falls before that cutoff. Points sharing a
/// timestamp collapse to the one appended last. Survivors come back sorted
/// by timestamp.
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use driftwatch::series::{Datapoint, TrimPlan, plan_trim};
///
/// let series = [Datapoint::new(10, 1.0)];
/// assert_eq!(plan_trim(&series, 1000, Duration::from_secs(500)), TrimPlan::Delete);
///
/// let series = [Datapoint::new(600, 1.0), Datapoint::new(400, 2.0)];
/// assert_eq!(
///     plan_trim(&series, 1000, Duration::from_secs(500)),
///     TrimPlan::Rewrite(vec![Datapoint::new(600, 1.0)])
/// );
/// ```
#[must_use]
pub fn plan_trim(points: &[Datapoint], now: i64, retention: Duration) -> TrimPlan {
    let retention = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
    let cutoff = now.saturating_sub(retention);

    let Some(newest) = points.iter().map(|dp| dp.timestamp).max() else {
        return TrimPlan::Delete;
    };
    if newest < cutoff {
        return TrimPlan::Delete;
    }

    // Later inserts overwrite earlier ones
    let mut latest: BTreeMap<i64, f64> = BTreeMap::new();
    for dp in points.iter().filter(|dp| dp.timestamp >= cutoff) {
        latest.insert(dp.timestamp, dp.value);
    }
    let trimmed: Vec<Datapoint> = latest
        .into_iter()
        .map(|(timestamp, value)| Datapoint::new(timestamp, value))
        .collect();

    let unchanged = trimmed.len() == points.len()
        && trimmed.iter().zip(points).all(|(a, b)| a.same_as(b));
    if unchanged {
        TrimPlan::Keep
    } else {
        TrimPlan::Rewrite(trimmed)
    }
}
