//! Splitting the metric universe across workers
//!
//! Every worker takes a contiguous slice of the sorted universe. With
//! `per = ceil(total / count)`, worker `p` (1-based) covers
//! `[(p - 1) * per, p * per)`, clamped to the universe, and the last worker
//! always runs to the end. The slices are disjoint and cover every index.
//!
//! The analyzer derives `p` and `count` from a membership registry (a sorted
//! set of alive keys ranked by registration time); the vacuum uses its
//! configured ranks directly.

use std::ops::Range;
use tracing::debug;

use crate::clock::unix_now_f64;
use crate::constants::analyzer::{ALIVE_TTL, PROCESSES_TTL};
use crate::ring::{Ring, RingError};
use crate::types::WorkerCount;

/// Index range of the universe assigned to worker `position` of `count`
///
/// `position` is 1-based. Positions past `count` get nothing.
///
/// # Examples
/// ```
/// use driftwatch::partition::assigned_range;
///
/// // five metrics over two workers
/// assert_eq!(assigned_range(5, 1, 2), 0..3);
/// assert_eq!(assigned_range(5, 2, 2), 3..5);
///
/// // more workers than metrics
/// assert_eq!(assigned_range(2, 3, 4), 2..2);
/// ```
#[must_use]
pub fn assigned_range(total: usize, position: usize, count: usize) -> Range<usize> {
    if count == 0 || position == 0 || position > count {
        return total..total;
    }
    let per = total.div_ceil(count);
    let start = ((position - 1) * per).min(total);
    let end = if position == count {
        total
    } else {
        (position * per).min(total)
    };
    start..end.max(start)
}

/// A worker's place in the cluster for one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    /// 1-based rank among registered workers
    pub position: usize,
    /// Number of partitions the universe is split into
    pub count: usize,
}

impl Assignment {
    /// Slice of a universe of `total` metrics
    #[must_use]
    pub fn range(&self, total: usize) -> Range<usize> {
        assigned_range(total, self.position, self.count)
    }
}

/// Cluster membership registry kept in a sorted set
#[derive(Debug, Clone)]
pub struct Membership {
    registry_key: String,
    configured: WorkerCount,
}

impl Membership {
    #[must_use]
    pub fn new(registry_key: impl Into<String>, configured: WorkerCount) -> Self {
        Self {
            registry_key: registry_key.into(),
            configured,
        }
    }

    #[must_use]
    pub fn registry_key(&self) -> &str {
        &self.registry_key
    }

    /// Heartbeat `alive_key` and work out this worker's assignment
    ///
    /// Registrations whose alive key expired are pruned first. A new worker
    /// is ranked by its registration time; an existing one keeps its rank.
    /// The partition count is the larger of the configured worker count and
    /// the number of registered workers, so workers that have not started
    /// yet still get their share reserved.
    ///
    /// Returns `None` if the registration vanished before it could be
    /// ranked; the worker should sit this cycle out.
    pub async fn register(
        &self,
        ring: &Ring,
        alive_key: &str,
    ) -> Result<Option<Assignment>, RingError> {
        ring.set(alive_key, b"1").await?;
        ring.expire(alive_key, ALIVE_TTL).await?;

        for member in ring.zrange(&self.registry_key, 0, -1).await? {
            if member != alive_key && ring.get(&member).await?.is_none() {
                debug!("Pruning expired registration {}", member);
                ring.zrem(&self.registry_key, &member).await?;
            }
        }

        if ring.zscore(&self.registry_key, alive_key).await?.is_none() {
            ring.zadd(&self.registry_key, unix_now_f64(), alive_key)
                .await?;
        }
        ring.expire(&self.registry_key, PROCESSES_TTL).await?;

        let Some(rank) = ring.zrank(&self.registry_key, alive_key).await? else {
            return Ok(None);
        };
        let registered = ring.zcard(&self.registry_key).await? as usize;

        Ok(Some(Assignment {
            position: rank as usize + 1,
            count: registered.max(self.configured.get()),
        }))
    }
}
