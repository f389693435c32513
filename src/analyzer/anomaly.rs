//! Publishing and collecting anomaly lists
//!
//! Each worker that found anomalies stores its list under its own process
//! key with a short expiry and adds that key to a shared index set, which
//! expires on its own too. Outputs of dead workers therefore age out
//! without anyone cleaning up.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::constants::analyzer::{ANOMALY_INDEX_TTL, ANOMALY_TTL};
use crate::ring::{Ring, RingError};
use crate::series::Datapoint;

/// An anomalous datapoint and the metric (without namespace) it belongs to
///
/// Stored as the msgpack pair `[[timestamp, value], metric]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(Datapoint, String)", into = "(Datapoint, String)")]
pub struct Anomaly {
    pub datapoint: Datapoint,
    pub metric: String,
}

impl Anomaly {
    #[must_use]
    pub fn new(datapoint: Datapoint, metric: impl Into<String>) -> Self {
        Self {
            datapoint,
            metric: metric.into(),
        }
    }
}

impl From<(Datapoint, String)> for Anomaly {
    fn from((datapoint, metric): (Datapoint, String)) -> Self {
        Self { datapoint, metric }
    }
}

impl From<Anomaly> for (Datapoint, String) {
    fn from(a: Anomaly) -> Self {
        (a.datapoint, a.metric)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnomalyError {
    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("cannot encode anomalies: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// Store a worker's anomalies under `process_key` and index it
pub async fn publish_anomalies(
    ring: &Ring,
    process_key: &str,
    index_key: &str,
    anomalies: &[Anomaly],
) -> Result<(), AnomalyError> {
    let packed = rmp_serde::to_vec(anomalies)?;
    ring.set(process_key, &packed).await?;
    ring.expire(process_key, ANOMALY_TTL).await?;
    ring.sadd(index_key, process_key).await?;
    ring.expire(index_key, ANOMALY_INDEX_TTL).await?;
    debug!("Published {} anomalies under {}", anomalies.len(), process_key);
    Ok(())
}

/// Gather every live worker's anomalies, sorted by metric name
///
/// Index entries whose list has expired are removed. When several workers
/// report the same metric, the entry from the last list (in key order)
/// wins.
pub async fn collect_anomalies(ring: &Ring, index_key: &str) -> Result<Vec<Anomaly>, RingError> {
    let mut keys = ring.smembers(index_key).await?;
    keys.sort();

    let mut merged: BTreeMap<String, Anomaly> = BTreeMap::new();
    for key in keys {
        let Some(raw) = ring.get(&key).await? else {
            debug!("Dropping expired anomaly list {}", key);
            ring.srem(index_key, &key).await?;
            continue;
        };
        match rmp_serde::from_slice::<Vec<Anomaly>>(&raw) {
            Ok(anomalies) => {
                for anomaly in anomalies {
                    merged.insert(anomaly.metric.clone(), anomaly);
                }
            }
            Err(e) => warn!("Ignoring malformed anomaly list {}: {}", key, e),
        }
    }
    Ok(merged.into_values().collect())
}
