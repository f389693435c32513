//! Alert rules, cooldowns and dispatch
//!
//! For every rule and every anomalous metric containing the rule's pattern,
//! a cooldown key `last_alert.<channel>.<metric>` is checked. If it is
//! absent it is set (holding the triggering datapoint, expiring after the
//! rule's cooldown) and the dispatcher is invoked. Failures are logged and
//! never abort the cycle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

use super::anomaly::Anomaly;
use crate::ring::{Ring, RingError};
use crate::series::encode_point;
use crate::types::duration_serde;

/// Route anomalies whose metric contains `pattern` to `channel`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRule {
    pub pattern: String,
    pub channel: String,
    /// Minimum time between two alerts for the same metric on this channel
    #[serde(with = "duration_serde")]
    pub cooldown: Duration,
}

impl AlertRule {
    #[must_use]
    pub fn new(pattern: impl Into<String>, channel: impl Into<String>, cooldown: Duration) -> Self {
        Self {
            pattern: pattern.into(),
            channel: channel.into(),
            cooldown,
        }
    }

    #[must_use]
    pub fn matches(&self, metric: &str) -> bool {
        metric.contains(self.pattern.as_str())
    }

    /// Key marking a recent alert for `metric` on this rule's channel
    #[must_use]
    pub fn cooldown_key(&self, metric: &str) -> String {
        format!("last_alert.{}.{}", self.channel, metric)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("alert channel {channel:?} failed: {reason}")]
    Channel { channel: String, reason: String },

    #[error("no dispatcher for channel {0:?}")]
    UnknownChannel(String),
}

/// Delivers alerts to an outside system
#[async_trait]
pub trait AlertDispatcher: Send + Sync + std::fmt::Debug {
    async fn dispatch(&self, rule: &AlertRule, anomaly: &Anomaly) -> Result<(), DispatchError>;
}

/// Dispatcher that only writes alerts to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatcher;

#[async_trait]
impl AlertDispatcher for LogDispatcher {
    async fn dispatch(&self, rule: &AlertRule, anomaly: &Anomaly) -> Result<(), DispatchError> {
        warn!(
            channel = %rule.channel,
            metric = %anomaly.metric,
            "Anomalous value {} at {}",
            anomaly.datapoint.value,
            anomaly.datapoint.timestamp
        );
        Ok(())
    }
}

/// Apply every rule to every anomaly, returning how many alerts went out
pub async fn send_alerts(
    ring: &Ring,
    rules: &[AlertRule],
    anomalies: &[Anomaly],
    dispatcher: &dyn AlertDispatcher,
) -> usize {
    let mut sent = 0;
    for rule in rules {
        for anomaly in anomalies.iter().filter(|a| rule.matches(&a.metric)) {
            match alert_once(ring, rule, anomaly, dispatcher).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => error!("Couldn't send alert for {}: {}", anomaly.metric, e),
            }
        }
    }
    sent
}

#[derive(Debug, Error)]
enum AlertError {
    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Encode(#[from] crate::series::SeriesError),
}

async fn alert_once(
    ring: &Ring,
    rule: &AlertRule,
    anomaly: &Anomaly,
    dispatcher: &dyn AlertDispatcher,
) -> Result<bool, AlertError> {
    let key = rule.cooldown_key(&anomaly.metric);
    if ring.get(&key).await?.is_some() {
        return Ok(false);
    }
    ring.set_ex(&key, &encode_point(&anomaly.datapoint)?, rule.cooldown)
        .await?;
    dispatcher.dispatch(rule, anomaly).await?;
    Ok(true)
}
