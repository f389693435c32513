use serde::Serialize;

use super::{IngestItem, ListenerError};
use crate::series::{Datapoint, RawTimestamp};

/// Decode one msgpack batch of `[metric_name, [timestamp, value]]` entries
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<IngestItem>, ListenerError> {
    let entries: Vec<(String, (RawTimestamp, f64))> = rmp_serde::from_slice(bytes)?;
    Ok(entries
        .into_iter()
        .map(|(metric, (ts, value))| IngestItem {
            metric,
            datapoint: Datapoint::new(ts.seconds(), value),
        })
        .collect())
}

/// Encode a batch the way producers send it
///
/// # Examples
/// ```
/// use driftwatch::listener::{IngestItem, decode_batch, encode_batch};
/// use driftwatch::series::Datapoint;
///
/// let items = vec![IngestItem::new("cpu.load", Datapoint::new(60, 0.5))];
/// let bytes = encode_batch(&items).unwrap();
/// assert_eq!(decode_batch(&bytes).unwrap(), items);
/// ```
pub fn encode_batch(items: &[IngestItem]) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    #[derive(Serialize)]
    struct Entry<'a>(&'a str, Datapoint);

    let entries: Vec<Entry<'_>> = items
        .iter()
        .map(|item| Entry(&item.metric, item.datapoint))
        .collect();
    rmp_serde::to_vec(&entries)
}

/// Optional namespace restriction on incoming metric names
///
/// With a non-empty key only names starting with `"<key>."` pass, and the
/// prefix is stripped from them.
#[derive(Debug, Clone, Default)]
pub struct AccessFilter {
    prefix: Option<String>,
}

impl AccessFilter {
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self {
            prefix: (!key.is_empty()).then(|| format!("{key}.")),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.prefix.is_none()
    }

    /// Apply the filter, returning the rewritten item or `None` if dropped
    #[must_use]
    pub fn apply(&self, mut item: IngestItem) -> Option<IngestItem> {
        let Some(prefix) = &self.prefix else {
            return Some(item);
        };
        let stripped = item.metric.strip_prefix(prefix.as_str())?;
        item.metric = stripped.to_string();
        Some(item)
    }
}
