//! Datapoints and the stored series format
//!
//! A series value is the concatenation of msgpack-encoded `[timestamp,
//! value]` arrays, exactly what appending one encoded datapoint at a time
//! produces. Readers always fetch and decode the whole value.

mod codec;
mod trim;

pub(crate) use codec::RawTimestamp;
pub use codec::{decode_series, encode_point, encode_series};
pub use trim::{TrimPlan, plan_trim};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One sample: whole-second unix timestamp and value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(i64, f64)", into = "(i64, f64)")]
pub struct Datapoint {
    pub timestamp: i64,
    pub value: f64,
}

impl Datapoint {
    #[must_use]
    #[inline]
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// Bitwise equality, so NaN values compare equal to themselves
    #[must_use]
    #[inline]
    pub fn same_as(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.value.to_bits() == other.value.to_bits()
    }
}

impl From<(i64, f64)> for Datapoint {
    fn from((timestamp, value): (i64, f64)) -> Self {
        Self { timestamp, value }
    }
}

impl From<Datapoint> for (i64, f64) {
    fn from(dp: Datapoint) -> Self {
        (dp.timestamp, dp.value)
    }
}

/// Errors decoding or encoding a stored series
#[derive(Debug, Error)]
pub enum SeriesError {
    #[error("malformed series at byte {offset}: {source}")]
    Decode {
        offset: usize,
        #[source]
        source: rmp_serde::decode::Error,
    },

    #[error("failed to encode series: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}
