use serde::Deserialize;
use std::io::Cursor;

use super::{Datapoint, SeriesError};

/// Timestamps written by other producers may be floats
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum RawTimestamp {
    Int(i64),
    Float(f64),
}

impl RawTimestamp {
    pub(crate) fn seconds(self) -> i64 {
        match self {
            Self::Int(ts) => ts,
            Self::Float(ts) => ts.trunc() as i64,
        }
    }
}

/// Encode one datapoint as a msgpack `[timestamp, value]` array
///
/// # Examples
/// ```
/// use driftwatch::series::{Datapoint, encode_point};
///
/// let bytes = encode_point(&Datapoint::new(1, 0.5)).unwrap();
/// assert_eq!(bytes[0], 0x92); // fixarray of two
/// assert_eq!(bytes[1], 0x01); // positive fixint
/// ```
pub fn encode_point(dp: &Datapoint) -> Result<Vec<u8>, SeriesError> {
    Ok(rmp_serde::to_vec(dp)?)
}

/// Encode a whole series in stored form
///
/// The points are encoded as one msgpack array and the array header is
/// dropped (1 byte up to 15 items, 3 up to 65535, 5 beyond). The result is
/// byte-identical to concatenating [`encode_point`] of each point.
pub fn encode_series(points: &[Datapoint]) -> Result<Vec<u8>, SeriesError> {
    let packed = rmp_serde::to_vec(points)?;
    let header = match points.len() {
        0..=15 => 1,
        16..=65_535 => 3,
        _ => 5,
    };
    Ok(packed[header..].to_vec())
}

/// Decode a stored series into its datapoints, in stored order
pub fn decode_series(raw: &[u8]) -> Result<Vec<Datapoint>, SeriesError> {
    let mut cursor = Cursor::new(raw);
    // Each encoded point takes at least 3 bytes
    let mut points = Vec::with_capacity(raw.len() / 3);
    while (cursor.position() as usize) < raw.len() {
        let offset = cursor.position() as usize;
        let (timestamp, value): (RawTimestamp, f64) = rmp_serde::from_read(&mut cursor)
            .map_err(|source| SeriesError::Decode { offset, source })?;
        points.push(Datapoint::new(timestamp.seconds(), value));
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn concatenated(points: &[Datapoint]) -> Vec<u8> {
        points
            .iter()
            .flat_map(|dp| encode_point(dp).unwrap())
            .collect()
    }

    #[test]
    fn test_encode_point_layout() {
        let bytes = encode_point(&Datapoint::new(100, 5.0)).unwrap();
        let mut expected = vec![0x92, 0x64, 0xcb];
        expected.extend_from_slice(&5.0f64.to_be_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_large_timestamps_use_wider_ints() {
        let bytes = encode_point(&Datapoint::new(1_700_000_000, 1.0)).unwrap();
        assert_eq!(bytes[1], 0xce); // uint32
    }

    #[test]
    fn test_encode_series_matches_appends_in_every_size_class() {
        for len in [0usize, 1, 15, 16, 300, 65_535, 65_536] {
            let points: Vec<Datapoint> = (0..len)
                .map(|i| Datapoint::new(i as i64, i as f64 / 2.0))
                .collect();
            assert_eq!(
                encode_series(&points).unwrap(),
                concatenated(&points),
                "size class mismatch at {len} points"
            );
        }
    }

    #[test]
    fn test_decode_concatenation() {
        let points = vec![
            Datapoint::new(10, 1.0),
            Datapoint::new(-5, -2.5),
            Datapoint::new(1_700_000_000, 3.25),
        ];
        assert_eq!(decode_series(&concatenated(&points)).unwrap(), points);
        assert!(decode_series(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_decode_accepts_float_timestamps_and_int_values() {
        // [10.9, 7]
        let mut raw = vec![0x92, 0xcb];
        raw.extend_from_slice(&10.9f64.to_be_bytes());
        raw.push(0x07);
        assert_eq!(decode_series(&raw).unwrap(), vec![Datapoint::new(10, 7.0)]);
    }

    #[test]
    fn test_decode_reports_offset_of_garbage() {
        let mut raw = encode_point(&Datapoint::new(1, 1.0)).unwrap();
        let good = raw.len();
        raw.extend_from_slice(b"\xc1"); // reserved marker
        match decode_series(&raw) {
            Err(SeriesError::Decode { offset, .. }) => assert_eq!(offset, good),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_truncated_point() {
        let raw = encode_point(&Datapoint::new(1, 1.0)).unwrap();
        assert!(decode_series(&raw[..raw.len() - 2]).is_err());
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_concatenated_encoding(
            raw in prop::collection::vec((any::<i64>(), -1e12f64..1e12), 0..64),
        ) {
            let points: Vec<Datapoint> = raw.into_iter().map(Datapoint::from).collect();
            let encoded = encode_series(&points).unwrap();
            prop_assert_eq!(&encoded, &concatenated(&points));
            prop_assert_eq!(decode_series(&encoded).unwrap(), points);
        }
    }
}
