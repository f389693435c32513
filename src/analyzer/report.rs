use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use super::anomaly::Anomaly;
use super::ensemble::{EvaluationError, Verdict};

/// Why a metric produced no verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Exception {
    /// Listed in the universe but gone by the time it was read
    DeletedConcurrently,
    TooShort,
    Stale,
    Incomplete,
    Boring,
    /// Undecodable series or any other evaluation failure
    Other,
}

impl From<&EvaluationError> for Exception {
    fn from(e: &EvaluationError) -> Self {
        match e {
            EvaluationError::TooShort => Self::TooShort,
            EvaluationError::Stale => Self::Stale,
            EvaluationError::Incomplete => Self::Incomplete,
            EvaluationError::Boring => Self::Boring,
            EvaluationError::Other(_) => Self::Other,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything one analyzer worker produced in one cycle
///
/// Workers own their report outright and hand it back when they finish;
/// the cycle sums them with [`WorkerReport::merge`], which is order
/// independent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerReport {
    /// Metrics that received a verdict
    pub analyzed: u64,
    pub exceptions: BTreeMap<Exception, u64>,
    /// Detector name to the number of anomalous votes it cast
    pub anomaly_breakdown: BTreeMap<String, u64>,
    pub anomalies: Vec<Anomaly>,
}

impl WorkerReport {
    pub fn record_exception(&mut self, exception: Exception) {
        *self.exceptions.entry(exception).or_default() += 1;
    }

    /// Count a verdict, keeping the anomaly if there is one
    pub fn record_verdict(&mut self, metric: &str, verdict: &Verdict) {
        self.analyzed += 1;
        if !verdict.anomalous {
            return;
        }
        self.anomalies.push(Anomaly::new(verdict.datapoint, metric));
        for detector in verdict.accusers() {
            *self
                .anomaly_breakdown
                .entry(detector.to_string())
                .or_default() += 1;
        }
    }

    /// Add another worker's report into this one
    pub fn merge(&mut self, other: WorkerReport) {
        self.analyzed += other.analyzed;
        for (exception, count) in other.exceptions {
            *self.exceptions.entry(exception).or_default() += count;
        }
        for (detector, count) in other.anomaly_breakdown {
            *self.anomaly_breakdown.entry(detector).or_default() += count;
        }
        self.anomalies.extend(other.anomalies);
    }

    #[must_use]
    pub fn total_exceptions(&self) -> u64 {
        self.exceptions.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::ensemble::Vote;
    use crate::series::Datapoint;
    use proptest::prelude::*;

    fn verdict(anomalous: bool, votes: [bool; 3]) -> Verdict {
        let names = ["a", "b", "c"];
        Verdict {
            anomalous,
            votes: names
                .into_iter()
                .zip(votes)
                .map(|(detector, anomalous)| Vote {
                    detector,
                    anomalous,
                })
                .collect(),
            datapoint: Datapoint::new(10, 1.0),
        }
    }

    #[test]
    fn test_record_verdict_counts_accusers() {
        let mut report = WorkerReport::default();
        report.record_verdict("cpu", &verdict(true, [true, false, true]));
        report.record_verdict("mem", &verdict(false, [true, false, false]));

        assert_eq!(report.analyzed, 2);
        assert_eq!(report.anomalies, vec![Anomaly::new(Datapoint::new(10, 1.0), "cpu")]);
        assert_eq!(report.anomaly_breakdown.get("a"), Some(&1));
        assert_eq!(report.anomaly_breakdown.get("b"), None);
        assert_eq!(report.anomaly_breakdown.get("c"), Some(&1));
    }

    #[test]
    fn test_from_evaluation_error() {
        assert_eq!(Exception::from(&EvaluationError::Boring), Exception::Boring);
        assert_eq!(
            Exception::from(&EvaluationError::Other("x".into())),
            Exception::Other
        );
    }

    const EXCEPTIONS: [Exception; 6] = [
        Exception::DeletedConcurrently,
        Exception::TooShort,
        Exception::Stale,
        Exception::Incomplete,
        Exception::Boring,
        Exception::Other,
    ];

    fn arb_report() -> impl Strategy<Value = WorkerReport> {
        (
            0u64..50,
            prop::collection::vec((0usize..6, 1u64..10), 0..8),
            prop::collection::vec((0usize..3, 1u64..10), 0..5),
        )
            .prop_map(|(analyzed, exceptions, votes)| {
                let mut report = WorkerReport {
                    analyzed,
                    ..Default::default()
                };
                for (i, n) in exceptions {
                    *report.exceptions.entry(EXCEPTIONS[i]).or_default() += n;
                }
                for (i, n) in votes {
                    *report
                        .anomaly_breakdown
                        .entry(["a", "b", "c"][i].to_string())
                        .or_default() += n;
                }
                report
            })
    }

    proptest! {
        #[test]
        fn prop_merge_is_order_independent(
            reports in prop::collection::vec(arb_report(), 0..6),
            seed in any::<u64>(),
        ) {
            let mut forward = WorkerReport::default();
            for r in reports.iter().cloned() {
                forward.merge(r);
            }

            // Deterministic shuffle driven by the seed
            let mut shuffled = reports.clone();
            let mut state = seed;
            for i in (1..shuffled.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                shuffled.swap(i, (state >> 33) as usize % (i + 1));
            }
            let mut other = WorkerReport::default();
            for r in shuffled {
                other.merge(r);
            }

            prop_assert_eq!(forward.analyzed, other.analyzed);
            prop_assert_eq!(&forward.exceptions, &other.exceptions);
            prop_assert_eq!(&forward.anomaly_breakdown, &other.anomaly_breakdown);
        }
    }
}
