//! Anomaly-detection ensemble
//!
//! An [`Ensemble`] judges one decoded series. It either returns a
//! [`Verdict`] carrying every detector's vote, or refuses the series with an
//! [`EvaluationError`] that the analyzer files into its exception buckets.

use thiserror::Error;

use crate::config::EnsembleConfig;
use crate::series::Datapoint;

/// Why a series was not judged
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error("series too short")]
    TooShort,

    #[error("series is stale")]
    Stale,

    #[error("series does not cover enough time")]
    Incomplete,

    #[error("series is boring")]
    Boring,

    #[error("{0}")]
    Other(String),
}

/// One detector's opinion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vote {
    pub detector: &'static str,
    pub anomalous: bool,
}

/// Outcome of judging one series
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub anomalous: bool,
    pub votes: Vec<Vote>,
    /// The point the verdict is about, normally the newest
    pub datapoint: Datapoint,
}

impl Verdict {
    /// Detectors that voted anomalous
    pub fn accusers(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.votes.iter().filter(|v| v.anomalous).map(|v| v.detector)
    }
}

/// A pluggable anomaly detector set
pub trait Ensemble: Send + Sync + std::fmt::Debug {
    /// Judge `series` (sorted by timestamp) of `metric` at unix time `now`
    fn evaluate(&self, series: &[Datapoint], metric: &str, now: i64)
    -> Result<Verdict, EvaluationError>;
}

/// Standard deviations a value must stray to be anomalous
const SIGMA: f64 = 3.0;

/// Center of mass of the exponentially weighted moving average
const EWMA_COM: f64 = 50.0;

/// Median absolute deviations a value must stray to be anomalous
const MAD_THRESHOLD: f64 = 6.0;

/// Mean of the last three values, smoothing single-point spikes
#[must_use]
pub fn tail_avg(values: &[f64]) -> f64 {
    let tail = &values[values.len().saturating_sub(3)..];
    if tail.is_empty() {
        return 0.0;
    }
    tail.iter().sum::<f64>() / tail.len() as f64
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Tail average more than three standard deviations from the series mean
#[must_use]
pub fn stddev_from_average(values: &[f64]) -> bool {
    if values.len() < 2 {
        return false;
    }
    let (mean, std) = mean_and_std(values);
    (tail_avg(values) - mean).abs() > SIGMA * std
}

/// Newest value more than three moving standard deviations from the
/// exponentially weighted moving average
#[must_use]
pub fn stddev_from_moving_average(values: &[f64]) -> bool {
    let Some((&first, rest)) = values.split_first() else {
        return false;
    };
    let alpha = 1.0 / (1.0 + EWMA_COM);
    let (mut avg, mut var) = (first, 0.0);
    for &x in rest {
        let diff = x - avg;
        let incr = alpha * diff;
        avg += incr;
        var = (1.0 - alpha) * (var + diff * incr);
    }
    let last = values[values.len() - 1];
    (last - avg).abs() > SIGMA * var.sqrt()
}

/// Newest value's deviation from the median, in median absolute
/// deviations, exceeds six
#[must_use]
pub fn median_absolute_deviation(values: &[f64]) -> bool {
    if values.len() < 2 {
        return false;
    }
    let center = median(&mut values.to_vec());
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    let last = deviations[deviations.len() - 1];
    let mad = median(&mut deviations);
    mad != 0.0 && last / mad > MAD_THRESHOLD
}

type Detector = fn(&[f64]) -> bool;

const DETECTORS: [(&str, Detector); 3] = [
    ("stddev_from_average", stddev_from_average),
    ("stddev_from_moving_average", stddev_from_moving_average),
    ("median_absolute_deviation", median_absolute_deviation),
];

/// Default ensemble: guard rules followed by three statistical detectors
#[derive(Debug, Clone)]
pub struct StatisticalEnsemble {
    config: EnsembleConfig,
}

impl StatisticalEnsemble {
    #[must_use]
    pub fn new(config: EnsembleConfig) -> Self {
        Self { config }
    }

    /// Names of the detectors, in vote order
    pub fn detector_names() -> impl Iterator<Item = &'static str> {
        DETECTORS.iter().map(|(name, _)| *name)
    }

    fn check_guards(&self, series: &[Datapoint], now: i64) -> Result<(), EvaluationError> {
        let (Some(first), Some(last)) = (series.first(), series.last()) else {
            return Err(EvaluationError::TooShort);
        };
        if series.len() < self.config.min_points {
            return Err(EvaluationError::TooShort);
        }
        let secs = |d: std::time::Duration| i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_sub(last.timestamp) > secs(self.config.stale_period) {
            return Err(EvaluationError::Stale);
        }
        if last.timestamp.saturating_sub(first.timestamp) < secs(self.config.min_span) {
            return Err(EvaluationError::Incomplete);
        }

        let window = &series[series.len().saturating_sub(self.config.boredom_window)..];
        let mut distinct: Vec<u64> = window.iter().map(|dp| dp.value.to_bits()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() <= self.config.boredom_set_size {
            return Err(EvaluationError::Boring);
        }
        Ok(())
    }
}

impl Ensemble for StatisticalEnsemble {
    fn evaluate(
        &self,
        series: &[Datapoint],
        metric: &str,
        now: i64,
    ) -> Result<Verdict, EvaluationError> {
        self.check_guards(series, now)?;

        let values: Vec<f64> = series.iter().map(|dp| dp.value).collect();
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(EvaluationError::Other(format!(
                "{metric} holds non-finite value {bad}"
            )));
        }

        let votes: Vec<Vote> = DETECTORS
            .iter()
            .map(|&(detector, check)| Vote {
                detector,
                anomalous: check(&values),
            })
            .collect();
        let agreeing = votes.iter().filter(|v| v.anomalous).count();

        Ok(Verdict {
            anomalous: agreeing >= self.config.consensus,
            votes,
            datapoint: *series.last().ok_or(EvaluationError::TooShort)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000;

    fn config() -> EnsembleConfig {
        EnsembleConfig {
            consensus: 2,
            min_points: 10,
            min_span: Duration::from_secs(600),
            stale_period: Duration::from_secs(500),
            boredom_window: 100,
            boredom_set_size: 1,
        }
    }

    /// One point a minute ending at NOW, values from `f`
    fn series(len: usize, f: impl Fn(usize) -> f64) -> Vec<Datapoint> {
        (0..len)
            .map(|i| Datapoint::new(NOW - 60 * (len - 1 - i) as i64, f(i)))
            .collect()
    }

    /// Gentle oscillation around 10
    fn wobble(i: usize) -> f64 {
        10.0 + [0.0, 0.5, -0.5, 0.25, -0.25][i % 5]
    }

    #[test]
    fn test_tail_avg() {
        assert_eq!(tail_avg(&[1.0, 2.0, 3.0, 4.0]), 3.0);
        assert_eq!(tail_avg(&[5.0]), 5.0);
        assert_eq!(tail_avg(&[]), 0.0);
    }

    #[test]
    fn test_detectors_quiet_on_steady_series() {
        let values: Vec<f64> = (0..100).map(wobble).collect();
        assert!(!stddev_from_average(&values));
        assert!(!stddev_from_moving_average(&values));
        assert!(!median_absolute_deviation(&values));
    }

    #[test]
    fn test_detectors_fire_on_spike() {
        let mut values: Vec<f64> = (0..100).map(wobble).collect();
        values.push(500.0);
        assert!(stddev_from_moving_average(&values));
        assert!(median_absolute_deviation(&values));
        // Three-point tail average still clears three sigma
        values.extend([500.0, 500.0]);
        assert!(stddev_from_average(&values));
    }

    #[test]
    fn test_mad_with_zero_spread_is_quiet() {
        assert!(!median_absolute_deviation(&[1.0, 1.0, 1.0, 1.0, 9.0]));
    }

    #[test]
    fn test_guard_too_short() {
        let ensemble = StatisticalEnsemble::new(config());
        assert_eq!(
            ensemble.evaluate(&series(5, wobble), "m", NOW),
            Err(EvaluationError::TooShort)
        );
        assert_eq!(ensemble.evaluate(&[], "m", NOW), Err(EvaluationError::TooShort));
    }

    #[test]
    fn test_guards_tolerate_extreme_timestamps() {
        let ensemble = StatisticalEnsemble::new(config());

        let ancient: Vec<Datapoint> = (0..10)
            .map(|i| Datapoint::new(i64::MIN + i, wobble(i as usize)))
            .collect();
        assert_eq!(ensemble.evaluate(&ancient, "m", NOW), Err(EvaluationError::Stale));

        let mut torn = series(20, wobble);
        torn[0].timestamp = i64::MIN;
        let verdict = ensemble.evaluate(&torn, "m", NOW);
        assert_ne!(verdict, Err(EvaluationError::Stale));
        assert_ne!(verdict, Err(EvaluationError::Incomplete));
    }

    #[test]
    fn test_guard_stale() {
        let ensemble = StatisticalEnsemble::new(config());
        assert_eq!(
            ensemble.evaluate(&series(50, wobble), "m", NOW + 501),
            Err(EvaluationError::Stale)
        );
    }

    #[test]
    fn test_guard_incomplete() {
        let ensemble = StatisticalEnsemble::new(config());
        // 10 points a minute apart span 540 seconds
        assert_eq!(
            ensemble.evaluate(&series(10, wobble), "m", NOW),
            Err(EvaluationError::Incomplete)
        );
    }

    #[test]
    fn test_guard_boring() {
        let ensemble = StatisticalEnsemble::new(config());
        assert_eq!(
            ensemble.evaluate(&series(50, |_| 3.0), "m", NOW),
            Err(EvaluationError::Boring)
        );
    }

    #[test]
    fn test_non_finite_is_other() {
        let ensemble = StatisticalEnsemble::new(config());
        let mut points = series(50, wobble);
        points[10].value = f64::NAN;
        assert!(matches!(
            ensemble.evaluate(&points, "m", NOW),
            Err(EvaluationError::Other(_))
        ));
    }

    #[test]
    fn test_verdict_on_spike() {
        let ensemble = StatisticalEnsemble::new(config());
        let points = series(100, |i| if i == 99 { 500.0 } else { wobble(i) });
        let verdict = ensemble.evaluate(&points, "m", NOW).unwrap();

        assert!(verdict.anomalous);
        assert_eq!(verdict.datapoint, Datapoint::new(NOW, 500.0));
        assert_eq!(verdict.votes.len(), 3);
        let accusers: Vec<_> = verdict.accusers().collect();
        assert!(accusers.contains(&"median_absolute_deviation"));
        assert!(accusers.contains(&"stddev_from_moving_average"));
    }

    #[test]
    fn test_verdict_on_steady_series() {
        let ensemble = StatisticalEnsemble::new(config());
        let verdict = ensemble.evaluate(&series(100, wobble), "m", NOW).unwrap();
        assert!(!verdict.anomalous);
        assert_eq!(verdict.accusers().count(), 0);
    }

    #[test]
    fn test_detector_names() {
        let names: Vec<_> = StatisticalEnsemble::detector_names().collect();
        assert_eq!(names.len(), 3);
        assert_eq!(names[0], "stddev_from_average");
    }
}
