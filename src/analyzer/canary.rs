use std::time::Duration;

use crate::series::Datapoint;

/// Projected cost of scanning a full day of data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Hours covered by the canary series
    pub span_hours: f64,
    /// Seconds a cycle would take if every series covered a full day
    pub projected: f64,
}

/// Project cycle time from the canary series and this cycle's run time
///
/// `24 * elapsed / span_hours`. `None` when the canary covers no time.
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use driftwatch::analyzer::project;
/// use driftwatch::series::Datapoint;
///
/// let canary = [Datapoint::new(0, 1.0), Datapoint::new(6 * 3600, 1.0)];
/// let p = project(&canary, Duration::from_secs(3)).unwrap();
/// assert_eq!(p.span_hours, 6.0);
/// assert_eq!(p.projected, 12.0);
/// ```
#[must_use]
pub fn project(canary: &[Datapoint], elapsed: Duration) -> Option<Projection> {
    let first = canary.iter().map(|dp| dp.timestamp).min()?;
    let last = canary.iter().map(|dp| dp.timestamp).max()?;
    let span_hours = (last - first) as f64 / 3600.0;
    if span_hours <= 0.0 {
        return None;
    }
    Some(Projection {
        span_hours,
        projected: 24.0 * elapsed.as_secs_f64() / span_hours,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_span_has_no_projection() {
        assert!(project(&[], Duration::from_secs(1)).is_none());
        assert!(project(&[Datapoint::new(5, 1.0)], Duration::from_secs(1)).is_none());
        assert!(
            project(
                &[Datapoint::new(5, 1.0), Datapoint::new(5, 2.0)],
                Duration::from_secs(1)
            )
            .is_none()
        );
    }

    #[test]
    fn test_unsorted_canary() {
        let canary = [
            Datapoint::new(7200, 1.0),
            Datapoint::new(0, 1.0),
            Datapoint::new(3600, 1.0),
        ];
        let p = project(&canary, Duration::from_millis(500)).unwrap();
        assert_eq!(p.span_hours, 2.0);
        assert_eq!(p.projected, 6.0);
    }
}
