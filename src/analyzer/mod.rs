//! Partitioned analyzer
//!
//! Every cycle the analyzer lists the full namespace, spawns one task per
//! configured worker, and lets each worker claim a contiguous slice of the
//! metric universe through the membership registry. Workers judge their
//! series with an [`Ensemble`] and hand back a [`WorkerReport`]; the parent
//! merges the reports, sends alerts and reports timings.

mod alert;
mod anomaly;
mod canary;
mod ensemble;
mod report;

pub use alert::{AlertDispatcher, AlertRule, DispatchError, LogDispatcher, send_alerts};
pub use anomaly::{Anomaly, AnomalyError, collect_anomalies, publish_anomalies};
pub use canary::{Projection, project};
pub use ensemble::{
    Ensemble, EvaluationError, StatisticalEnsemble, Verdict, Vote, median_absolute_deviation,
    stddev_from_average, stddev_from_moving_average, tail_avg,
};
pub use report::{Exception, WorkerReport};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clock::unix_now;
use crate::config::AnalyzerConfig;
use crate::constants::analyzer::{IDLE_SLEEP, MIN_CYCLE};
use crate::constants::ring::REBUILD_BACKOFF;
use crate::liveness::{Liveness, LivenessError};
use crate::metrics::{GraphiteSink, Metric};
use crate::partition::Membership;
use crate::ring::{Ring, RingError, RingFactory};
use crate::series::decode_series;
use crate::types::{KeyPrefix, Namespace, WorkerIndex};

/// Outcome of one analysis cycle
#[derive(Debug, Clone)]
pub struct CycleSummary {
    /// Series listed in the full namespace
    pub universe: usize,
    pub report: WorkerReport,
    pub alerts_sent: usize,
    pub elapsed: Duration,
    pub projection: Option<Projection>,
}

/// The analyzer service
#[derive(Debug)]
pub struct Analyzer {
    config: AnalyzerConfig,
    full: Namespace,
    prefix: KeyPrefix,
    hostname: String,
    factory: RingFactory,
    ensemble: Arc<dyn Ensemble>,
    dispatcher: Arc<dyn AlertDispatcher>,
    graphite: GraphiteSink,
}

/// What every worker of one cycle shares
#[derive(Debug)]
struct CycleContext {
    ring: Arc<Ring>,
    universe: Vec<String>,
    full: Namespace,
    membership: Membership,
    ensemble: Arc<dyn Ensemble>,
    /// `<prefix>.analyzer.<host>`, suffixed with the worker index
    process_base: String,
    anomalies_key: String,
}

impl Analyzer {
    /// Analyzer with the statistical ensemble and log-only alerts
    #[must_use]
    pub fn new(
        config: AnalyzerConfig,
        full: Namespace,
        prefix: KeyPrefix,
        hostname: impl Into<String>,
        factory: RingFactory,
        graphite: GraphiteSink,
    ) -> Self {
        let ensemble = Arc::new(StatisticalEnsemble::new(config.ensemble.clone()));
        Self {
            config,
            full,
            prefix,
            hostname: hostname.into(),
            factory,
            ensemble,
            dispatcher: Arc::new(LogDispatcher),
            graphite,
        }
    }

    #[must_use]
    pub fn with_ensemble(mut self, ensemble: Arc<dyn Ensemble>) -> Self {
        self.ensemble = ensemble;
        self
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn AlertDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Run cycles until stopped
    pub async fn run(&self, liveness: Liveness) -> LivenessError {
        info!(
            "Analyzer starting on {} with {} workers",
            self.hostname, self.config.processes
        );
        let mut ring = match self.factory.build_until_ready(&liveness).await {
            Ok(ring) => Arc::new(ring),
            Err(e) => return e,
        };

        loop {
            if let Err(e) = liveness.check() {
                return e;
            }

            if let Err(e) = ring.check_connections().await {
                warn!("Ring check failed: {}, rebuilding in {:?}", e, REBUILD_BACKOFF);
                if let Err(e) = liveness.sleep(REBUILD_BACKOFF).await {
                    return e;
                }
                match self.factory.build_until_ready(&liveness).await {
                    Ok(fresh) => ring = Arc::new(fresh),
                    Err(e) => return e,
                }
                continue;
            }

            let pause = match self.run_cycle(&ring, &liveness).await {
                Ok(Some(summary)) => {
                    self.emit(&summary).await;
                    summary.elapsed < MIN_CYCLE
                }
                Ok(None) => {
                    info!("No metrics to analyze");
                    true
                }
                Err(e) => {
                    error!("Analysis cycle failed: {}", e);
                    true
                }
            };
            if pause && let Err(e) = liveness.sleep(IDLE_SLEEP).await {
                return e;
            }
        }
    }

    /// Analyze the whole universe once
    ///
    /// Returns `None` when the full namespace lists no series.
    pub async fn run_cycle(
        &self,
        ring: &Arc<Ring>,
        liveness: &Liveness,
    ) -> Result<Option<CycleSummary>, RingError> {
        let started = Instant::now();

        let mut universe = ring.smembers(&self.full.unique_metrics_key()).await?;
        if universe.is_empty() {
            return Ok(None);
        }
        universe.sort();

        let workers = self.config.processes.get().min(universe.len());
        let context = Arc::new(CycleContext {
            ring: ring.clone(),
            universe,
            full: self.full.clone(),
            membership: Membership::new(self.config.processes_key.as_str(), self.config.processes),
            ensemble: self.ensemble.clone(),
            process_base: self.prefix.join(&["analyzer", &self.hostname]),
            anomalies_key: self.config.anomalies_key.clone(),
        });

        let mut tasks = JoinSet::new();
        for index in (1..=workers).filter_map(WorkerIndex::new) {
            tasks.spawn(analyze_partition(context.clone(), index, liveness.clone()));
        }
        let mut report = WorkerReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(partial) => report.merge(partial),
                Err(e) => error!("Analyzer worker panicked: {}", e),
            }
        }
        report.anomalies.sort_by(|a, b| a.metric.cmp(&b.metric));

        let alerts_sent = if self.config.enable_alerts && !report.anomalies.is_empty() {
            send_alerts(
                ring,
                &self.config.alerts,
                &report.anomalies,
                self.dispatcher.as_ref(),
            )
            .await
        } else {
            0
        };

        let elapsed = started.elapsed();
        let projection = self.canary_projection(ring, elapsed).await;

        Ok(Some(CycleSummary {
            universe: context.universe.len(),
            report,
            alerts_sent,
            elapsed,
            projection,
        }))
    }

    async fn canary_projection(&self, ring: &Ring, elapsed: Duration) -> Option<Projection> {
        let key = self.full.series_key(&self.config.canary_metric);
        let raw = match ring.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                debug!("Canary {} unavailable: {}", key, e);
                return None;
            }
        };
        match decode_series(&raw) {
            Ok(series) => project(&series, elapsed),
            Err(e) => {
                warn!("Canary {} is undecodable: {}", key, e);
                None
            }
        }
    }

    /// Log a cycle and forward its numbers to Graphite
    async fn emit(&self, summary: &CycleSummary) {
        let report = &summary.report;
        info!(
            "Analyzed {} of {} metrics in {:.2}s: {} anomalies, {} exceptions, {} alerts",
            report.analyzed,
            summary.universe,
            summary.elapsed.as_secs_f64(),
            report.anomalies.len(),
            report.total_exceptions(),
            summary.alerts_sent
        );
        for (exception, count) in &report.exceptions {
            info!("  {}: {}", exception, count);
        }
        for (detector, count) in &report.anomaly_breakdown {
            info!("  {} flagged {}", detector, count);
        }

        let now = unix_now();
        let mut metrics = vec![
            Metric::new(
                self.graphite.name(&["analyzer", "run_time"]),
                summary.elapsed.as_secs_f64(),
                now,
            ),
            Metric::new(
                self.graphite.name(&["analyzer", "total_analyzed"]),
                report.analyzed as f64,
                now,
            ),
            Metric::new(
                self.graphite.name(&["analyzer", "total_anomalies"]),
                report.anomalies.len() as f64,
                now,
            ),
        ];
        if let Some(projection) = summary.projection {
            info!(
                "Canary spans {:.2}h, a full day would take {:.2}s",
                projection.span_hours, projection.projected
            );
            metrics.push(Metric::new(
                self.graphite.name(&["analyzer", "duration"]),
                projection.span_hours,
                now,
            ));
            metrics.push(Metric::new(
                self.graphite.name(&["analyzer", "projected"]),
                projection.projected,
                now,
            ));
        }
        self.graphite.emit(&metrics).await;
    }
}

/// One worker's share of a cycle
///
/// Failures are logged and end the worker early with whatever it has.
async fn analyze_partition(
    context: Arc<CycleContext>,
    index: WorkerIndex,
    liveness: Liveness,
) -> WorkerReport {
    let mut report = WorkerReport::default();
    let ring = context.ring.as_ref();
    let alive_key = format!("{}.{}.alive", context.process_base, index);

    let assignment = match context.membership.register(ring, &alive_key).await {
        Ok(Some(assignment)) => assignment,
        Ok(None) => {
            warn!("Worker {} lost its registration, skipping this cycle", index);
            return report;
        }
        Err(e) => {
            error!("Worker {} could not register: {}", index, e);
            return report;
        }
    };
    let keys = &context.universe[assignment.range(context.universe.len())];
    debug!(
        "Worker {} is {} of {} with {} metrics",
        index,
        assignment.position,
        assignment.count,
        keys.len()
    );
    if keys.is_empty() {
        return report;
    }

    let values = match ring.mget(keys).await {
        Ok(values) => values,
        Err(e) => {
            error!("Worker {} could not fetch its metrics: {}", index, e);
            return report;
        }
    };

    let now = unix_now();
    for (key, raw) in keys.iter().zip(values) {
        if let Err(e) = liveness.check() {
            warn!("Worker {} stopping early: {}", index, e);
            break;
        }
        let Some(raw) = raw else {
            report.record_exception(Exception::DeletedConcurrently);
            continue;
        };
        let mut series = match decode_series(&raw) {
            Ok(series) => series,
            Err(e) => {
                debug!("Undecodable series {}: {}", key, e);
                report.record_exception(Exception::Other);
                continue;
            }
        };
        series.sort_by_key(|dp| dp.timestamp);

        let metric = context.full.metric_name(key);
        match context.ensemble.evaluate(&series, metric, now) {
            Ok(verdict) => report.record_verdict(metric, &verdict),
            Err(e) => report.record_exception(Exception::from(&e)),
        }
    }

    if !report.anomalies.is_empty() {
        let process_key = format!("{}.{}", context.process_base, index);
        if let Err(e) = publish_anomalies(
            ring,
            &process_key,
            &context.anomalies_key,
            &report.anomalies,
        )
        .await
        {
            error!("Worker {} could not publish anomalies: {}", index, e);
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnsembleConfig, NamespaceConfig};
    use crate::liveness::Shutdown;
    use crate::series::{Datapoint, encode_series};
    use crate::store::{BackendDescriptor, MemoryConnector};
    use crate::types::{MaxFailures, WorkerCount};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait::async_trait]
    impl AlertDispatcher for Recorder {
        async fn dispatch(&self, _rule: &AlertRule, anomaly: &Anomaly) -> Result<(), DispatchError> {
            self.0.lock().unwrap().push(anomaly.metric.clone());
            Ok(())
        }
    }

    fn factory(connector: &MemoryConnector) -> RingFactory {
        RingFactory::new(
            vec![
                BackendDescriptor::memory("an1"),
                BackendDescriptor::memory("an2"),
            ],
            Arc::new(connector.clone()),
            MaxFailures::DEFAULT,
        )
    }

    fn analyzer(connector: &MemoryConnector, processes: usize) -> Analyzer {
        let config = AnalyzerConfig {
            processes: WorkerCount::new(processes).unwrap(),
            ensemble: EnsembleConfig::default(),
            enable_alerts: true,
            alerts: vec![AlertRule::new("spiky", "ops", Duration::from_secs(300))],
            ..Default::default()
        };
        Analyzer::new(
            config,
            NamespaceConfig::default().full,
            KeyPrefix::new("dw".to_string()).unwrap(),
            "testhost",
            factory(connector),
            GraphiteSink::new(None, KeyPrefix::new("dw".to_string()).unwrap()),
        )
    }

    /// A point a minute for 100 minutes ending now
    fn steady(now: i64, last: f64) -> Vec<Datapoint> {
        (0..100)
            .map(|i| {
                let value = if i == 99 {
                    last
                } else {
                    10.0 + [0.0, 0.5, -0.5, 0.25, -0.25][i % 5]
                };
                Datapoint::new(now - 60 * (99 - i as i64), value)
            })
            .collect()
    }

    async fn store_series(ring: &Ring, full: &Namespace, metric: &str, raw: &[u8]) {
        let key = full.series_key(metric);
        ring.set(&key, raw).await.unwrap();
        ring.sadd(&full.unique_metrics_key(), &key).await.unwrap();
    }

    #[tokio::test]
    async fn test_cycle_finds_spike_and_buckets_exceptions() {
        let connector = MemoryConnector::new();
        let analyzer = analyzer(&connector, 2);
        let ring = Arc::new(analyzer.factory.build().await.unwrap());
        let full = analyzer.full.clone();
        let now = unix_now();

        for metric in ["calm.a", "calm.b", "calm.c"] {
            store_series(&ring, &full, metric, &encode_series(&steady(now, 9.75)).unwrap()).await;
        }
        store_series(&ring, &full, "spiky", &encode_series(&steady(now, 500.0)).unwrap()).await;
        store_series(&ring, &full, "short", &encode_series(&steady(now, 1.0)[95..]).unwrap()).await;
        store_series(&ring, &full, "garbage", b"\xc1\xc1").await;
        // Listed but already gone
        ring.sadd(&full.unique_metrics_key(), &full.series_key("gone"))
            .await
            .unwrap();

        let shutdown = Shutdown::new();
        let summary = analyzer
            .run_cycle(&ring, &shutdown.liveness(None))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.universe, 7);
        assert_eq!(summary.report.analyzed, 4);
        assert_eq!(
            summary.report.anomalies,
            vec![Anomaly::new(Datapoint::new(now, 500.0), "spiky")]
        );
        let exceptions = &summary.report.exceptions;
        assert_eq!(exceptions.get(&Exception::TooShort), Some(&1));
        assert_eq!(exceptions.get(&Exception::Other), Some(&1));
        assert_eq!(exceptions.get(&Exception::DeletedConcurrently), Some(&1));
        assert_eq!(summary.alerts_sent, 1);
        assert!(summary.projection.is_none());

        let collected = collect_anomalies(&ring, "analyzer.anomalies").await.unwrap();
        assert_eq!(collected, summary.report.anomalies);
    }

    #[tokio::test]
    async fn test_empty_universe() {
        let connector = MemoryConnector::new();
        let analyzer = analyzer(&connector, 3);
        let ring = Arc::new(analyzer.factory.build().await.unwrap());
        let summary = analyzer
            .run_cycle(&ring, &Shutdown::new().liveness(None))
            .await
            .unwrap();
        assert!(summary.is_none());
    }

    #[tokio::test]
    async fn test_alert_cooldown_across_cycles() {
        let connector = MemoryConnector::new();
        let recorder = Arc::new(Recorder::default());
        let analyzer = analyzer(&connector, 1).with_dispatcher(recorder.clone());
        let ring = Arc::new(analyzer.factory.build().await.unwrap());
        let full = analyzer.full.clone();
        let now = unix_now();
        store_series(&ring, &full, "spiky", &encode_series(&steady(now, 500.0)).unwrap()).await;

        let liveness = Shutdown::new().liveness(None);
        let first = analyzer.run_cycle(&ring, &liveness).await.unwrap().unwrap();
        let second = analyzer.run_cycle(&ring, &liveness).await.unwrap().unwrap();

        assert_eq!(first.alerts_sent, 1);
        assert_eq!(second.report.anomalies.len(), 1);
        assert_eq!(second.alerts_sent, 0);
        assert_eq!(*recorder.0.lock().unwrap(), vec!["spiky".to_string()]);
    }

    #[tokio::test]
    async fn test_canary_projection() {
        let connector = MemoryConnector::new();
        let analyzer = analyzer(&connector, 1);
        let ring = Arc::new(analyzer.factory.build().await.unwrap());
        let full = analyzer.full.clone();
        let now = unix_now();
        // The canary is a regular steady series spanning 99 minutes
        store_series(
            &ring,
            &full,
            &analyzer.config.canary_metric,
            &encode_series(&steady(now, 9.75)).unwrap(),
        )
        .await;

        let summary = analyzer
            .run_cycle(&ring, &Shutdown::new().liveness(None))
            .await
            .unwrap()
            .unwrap();
        let projection = summary.projection.unwrap();
        assert!((projection.span_hours - 99.0 / 60.0).abs() < 1e-9);
        assert!(projection.projected >= 0.0);
    }

    #[tokio::test]
    async fn test_stopped_workers_return_partial_reports() {
        let connector = MemoryConnector::new();
        let analyzer = analyzer(&connector, 2);
        let ring = Arc::new(analyzer.factory.build().await.unwrap());
        let full = analyzer.full.clone();
        let now = unix_now();
        for metric in ["a", "b", "c", "d"] {
            store_series(&ring, &full, metric, &encode_series(&steady(now, 9.75)).unwrap()).await;
        }

        let shutdown = Shutdown::new();
        let liveness = shutdown.liveness(None);
        shutdown.trigger();
        let summary = analyzer.run_cycle(&ring, &liveness).await.unwrap().unwrap();
        assert_eq!(summary.report.analyzed, 0);
        assert_eq!(summary.report.total_exceptions(), 0);
    }
}
