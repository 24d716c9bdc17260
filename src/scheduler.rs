// Scheduler module - drives periodic collection and daily report compilation
//
// This module implements the core scheduling logic using Tokio tasks.
//
// # Architecture
// - A collection loop on a Tokio interval timer (default every 5 minutes)
// - A report loop sleeping until the next local report time (default midnight)
// - Every firing is spawned as its own task: a slow cycle never delays the
//   next one, and overlapping cycles are safe because the store only appends
// - Errors and panics end only the unit of work that raised them

use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::collectors::{CollectorError, InventoryCollector, MetricCollector, MetricsWindow};
use crate::config::{ConfigError, MonitorSettings};
use crate::report::{ReportCompiler, ReportSlot};

/// What one collection cycle wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub clusters: usize,
    pub services: usize,
    pub tasks: usize,
    pub points: usize,
}

/// Outcome of one report run over every cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportBatch {
    /// Published report directories
    pub compiled: Vec<PathBuf>,

    /// Clusters whose report failed
    pub failed: Vec<String>,
}

/// Runs `work` in its own task; a panic inside it is logged and contained
fn spawn_isolated<F>(unit: &'static str, work: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let inner = tokio::spawn(work);
    tokio::spawn(async move {
        if let Err(e) = inner.await {
            error!("{} task failed: {}", unit, e);
        }
    })
}

/// First instant strictly after `now` whose local wall-clock time is `at`
///
/// Days on which `at` does not exist locally (a DST gap) are skipped; an
/// ambiguous `at` resolves to its earlier occurrence.
pub fn next_daily_run<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut day = now.date_naive();

    for _ in 0..3 {
        if let Some(candidate) = tz.from_local_datetime(&day.and_time(at)).earliest() {
            if candidate > *now {
                return candidate;
            }
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    now.clone() + chrono::Duration::days(1)
}

/// Monitor scheduler owning the collectors and the report compiler
pub struct MonitorScheduler {
    settings: Arc<MonitorSettings>,
    inventory: Arc<InventoryCollector>,
    metrics: Arc<MetricCollector>,
    compiler: Arc<ReportCompiler>,
}

impl MonitorScheduler {
    /// Creates a new MonitorScheduler instance
    ///
    /// # Arguments
    /// * `settings` - Validated monitor settings
    /// * `inventory` - Cluster, service and task collector
    /// * `metrics` - Cluster metrics collector
    /// * `compiler` - Daily report compiler
    pub fn new(
        settings: MonitorSettings,
        inventory: InventoryCollector,
        metrics: MetricCollector,
        compiler: ReportCompiler,
    ) -> Self {
        MonitorScheduler {
            settings: Arc::new(settings),
            inventory: Arc::new(inventory),
            metrics: Arc::new(metrics),
            compiler: Arc::new(compiler),
        }
    }

    /// Starts both loops and runs until they stop
    ///
    /// # Returns
    /// * `Err(ConfigError)` - The report time could not be parsed
    /// * `Ok(())` - Both loops ended, which only happens if they panicked
    pub async fn start(self) -> Result<(), ConfigError> {
        let report_time = self.settings.report_time()?;

        info!(
            "Starting scheduler: collection every {}s, reports daily at {}",
            self.settings.collection_interval_secs, self.settings.report_time
        );

        let scheduler = Arc::new(self);
        let handles = [
            tokio::spawn(Self::run_collection_loop(Arc::clone(&scheduler))),
            tokio::spawn(Self::run_report_loop(Arc::clone(&scheduler), report_time)),
        ];

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Scheduler loop panicked: {}", e);
            }
        }

        error!("All scheduler loops have stopped");
        Ok(())
    }

    async fn run_collection_loop(self: Arc<Self>) {
        // tick() completes immediately the first time
        let mut timer = interval(self.settings.collection_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;

            let scheduler = Arc::clone(&self);
            spawn_isolated("Collection cycle", async move {
                match scheduler.run_collection_cycle().await {
                    Ok(summary) => info!(
                        "Collection cycle complete: {} cluster(s), {} service(s), {} task(s), {} point(s)",
                        summary.clusters, summary.services, summary.tasks, summary.points
                    ),
                    Err(e) => error!("Collection cycle failed: {}", e),
                }
            });
        }
    }

    async fn run_report_loop(self: Arc<Self>, at: NaiveTime) {
        let mut after = Local::now();

        loop {
            let next = next_daily_run(&after, at);
            info!("Next report run at {}", next.format("%Y-%m-%d %H:%M %Z"));

            let wait = next
                .signed_duration_since(Local::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            // Filed under the local day the run fired on
            let slot = ReportSlot::at(&next);
            let scheduler = Arc::clone(&self);
            spawn_isolated("Report run", async move {
                match scheduler.compile_all_reports(slot).await {
                    Ok(batch) => info!(
                        "Report run complete: {} compiled, {} failed",
                        batch.compiled.len(),
                        batch.failed.len()
                    ),
                    Err(e) => error!("Report run failed: {}", e),
                }
            });

            // Never fire twice for the same slot if the wall clock lags the timer
            after = std::cmp::max(Local::now(), next);
        }
    }

    /// Runs one collection cycle
    ///
    /// Inventory is collected and persisted first; then tasks and metrics are
    /// collected for each cluster, up to `metrics_concurrency` clusters at a
    /// time. The first failure aborts the rest of the cycle.
    pub async fn run_collection_cycle(&self) -> Result<CycleSummary, CollectorError> {
        let views = self.inventory.collect_inventory(true).await?;

        let mut summary = CycleSummary {
            clusters: views.len(),
            services: views.iter().map(|v| v.services.len()).sum(),
            ..CycleSummary::default()
        };

        if views.is_empty() {
            return Ok(summary);
        }

        let window = MetricsWindow::trailing(
            Utc::now(),
            self.settings.metrics_lookback(),
            self.settings.metrics_period(),
        );

        let inventory = Arc::clone(&self.inventory);
        let metrics = Arc::clone(&self.metrics);
        let per_cluster: Vec<(usize, usize)> = stream::iter(
            views.into_iter().map(|view| view.cluster.cluster_name),
        )
        .map(move |cluster| {
            let inventory = Arc::clone(&inventory);
            let metrics = Arc::clone(&metrics);
            async move {
                let tasks = inventory.collect_tasks(&cluster, true).await?;
                let result = metrics.collect_metrics(&cluster, &window, true).await?;
                Ok::<_, CollectorError>((tasks.len(), result.points_written))
            }
        })
        .buffer_unordered(self.settings.metrics_concurrency.max(1))
        .try_collect()
        .await?;

        for (tasks, points) in per_cluster {
            summary.tasks += tasks;
            summary.points += points;
        }

        Ok(summary)
    }

    /// Compiles the report of every cluster for `slot`
    ///
    /// Clusters are listed without persisting. A failed report is logged and
    /// the run moves on to the next cluster.
    pub async fn compile_all_reports(&self, slot: ReportSlot) -> Result<ReportBatch, CollectorError> {
        let views = self.inventory.collect_inventory(false).await?;
        info!("Generating reports for {} cluster(s)", views.len());

        let mut batch = ReportBatch::default();
        for view in &views {
            let cluster = &view.cluster.cluster_name;
            match self.compiler.compile_report(cluster, slot).await {
                Ok(dir) => batch.compiled.push(dir),
                Err(e) => {
                    error!("Failed to generate report for cluster '{}': {}", cluster, e);
                    batch.failed.push(cluster.clone());
                }
            }
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::metrics::series;
    use crate::storage::{MemoryStore, Store};
    use crate::testing::{service, task, FakeInventory, FakeMetrics, RecordingRenderer, RendererBehavior};
    use chrono::{Duration as ChronoDuration, FixedOffset, Timelike};
    use std::path::Path;

    fn scheduler(
        inventory: FakeInventory,
        metrics: impl Into<Arc<FakeMetrics>>,
        renderer: RendererBehavior,
        store: Arc<MemoryStore>,
        reports_dir: &Path,
    ) -> MonitorScheduler {
        let settings = MonitorSettings {
            reports_dir: reports_dir.to_path_buf(),
            metrics_concurrency: 2,
            ..MonitorSettings::default()
        };
        let timeout = Duration::from_secs(5);
        let metrics: Arc<FakeMetrics> = metrics.into();

        MonitorScheduler::new(
            settings,
            InventoryCollector::new(Arc::new(inventory), store.clone(), timeout),
            MetricCollector::new(metrics, store.clone(), timeout),
            ReportCompiler::new(
                store,
                Arc::new(RecordingRenderer::new(renderer)),
                reports_dir.to_path_buf(),
                7,
                timeout,
            ),
        )
    }

    fn fleet() -> (FakeInventory, FakeMetrics) {
        let recent = Utc::now() - ChronoDuration::minutes(30);
        let inventory = FakeInventory::default()
            .with_cluster("prod", vec![service("api"), service("worker")])
            .with_cluster("staging", vec![service("api")])
            .with_tasks("prod", vec![task("arn:task/1", Some(recent))]);
        let metrics = FakeMetrics::default()
            .with_series("prod", series::CPU_UTILIZATION, recent, &[20.0, 25.0])
            .with_series("staging", series::CPU_UTILIZATION, recent, &[5.0]);
        (inventory, metrics)
    }

    #[tokio::test]
    async fn test_zero_clusters_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(FakeMetrics::default());
        let scheduler = scheduler(
            FakeInventory::default(),
            metrics.clone(),
            RendererBehavior::Succeed,
            store.clone(),
            dir.path(),
        );

        let summary = scheduler.run_collection_cycle().await.unwrap();

        assert_eq!(summary, CycleSummary::default());
        assert_eq!(store.row_counts().total(), 0);
        assert!(metrics.requested().is_empty());
    }

    #[tokio::test]
    async fn test_collection_cycle_covers_every_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (inventory, metrics) = fleet();
        let metrics = Arc::new(metrics);
        let scheduler = scheduler(inventory, metrics.clone(), RendererBehavior::Succeed, store.clone(), dir.path());

        let summary = scheduler.run_collection_cycle().await.unwrap();

        // One metrics request per cluster; order varies with buffer_unordered
        let mut requested = metrics.requested();
        requested.sort();
        assert_eq!(requested, vec!["prod".to_string(), "staging".to_string()]);

        assert_eq!(
            summary,
            CycleSummary {
                clusters: 2,
                services: 3,
                tasks: 1,
                points: 3
            }
        );
        let counts = store.row_counts();
        assert_eq!(counts.services, 3);
        assert_eq!(counts.tasks, 1);
        assert_eq!(counts.metrics, 3);
    }

    #[tokio::test]
    async fn test_metric_failure_fails_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (inventory, metrics) = fleet();
        let scheduler = scheduler(
            inventory,
            metrics.failing_on("staging"),
            RendererBehavior::Succeed,
            store,
            dir.path(),
        );

        let result = scheduler.run_collection_cycle().await;
        assert!(matches!(result, Err(CollectorError::Api(_))));
    }

    #[tokio::test]
    async fn test_overlapping_cycles_both_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (inventory, metrics) = fleet();
        let scheduler = scheduler(inventory, metrics, RendererBehavior::Succeed, store.clone(), dir.path());

        let (first, second) = tokio::join!(
            scheduler.run_collection_cycle(),
            scheduler.run_collection_cycle()
        );

        assert!(first.is_ok() && second.is_ok());
        let counts = store.row_counts();
        assert_eq!(counts.services, 6);
        assert_eq!(counts.metrics, 6);
    }

    #[tokio::test]
    async fn test_failed_report_does_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let inventory = FakeInventory::default()
            .with_cluster("alpha", vec![service("api")])
            .with_cluster("broken", vec![service("api")])
            .with_cluster("zeta", vec![service("api")]);
        let scheduler = scheduler(
            inventory,
            FakeMetrics::default(),
            RendererBehavior::FailFor("/.broken.staging".to_string()),
            store.clone(),
            dir.path(),
        );
        let slot = ReportSlot::at(&Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap());

        let batch = scheduler.compile_all_reports(slot).await.unwrap();

        assert_eq!(batch.compiled.len(), 2);
        assert_eq!(batch.failed, vec!["broken".to_string()]);

        let mut published: Vec<String> = std::fs::read_dir(dir.path().join("2024-03-10"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        published.sort();
        assert_eq!(published, vec!["alpha".to_string(), "zeta".to_string()]);

        let day = slot.date;
        assert!(store.report_for(day, "broken").await.unwrap().is_none());
        assert!(store.report_for(day, "zeta").await.unwrap().is_some());
        // Report runs read inventory without recording it
        assert_eq!(store.row_counts().services, 0);
    }

    #[tokio::test]
    async fn test_repeated_ticks_list_each_task_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (inventory, metrics) = fleet();
        let scheduler = scheduler(inventory, metrics, RendererBehavior::Succeed, store.clone(), dir.path());

        for _ in 0..3 {
            scheduler.run_collection_cycle().await.unwrap();
        }
        assert_eq!(store.row_counts().tasks, 3);

        let data = scheduler
            .compiler
            .gather("prod", ReportSlot::at(&Utc::now()))
            .await
            .unwrap();

        assert_eq!(data.tasks.len(), 1);
        assert_eq!(data.tasks[0].task_arn, "arn:task/1");
    }

    #[tokio::test]
    async fn test_spawn_isolated_contains_panics() {
        let handle = spawn_isolated("Exploding", async {
            panic!("boom");
        });
        assert!(handle.await.is_ok());
    }

    #[test]
    fn test_next_daily_run() {
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();

        let morning = Utc.with_ymd_and_hms(2024, 3, 10, 9, 30, 0).unwrap();
        assert_eq!(
            next_daily_run(&morning, noon),
            Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
        );
        assert_eq!(
            next_daily_run(&morning, midnight),
            Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()
        );

        // Exactly on the slot schedules the next day
        let on_slot = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap();
        assert_eq!(
            next_daily_run(&on_slot, midnight),
            Utc.with_ymd_and_hms(2024, 3, 12, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_daily_run_uses_local_wall_clock() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 3, 10, 23, 0, 0).unwrap();
        let next = next_daily_run(&now, NaiveTime::from_hms_opt(0, 0, 0).unwrap());

        assert_eq!(next, tz.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap());
        assert_eq!(next.with_timezone(&Utc).hour(), 22);
    }

    #[test]
    fn test_midnight_run_east_of_utc_is_filed_under_local_day() {
        let tz = FixedOffset::east_opt(9 * 3600).unwrap();
        let evening = tz.with_ymd_and_hms(2024, 10, 18, 21, 30, 0).unwrap();

        let next = next_daily_run(&evening, NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        let slot = ReportSlot::at(&next);

        // UTC is still on the 18th when the local clock reaches the 19th
        assert_eq!(slot.date, chrono::NaiveDate::from_ymd_opt(2024, 10, 19).unwrap());
        assert_eq!(slot.end, Utc.with_ymd_and_hms(2024, 10, 18, 15, 0, 0).unwrap());
        assert_ne!(slot.date, slot.end.date_naive());
    }
}
