// Report module - compiles one cluster's daily report
//
// Layout: `<reports_dir>/<yyyy-mm-dd>/<cluster>/` holding exactly the files in
// `artifacts`. Everything is produced in a hidden staging directory next to
// the final one and renamed into place only once the full set exists, so a
// reader never observes a partial report. A report being replaced is moved
// aside rather than deleted, and only removed once the ReportRecord is written.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::collectors::metrics::series;
use crate::storage::{
    DailyAggregate, MetricPoint, ReportRecord, ServiceSnapshot, StorageError, Store, TaskSnapshot,
};

pub mod html;
pub mod render;

use render::{render_document, RenderError, RenderPlan, Renderer};

/// File names of one report's artifact set
pub mod artifacts {
    pub const DATA_JSON: &str = "report-data.json";
    pub const HTML: &str = "report.html";
    pub const CPU_CHART: &str = "cpu-chart.png";
    pub const MEMORY_CHART: &str = "memory-chart.png";
    pub const DAILY_AVG_CHART: &str = "daily-avg-chart.png";
    pub const PDF: &str = "full-report.pdf";

    pub const ALL: [&str; 6] = [DATA_JSON, HTML, CPU_CHART, MEMORY_CHART, DAILY_AVG_CHART, PDF];
}

/// Canvas ids of the cpu, memory and daily-average charts
pub const CHART_IDS: [&str; 3] = ["cpuChart", "memoryChart", "dailyAvgChart"];

/// Length of the window a report covers
const REPORT_WINDOW_HOURS: i64 = 24;

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Errors that abort one cluster's report
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to read report data: {0}")]
    Storage(#[from] StorageError),

    #[error("Rendering failed: {0}")]
    Render(#[from] RenderError),

    #[error("Report file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Renderer did not produce {0}")]
    MissingArtifact(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyAverages {
    pub cpu: Vec<DailyAggregate>,
    pub memory: Vec<DailyAggregate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetrics {
    pub cpu: Vec<MetricPoint>,
    pub memory: Vec<MetricPoint>,
    pub cpu_reservation: Vec<MetricPoint>,
    pub memory_reservation: Vec<MetricPoint>,
    pub daily_averages: DailyAverages,
}

/// The aggregate document a report is built from, saved as `report-data.json`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportData {
    pub cluster_name: String,
    pub report_date: NaiveDate,
    pub metrics: ReportMetrics,
    pub services: Vec<ServiceSnapshot>,
    pub tasks: Vec<TaskSnapshot>,
}

/// Which day a report is filed under and the instant its window ends
///
/// The date is the calendar day of `end` in the time zone the report was
/// scheduled in, so a run firing at local midnight is filed under the local
/// day even when UTC is still on the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportSlot {
    pub date: NaiveDate,
    pub end: DateTime<Utc>,
}

impl ReportSlot {
    pub fn at<Tz: TimeZone>(end: &DateTime<Tz>) -> Self {
        ReportSlot {
            date: end.date_naive(),
            end: end.with_timezone(&Utc),
        }
    }
}

/// Directory name for a cluster; anything outside `[A-Za-z0-9._-]` becomes `_`
fn cluster_dir_name(cluster: &str) -> String {
    let name: String = cluster
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match name.as_str() {
        "" | "." | ".." => format!("_{}", name),
        _ => name,
    }
}

/// Best-effort removal used on failure paths
async fn discard(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }
}

/// Compiles per-cluster reports from stored history
pub struct ReportCompiler {
    store: Arc<dyn Store>,
    renderer: Arc<dyn Renderer>,
    reports_dir: PathBuf,
    daily_average_days: u32,
    render_timeout: Duration,
}

impl ReportCompiler {
    /// Creates a new ReportCompiler
    ///
    /// # Arguments
    /// * `store` - Source of report data and sink for report records
    /// * `renderer` - Rendering engine producing chart images and the PDF
    /// * `reports_dir` - Root of the date-stamped report tree
    /// * `daily_average_days` - Trailing days covered by the daily-average chart
    /// * `render_timeout` - Upper bound for the whole rendering phase
    pub fn new(
        store: Arc<dyn Store>,
        renderer: Arc<dyn Renderer>,
        reports_dir: PathBuf,
        daily_average_days: u32,
        render_timeout: Duration,
    ) -> Self {
        ReportCompiler {
            store,
            renderer,
            reports_dir,
            daily_average_days,
            render_timeout,
        }
    }

    /// Final directory of a cluster's report for `date`
    pub fn report_dir(&self, cluster: &str, date: NaiveDate) -> PathBuf {
        self.reports_dir
            .join(date.format("%Y-%m-%d").to_string())
            .join(cluster_dir_name(cluster))
    }

    /// Reads everything one report shows for the 24 hours ending at `slot.end`
    pub async fn gather(&self, cluster: &str, slot: ReportSlot) -> Result<ReportData, ReportError> {
        let end = slot.end;
        let start = end - ChronoDuration::hours(REPORT_WINDOW_HOURS);
        let store = self.store.as_ref();

        let cpu = store.points_in_range(cluster, series::CPU_UTILIZATION, start, end).await?;
        let memory = store
            .points_in_range(cluster, series::MEMORY_UTILIZATION, start, end)
            .await?;
        let cpu_reservation = store
            .points_in_range(cluster, series::CPU_RESERVATION, start, end)
            .await?;
        let memory_reservation = store
            .points_in_range(cluster, series::MEMORY_RESERVATION, start, end)
            .await?;

        let daily_averages = DailyAverages {
            cpu: store
                .daily_aggregate(cluster, series::CPU_UTILIZATION, self.daily_average_days, end)
                .await?,
            memory: store
                .daily_aggregate(cluster, series::MEMORY_UTILIZATION, self.daily_average_days, end)
                .await?,
        };

        let services = store.latest_service_snapshot(cluster).await?;
        // Every tick re-records each live task; show its latest state once
        let tasks = store.latest_tasks_in_window(cluster, start, end).await?;

        Ok(ReportData {
            cluster_name: cluster.to_string(),
            report_date: slot.date,
            metrics: ReportMetrics {
                cpu,
                memory,
                cpu_reservation,
                memory_reservation,
                daily_averages,
            },
            services,
            tasks,
        })
    }

    /// Compiles the report of `cluster` for the 24 hours ending at `slot.end`,
    /// filed under `slot.date`
    ///
    /// # Returns
    /// * `Ok(PathBuf)` - The published report directory
    /// * `Err(ReportError)` - Nothing new was published and no record was
    ///   written; an earlier report for the same cluster and date is left intact
    ///
    /// Recompiling the same cluster and date replaces the earlier directory and
    /// record.
    pub async fn compile_report(
        &self,
        cluster: &str,
        slot: ReportSlot,
    ) -> Result<PathBuf, ReportError> {
        let report_date = slot.date;
        info!("Generating report for '{}' on {}", cluster, report_date);

        let data = self.gather(cluster, slot).await?;
        let json = serde_json::to_string_pretty(&data)?;

        let final_dir = self.report_dir(cluster, report_date);
        let parent = final_dir.parent().unwrap_or(&self.reports_dir).to_path_buf();
        fs::create_dir_all(&parent).await?;

        let staging = hidden_sibling(&parent, cluster, "staging");
        if let Err(e) = self.build_artifacts(&staging, &data, &json).await {
            discard(&staging).await;
            return Err(e);
        }

        let aside = hidden_sibling(&parent, cluster, "previous");
        let publication = match publish(&staging, &final_dir, aside).await {
            Ok(publication) => publication,
            Err(e) => {
                discard(&staging).await;
                return Err(e.into());
            }
        };

        let record = ReportRecord {
            report_date,
            cluster: cluster.to_string(),
            report_path: final_dir.to_string_lossy().into_owned(),
            json_data: json,
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.save_report(&record).await {
            publication.rollback().await;
            return Err(e.into());
        }
        publication.commit().await;

        info!("Report generated at {}", final_dir.display());
        Ok(final_dir)
    }

    async fn build_artifacts(
        &self,
        staging: &Path,
        data: &ReportData,
        json: &str,
    ) -> Result<(), ReportError> {
        fs::create_dir_all(staging).await?;

        fs::write(staging.join(artifacts::DATA_JSON), json).await?;

        let document = staging.join(artifacts::HTML);
        fs::write(&document, html::render_report(data, self.daily_average_days)?).await?;

        let plan = RenderPlan {
            document: fs::canonicalize(&document).await?,
            regions: vec![
                ("#cpuChart", staging.join(artifacts::CPU_CHART)),
                ("#memoryChart", staging.join(artifacts::MEMORY_CHART)),
                ("#dailyAvgChart", staging.join(artifacts::DAILY_AVG_CHART)),
            ],
            pdf: staging.join(artifacts::PDF),
        };

        render_document(self.renderer.as_ref(), &plan, self.render_timeout).await?;

        for name in artifacts::ALL {
            if !fs::try_exists(staging.join(name)).await? {
                return Err(ReportError::MissingArtifact(name));
            }
        }

        debug!("All artifacts present in {}", staging.display());
        Ok(())
    }
}

/// Unique hidden directory next to a cluster's report, e.g. `.prod.staging-41-3`
fn hidden_sibling(parent: &Path, cluster: &str, kind: &str) -> PathBuf {
    parent.join(format!(
        ".{}.{}-{}-{}",
        cluster_dir_name(cluster),
        kind,
        std::process::id(),
        STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

/// A report directory renamed into place. The report it replaced, if any,
/// waits in `previous` until the caller commits or rolls back.
struct Publication {
    final_dir: PathBuf,
    previous: Option<PathBuf>,
}

/// Moves a complete staging directory to `final_dir`. An earlier report there
/// is renamed to `aside` first and restored if the move fails.
async fn publish(staging: &Path, final_dir: &Path, aside: PathBuf) -> std::io::Result<Publication> {
    let previous = match fs::rename(final_dir, &aside).await {
        Ok(()) => {
            debug!("Moved earlier report at {} aside", final_dir.display());
            Some(aside)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    if let Err(e) = fs::rename(staging, final_dir).await {
        if let Some(previous) = &previous {
            restore(previous, final_dir).await;
        }
        return Err(e);
    }

    Ok(Publication {
        final_dir: final_dir.to_path_buf(),
        previous,
    })
}

async fn restore(previous: &Path, final_dir: &Path) {
    if let Err(e) = fs::rename(previous, final_dir).await {
        warn!(
            "Failed to restore earlier report {} to {}: {}",
            previous.display(),
            final_dir.display(),
            e
        );
    }
}

impl Publication {
    /// Drops the replaced report
    async fn commit(self) {
        if let Some(previous) = &self.previous {
            discard(previous).await;
        }
    }

    /// Removes the new report and puts the replaced one back
    async fn rollback(self) {
        discard(&self.final_dir).await;
        if let Some(previous) = &self.previous {
            restore(previous, &self.final_dir).await;
        }
    }
}
