// In-memory storage backend
//
// Used for ephemeral runs (`--ephemeral`) and as the store behind every test.
// A single mutex serializes writes; reads clone the matching rows out.

use async_trait::async_trait;
use bson::oid::ObjectId;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::model::timestamp;
use super::{
    trailing_days_start, ContainerSnapshot, DailyAggregate, MetricPoint, ReportRecord,
    ServiceSnapshot, StorageError, Store, TaskSnapshot, TaskWithContainers,
};

#[derive(Default)]
struct Tables {
    metrics: Vec<MetricPoint>,
    services: Vec<ServiceSnapshot>,
    tasks: Vec<TaskSnapshot>,
    containers: Vec<ContainerSnapshot>,
    reports: Vec<ReportRecord>,
}

/// Row counts per table, mostly useful for assertions and logging
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RowCounts {
    pub metrics: usize,
    pub services: usize,
    pub tasks: usize,
    pub containers: usize,
    pub reports: usize,
}

impl RowCounts {
    pub fn total(&self) -> usize {
        self.metrics + self.services + self.tasks + self.containers + self.reports
    }
}

/// Volatile store holding every table in process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_counts(&self) -> RowCounts {
        let tables = self.lock();
        RowCounts {
            metrics: tables.metrics.len(),
            services: tables.services.len(),
            tasks: tables.tasks.len(),
            containers: tables.containers.len(),
            reports: tables.reports.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A panic while holding the lock cannot leave a half-written row
        // behind: every write is a single push.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// True when `ts` lies in `[start, end]` at stored (second) precision
fn within(ts: &DateTime<Utc>, start: &DateTime<Utc>, end: &DateTime<Utc>) -> bool {
    let ts = timestamp::truncate(*ts);
    ts >= timestamp::truncate(*start) && ts <= timestamp::truncate(*end)
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_metric(&self, point: &MetricPoint) -> Result<(), StorageError> {
        let mut row = point.clone();
        row.timestamp = timestamp::truncate(row.timestamp);
        self.lock().metrics.push(row);
        Ok(())
    }

    async fn insert_service(&self, service: &ServiceSnapshot) -> Result<(), StorageError> {
        let mut row = service.clone();
        row.timestamp = timestamp::truncate(row.timestamp);
        self.lock().services.push(row);
        Ok(())
    }

    async fn insert_task(&self, task: &TaskSnapshot) -> Result<ObjectId, StorageError> {
        let id = ObjectId::new();
        let row = TaskSnapshot {
            id: Some(id),
            created_at: task.created_at.map(timestamp::truncate),
            started_at: task.started_at.map(timestamp::truncate),
            timestamp: timestamp::truncate(task.timestamp),
            ..task.clone()
        };
        self.lock().tasks.push(row);
        Ok(id)
    }

    async fn insert_container(&self, container: &ContainerSnapshot) -> Result<(), StorageError> {
        let mut row = container.clone();
        row.timestamp = timestamp::truncate(row.timestamp);
        self.lock().containers.push(row);
        Ok(())
    }

    async fn save_report(&self, report: &ReportRecord) -> Result<(), StorageError> {
        let mut tables = self.lock();
        tables
            .reports
            .retain(|r| !(r.report_date == report.report_date && r.cluster == report.cluster));
        tables.reports.push(report.clone());
        Ok(())
    }

    async fn points_in_range(
        &self,
        cluster: &str,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>, StorageError> {
        let mut points: Vec<MetricPoint> = self
            .lock()
            .metrics
            .iter()
            .filter(|p| p.cluster == cluster && p.metric_name == metric)
            .filter(|p| within(&p.timestamp, &start, &end))
            .cloned()
            .collect();

        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }

    async fn latest_points(
        &self,
        cluster: &str,
        limit: usize,
    ) -> Result<Vec<MetricPoint>, StorageError> {
        let mut points: Vec<MetricPoint> = self
            .lock()
            .metrics
            .iter()
            .filter(|p| p.cluster == cluster)
            .cloned()
            .collect();

        points.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        points.truncate(limit);
        Ok(points)
    }

    async fn daily_aggregate(
        &self,
        cluster: &str,
        metric: &str,
        days: u32,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<DailyAggregate>, StorageError> {
        let Some(since) = trailing_days_start(as_of, days) else {
            return Ok(Vec::new());
        };

        // day -> (sum, count, min, max)
        let mut groups: BTreeMap<NaiveDate, (f64, usize, f64, f64)> = BTreeMap::new();
        for point in self.lock().metrics.iter() {
            if point.cluster != cluster
                || point.metric_name != metric
                || !within(&point.timestamp, &since, &as_of)
            {
                continue;
            }

            let entry = groups
                .entry(point.timestamp.date_naive())
                .or_insert((0.0, 0, f64::INFINITY, f64::NEG_INFINITY));
            entry.0 += point.value;
            entry.1 += 1;
            entry.2 = entry.2.min(point.value);
            entry.3 = entry.3.max(point.value);
        }

        Ok(groups
            .into_iter()
            .map(|(day, (sum, count, min, max))| DailyAggregate {
                day,
                avg: sum / count as f64,
                min,
                max,
            })
            .collect())
    }

    async fn latest_service_snapshot(
        &self,
        cluster: &str,
    ) -> Result<Vec<ServiceSnapshot>, StorageError> {
        let mut latest: BTreeMap<String, ServiceSnapshot> = BTreeMap::new();
        for service in self.lock().services.iter().filter(|s| s.cluster == cluster) {
            match latest.get(&service.service_name) {
                Some(current) if current.timestamp >= service.timestamp => {}
                _ => {
                    latest.insert(service.service_name.clone(), service.clone());
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn services_in_range(
        &self,
        cluster: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ServiceSnapshot>, StorageError> {
        let mut services: Vec<ServiceSnapshot> = self
            .lock()
            .services
            .iter()
            .filter(|s| s.cluster == cluster && within(&s.timestamp, &start, &end))
            .cloned()
            .collect();

        services.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(services)
    }

    async fn tasks_in_window(
        &self,
        cluster: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskSnapshot>, StorageError> {
        let mut tasks: Vec<TaskSnapshot> = self
            .lock()
            .tasks
            .iter()
            .filter(|t| t.cluster == cluster)
            .filter(|t| matches!(&t.created_at, Some(created) if within(created, &start, &end)))
            .cloned()
            .collect();

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn latest_tasks_in_window(
        &self,
        cluster: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskSnapshot>, StorageError> {
        let mut latest: BTreeMap<String, TaskSnapshot> = BTreeMap::new();
        for task in self.tasks_in_window(cluster, start, end).await? {
            match latest.get(&task.task_arn) {
                Some(current) if current.timestamp >= task.timestamp => {}
                _ => {
                    latest.insert(task.task_arn.clone(), task);
                }
            }
        }

        let mut tasks: Vec<TaskSnapshot> = latest.into_values().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn recent_tasks(
        &self,
        cluster: &str,
        limit: usize,
    ) -> Result<Vec<TaskSnapshot>, StorageError> {
        let mut tasks: Vec<TaskSnapshot> = self
            .lock()
            .tasks
            .iter()
            .filter(|t| t.cluster == cluster)
            .cloned()
            .collect();

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn task_with_containers(
        &self,
        task_id: &ObjectId,
    ) -> Result<Option<TaskWithContainers>, StorageError> {
        let tables = self.lock();
        let Some(task) = tables.tasks.iter().find(|t| t.id.as_ref() == Some(task_id)) else {
            return Ok(None);
        };

        let containers = tables
            .containers
            .iter()
            .filter(|c| &c.task_id == task_id)
            .cloned()
            .collect();

        Ok(Some(TaskWithContainers {
            task: task.clone(),
            containers,
        }))
    }

    async fn report_for(
        &self,
        report_date: NaiveDate,
        cluster: &str,
    ) -> Result<Option<ReportRecord>, StorageError> {
        Ok(self
            .lock()
            .reports
            .iter()
            .find(|r| r.report_date == report_date && r.cluster == cluster)
            .cloned())
    }

    async fn recent_reports(&self, limit: usize) -> Result<Vec<ReportRecord>, StorageError> {
        let mut reports = self.lock().reports.clone();
        reports.sort_by(|a, b| {
            b.report_date
                .cmp(&a.report_date)
                .then_with(|| a.cluster.cmp(&b.cluster))
        });
        reports.truncate(limit);
        Ok(reports)
    }
}
