// Storage module - the append-only time-series store
//
// This module is responsible for:
// 1. Defining the row model for metrics, services, tasks, containers and reports
// 2. Defining the `Store` trait every component receives explicitly
// 3. Providing a MongoDB backend and an in-memory backend
//
// Rows are never updated or deleted, with one exception: report records are
// upserted on their (report_date, cluster) key so a recompile replaces the
// previous record for that cluster and day.

use async_trait::async_trait;
use bson::oid::ObjectId;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use thiserror::Error;

pub mod memory;
pub mod model;
pub mod mongo;

pub use memory::MemoryStore;
pub use model::{
    timestamp, ContainerSnapshot, DailyAggregate, MetricPoint, ReportRecord, ServiceSnapshot, TaskSnapshot,
    TaskWithContainers,
};
pub use mongo::MongoStore;

/// Errors that can occur while reading or writing the store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("MongoDB operation failed: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("Failed to encode document: {0}")]
    Encode(#[from] bson::ser::Error),

    #[error("Failed to decode document: {0}")]
    Decode(#[from] bson::de::Error),

    #[error("Invalid document format: {0}")]
    InvalidDocument(String),
}

/// Persistence contract shared by the collectors and the report compiler.
///
/// Each write is a single atomic insert. There is no cross-table transaction:
/// a task insert followed by its container inserts can be interrupted, leaving
/// the task with a subset of its containers.
///
/// Reads return only committed rows and never block writers.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_metric(&self, point: &MetricPoint) -> Result<(), StorageError>;

    async fn insert_service(&self, service: &ServiceSnapshot) -> Result<(), StorageError>;

    /// Inserts a task row and returns the id its containers must reference.
    async fn insert_task(&self, task: &TaskSnapshot) -> Result<ObjectId, StorageError>;

    async fn insert_container(&self, container: &ContainerSnapshot) -> Result<(), StorageError>;

    /// Stores a report record, replacing any record with the same
    /// (report_date, cluster) key.
    async fn save_report(&self, report: &ReportRecord) -> Result<(), StorageError>;

    /// Points of one series with timestamp in `[start, end]`, ascending.
    async fn points_in_range(
        &self,
        cluster: &str,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>, StorageError>;

    /// Most recent points of any series for a cluster, newest first.
    async fn latest_points(
        &self,
        cluster: &str,
        limit: usize,
    ) -> Result<Vec<MetricPoint>, StorageError>;

    /// Per-day avg/min/max over the `days` calendar days ending on the day of
    /// `as_of` (inclusive), ascending by day.
    async fn daily_aggregate(
        &self,
        cluster: &str,
        metric: &str,
        days: u32,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<DailyAggregate>, StorageError>;

    /// One row per distinct service name: the row with the maximum timestamp.
    /// When several rows share that timestamp any one of them is returned.
    /// Ordered by service name.
    async fn latest_service_snapshot(
        &self,
        cluster: &str,
    ) -> Result<Vec<ServiceSnapshot>, StorageError>;

    /// Service rows observed in `[start, end]`, newest first.
    async fn services_in_range(
        &self,
        cluster: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ServiceSnapshot>, StorageError>;

    /// Tasks whose `created_at` falls in `[start, end]`, newest first.
    async fn tasks_in_window(
        &self,
        cluster: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskSnapshot>, StorageError>;

    /// Same window as `tasks_in_window`, but only the most recently observed
    /// row of each task ARN; any row with the max timestamp wins a tie.
    /// Newest first by `created_at`.
    async fn latest_tasks_in_window(
        &self,
        cluster: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskSnapshot>, StorageError>;

    /// Most recently created task rows for a cluster.
    async fn recent_tasks(
        &self,
        cluster: &str,
        limit: usize,
    ) -> Result<Vec<TaskSnapshot>, StorageError>;

    /// `None` when no task row has this id.
    async fn task_with_containers(
        &self,
        task_id: &ObjectId,
    ) -> Result<Option<TaskWithContainers>, StorageError>;

    async fn report_for(
        &self,
        report_date: NaiveDate,
        cluster: &str,
    ) -> Result<Option<ReportRecord>, StorageError>;

    /// Most recent report records, newest date first.
    async fn recent_reports(&self, limit: usize) -> Result<Vec<ReportRecord>, StorageError>;
}

/// First instant of the trailing `days`-day window that ends on `as_of`'s day.
///
/// Returns `None` for a zero-day window.
pub fn trailing_days_start(as_of: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    if days == 0 {
        return None;
    }
    let first_day = as_of.date_naive() - Duration::days(i64::from(days) - 1);
    Some(first_day.and_time(chrono::NaiveTime::MIN).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_trailing_days_start() {
        let as_of = Utc.with_ymd_and_hms(2024, 3, 10, 15, 45, 0).unwrap();

        assert_eq!(
            trailing_days_start(as_of, 1),
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap())
        );
        assert_eq!(
            trailing_days_start(as_of, 7),
            Some(Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap())
        );
        assert_eq!(trailing_days_start(as_of, 0), None);
    }
}
