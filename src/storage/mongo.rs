// MongoDB storage backend
//
// One collection per logical table. Inserts are single-document writes, so
// each append is atomic on its own and concurrent appends from overlapping
// ticks never interfere.

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Document};
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::stream::TryStreamExt;
use mongodb::options::{FindOptions, IndexOptions, ReplaceOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, info};

use super::model::timestamp;
use super::{
    trailing_days_start, ContainerSnapshot, DailyAggregate, MetricPoint, ReportRecord,
    ServiceSnapshot, StorageError, Store, TaskSnapshot, TaskWithContainers,
};

const METRICS: &str = "metrics";
const SERVICES: &str = "services";
const TASKS: &str = "tasks";
const CONTAINERS: &str = "containers";
const REPORTS: &str = "reports";

/// MongoDB-backed store
pub struct MongoStore {
    /// MongoDB client for database operations
    client: Client,

    /// Database name where all tables live
    database_name: String,
}

impl MongoStore {
    /// Creates a new MongoStore on top of an existing client
    ///
    /// # Arguments
    /// * `client` - MongoDB client (shared reference from ConfigManager)
    /// * `database_name` - Name of the database holding the tables
    pub fn new(client: &Client, database_name: &str) -> Self {
        MongoStore {
            client: client.clone(),
            database_name: database_name.to_string(),
        }
    }

    fn database(&self) -> Database {
        self.client.database(&self.database_name)
    }

    fn metrics(&self) -> Collection<MetricPoint> {
        self.database().collection(METRICS)
    }

    fn services(&self) -> Collection<ServiceSnapshot> {
        self.database().collection(SERVICES)
    }

    fn tasks(&self) -> Collection<TaskSnapshot> {
        self.database().collection(TASKS)
    }

    fn containers(&self) -> Collection<ContainerSnapshot> {
        self.database().collection(CONTAINERS)
    }

    fn reports(&self) -> Collection<ReportRecord> {
        self.database().collection(REPORTS)
    }

    /// Creates the indexes backing every read in the `Store` contract
    ///
    /// Optional, but recommended for production deployments. The report
    /// index is unique because report records are keyed by date and cluster.
    pub async fn create_indexes(&self) -> Result<(), StorageError> {
        let db = self.database();

        let plan: [(&str, Document, &str, bool); 6] = [
            (
                METRICS,
                doc! { "cluster": 1, "metric_name": 1, "timestamp": 1 },
                "cluster_metric_timestamp_idx",
                false,
            ),
            (
                SERVICES,
                doc! { "cluster": 1, "service_name": 1, "timestamp": -1 },
                "cluster_service_timestamp_idx",
                false,
            ),
            (
                TASKS,
                doc! { "cluster": 1, "created_at": -1 },
                "cluster_created_idx",
                false,
            ),
            (CONTAINERS, doc! { "task_id": 1 }, "task_idx", false),
            (
                REPORTS,
                doc! { "report_date": -1, "cluster": 1 },
                "report_key_idx",
                true,
            ),
            (
                METRICS,
                doc! { "cluster": 1, "timestamp": -1 },
                "cluster_timestamp_idx",
                false,
            ),
        ];

        for (collection_name, keys, name, unique) in plan {
            info!("Creating index '{}' on collection '{}'", name, collection_name);

            let index = IndexModel::builder()
                .keys(keys)
                .options(
                    IndexOptions::builder()
                        .name(name.to_string())
                        .unique(unique)
                        .build(),
                )
                .build();

            db.collection::<Document>(collection_name)
                .create_index(index, None)
                .await?;
        }

        info!("Successfully created store indexes");
        Ok(())
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn insert_metric(&self, point: &MetricPoint) -> Result<(), StorageError> {
        self.metrics().insert_one(point, None).await?;
        debug!(
            "Stored {} point for cluster '{}' at {}",
            point.metric_name,
            point.cluster,
            timestamp::format(&point.timestamp)
        );
        Ok(())
    }

    async fn insert_service(&self, service: &ServiceSnapshot) -> Result<(), StorageError> {
        self.services().insert_one(service, None).await?;
        debug!(
            "Stored snapshot of service '{}' in cluster '{}'",
            service.service_name, service.cluster
        );
        Ok(())
    }

    async fn insert_task(&self, task: &TaskSnapshot) -> Result<ObjectId, StorageError> {
        let id = ObjectId::new();
        let row = TaskSnapshot {
            id: Some(id),
            ..task.clone()
        };

        self.tasks().insert_one(&row, None).await?;
        debug!("Stored task {} with id {}", row.task_arn, id);
        Ok(id)
    }

    async fn insert_container(&self, container: &ContainerSnapshot) -> Result<(), StorageError> {
        self.containers().insert_one(container, None).await?;
        Ok(())
    }

    async fn save_report(&self, report: &ReportRecord) -> Result<(), StorageError> {
        let options = ReplaceOptions::builder().upsert(true).build();

        let result = self
            .reports()
            .replace_one(report_key(report.report_date, &report.cluster), report, options)
            .await?;
        debug!(
            "Saved report record for '{}' on {} (replaced existing: {})",
            report.cluster,
            report.report_date,
            result.matched_count > 0
        );
        Ok(())
    }

    async fn points_in_range(
        &self,
        cluster: &str,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>, StorageError> {
        let filter = doc! {
            "cluster": cluster,
            "metric_name": metric,
            "timestamp": {
                "$gte": timestamp::format(&start),
                "$lte": timestamp::format(&end),
            },
        };
        let options = FindOptions::builder().sort(doc! { "timestamp": 1 }).build();

        let cursor = self.metrics().find(filter, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn latest_points(
        &self,
        cluster: &str,
        limit: usize,
    ) -> Result<Vec<MetricPoint>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let options = FindOptions::builder()
            .sort(doc! { "timestamp": -1 })
            .limit(limit as i64)
            .build();

        let cursor = self
            .metrics()
            .find(doc! { "cluster": cluster }, options)
            .await?;
        Ok(cursor.try_collect().await?)
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

        let rows: Vec<Document> = self
            .metrics()
            .aggregate(daily_aggregate_pipeline(cluster, metric, since, as_of), None)
            .await?
            .try_collect()
            .await?;

        rows.iter().map(decode_daily_aggregate).collect()
    }

    async fn latest_service_snapshot(
        &self,
        cluster: &str,
    ) -> Result<Vec<ServiceSnapshot>, StorageError> {
        let rows: Vec<Document> = self
            .services()
            .aggregate(latest_service_pipeline(cluster), None)
            .await?
            .try_collect()
            .await?;

        rows.into_iter()
            .map(|row| bson::from_document(row).map_err(StorageError::from))
            .collect()
    }

    async fn services_in_range(
        &self,
        cluster: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ServiceSnapshot>, StorageError> {
        let filter = doc! {
            "cluster": cluster,
            "timestamp": {
                "$gte": timestamp::format(&start),
                "$lte": timestamp::format(&end),
            },
        };
        let options = FindOptions::builder().sort(doc! { "timestamp": -1 }).build();

        let cursor = self.services().find(filter, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn tasks_in_window(
        &self,
        cluster: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskSnapshot>, StorageError> {
        let filter = doc! {
            "cluster": cluster,
            "created_at": {
                "$gte": timestamp::format(&start),
                "$lte": timestamp::format(&end),
            },
        };
        let options = FindOptions::builder().sort(doc! { "created_at": -1 }).build();

        let cursor = self.tasks().find(filter, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn latest_tasks_in_window(
        &self,
        cluster: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskSnapshot>, StorageError> {
        let rows: Vec<Document> = self
            .tasks()
            .aggregate(latest_task_pipeline(cluster, start, end), None)
            .await?
            .try_collect()
            .await?;

        rows.into_iter()
            .map(|row| bson::from_document(row).map_err(StorageError::from))
            .collect()
    }

    async fn recent_tasks(
        &self,
        cluster: &str,
        limit: usize,
    ) -> Result<Vec<TaskSnapshot>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .limit(limit as i64)
            .build();

        let cursor = self.tasks().find(doc! { "cluster": cluster }, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn task_with_containers(
        &self,
        task_id: &ObjectId,
    ) -> Result<Option<TaskWithContainers>, StorageError> {
        let Some(task) = self.tasks().find_one(doc! { "_id": *task_id }, None).await? else {
            return Ok(None);
        };

        let containers = self
            .containers()
            .find(doc! { "task_id": *task_id }, None)
            .await?
            .try_collect()
            .await?;

        Ok(Some(TaskWithContainers { task, containers }))
    }

    async fn report_for(
        &self,
        report_date: NaiveDate,
        cluster: &str,
    ) -> Result<Option<ReportRecord>, StorageError> {
        Ok(self
            .reports()
            .find_one(report_key(report_date, cluster), None)
            .await?)
    }

    async fn recent_reports(&self, limit: usize) -> Result<Vec<ReportRecord>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let options = FindOptions::builder()
            .sort(doc! { "report_date": -1, "cluster": 1 })
            .limit(limit as i64)
            .build();

        let cursor = self.reports().find(doc! {}, options).await?;
        Ok(cursor.try_collect().await?)
    }
}

/// Filter matching the single report record of a cluster on a day
fn report_key(report_date: NaiveDate, cluster: &str) -> Document {
    doc! {
        "report_date": report_date.to_string(),
        "cluster": cluster,
    }
}

/// Per-day avg/min/max of one series between `since` and `as_of`
fn daily_aggregate_pipeline(
    cluster: &str,
    metric: &str,
    since: DateTime<Utc>,
    as_of: DateTime<Utc>,
) -> Vec<Document> {
    // The first ten bytes of the stored timestamp are the UTC calendar day
    vec![
        doc! { "$match": {
            "cluster": cluster,
            "metric_name": metric,
            "timestamp": {
                "$gte": timestamp::format(&since),
                "$lte": timestamp::format(&as_of),
            },
        }},
        doc! { "$group": {
            "_id": { "$substrBytes": ["$timestamp", 0, 10] },
            "avg": { "$avg": "$value" },
            "min": { "$min": "$value" },
            "max": { "$max": "$value" },
        }},
        doc! { "$sort": { "_id": 1 } },
    ]
}

/// Newest row of each service name, ordered by name
fn latest_service_pipeline(cluster: &str) -> Vec<Document> {
    vec![
        doc! { "$match": { "cluster": cluster } },
        doc! { "$sort": { "service_name": 1, "timestamp": -1 } },
        doc! { "$group": {
            "_id": "$service_name",
            "row": { "$first": "$$ROOT" },
        }},
        doc! { "$replaceRoot": { "newRoot": "$row" } },
        doc! { "$sort": { "service_name": 1 } },
    ]
}

/// Newest row of each task created in `[start, end]`, newest creation first
fn latest_task_pipeline(cluster: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Document> {
    vec![
        doc! { "$match": {
            "cluster": cluster,
            "created_at": {
                "$gte": timestamp::format(&start),
                "$lte": timestamp::format(&end),
            },
        }},
        doc! { "$sort": { "task_arn": 1, "timestamp": -1 } },
        doc! { "$group": {
            "_id": "$task_arn",
            "row": { "$first": "$$ROOT" },
        }},
        doc! { "$replaceRoot": { "newRoot": "$row" } },
        doc! { "$sort": { "created_at": -1, "task_arn": 1 } },
    ]
}

/// Converts one `$group` output row into a `DailyAggregate`
fn decode_daily_aggregate(row: &Document) -> Result<DailyAggregate, StorageError> {
    let invalid = |e: bson::document::ValueAccessError| {
        StorageError::InvalidDocument(format!("daily aggregate row: {}", e))
    };

    let day = row.get_str("_id").map_err(invalid)?;
    let day = NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|e| StorageError::InvalidDocument(format!("day '{}': {}", day, e)))?;

    Ok(DailyAggregate {
        day,
        avg: row.get_f64("avg").map_err(invalid)?,
        min: row.get_f64("min").map_err(invalid)?,
        max: row.get_f64("max").map_err(invalid)?,
    })
}
