// Row model - the five logical tables persisted by the store
//
// Every row is immutable once written. Timestamps are UTC and stored as
// fixed-width "yyyy-MM-dd HH:mm:ss" strings so that lexicographic order in
// the database matches chronological order.

use bson::oid::ObjectId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One datapoint of one metric series for one cluster.
///
/// Append-only: re-collecting an overlapping window inserts duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Cluster name the series belongs to
    pub cluster: String,

    /// Series identifier (e.g. "cpuUtilization")
    pub metric_name: String,

    /// Datapoint time as reported by the metrics API
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,

    pub value: f64,
}

/// Observed state of a service at one collection tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub cluster: String,
    pub service_name: String,
    pub service_arn: String,
    pub running_count: i64,
    pub desired_count: i64,
    pub status: String,

    /// Shared observation time of the tick that produced this row
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Observed state of a task at one collection tick.
///
/// `id` is assigned by the store on insert and is the key containers refer to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub cluster: String,
    pub task_arn: String,
    pub last_status: String,
    pub desired_status: String,

    #[serde(with = "timestamp::option", default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(with = "timestamp::option", default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// A container belonging to exactly one task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    /// Id of the owning `TaskSnapshot`
    pub task_id: ObjectId,

    pub container_arn: String,
    pub name: String,
    pub last_status: String,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,

    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// A task merged with every container row that references it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskWithContainers {
    #[serde(flatten)]
    pub task: TaskSnapshot,
    pub containers: Vec<ContainerSnapshot>,
}

/// Per-calendar-day statistics for one metric series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub day: NaiveDate,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// Record of one compiled report, keyed by (report_date, cluster).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub report_date: NaiveDate,
    pub cluster: String,

    /// Directory holding the published artifact set
    pub report_path: String,

    /// Serialized report document
    pub json_data: String,

    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Serde adapter for the stored timestamp format.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    /// Formats an instant the way it is stored.
    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.format(FORMAT).to_string()
    }

    pub fn parse(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        NaiveDateTime::parse_from_str(value, FORMAT).map(|naive| naive.and_utc())
    }

    /// Drops sub-second precision, matching what survives a store round-trip.
    pub fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
        ts.trunc_subsecs(0)
    }

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(ts: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match ts {
                Some(ts) => serializer.serialize_some(&super::format(ts)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::parse(&raw)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
