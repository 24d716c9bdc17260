// Cloud module - the control-plane and metrics APIs consumed by the collectors
//
// Collectors only see the two capability traits defined here, so tests can
// substitute in-process fakes for the AWS clients.

use async_trait::async_trait;
// Both SDK crates re-export the same smithy timestamp type
use aws_sdk_ecs::primitives::DateTime as SdkDateTime;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub mod cloudwatch;
pub mod ecs;

pub use cloudwatch::CloudWatchMetrics;
pub use ecs::EcsInventory;

/// Errors raised by inventory or metrics calls
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} timed out after {}s", .limit.as_secs())]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },
}

impl ApiError {
    pub fn request(operation: &'static str, message: impl Into<String>) -> Self {
        ApiError::Request {
            operation,
            message: message.into(),
        }
    }
}

/// Runs one external call with an upper bound on its duration.
///
/// Expiry is reported as `ApiError::Timeout` and drops the in-flight call.
pub async fn bounded<T, F>(operation: &'static str, limit: Duration, call: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Timeout { operation, limit }),
    }
}

/// A cluster as described by the control plane
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDescription {
    pub cluster_name: String,
    pub cluster_arn: String,
    pub status: Option<String>,
    pub running_tasks_count: i64,
    pub pending_tasks_count: i64,
    pub active_services_count: i64,
    pub registered_container_instances_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescription {
    pub service_arn: Option<String>,
    pub service_name: Option<String>,
    pub running_count: i64,
    pub desired_count: i64,
    pub status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDescription {
    pub container_arn: Option<String>,
    pub name: Option<String>,
    pub last_status: Option<String>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescription {
    pub task_arn: Option<String>,
    pub task_definition_arn: Option<String>,
    pub last_status: Option<String>,
    pub desired_status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub containers: Vec<ContainerDescription>,
}

/// Read access to the cluster inventory
#[async_trait]
pub trait InventoryApi: Send + Sync {
    /// ARNs of every cluster in the account/region
    async fn list_clusters(&self) -> Result<Vec<String>, ApiError>;

    async fn describe_clusters(
        &self,
        cluster_arns: &[String],
    ) -> Result<Vec<ClusterDescription>, ApiError>;

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>, ApiError>;

    async fn describe_services(
        &self,
        cluster: &str,
        service_arns: &[String],
    ) -> Result<Vec<ServiceDescription>, ApiError>;

    async fn list_tasks(&self, cluster: &str) -> Result<Vec<String>, ApiError>;

    async fn describe_tasks(
        &self,
        cluster: &str,
        task_arns: &[String],
    ) -> Result<Vec<TaskDescription>, ApiError>;
}

/// One named series in a batched metrics request
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesQuery {
    /// Caller-chosen id echoed back on the result
    pub id: String,
    pub namespace: String,
    pub metric_name: String,
    pub dimension_name: String,
    pub dimension_value: String,
    pub stat: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRequest {
    pub queries: Vec<SeriesQuery>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_seconds: i32,
}

/// Aligned timestamp/value arrays for one requested series
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricSeries {
    pub id: String,
    pub label: Option<String>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<f64>,
}

impl MetricSeries {
    /// Datapoints present in both arrays with a finite value
    pub fn datapoints(&self) -> impl Iterator<Item = (DateTime<Utc>, f64)> + '_ {
        self.timestamps
            .iter()
            .copied()
            .zip(self.values.iter().copied())
            .filter(|(_, value)| value.is_finite())
    }
}

/// Batched multi-series metrics queries
#[async_trait]
pub trait MetricsApi: Send + Sync {
    async fn get_metric_data(&self, request: &MetricsRequest)
        -> Result<Vec<MetricSeries>, ApiError>;
}

/// Converts an SDK timestamp into a chrono UTC instant
pub(crate) fn to_utc(value: &SdkDateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(value.secs(), value.subsec_nanos())
}

/// Converts a chrono UTC instant into an SDK timestamp
pub(crate) fn from_utc(value: DateTime<Utc>) -> SdkDateTime {
    SdkDateTime::from_secs_and_nanos(value.timestamp(), value.timestamp_subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_bounded_passes_through_result() {
        let ok = bounded("Fast", Duration::from_secs(1), async { Ok::<_, ApiError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err = bounded("Broken", Duration::from_secs(1), async {
            Err::<(), _>(ApiError::request("Broken", "denied"))
        })
        .await;
        assert!(matches!(err, Err(ApiError::Request { .. })));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result = bounded("Hung", Duration::from_millis(20), async {
            std::future::pending::<Result<(), ApiError>>().await
        })
        .await;

        match result {
            Err(ApiError::Timeout { operation, .. }) => assert_eq!(operation, "Hung"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_datapoints_skip_missing_values() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let series = MetricSeries {
            id: "cpuUtilization".to_string(),
            label: None,
            timestamps: vec![
                t0,
                t0 + chrono::Duration::minutes(5),
                t0 + chrono::Duration::minutes(10),
            ],
            values: vec![10.0, f64::NAN],
        };

        let points: Vec<_> = series.datapoints().collect();
        assert_eq!(points, vec![(t0, 10.0)]);
    }

    #[test]
    fn test_sdk_timestamp_conversion() {
        let instant = Utc.with_ymd_and_hms(2024, 3, 10, 12, 30, 15).unwrap();
        assert_eq!(to_utc(&from_utc(instant)), Some(instant));
    }
}
