// Cluster metrics collector
//
// Issues one batched metrics query per cluster covering every series in
// `CLUSTER_SERIES`, and appends one MetricPoint per returned datapoint.
// No deduplication: collecting an overlapping window twice stores the
// overlapping points twice.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::CollectorError;
use crate::cloud::{bounded, MetricSeries, MetricsApi, MetricsRequest, SeriesQuery};
use crate::storage::{MetricPoint, Store};

/// Namespace all cluster-level series are published under
pub const NAMESPACE: &str = "AWS/ECS";

/// Dimension identifying the cluster
pub const CLUSTER_DIMENSION: &str = "ClusterName";

/// Statistic requested for every series
pub const STATISTIC: &str = "Average";

/// Series ids, as stored in `MetricPoint::metric_name`
pub mod series {
    pub const CPU_UTILIZATION: &str = "cpuUtilization";
    pub const MEMORY_UTILIZATION: &str = "memoryUtilization";
    pub const CPU_RESERVATION: &str = "cpuReservation";
    pub const MEMORY_RESERVATION: &str = "memoryReservation";
    pub const CONTAINER_INSTANCE_COUNT: &str = "containerInstanceCount";
}

/// A series id paired with the upstream metric it reads
#[derive(Debug, Clone, Copy)]
pub struct SeriesSpec {
    pub id: &'static str,
    pub metric_name: &'static str,
}

/// Every series requested for a cluster on each collection
pub const CLUSTER_SERIES: [SeriesSpec; 5] = [
    SeriesSpec {
        id: series::CPU_UTILIZATION,
        metric_name: "CPUUtilization",
    },
    SeriesSpec {
        id: series::MEMORY_UTILIZATION,
        metric_name: "MemoryUtilization",
    },
    SeriesSpec {
        id: series::CPU_RESERVATION,
        metric_name: "CPUReservation",
    },
    SeriesSpec {
        id: series::MEMORY_RESERVATION,
        metric_name: "MemoryReservation",
    },
    SeriesSpec {
        id: series::CONTAINER_INSTANCE_COUNT,
        metric_name: "ContainerInstanceCount",
    },
];

/// Time range and granularity of one metrics query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_seconds: i32,
}

impl MetricsWindow {
    /// Window of `lookback` ending at `end`
    pub fn trailing(end: DateTime<Utc>, lookback: ChronoDuration, period_seconds: i32) -> Self {
        MetricsWindow {
            start: end - lookback,
            end,
            period_seconds,
        }
    }
}

/// Outcome of one cluster's metrics query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResult {
    pub cluster_name: String,
    pub period: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub metrics: Vec<MetricSeries>,

    /// Number of MetricPoint rows appended by this call
    #[serde(skip)]
    pub points_written: usize,
}

/// Collects cluster-level utilization and reservation metrics
pub struct MetricCollector {
    api: Arc<dyn MetricsApi>,
    store: Arc<dyn Store>,
    call_timeout: Duration,
}

impl MetricCollector {
    pub fn new(api: Arc<dyn MetricsApi>, store: Arc<dyn Store>, call_timeout: Duration) -> Self {
        MetricCollector {
            api,
            store,
            call_timeout,
        }
    }

    /// Builds the batched request for one cluster
    pub fn request_for(cluster: &str, window: &MetricsWindow) -> MetricsRequest {
        MetricsRequest {
            queries: CLUSTER_SERIES
                .iter()
                .map(|def| SeriesQuery {
                    id: def.id.to_string(),
                    namespace: NAMESPACE.to_string(),
                    metric_name: def.metric_name.to_string(),
                    dimension_name: CLUSTER_DIMENSION.to_string(),
                    dimension_value: cluster.to_string(),
                    stat: STATISTIC.to_string(),
                })
                .collect(),
            start: window.start,
            end: window.end,
            period_seconds: window.period_seconds,
        }
    }

    /// Queries every cluster series over `window`
    ///
    /// # Arguments
    /// * `cluster` - Cluster name
    /// * `window` - Time range and period
    /// * `persist` - Whether to append a MetricPoint per datapoint
    ///
    /// # Returns
    /// Per-series aligned timestamp/value arrays as returned by the API.
    pub async fn collect_metrics(
        &self,
        cluster: &str,
        window: &MetricsWindow,
        persist: bool,
    ) -> Result<MetricsResult, CollectorError> {
        let request = Self::request_for(cluster, window);
        let metrics = bounded(
            "GetMetricData",
            self.call_timeout,
            self.api.get_metric_data(&request),
        )
        .await?;

        let mut points_written = 0;
        if persist {
            for series in &metrics {
                for (timestamp, value) in series.datapoints() {
                    let point = MetricPoint {
                        cluster: cluster.to_string(),
                        metric_name: series.id.clone(),
                        timestamp,
                        value,
                    };
                    self.store.insert_metric(&point).await?;
                    points_written += 1;
                }
            }
        }

        debug!(
            "Collected {} series for cluster '{}', stored {} point(s)",
            metrics.len(),
            cluster,
            points_written
        );

        Ok(MetricsResult {
            cluster_name: cluster.to_string(),
            period: window.period_seconds,
            start_time: window.start,
            end_time: window.end,
            metrics,
            points_written,
        })
    }
}
