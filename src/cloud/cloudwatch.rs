// CloudWatch metrics client
//
// Implements `MetricsApi` with GetMetricData: every requested series goes out
// in one batched request, and result pages are merged back per series id.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_cloudwatch::error::DisplayErrorContext;
use aws_sdk_cloudwatch::types::{
    Dimension, Metric, MetricDataQuery, MetricDataResult, MetricStat, ScanBy,
};
use aws_sdk_cloudwatch::Client;
use std::collections::HashMap;
use tracing::debug;

use super::{from_utc, to_utc, ApiError, MetricSeries, MetricsApi, MetricsRequest, SeriesQuery};

const OPERATION: &str = "GetMetricData";

/// CloudWatch client
pub struct CloudWatchMetrics {
    client: Client,
}

impl CloudWatchMetrics {
    /// Creates a client from a loaded AWS configuration
    pub fn new(config: &SdkConfig) -> Self {
        CloudWatchMetrics {
            client: Client::new(config),
        }
    }
}

fn build_error(err: aws_sdk_cloudwatch::error::BuildError) -> ApiError {
    ApiError::request(OPERATION, format!("invalid query: {}", err))
}

/// Translates one series request into a GetMetricData query
fn data_query(query: &SeriesQuery, period_seconds: i32) -> Result<MetricDataQuery, ApiError> {
    let dimension = Dimension::builder()
        .name(&query.dimension_name)
        .value(&query.dimension_value)
        .build();

    let metric = Metric::builder()
        .namespace(&query.namespace)
        .metric_name(&query.metric_name)
        .dimensions(dimension)
        .build();

    let stat = MetricStat::builder()
        .metric(metric)
        .period(period_seconds)
        .stat(&query.stat)
        .build();

    Ok(MetricDataQuery::builder()
        .id(&query.id)
        .metric_stat(stat)
        .return_data(true)
        .build())
}

/// Appends one result page to the series accumulated under its id
fn merge_result(series: &mut HashMap<String, MetricSeries>, result: &MetricDataResult) {
    let Some(id) = result.id() else {
        return;
    };

    let entry = series.entry(id.to_string()).or_insert_with(|| MetricSeries {
        id: id.to_string(),
        label: result.label().map(str::to_string),
        ..MetricSeries::default()
    });

    // Keep the arrays aligned even if a timestamp fails to convert
    for (timestamp, value) in result.timestamps().iter().zip(result.values()) {
        if let Some(timestamp) = to_utc(timestamp) {
            entry.timestamps.push(timestamp);
            entry.values.push(*value);
        }
    }
}

#[async_trait]
impl MetricsApi for CloudWatchMetrics {
    async fn get_metric_data(
        &self,
        request: &MetricsRequest,
    ) -> Result<Vec<MetricSeries>, ApiError> {
        let queries = request
            .queries
            .iter()
            .map(|query| data_query(query, request.period_seconds))
            .collect::<Result<Vec<_>, _>>()?;

        let mut merged: HashMap<String, MetricSeries> = HashMap::new();
        let mut next_token = None;
        let mut pages = 0usize;

        loop {
            let page = self
                .client
                .get_metric_data()
                .set_metric_data_queries(Some(queries.clone()))
                .start_time(from_utc(request.start))
                .end_time(from_utc(request.end))
                .scan_by(ScanBy::TimestampAscending)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| ApiError::request(OPERATION, DisplayErrorContext(e).to_string()))?;

            pages += 1;
            for result in page.metric_data_results() {
                merge_result(&mut merged, result);
            }

            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        debug!(
            "{} returned {} series over {} page(s)",
            OPERATION,
            merged.len(),
            pages
        );

        // Answer in request order
        Ok(request
            .queries
            .iter()
            .filter_map(|query| merged.remove(&query.id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_cloudwatch::primitives::DateTime;

    fn query(id: &str) -> SeriesQuery {
        SeriesQuery {
            id: id.to_string(),
            namespace: "AWS/ECS".to_string(),
            metric_name: "CPUUtilization".to_string(),
            dimension_name: "ClusterName".to_string(),
            dimension_value: "prod".to_string(),
            stat: "Average".to_string(),
        }
    }

    #[test]
    fn test_data_query_carries_period_and_dimension() {
        let built = data_query(&query("cpuUtilization"), 300).unwrap();
        let rendered = format!("{:?}", built);

        assert!(rendered.contains("cpuUtilization"));
        assert!(rendered.contains("AWS/ECS"));
        assert!(rendered.contains("prod"));
        assert!(rendered.contains("300"));
    }

    #[test]
    fn test_merge_result_concatenates_pages() {
        let mut merged = HashMap::new();
        let page = |secs: i64, value: f64| {
            MetricDataResult::builder()
                .id("cpuUtilization")
                .label("CPUUtilization")
                .timestamps(DateTime::from_secs(secs))
                .values(value)
                .build()
        };

        merge_result(&mut merged, &page(1_710_000_000, 20.0));
        merge_result(&mut merged, &page(1_710_000_300, 25.0));

        let series = &merged["cpuUtilization"];
        assert_eq!(series.values, vec![20.0, 25.0]);
        assert_eq!(series.timestamps.len(), 2);
        assert_eq!(series.label.as_deref(), Some("CPUUtilization"));
    }
}
