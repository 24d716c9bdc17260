// In-process fakes for the external collaborators used across test modules

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cloud::{
    ApiError, ClusterDescription, InventoryApi, MetricSeries, MetricsApi, MetricsRequest,
    ServiceDescription, TaskDescription,
};
use crate::report::render::{RenderError, RenderSession, Renderer};

const ARN_PREFIX: &str = "arn:aws:ecs:us-east-1:123456789012";

pub fn cluster_arn(name: &str) -> String {
    format!("{}:cluster/{}", ARN_PREFIX, name)
}

pub fn service(name: &str) -> ServiceDescription {
    ServiceDescription {
        service_arn: Some(format!("{}:service/{}", ARN_PREFIX, name)),
        service_name: Some(name.to_string()),
        running_count: 2,
        desired_count: 2,
        status: Some("ACTIVE".to_string()),
        created_at: None,
    }
}

pub fn task(arn: &str, created_at: Option<DateTime<Utc>>) -> TaskDescription {
    TaskDescription {
        task_arn: Some(arn.to_string()),
        last_status: Some("RUNNING".to_string()),
        desired_status: Some("RUNNING".to_string()),
        created_at,
        started_at: created_at,
        ..TaskDescription::default()
    }
}

/// Control plane serving a fixed set of clusters
#[derive(Default)]
pub struct FakeInventory {
    clusters: Vec<(String, Vec<ServiceDescription>)>,
    tasks: HashMap<String, Vec<TaskDescription>>,
    failing: HashSet<String>,
    hanging: bool,
}

impl FakeInventory {
    pub fn with_cluster(mut self, name: &str, services: Vec<ServiceDescription>) -> Self {
        self.clusters.push((name.to_string(), services));
        self
    }

    pub fn with_tasks(mut self, cluster: &str, tasks: Vec<TaskDescription>) -> Self {
        self.tasks.insert(cluster.to_string(), tasks);
        self
    }

    /// Per-cluster calls for `cluster` fail
    pub fn failing_on(mut self, cluster: &str) -> Self {
        self.failing.insert(cluster.to_string());
        self
    }

    /// `list_clusters` never completes
    pub fn hanging(mut self) -> Self {
        self.hanging = true;
        self
    }

    fn services_of(&self, cluster: &str) -> Vec<ServiceDescription> {
        self.clusters
            .iter()
            .find(|(name, _)| name == cluster)
            .map(|(_, services)| services.clone())
            .unwrap_or_default()
    }

    fn check(&self, operation: &'static str, cluster: &str) -> Result<(), ApiError> {
        if self.failing.contains(cluster) {
            return Err(ApiError::request(operation, "AccessDeniedException"));
        }
        Ok(())
    }
}

#[async_trait]
impl InventoryApi for FakeInventory {
    async fn list_clusters(&self) -> Result<Vec<String>, ApiError> {
        if self.hanging {
            std::future::pending::<()>().await;
        }
        Ok(self.clusters.iter().map(|(name, _)| cluster_arn(name)).collect())
    }

    async fn describe_clusters(
        &self,
        cluster_arns: &[String],
    ) -> Result<Vec<ClusterDescription>, ApiError> {
        Ok(cluster_arns
            .iter()
            .filter_map(|arn| {
                let name = arn.rsplit('/').next()?;
                let services = self.services_of(name);
                Some(ClusterDescription {
                    cluster_name: name.to_string(),
                    cluster_arn: arn.clone(),
                    status: Some("ACTIVE".to_string()),
                    running_tasks_count: self.tasks.get(name).map_or(0, |t| t.len() as i64),
                    pending_tasks_count: 0,
                    active_services_count: services.len() as i64,
                    registered_container_instances_count: 1,
                })
            })
            .collect())
    }

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>, ApiError> {
        self.check("ListServices", cluster)?;
        Ok(self
            .services_of(cluster)
            .iter()
            .enumerate()
            .map(|(i, s)| s.service_arn.clone().unwrap_or_else(|| format!("service-{}", i)))
            .collect())
    }

    async fn describe_services(
        &self,
        cluster: &str,
        _service_arns: &[String],
    ) -> Result<Vec<ServiceDescription>, ApiError> {
        self.check("DescribeServices", cluster)?;
        Ok(self.services_of(cluster))
    }

    async fn list_tasks(&self, cluster: &str) -> Result<Vec<String>, ApiError> {
        self.check("ListTasks", cluster)?;
        Ok(self
            .tasks
            .get(cluster)
            .map(|tasks| {
                tasks
                    .iter()
                    .enumerate()
                    .map(|(i, t)| t.task_arn.clone().unwrap_or_else(|| format!("task-{}", i)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn describe_tasks(
        &self,
        cluster: &str,
        _task_arns: &[String],
    ) -> Result<Vec<TaskDescription>, ApiError> {
        self.check("DescribeTasks", cluster)?;
        Ok(self.tasks.get(cluster).cloned().unwrap_or_default())
    }
}

/// Metrics API answering from canned series
#[derive(Default)]
pub struct FakeMetrics {
    series: HashMap<String, Vec<MetricSeries>>,
    failing: HashSet<String>,
    requests: Mutex<Vec<String>>,
}

impl FakeMetrics {
    /// Adds a series for `cluster` with one value every five minutes from `start`
    pub fn with_series(mut self, cluster: &str, id: &str, start: DateTime<Utc>, values: &[f64]) -> Self {
        let timestamps = (0..values.len())
            .map(|i| start + ChronoDuration::minutes(5 * i as i64))
            .collect();
        self.series
            .entry(cluster.to_string())
            .or_default()
            .push(MetricSeries {
                id: id.to_string(),
                label: Some(id.to_string()),
                timestamps,
                values: values.to_vec(),
            });
        self
    }

    pub fn failing_on(mut self, cluster: &str) -> Self {
        self.failing.insert(cluster.to_string());
        self
    }

    /// Clusters queried so far, in call order
    pub fn requested(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MetricsApi for FakeMetrics {
    async fn get_metric_data(&self, request: &MetricsRequest) -> Result<Vec<MetricSeries>, ApiError> {
        let cluster = request
            .queries
            .first()
            .map(|q| q.dimension_value.clone())
            .unwrap_or_default();

        if let Ok(mut requests) = self.requests.lock() {
            requests.push(cluster.clone());
        }

        if self.failing.contains(&cluster) {
            return Err(ApiError::request("GetMetricData", "Throttling"));
        }

        let ids: HashSet<&str> = request.queries.iter().map(|q| q.id.as_str()).collect();
        Ok(self
            .series
            .get(&cluster)
            .map(|all| {
                all.iter()
                    .filter(|s| ids.contains(s.id.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// How sessions opened by a `RecordingRenderer` behave
#[derive(Debug, Clone, PartialEq)]
pub enum RendererBehavior {
    Succeed,
    /// `wait_ready` fails for every document
    FailCapture,
    /// `wait_ready` fails for documents whose path contains the pattern
    FailFor(String),
    /// `wait_ready` never completes
    Hang,
}

/// Renderer writing placeholder artifacts and counting session lifecycle
pub struct RecordingRenderer {
    behavior: RendererBehavior,
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl RecordingRenderer {
    pub fn new(behavior: RendererBehavior) -> Self {
        RecordingRenderer {
            behavior,
            opened: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for RecordingRenderer {
    async fn open(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingSession {
            behavior: self.behavior.clone(),
            released: Arc::clone(&self.released),
            document: None,
        }))
    }
}

struct RecordingSession {
    behavior: RendererBehavior,
    released: Arc<AtomicUsize>,
    document: Option<PathBuf>,
}

#[async_trait]
impl RenderSession for RecordingSession {
    async fn load(&mut self, document: &Path) -> Result<(), RenderError> {
        self.document = Some(document.to_path_buf());
        Ok(())
    }

    async fn wait_ready(&mut self, _selectors: &[&str]) -> Result<(), RenderError> {
        let document = self.document.as_ref().ok_or(RenderError::NoDocument)?;
        match &self.behavior {
            RendererBehavior::Succeed => Ok(()),
            RendererBehavior::FailCapture => Err(RenderError::NotReady("stub failure".to_string())),
            RendererBehavior::FailFor(pattern) => {
                if document.to_string_lossy().contains(pattern.as_str()) {
                    Err(RenderError::NotReady(format!("stub failure for {}", pattern)))
                } else {
                    Ok(())
                }
            }
            RendererBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn capture_region(&mut self, _selector: &str, output: &Path) -> Result<(), RenderError> {
        tokio::fs::write(output, b"\x89PNG").await?;
        Ok(())
    }

    async fn capture_pdf(&mut self, output: &Path) -> Result<(), RenderError> {
        tokio::fs::write(output, b"%PDF-1.4").await?;
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), RenderError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
