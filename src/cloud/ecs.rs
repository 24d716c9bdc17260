// ECS inventory client
//
// Implements `InventoryApi` on top of the AWS SDK. List calls follow
// pagination tokens; describe calls are chunked to the per-call limits of
// the ECS API.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ecs::error::DisplayErrorContext;
use aws_sdk_ecs::types::{Cluster, Container, Service, Task};
use aws_sdk_ecs::Client;
use tracing::debug;

use super::{
    to_utc, ApiError, ClusterDescription, ContainerDescription, InventoryApi, ServiceDescription,
    TaskDescription,
};

/// DescribeClusters accepts at most 100 clusters per call
const DESCRIBE_CLUSTERS_LIMIT: usize = 100;

/// DescribeServices accepts at most 10 services per call
const DESCRIBE_SERVICES_LIMIT: usize = 10;

/// DescribeTasks accepts at most 100 tasks per call
const DESCRIBE_TASKS_LIMIT: usize = 100;

/// ECS control-plane client
pub struct EcsInventory {
    client: Client,
}

impl EcsInventory {
    /// Creates a client from a loaded AWS configuration
    pub fn new(config: &SdkConfig) -> Self {
        EcsInventory {
            client: Client::new(config),
        }
    }
}

fn api_error<E>(operation: &'static str, err: E) -> ApiError
where
    E: std::error::Error,
{
    ApiError::request(operation, DisplayErrorContext(err).to_string())
}

#[async_trait]
impl InventoryApi for EcsInventory {
    async fn list_clusters(&self) -> Result<Vec<String>, ApiError> {
        let mut arns = Vec::new();
        let mut next_token = None;

        loop {
            let page = self
                .client
                .list_clusters()
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| api_error("ListClusters", e))?;

            arns.extend(page.cluster_arns().iter().cloned());
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        debug!("ListClusters returned {} cluster(s)", arns.len());
        Ok(arns)
    }

    async fn describe_clusters(
        &self,
        cluster_arns: &[String],
    ) -> Result<Vec<ClusterDescription>, ApiError> {
        let mut clusters = Vec::with_capacity(cluster_arns.len());

        for chunk in cluster_arns.chunks(DESCRIBE_CLUSTERS_LIMIT) {
            let output = self
                .client
                .describe_clusters()
                .set_clusters(Some(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| api_error("DescribeClusters", e))?;

            clusters.extend(output.clusters().iter().filter_map(cluster_description));
        }

        Ok(clusters)
    }

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>, ApiError> {
        let mut arns = Vec::new();
        let mut next_token = None;

        loop {
            let page = self
                .client
                .list_services()
                .cluster(cluster)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| api_error("ListServices", e))?;

            arns.extend(page.service_arns().iter().cloned());
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        Ok(arns)
    }

    async fn describe_services(
        &self,
        cluster: &str,
        service_arns: &[String],
    ) -> Result<Vec<ServiceDescription>, ApiError> {
        let mut services = Vec::with_capacity(service_arns.len());

        for chunk in service_arns.chunks(DESCRIBE_SERVICES_LIMIT) {
            let output = self
                .client
                .describe_services()
                .cluster(cluster)
                .set_services(Some(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| api_error("DescribeServices", e))?;

            services.extend(output.services().iter().map(service_description));
        }

        Ok(services)
    }

    async fn list_tasks(&self, cluster: &str) -> Result<Vec<String>, ApiError> {
        let mut arns = Vec::new();
        let mut next_token = None;

        loop {
            let page = self
                .client
                .list_tasks()
                .cluster(cluster)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| api_error("ListTasks", e))?;

            arns.extend(page.task_arns().iter().cloned());
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        Ok(arns)
    }

    async fn describe_tasks(
        &self,
        cluster: &str,
        task_arns: &[String],
    ) -> Result<Vec<TaskDescription>, ApiError> {
        let mut tasks = Vec::with_capacity(task_arns.len());

        for chunk in task_arns.chunks(DESCRIBE_TASKS_LIMIT) {
            let output = self
                .client
                .describe_tasks()
                .cluster(cluster)
                .set_tasks(Some(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| api_error("DescribeTasks", e))?;

            tasks.extend(output.tasks().iter().map(task_description));
        }

        Ok(tasks)
    }
}

/// Clusters without a name cannot be addressed by later calls and are dropped
fn cluster_description(cluster: &Cluster) -> Option<ClusterDescription> {
    Some(ClusterDescription {
        cluster_name: cluster.cluster_name()?.to_string(),
        cluster_arn: cluster.cluster_arn().unwrap_or_default().to_string(),
        status: cluster.status().map(str::to_string),
        running_tasks_count: i64::from(cluster.running_tasks_count()),
        pending_tasks_count: i64::from(cluster.pending_tasks_count()),
        active_services_count: i64::from(cluster.active_services_count()),
        registered_container_instances_count: i64::from(
            cluster.registered_container_instances_count(),
        ),
    })
}

fn service_description(service: &Service) -> ServiceDescription {
    ServiceDescription {
        service_arn: service.service_arn().map(str::to_string),
        service_name: service.service_name().map(str::to_string),
        running_count: i64::from(service.running_count()),
        desired_count: i64::from(service.desired_count()),
        status: service.status().map(str::to_string),
        created_at: service.created_at().and_then(to_utc),
    }
}

fn task_description(task: &Task) -> TaskDescription {
    TaskDescription {
        task_arn: task.task_arn().map(str::to_string),
        task_definition_arn: task.task_definition_arn().map(str::to_string),
        last_status: task.last_status().map(str::to_string),
        desired_status: task.desired_status().map(str::to_string),
        created_at: task.created_at().and_then(to_utc),
        started_at: task.started_at().and_then(to_utc),
        containers: task.containers().iter().map(container_description).collect(),
    }
}

fn container_description(container: &Container) -> ContainerDescription {
    ContainerDescription {
        container_arn: container.container_arn().map(str::to_string),
        name: container.name().map(str::to_string),
        last_status: container.last_status().map(str::to_string),
        exit_code: container.exit_code(),
        reason: container.reason().map(str::to_string),
    }
}
