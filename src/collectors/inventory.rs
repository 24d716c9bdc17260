// Inventory collector
//
// Enumerates clusters, their services and their tasks, writing one snapshot
// row per observed resource. Cluster fetches within one call run concurrently
// and the first failure aborts the whole call.

use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::CollectorError;
use crate::cloud::{
    bounded, ClusterDescription, InventoryApi, ServiceDescription, TaskDescription,
};
use crate::storage::{ContainerSnapshot, ServiceSnapshot, Store, TaskSnapshot};

/// Status recorded when the control plane omits one
const UNKNOWN_STATUS: &str = "UNKNOWN";

/// A cluster together with the services observed in it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    #[serde(flatten)]
    pub cluster: ClusterDescription,
    pub services: Vec<ServiceDescription>,
}

/// Collects cluster inventory from the control plane
///
/// # Persistence
/// - One `ServiceSnapshot` per service carrying both a name and an ARN
/// - One `TaskSnapshot` per task carrying an ARN
/// - One `ContainerSnapshot` per container carrying both an ARN and a name
///
/// All rows written by one call share a single observation timestamp.
pub struct InventoryCollector {
    api: Arc<dyn InventoryApi>,
    store: Arc<dyn Store>,
    call_timeout: Duration,
}

impl InventoryCollector {
    /// Creates a new InventoryCollector
    ///
    /// # Arguments
    /// * `api` - Control-plane client
    /// * `store` - Store receiving snapshot rows
    /// * `call_timeout` - Upper bound for every individual API call
    pub fn new(api: Arc<dyn InventoryApi>, store: Arc<dyn Store>, call_timeout: Duration) -> Self {
        InventoryCollector {
            api,
            store,
            call_timeout,
        }
    }

    /// Lists every cluster with its services
    ///
    /// # Arguments
    /// * `persist` - Whether to append a `ServiceSnapshot` row per service
    ///
    /// # Returns
    /// * `Ok(Vec<ClusterView>)` - One view per cluster, empty when the account has none
    /// * `Err(CollectorError)` - The first failure of any cluster; remaining
    ///   in-flight cluster fetches are dropped
    pub async fn collect_inventory(&self, persist: bool) -> Result<Vec<ClusterView>, CollectorError> {
        let cluster_arns = bounded("ListClusters", self.call_timeout, self.api.list_clusters()).await?;

        if cluster_arns.is_empty() {
            info!("No clusters found");
            return Ok(Vec::new());
        }

        let clusters = bounded(
            "DescribeClusters",
            self.call_timeout,
            self.api.describe_clusters(&cluster_arns),
        )
        .await?;

        let observed_at = Utc::now();
        let views = try_join_all(
            clusters
                .into_iter()
                .map(|cluster| self.collect_cluster(cluster, persist, observed_at)),
        )
        .await?;

        info!(
            "Collected inventory for {} cluster(s), {} service(s)",
            views.len(),
            views.iter().map(|v| v.services.len()).sum::<usize>()
        );

        Ok(views)
    }

    async fn collect_cluster(
        &self,
        cluster: ClusterDescription,
        persist: bool,
        observed_at: DateTime<Utc>,
    ) -> Result<ClusterView, CollectorError> {
        let name = cluster.cluster_name.as_str();

        let service_arns = bounded(
            "ListServices",
            self.call_timeout,
            self.api.list_services(name),
        )
        .await?;

        let services = if service_arns.is_empty() {
            Vec::new()
        } else {
            bounded(
                "DescribeServices",
                self.call_timeout,
                self.api.describe_services(name, &service_arns),
            )
            .await?
        };

        if persist {
            for service in &services {
                self.persist_service(name, service, observed_at).await?;
            }
        }

        debug!("Cluster '{}' has {} service(s)", name, services.len());

        Ok(ClusterView { cluster, services })
    }

    async fn persist_service(
        &self,
        cluster: &str,
        service: &ServiceDescription,
        observed_at: DateTime<Utc>,
    ) -> Result<(), CollectorError> {
        let (Some(service_name), Some(service_arn)) = (&service.service_name, &service.service_arn)
        else {
            debug!("Skipping service without name or ARN in cluster '{}'", cluster);
            return Ok(());
        };

        let row = ServiceSnapshot {
            cluster: cluster.to_string(),
            service_name: service_name.clone(),
            service_arn: service_arn.clone(),
            running_count: service.running_count,
            desired_count: service.desired_count,
            status: service
                .status
                .clone()
                .unwrap_or_else(|| UNKNOWN_STATUS.to_string()),
            timestamp: observed_at,
        };

        self.store.insert_service(&row).await?;
        Ok(())
    }

    /// Lists and describes every task of one cluster
    ///
    /// # Arguments
    /// * `cluster` - Cluster name
    /// * `persist` - Whether to append task and container rows
    ///
    /// # Returns
    /// Tasks sorted newest first by creation time; tasks without a creation
    /// time sort last.
    ///
    /// # Consistency
    /// A task row and its container rows are separate inserts. An error part
    /// way through leaves the task with a subset of its containers.
    pub async fn collect_tasks(
        &self,
        cluster: &str,
        persist: bool,
    ) -> Result<Vec<TaskDescription>, CollectorError> {
        let task_arns = bounded("ListTasks", self.call_timeout, self.api.list_tasks(cluster)).await?;

        if task_arns.is_empty() {
            return Ok(Vec::new());
        }

        let mut tasks = bounded(
            "DescribeTasks",
            self.call_timeout,
            self.api.describe_tasks(cluster, &task_arns),
        )
        .await?;

        if persist {
            let observed_at = Utc::now();
            for task in &tasks {
                self.persist_task(cluster, task, observed_at).await?;
            }
        }

        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        debug!("Cluster '{}' has {} task(s)", cluster, tasks.len());
        Ok(tasks)
    }

    async fn persist_task(
        &self,
        cluster: &str,
        task: &TaskDescription,
        observed_at: DateTime<Utc>,
    ) -> Result<(), CollectorError> {
        let Some(task_arn) = &task.task_arn else {
            debug!("Skipping task without ARN in cluster '{}'", cluster);
            return Ok(());
        };

        let row = TaskSnapshot {
            id: None,
            cluster: cluster.to_string(),
            task_arn: task_arn.clone(),
            last_status: task
                .last_status
                .clone()
                .unwrap_or_else(|| UNKNOWN_STATUS.to_string()),
            desired_status: task
                .desired_status
                .clone()
                .unwrap_or_else(|| UNKNOWN_STATUS.to_string()),
            created_at: task.created_at,
            started_at: task.started_at,
            timestamp: observed_at,
        };

        let task_id = self.store.insert_task(&row).await?;

        for container in &task.containers {
            let (Some(container_arn), Some(name)) = (&container.container_arn, &container.name)
            else {
                continue;
            };

            let row = ContainerSnapshot {
                task_id,
                container_arn: container_arn.clone(),
                name: name.clone(),
                last_status: container
                    .last_status
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_STATUS.to_string()),
                exit_code: container.exit_code,
                reason: container.reason.clone(),
                timestamp: observed_at,
            };

            self.store.insert_container(&row).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{ApiError, ContainerDescription};
    use crate::storage::MemoryStore;
    use crate::testing::{service, task, FakeInventory};
    use chrono::TimeZone;

    fn collector(api: FakeInventory, store: Arc<MemoryStore>) -> InventoryCollector {
        InventoryCollector::new(Arc::new(api), store, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_no_clusters_is_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        let inventory = collector(FakeInventory::default(), store.clone());

        let views = inventory.collect_inventory(true).await.unwrap();

        assert!(views.is_empty());
        assert_eq!(store.row_counts().total(), 0);
    }

    #[tokio::test]
    async fn test_services_share_one_tick_timestamp() {
        let store = Arc::new(MemoryStore::new());
        let api = FakeInventory::default()
            .with_cluster("prod", vec![service("api"), service("worker")])
            .with_cluster("staging", vec![service("api")]);
        let inventory = collector(api, store.clone());

        let views = inventory.collect_inventory(true).await.unwrap();

        assert_eq!(views.len(), 2);
        assert_eq!(store.row_counts().services, 3);

        let prod = store.latest_service_snapshot("prod").await.unwrap();
        let staging = store.latest_service_snapshot("staging").await.unwrap();
        assert_eq!(prod.len(), 2);
        assert!(prod.iter().all(|s| s.timestamp == staging[0].timestamp));
    }

    #[tokio::test]
    async fn test_collect_without_persist_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let api = FakeInventory::default().with_cluster("prod", vec![service("api")]);
        let inventory = collector(api, store.clone());

        let views = inventory.collect_inventory(false).await.unwrap();

        assert_eq!(views[0].cluster.cluster_name, "prod");
        assert_eq!(views[0].services.len(), 1);
        assert_eq!(store.row_counts().total(), 0);
    }

    #[tokio::test]
    async fn test_services_missing_identity_are_not_persisted() {
        let store = Arc::new(MemoryStore::new());
        let mut nameless = service("ghost");
        nameless.service_name = None;
        let api = FakeInventory::default().with_cluster("prod", vec![service("api"), nameless]);
        let inventory = collector(api, store.clone());

        let views = inventory.collect_inventory(true).await.unwrap();

        assert_eq!(views[0].services.len(), 2);
        assert_eq!(store.row_counts().services, 1);
    }

    #[tokio::test]
    async fn test_one_failing_cluster_fails_the_call() {
        let store = Arc::new(MemoryStore::new());
        let api = FakeInventory::default()
            .with_cluster("prod", vec![service("api")])
            .with_cluster("broken", vec![service("api")])
            .failing_on("broken");
        let inventory = collector(api, store);

        let result = inventory.collect_inventory(true).await;

        assert!(matches!(
            result,
            Err(CollectorError::Api(ApiError::Request { operation: "ListServices", .. }))
        ));
    }

    #[tokio::test]
    async fn test_hung_call_times_out() {
        let store = Arc::new(MemoryStore::new());
        let api = FakeInventory::default()
            .with_cluster("prod", vec![service("api")])
            .hanging();
        let inventory = InventoryCollector::new(Arc::new(api), store, Duration::from_millis(20));

        let result = inventory.collect_inventory(true).await;

        assert!(matches!(
            result,
            Err(CollectorError::Api(ApiError::Timeout { operation: "ListClusters", .. }))
        ));
    }

    #[tokio::test]
    async fn test_collect_tasks_persists_tasks_and_containers() {
        let store = Arc::new(MemoryStore::new());
        let early = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap();

        let mut first = task("arn:task/first", Some(early));
        first.containers = vec![
            ContainerDescription {
                container_arn: Some("arn:container/web".to_string()),
                name: Some("web".to_string()),
                last_status: Some("STOPPED".to_string()),
                exit_code: Some(1),
                reason: Some("Essential container exited".to_string()),
            },
            // No ARN: skipped
            ContainerDescription {
                name: Some("pending".to_string()),
                ..ContainerDescription::default()
            },
        ];
        let second = task("arn:task/second", Some(late));
        let mut anonymous = task("unused", None);
        anonymous.task_arn = None;

        let api = FakeInventory::default()
            .with_cluster("prod", vec![])
            .with_tasks("prod", vec![first, second, anonymous]);
        let inventory = collector(api, store.clone());

        let tasks = inventory.collect_tasks("prod", true).await.unwrap();

        let arns: Vec<Option<&str>> = tasks.iter().map(|t| t.task_arn.as_deref()).collect();
        assert_eq!(
            arns,
            vec![Some("arn:task/second"), Some("arn:task/first"), None]
        );

        let counts = store.row_counts();
        assert_eq!(counts.tasks, 2);
        assert_eq!(counts.containers, 1);

        let stored = store.recent_tasks("prod", 10).await.unwrap();
        let first_row = stored.iter().find(|t| t.task_arn == "arn:task/first").unwrap();
        let merged = store
            .task_with_containers(first_row.id.as_ref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.containers.len(), 1);
        assert_eq!(merged.containers[0].exit_code, Some(1));
        assert_eq!(merged.containers[0].timestamp, first_row.timestamp);
    }

    #[tokio::test]
    async fn test_collect_tasks_empty_cluster() {
        let store = Arc::new(MemoryStore::new());
        let api = FakeInventory::default().with_cluster("prod", vec![]);
        let inventory = collector(api, store.clone());

        assert!(inventory.collect_tasks("prod", true).await.unwrap().is_empty());
        assert_eq!(store.row_counts().total(), 0);
    }
}
