// Collectors module - turns control-plane and metrics API responses into rows
//
// Both collectors receive their API client and the store explicitly, wrap
// every external call in a bounded-time operation, and only ever append to
// the store.

use thiserror::Error;

use crate::cloud::ApiError;
use crate::storage::StorageError;

pub mod inventory;
pub mod metrics;

pub use inventory::{ClusterView, InventoryCollector};
pub use metrics::{MetricCollector, MetricsWindow};

/// Errors that abort one collection unit of work
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("External API error: {0}")]
    Api(#[from] ApiError),

    #[error("Persistence error: {0}")]
    Storage(#[from] StorageError),
}
