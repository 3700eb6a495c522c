//! Seam between the fleet syncer and the cluster API

use crate::k8s::types::{ClusterPod, PodEvent};
use crate::k8s::workload::TapperPlan;
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("cluster API request failed: {0}")]
    Api(String),

    #[error("permission denied: {0}")]
    Forbidden(String),

    #[error("{name} is owned by {owner}")]
    Conflict { name: String, owner: String },

    #[error("pod watch failed: {0}")]
    Watch(String),

    #[error("cluster API unavailable: {0}")]
    Unavailable(String),
}

impl ClusterError {
    /// Errors that will not go away by retrying
    pub fn is_irrecoverable(&self) -> bool {
        matches!(self, ClusterError::Forbidden(_) | ClusterError::Conflict { .. })
    }
}

pub type PodEventStream = BoxStream<'static, Result<PodEvent, ClusterError>>;

/// Operations the fleet syncer needs from the cluster
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Current pods in `namespaces`
    async fn list_pods(&self, namespaces: &[String]) -> Result<Vec<ClusterPod>, ClusterError>;

    /// Pod changes in `namespaces`; the stream ends when the watch is lost
    async fn watch_pods(&self, namespaces: &[String]) -> Result<PodEventStream, ClusterError>;

    /// Take ownership of the coordination object for `owner`.
    ///
    /// Fails with `Conflict` when another syncer already owns it.
    async fn claim_coordination(&self, owner: &str) -> Result<(), ClusterError>;

    /// Create or update the capture workloads for `plan`
    async fn apply_tapper(&self, owner: &str, plan: &TapperPlan) -> Result<(), ClusterError>;

    /// Remove the capture workloads; absent workloads are not an error
    async fn remove_tapper(&self, owner: &str) -> Result<(), ClusterError>;
}
