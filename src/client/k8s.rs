//! Port for the Kubernetes API.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::node::Node;
use crate::core::pdb::PodDisruptionBudget;
use crate::core::pod::Pod;

#[derive(Debug, Error)]
pub enum K8sError {
    #[error("conflict updating {0}: stale resource version")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("kubernetes API throttled: {0}")]
    Throttled(String),
    #[error("kubernetes API error: {0}")]
    Api(String),
}

impl K8sError {
    pub fn is_throttle(&self) -> bool {
        matches!(self, K8sError::Throttled(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, K8sError::Conflict(_))
    }
}

#[async_trait]
pub trait K8sClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, K8sError>;

    /// Optimistic-concurrency write: the update is rejected with
    /// [`K8sError::Conflict`] when `metadata.resource_version` is stale.
    async fn update_node(&self, node: &Node) -> Result<Node, K8sError>;

    async fn list_nodes(&self) -> Result<Vec<Node>, K8sError>;

    /// Pods with `spec.node_name == node_name`, the field-selector scoped list.
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, K8sError>;

    async fn list_all_pods(&self) -> Result<Vec<Pod>, K8sError>;

    async fn list_pod_disruption_budgets(
        &self,
        namespace: &str,
    ) -> Result<Vec<PodDisruptionBudget>, K8sError>;
}
