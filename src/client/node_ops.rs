//! Port for the pre-existing generic node drain routines. The agent invokes
//! them; their implementation (eviction API calls, grace periods) lives with
//! the other termination-event handlers.

use std::time::Duration;

use async_trait::async_trait;

use crate::client::k8s::K8sError;

#[async_trait]
pub trait NodeOps: Send + Sync {
    async fn cordon(&self, node_name: &str) -> Result<(), K8sError>;

    /// Cordon-then-evict. Honors PDBs and termination grace periods within
    /// the given budget.
    async fn drain(&self, node_name: &str, timeout: Duration) -> Result<(), K8sError>;
}
