//! Drain safety checks: pod reschedulability, PDB compliance and the
//! post-drain cluster utilization ceiling.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::client::k8s::{K8sClient, K8sError};
use crate::core::node::Node;
use crate::core::pdb::PodDisruptionBudget;
use crate::core::pod::Pod;

#[derive(Debug, Clone, PartialEq)]
pub enum DrainBlocker {
    /// No other ready, schedulable node can host the pod's requests.
    PodNotReschedulable { pod: String },
    /// Evicting the pod would violate a PodDisruptionBudget.
    PdbViolation { pdb: String, pod: String },
    /// Cluster utilization after removing the node would exceed the limit.
    UtilizationExceeded { projected: f64, limit: f64 },
}

impl DrainBlocker {
    pub fn is_utilization(&self) -> bool {
        matches!(self, DrainBlocker::UtilizationExceeded { .. })
    }
}

impl std::fmt::Display for DrainBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrainBlocker::PodNotReschedulable { pod } => {
                write!(f, "pod {} has no other node fitting its requests", pod)
            }
            DrainBlocker::PdbViolation { pdb, pod } => {
                write!(f, "evicting pod {} would violate PDB {}", pod, pdb)
            }
            DrainBlocker::UtilizationExceeded { projected, limit } => write!(
                f,
                "utilization after drain would exceed limit: {:.1}% > {:.1}%",
                projected, limit
            ),
        }
    }
}

pub struct SafetyEvaluator {
    k8s: Arc<dyn K8sClient>,
}

impl SafetyEvaluator {
    pub fn new(k8s: Arc<dyn K8sClient>) -> Self {
        Self { k8s }
    }

    /// Checks run in order and short-circuit on the first blocker:
    /// pod fit, then PDBs, then the utilization buffer. Returns None when the
    /// node can be drained under the given utilization ceiling (percent).
    pub async fn can_safely_drain(
        &self,
        node_name: &str,
        max_utilization: f64,
    ) -> Result<Option<DrainBlocker>, K8sError> {
        let pods_on_node = self.k8s.list_pods_on_node(node_name).await?;
        let nodes = self.k8s.list_nodes().await?;

        let evictable: Vec<&Pod> = pods_on_node
            .iter()
            .filter(|pod| !pod.is_daemon_set() && !pod.is_terminating())
            .collect();

        for pod in &evictable {
            if !can_reschedule(pod, &nodes, node_name) {
                return Ok(Some(DrainBlocker::PodNotReschedulable {
                    pod: pod.metadata.name.clone(),
                }));
            }
        }

        let mut pdbs_by_namespace: HashMap<String, Vec<PodDisruptionBudget>> = HashMap::new();
        for pod in &evictable {
            let namespace = &pod.metadata.namespace;
            if !pdbs_by_namespace.contains_key(namespace) {
                // PDB lookups that error out count as "no PDB": blocking on a
                // listing race would leave on-demand nodes running forever.
                let pdbs = match self.k8s.list_pod_disruption_budgets(namespace).await {
                    Ok(pdbs) => pdbs,
                    Err(e) => {
                        warn!(
                            "namespace {}: PDB list failed, treating as no PDB: {}",
                            namespace, e
                        );
                        vec![]
                    }
                };
                pdbs_by_namespace.insert(namespace.clone(), pdbs);
            }
            for pdb in &pdbs_by_namespace[namespace] {
                if pdb.matches_pod(pod) && pdb.status.disruptions_allowed <= 0 {
                    return Ok(Some(DrainBlocker::PdbViolation {
                        pdb: pdb.metadata.name.clone(),
                        pod: pod.metadata.name.clone(),
                    }));
                }
            }
        }

        let all_pods = self.k8s.list_all_pods().await?;
        let projected = utilization_without_node(&all_pods, &nodes, node_name);
        if projected > max_utilization {
            return Ok(Some(DrainBlocker::UtilizationExceeded {
                projected,
                limit: max_utilization,
            }));
        }

        debug!(
            "node {}: drain is safe, projected utilization {:.1}% <= {:.1}%",
            node_name, projected, max_utilization
        );
        Ok(None)
    }

    /// Utilization of the cluster as it stands, in percent. Conservatively
    /// reports 100.0 when the API cannot be consulted.
    pub async fn cluster_utilization(&self) -> f64 {
        let pods = match self.k8s.list_all_pods().await {
            Ok(pods) => pods,
            Err(e) => {
                warn!("cluster utilization unavailable, assuming 100%: {}", e);
                return 100.0;
            }
        };
        let nodes = match self.k8s.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("cluster utilization unavailable, assuming 100%: {}", e);
                return 100.0;
            }
        };
        utilization_without_node(&pods, &nodes, "")
    }
}

fn can_reschedule(pod: &Pod, nodes: &[Node], draining_node: &str) -> bool {
    nodes.iter().any(|node| {
        node.metadata.name != draining_node
            && node.is_ready()
            && !node.spec.unschedulable
            && pod.spec.resources.requests.fits_into(&node.status.allocatable)
    })
}

/// Max of CPU and memory utilization in percent, with the named node's
/// allocatable removed from the denominator. An empty name projects against
/// the whole cluster. A denominator of zero reports as fully utilized.
fn utilization_without_node(pods: &[Pod], nodes: &[Node], excluded_node: &str) -> f64 {
    let mut used_cpu: f64 = 0.0;
    let mut used_ram: f64 = 0.0;
    for pod in pods {
        if !pod.is_running() {
            continue;
        }
        used_cpu += pod.spec.resources.requests.cpu as f64;
        used_ram += pod.spec.resources.requests.ram as f64;
    }

    let mut total_cpu: f64 = 0.0;
    let mut total_ram: f64 = 0.0;
    for node in nodes {
        if !node.is_ready() || node.metadata.name == excluded_node {
            continue;
        }
        total_cpu += node.status.allocatable.cpu as f64;
        total_ram += node.status.allocatable.ram as f64;
    }

    if total_cpu <= 0.0 || total_ram <= 0.0 {
        return 100.0;
    }
    let cpu_pct = used_cpu / total_cpu * 100.0;
    let ram_pct = used_ram / total_ram * 100.0;
    cpu_pct.max(ram_pct)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::sim::cluster::SimCluster;

    // Two 4-core/8GiB nodes plus the on-demand node under evaluation.
    fn cluster_with_spare_room() -> Arc<SimCluster> {
        let cluster = SimCluster::new();
        cluster.add_node(Node::new("spot-node-1".to_string(), 4000, 8589934592));
        cluster.add_node(Node::new("spot-node-2".to_string(), 4000, 8589934592));
        cluster.add_node(Node::new("od-node-1".to_string(), 4000, 8589934592));
        cluster
    }

    #[tokio::test]
    async fn test_drain_safe_when_pods_fit_elsewhere() {
        let cluster = cluster_with_spare_room();
        cluster.add_pod(Pod::new("web-1".to_string(), 1000, 1073741824).on_node("od-node-1"));
        let evaluator = SafetyEvaluator::new(cluster.k8s_client());

        let blocker = evaluator.can_safely_drain("od-node-1", 75.0).await.unwrap();
        assert_eq!(blocker, None);
    }

    #[tokio::test]
    async fn test_unreschedulable_pod_blocks_drain() {
        let cluster = cluster_with_spare_room();
        // Requests exceed any single other node's allocatable.
        cluster.add_pod(Pod::new("big-1".to_string(), 6000, 1073741824).on_node("od-node-1"));
        let evaluator = SafetyEvaluator::new(cluster.k8s_client());

        let blocker = evaluator.can_safely_drain("od-node-1", 75.0).await.unwrap();
        assert_eq!(
            blocker,
            Some(DrainBlocker::PodNotReschedulable {
                pod: "big-1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_daemonset_and_terminating_pods_are_ignored() {
        let cluster = cluster_with_spare_room();
        cluster.add_pod(
            Pod::new("ds-1".to_string(), 6000, 1073741824)
                .on_node("od-node-1")
                .owned_by("DaemonSet"),
        );
        let mut leaving = Pod::new("old-1".to_string(), 6000, 1073741824).on_node("od-node-1");
        leaving.metadata.deletion_timestamp = Some(chrono::Utc::now());
        cluster.add_pod(leaving);
        let evaluator = SafetyEvaluator::new(cluster.k8s_client());

        let blocker = evaluator.can_safely_drain("od-node-1", 75.0).await.unwrap();
        assert_eq!(blocker, None);
    }

    #[tokio::test]
    async fn test_exhausted_pdb_blocks_drain() {
        let cluster = cluster_with_spare_room();
        cluster.add_pod(
            Pod::new("web-1".to_string(), 500, 1073741824)
                .on_node("od-node-1")
                .with_label("app", "web"),
        );
        cluster.add_pdb(PodDisruptionBudget::new("web-pdb", "default", 0).selecting("app", "web"));
        let evaluator = SafetyEvaluator::new(cluster.k8s_client());

        let blocker = evaluator.can_safely_drain("od-node-1", 75.0).await.unwrap();
        assert_eq!(
            blocker,
            Some(DrainBlocker::PdbViolation {
                pdb: "web-pdb".to_string(),
                pod: "web-1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_pdb_list_failure_is_permissive() {
        let cluster = cluster_with_spare_room();
        cluster.add_pod(Pod::new("web-1".to_string(), 500, 1073741824).on_node("od-node-1"));
        cluster.fail_pdb_lists(true);
        let evaluator = SafetyEvaluator::new(cluster.k8s_client());

        let blocker = evaluator.can_safely_drain("od-node-1", 75.0).await.unwrap();
        assert_eq!(blocker, None);
    }

    #[tokio::test]
    async fn test_utilization_after_drain_blocks() {
        let cluster = cluster_with_spare_room();
        // 6000m across the cluster: 50% of 12 cores now, 75%+ of the 8 cores
        // left once od-node-1 is taken out.
        cluster.add_pod(Pod::new("w-1".to_string(), 3000, 1073741824).on_node("spot-node-1"));
        cluster.add_pod(Pod::new("w-2".to_string(), 3000, 1073741824).on_node("spot-node-2"));
        let evaluator = SafetyEvaluator::new(cluster.k8s_client());

        let blocker = evaluator.can_safely_drain("od-node-1", 70.0).await.unwrap();
        match blocker {
            Some(DrainBlocker::UtilizationExceeded { projected, limit }) => {
                assert!((projected - 75.0).abs() < 0.01);
                assert_eq!(limit, 70.0);
            }
            other => panic!("expected utilization blocker, got {:?}", other),
        }

        // The same projection passes under a relaxed ceiling.
        let blocker = evaluator.can_safely_drain("od-node-1", 80.0).await.unwrap();
        assert_eq!(blocker, None);
    }

    #[tokio::test]
    async fn test_current_utilization_and_error_bias() {
        let cluster = cluster_with_spare_room();
        cluster.add_pod(Pod::new("w-1".to_string(), 6000, 1073741824).on_node("spot-node-1"));
        let evaluator = SafetyEvaluator::new(cluster.k8s_client());
        let utilization = evaluator.cluster_utilization().await;
        assert!((utilization - 50.0).abs() < 0.01);

        let empty = SimCluster::new();
        let evaluator = SafetyEvaluator::new(empty.k8s_client());
        // No ready nodes at all reads as a full cluster.
        assert_eq!(evaluator.cluster_utilization().await, 100.0);
    }
}
