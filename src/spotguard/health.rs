//! One-shot comprehensive ASG + node health check with stability tracking.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use thiserror::Error;

use crate::client::asg::{AsgClient, AsgError};
use crate::client::k8s::{K8sClient, K8sError};

#[derive(Debug, Error)]
pub enum HealthCheckError {
    #[error("failed to describe auto scaling group: {0}")]
    DescribeFailed(#[source] AsgError),
    #[error("failed to list nodes: {0}")]
    ListFailed(#[source] K8sError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    /// Healthy InService instance count reached desired capacity.
    pub asg_healthy: bool,
    /// At least one cluster node matched the group and all matched nodes are
    /// schedulable and Ready.
    pub nodes_ready: bool,
    /// Both of the above held continuously for the stability duration.
    pub stable: bool,
    /// Start of the current unbroken healthy streak. None while unhealthy.
    pub healthy_since: Option<DateTime<Utc>>,
    /// Instance ids reported by the group.
    pub instance_ids: Vec<String>,
}

impl HealthStatus {
    fn unhealthy() -> Self {
        Self {
            asg_healthy: false,
            nodes_ready: false,
            stable: false,
            healthy_since: None,
            instance_ids: vec![],
        }
    }

    pub fn is_fully_healthy(&self) -> bool {
        self.asg_healthy && self.nodes_ready
    }
}

pub struct HealthEvaluator {
    asg: Arc<dyn AsgClient>,
    k8s: Arc<dyn K8sClient>,
}

impl HealthEvaluator {
    pub fn new(asg: Arc<dyn AsgClient>, k8s: Arc<dyn K8sClient>) -> Self {
        Self { asg, k8s }
    }

    /// One describe call to the ASG, one node list to Kubernetes. Nodes are
    /// matched to the group through `spec.provider_id`, which works on any
    /// distribution; labels are not consulted. The stability timer carried in
    /// `previous_healthy_since` resets the moment either sub-check dips.
    ///
    /// Throttle errors yield an unhealthy status without an error so that the
    /// caller simply retries on its next tick.
    pub async fn check_comprehensive(
        &self,
        asg_name: &str,
        stability_duration: Duration,
        previous_healthy_since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<HealthStatus, HealthCheckError> {
        let group = match self.asg.describe_group(asg_name).await {
            Ok(group) => group,
            Err(e) if e.is_throttle() => {
                warn!("asg {}: describe throttled, treating as unhealthy: {}", asg_name, e);
                return Ok(HealthStatus::unhealthy());
            }
            Err(e) => return Err(HealthCheckError::DescribeFailed(e)),
        };

        let instance_ids: Vec<String> = group
            .instances
            .iter()
            .map(|instance| instance.instance_id.clone())
            .collect();
        let counted = group.healthy_in_service_instance_ids();
        let asg_healthy = counted.len() as u32 >= group.desired_capacity;

        let nodes = match self.k8s.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) if e.is_throttle() => {
                warn!("asg {}: node list throttled, treating as unhealthy: {}", asg_name, e);
                return Ok(HealthStatus::unhealthy());
            }
            Err(e) => return Err(HealthCheckError::ListFailed(e)),
        };

        let group_instances: HashSet<&str> = instance_ids.iter().map(|id| id.as_str()).collect();
        let matched: Vec<_> = nodes
            .iter()
            .filter(|node| {
                node.instance_id()
                    .map(|id| group_instances.contains(id))
                    .unwrap_or(false)
            })
            .collect();
        let nodes_ready = !matched.is_empty()
            && matched
                .iter()
                .all(|node| !node.spec.unschedulable && node.is_ready());

        let (healthy_since, stable) = if asg_healthy && nodes_ready {
            match previous_healthy_since {
                None => (Some(now), false),
                Some(since) => (Some(since), now - since >= stability_duration),
            }
        } else {
            (None, false)
        };

        debug!(
            "asg {}: healthy={} ({}/{} instances), nodes_ready={} ({} matched), stable={}",
            asg_name,
            asg_healthy,
            counted.len(),
            group.desired_capacity,
            nodes_ready,
            matched.len(),
            stable
        );

        Ok(HealthStatus {
            asg_healthy,
            nodes_ready,
            stable,
            healthy_since,
            instance_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    use crate::core::node::Node;
    use crate::sim::cluster::SimCluster;

    fn healthy_cluster() -> Arc<SimCluster> {
        let cluster = SimCluster::new();
        cluster.add_asg("spot-workers", 2, 0, 5);
        cluster.add_asg_instance("spot-workers", "i-1");
        cluster.add_asg_instance("spot-workers", "i-2");
        cluster.add_node(
            Node::new("spot-node-1".to_string(), 4000, 8589934592)
                .with_provider_id("aws:///us-west-2a/i-1"),
        );
        cluster.add_node(
            Node::new("spot-node-2".to_string(), 4000, 8589934592)
                .with_provider_id("aws:///us-west-2b/i-2"),
        );
        cluster
    }

    #[tokio::test]
    async fn test_streak_starts_unstable_then_stabilizes() {
        let cluster = healthy_cluster();
        let evaluator = HealthEvaluator::new(cluster.asg_client(), cluster.k8s_client());
        let stability = Duration::minutes(2);
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let status = evaluator
            .check_comprehensive("spot-workers", stability, None, t0)
            .await
            .unwrap();
        assert!(status.is_fully_healthy());
        assert!(!status.stable);
        assert_eq!(status.healthy_since, Some(t0));

        // Exactly at the stability boundary the status flips to stable.
        let status = evaluator
            .check_comprehensive("spot-workers", stability, status.healthy_since, t0 + stability)
            .await
            .unwrap();
        assert!(status.stable);
        assert_eq!(status.healthy_since, Some(t0));
    }

    #[tokio::test]
    async fn test_dip_resets_the_stability_timer() {
        let cluster = healthy_cluster();
        let evaluator = HealthEvaluator::new(cluster.asg_client(), cluster.k8s_client());
        let stability = Duration::minutes(2);
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let status = evaluator
            .check_comprehensive("spot-workers", stability, None, t0)
            .await
            .unwrap();
        assert_eq!(status.healthy_since, Some(t0));

        // One node turns not-ready: the streak is gone.
        cluster.set_node_ready("spot-node-2", false);
        let status = evaluator
            .check_comprehensive(
                "spot-workers",
                stability,
                status.healthy_since,
                t0 + Duration::minutes(1),
            )
            .await
            .unwrap();
        assert!(!status.nodes_ready);
        assert_eq!(status.healthy_since, None);

        // Recovery starts a fresh streak from the recovery time.
        cluster.set_node_ready("spot-node-2", true);
        let status = evaluator
            .check_comprehensive(
                "spot-workers",
                stability,
                status.healthy_since,
                t0 + Duration::minutes(3),
            )
            .await
            .unwrap();
        assert_eq!(status.healthy_since, Some(t0 + Duration::minutes(3)));
        assert!(!status.stable);
    }

    #[tokio::test]
    async fn test_asg_below_desired_is_unhealthy() {
        let cluster = healthy_cluster();
        cluster.set_asg_desired("spot-workers", 3);
        let evaluator = HealthEvaluator::new(cluster.asg_client(), cluster.k8s_client());
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let status = evaluator
            .check_comprehensive("spot-workers", Duration::minutes(2), None, t0)
            .await
            .unwrap();
        assert!(!status.asg_healthy);
        assert!(!status.stable);
    }

    #[tokio::test]
    async fn test_cordoned_node_breaks_readiness() {
        let cluster = healthy_cluster();
        cluster.set_node_unschedulable("spot-node-1", true);
        let evaluator = HealthEvaluator::new(cluster.asg_client(), cluster.k8s_client());
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let status = evaluator
            .check_comprehensive("spot-workers", Duration::minutes(2), None, t0)
            .await
            .unwrap();
        assert!(status.asg_healthy);
        assert!(!status.nodes_ready);
    }

    #[tokio::test]
    async fn test_no_matched_nodes_is_not_ready() {
        let cluster = SimCluster::new();
        cluster.add_asg("spot-workers", 0, 0, 5);
        let evaluator = HealthEvaluator::new(cluster.asg_client(), cluster.k8s_client());
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let status = evaluator
            .check_comprehensive("spot-workers", Duration::minutes(2), None, t0)
            .await
            .unwrap();
        // Zero desired makes the group trivially healthy, but an empty
        // matched set never counts as ready.
        assert!(status.asg_healthy);
        assert!(!status.nodes_ready);
    }

    #[tokio::test]
    async fn test_throttle_yields_unhealthy_without_error() {
        let cluster = healthy_cluster();
        cluster.throttle_next_asg_calls(1);
        let evaluator = HealthEvaluator::new(cluster.asg_client(), cluster.k8s_client());
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let status = evaluator
            .check_comprehensive("spot-workers", Duration::minutes(2), None, t0)
            .await
            .unwrap();
        assert!(!status.asg_healthy);
        assert_eq!(status.healthy_since, None);
    }
}
