//! Classifies the agent's own node as spot or on-demand.

use std::sync::Arc;

use log::{debug, warn};

use crate::client::asg::AsgClient;
use crate::client::k8s::K8sClient;
use crate::client::metadata::InstanceMetadata;

/// Distribution-specific labels carrying the capacity class, tried in order
/// when ASG membership cannot be resolved.
const CAPACITY_TYPE_LABELS: &[&str] = &[
    "karpenter.sh/capacity-type",
    "eks.amazonaws.com/capacityType",
    "node.kubernetes.io/lifecycle",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLineage {
    Spot,
    OnDemand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionMethod {
    AsgMembership,
    CapacityTypeLabel,
    /// Both methods failed; the conservative spot default applies. A wrong
    /// "spot" answer wastes some on-demand cost, a wrong "on-demand" answer
    /// would let the agent retire a node it must not touch.
    DefaultOnError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub lineage: NodeLineage,
    pub method: DetectionMethod,
}

pub struct NodeDetector {
    metadata: Arc<dyn InstanceMetadata>,
    asg: Arc<dyn AsgClient>,
    k8s: Arc<dyn K8sClient>,
    on_demand_asg_name: String,
}

impl NodeDetector {
    pub fn new(
        metadata: Arc<dyn InstanceMetadata>,
        asg: Arc<dyn AsgClient>,
        k8s: Arc<dyn K8sClient>,
        on_demand_asg_name: &str,
    ) -> Self {
        Self {
            metadata,
            asg,
            k8s,
            on_demand_asg_name: on_demand_asg_name.to_string(),
        }
    }

    pub async fn detect(&self, node_name: &str) -> Detection {
        match self.detect_by_asg_membership().await {
            Ok(detection) => return detection,
            Err(reason) => {
                debug!("node {}: ASG membership detection failed: {}", node_name, reason);
            }
        }
        match self.detect_by_capacity_label(node_name).await {
            Ok(detection) => detection,
            Err(reason) => {
                warn!(
                    "node {}: lineage detection failed, defaulting to spot: {}",
                    node_name, reason
                );
                Detection {
                    lineage: NodeLineage::Spot,
                    method: DetectionMethod::DefaultOnError(reason),
                }
            }
        }
    }

    async fn detect_by_asg_membership(&self) -> Result<Detection, String> {
        let instance_id = self
            .metadata
            .instance_id()
            .await
            .map_err(|e| e.to_string())?;
        let memberships = self
            .asg
            .describe_auto_scaling_instances(&[instance_id.clone()])
            .await
            .map_err(|e| e.to_string())?;
        let membership = memberships
            .iter()
            .find(|m| m.instance_id == instance_id)
            .ok_or_else(|| format!("instance {} not in any auto scaling group", instance_id))?;

        let lineage = if membership.group_name == self.on_demand_asg_name {
            NodeLineage::OnDemand
        } else {
            NodeLineage::Spot
        };
        Ok(Detection {
            lineage,
            method: DetectionMethod::AsgMembership,
        })
    }

    async fn detect_by_capacity_label(&self, node_name: &str) -> Result<Detection, String> {
        let node = self.k8s.get_node(node_name).await.map_err(|e| e.to_string())?;
        for label in CAPACITY_TYPE_LABELS {
            if let Some(value) = node.metadata.labels.get(*label) {
                let lineage = if value.eq_ignore_ascii_case("spot") {
                    NodeLineage::Spot
                } else {
                    NodeLineage::OnDemand
                };
                return Ok(Detection {
                    lineage,
                    method: DetectionMethod::CapacityTypeLabel,
                });
            }
        }
        Err(format!("node {} carries no capacity-type label", node_name))
    }
}
