//! Pre-scale fallback for utilization-blocked drains: proactively grow the
//! spot group, then relax the ceiling, then back off.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::client::asg::AsgClient;
use crate::client::k8s::K8sClient;
use crate::config::SpotGuardConfig;
use crate::spotguard::capacity::CapacityFailureDetector;
use crate::spotguard::health::HealthEvaluator;
use crate::spotguard::safety::SafetyEvaluator;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum PreScaleOutcome {
    /// Level 1: new spot nodes are up; drain can be re-evaluated normally.
    CapacityRestored,
    /// Level 2: the relaxed ceiling admits the drain.
    ThresholdRelaxed,
    /// Level 3: nothing worked; skip checks until `retry_at`. The on-demand
    /// node keeps running, which is the safest outcome.
    Abandoned { retry_at: DateTime<Utc> },
}

pub struct PreScalePlanner {
    asg: Arc<dyn AsgClient>,
    health: HealthEvaluator,
    capacity: CapacityFailureDetector,
    spot_asg_name: String,
    target_utilization: f64,
    safety_buffer: f64,
    fallback_threshold: f64,
    retry_backoff: chrono::Duration,
    scale_wait: Duration,
    poll_interval: Duration,
}

impl PreScalePlanner {
    pub fn new(
        asg: Arc<dyn AsgClient>,
        k8s: Arc<dyn K8sClient>,
        config: &SpotGuardConfig,
    ) -> Self {
        Self {
            health: HealthEvaluator::new(asg.clone(), k8s),
            capacity: CapacityFailureDetector::new(asg.clone()),
            asg,
            spot_asg_name: config.spot_asg_name.clone(),
            target_utilization: config.pre_scale_target_utilization,
            safety_buffer: config.pre_scale_safety_buffer,
            fallback_threshold: config.pre_scale_fallback_threshold,
            retry_backoff: config.retry_backoff(),
            scale_wait: config.pre_scale_wait(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Three-level fallback, invoked when drain was blocked on utilization
    /// alone. `current_utilization` is the cluster utilization that produced
    /// the block, in percent.
    pub async fn execute(
        &self,
        node_name: &str,
        current_utilization: f64,
        current_node_count: usize,
        safety: &SafetyEvaluator,
        now: DateTime<Utc>,
    ) -> PreScaleOutcome {
        if self
            .proactive_spot_scale_up(current_utilization, current_node_count)
            .await
        {
            info!(
                "node {}: pre-scale brought spot capacity up, re-evaluating drain",
                node_name
            );
            return PreScaleOutcome::CapacityRestored;
        }

        match safety
            .can_safely_drain(node_name, self.fallback_threshold)
            .await
        {
            Ok(None) => {
                info!(
                    "node {}: drain admitted under relaxed ceiling {:.1}%",
                    node_name, self.fallback_threshold
                );
                PreScaleOutcome::ThresholdRelaxed
            }
            Ok(Some(blocker)) => {
                let retry_at = now + self.retry_backoff;
                warn!(
                    "node {}: pre-scale abandoned ({}), backing off until {}",
                    node_name, blocker, retry_at
                );
                PreScaleOutcome::Abandoned { retry_at }
            }
            Err(e) => {
                let retry_at = now + self.retry_backoff;
                warn!(
                    "node {}: drain re-evaluation failed ({}), backing off until {}",
                    node_name, e, retry_at
                );
                PreScaleOutcome::Abandoned { retry_at }
            }
        }
    }

    /// Level 1. Returns true when the requested spot nodes became Ready
    /// within the pre-scale budget.
    async fn proactive_spot_scale_up(
        &self,
        current_utilization: f64,
        current_node_count: usize,
    ) -> bool {
        let group = match self.asg.describe_group(&self.spot_asg_name).await {
            Ok(group) => group,
            Err(e) => {
                warn!("asg {}: describe failed in pre-scale: {}", self.spot_asg_name, e);
                return false;
            }
        };

        let additional = additional_spot_nodes(
            current_node_count,
            current_utilization,
            self.target_utilization,
            group.in_service_count(),
            self.safety_buffer,
        );
        if additional == 0 {
            return false;
        }

        let desired = (group.desired_capacity + additional).min(group.max_size);
        if desired <= group.desired_capacity {
            warn!(
                "asg {}: no headroom for pre-scale (desired {}, max {})",
                self.spot_asg_name, group.desired_capacity, group.max_size
            );
            return false;
        }

        info!(
            "asg {}: pre-scaling {} -> {} to reach {:.1}% target utilization",
            self.spot_asg_name, group.desired_capacity, desired, self.target_utilization
        );
        let scale_start_time = Utc::now();
        if let Err(e) = self
            .asg
            .set_desired_capacity(&self.spot_asg_name, desired, false)
            .await
        {
            warn!("asg {}: pre-scale request failed: {}", self.spot_asg_name, e);
            return false;
        }

        let deadline = tokio::time::Instant::now() + self.scale_wait;
        loop {
            tokio::time::sleep(self.poll_interval).await;

            match self
                .health
                .check_comprehensive(
                    &self.spot_asg_name,
                    chrono::Duration::zero(),
                    None,
                    Utc::now(),
                )
                .await
            {
                Ok(status) if status.is_fully_healthy() => return true,
                Ok(_) => {}
                Err(e) => {
                    warn!("asg {}: health check failed in pre-scale: {}", self.spot_asg_name, e);
                }
            }

            match self
                .capacity
                .capacity_failure_observed(&self.spot_asg_name, scale_start_time)
                .await
            {
                Ok(true) => {
                    warn!("asg {}: capacity failure during pre-scale", self.spot_asg_name);
                    return false;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("asg {}: activity list failed in pre-scale: {}", self.spot_asg_name, e);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!("asg {}: pre-scale timed out", self.spot_asg_name);
                return false;
            }
        }
    }
}

/// Spot nodes to add so the cluster lands at the target utilization once the
/// on-demand node is gone, padded by the safety buffer (percent). Zero when
/// utilization is already at or under the target.
pub fn additional_spot_nodes(
    current_node_count: usize,
    current_utilization: f64,
    target_utilization: f64,
    current_spot_nodes: usize,
    safety_buffer: f64,
) -> u32 {
    if current_utilization <= target_utilization {
        return 0;
    }
    let total_workload = current_node_count as f64 * (current_utilization / 100.0);
    let required_spot_nodes = (total_workload / (target_utilization / 100.0)).ceil();
    let deficit = required_spot_nodes - current_spot_nodes as f64;
    let padded = (deficit * (1.0 + safety_buffer / 100.0)).ceil();
    padded.max(1.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_additional_nodes_at_or_under_target() {
        assert_eq!(additional_spot_nodes(10, 65.0, 65.0, 6, 10.0), 0);
        assert_eq!(additional_spot_nodes(10, 40.0, 65.0, 6, 10.0), 0);
    }

    #[test]
    fn test_deficit_is_padded_and_rounded_up() {
        // 10 nodes at 92% = 9.2 node-equivalents of workload; at a 65%
        // target that needs ceil(9.2 / 0.65) = 15 spot nodes. With 12
        // already in service: ceil(3 * 1.1) = 4.
        assert_eq!(additional_spot_nodes(10, 92.0, 65.0, 12, 10.0), 4);
    }

    #[test]
    fn test_at_least_one_node_when_over_target() {
        // Deficit rounds to zero but utilization is over target.
        assert_eq!(additional_spot_nodes(4, 70.0, 65.0, 10, 10.0), 1);
    }
}
