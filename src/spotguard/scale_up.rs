//! Rebalance-driven scale-up: prefer the spot group, fall back to on-demand
//! when spot capacity cannot be obtained.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};

use crate::client::asg::{AsgClient, AsgError};
use crate::config::SpotGuardConfig;
use crate::spotguard::capacity::CapacityFailureDetector;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum ScaleUpOutcome {
    /// The spot group took the extra instance.
    SpotScaled { new_instances: Vec<String> },
    /// Spot capacity was unavailable; the on-demand group took it instead.
    OnDemandFallback { new_instances: Vec<String> },
    /// Neither group could be scaled. The interrupted node still proceeds to
    /// the external drain path, just without replacement capacity.
    NoCapacityAdded { reason: String },
}

enum GroupScaleResult {
    Scaled(Vec<String>),
    AtMax,
    /// The group does not exist; fatal for this handler invocation.
    GroupMissing(String),
    Failed(String),
}

pub struct ScaleUpOrchestrator {
    asg: Arc<dyn AsgClient>,
    capacity: CapacityFailureDetector,
    spot_asg_name: String,
    on_demand_asg_name: String,
    scale_timeout: Duration,
    poll_interval: Duration,
}

impl ScaleUpOrchestrator {
    pub fn new(asg: Arc<dyn AsgClient>, config: &SpotGuardConfig) -> Self {
        Self {
            capacity: CapacityFailureDetector::new(asg.clone()),
            asg,
            spot_asg_name: config.spot_asg_name.clone(),
            on_demand_asg_name: config.on_demand_asg_name.clone(),
            scale_timeout: config.scale_wait(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Reacts to a rebalance recommendation on `node_name`. Tainting and
    /// draining of the interrupted node stay with the external rebalance
    /// pipeline; this only adds replacement capacity.
    pub async fn handle_rebalance(&self, node_name: &str) -> ScaleUpOutcome {
        info!(
            "node {}: rebalance recommendation, pre-scaling replacement capacity in asg {}",
            node_name, self.spot_asg_name
        );

        let spot_reason = match self.scale_group(&self.spot_asg_name).await {
            GroupScaleResult::Scaled(new_instances) => {
                info!(
                    "node {}: spot asg {} took the replacement instance {:?}",
                    node_name, self.spot_asg_name, new_instances
                );
                return ScaleUpOutcome::SpotScaled { new_instances };
            }
            GroupScaleResult::AtMax => format!("spot asg {} at max size", self.spot_asg_name),
            GroupScaleResult::GroupMissing(reason) => {
                warn!("node {}: {}", node_name, reason);
                return ScaleUpOutcome::NoCapacityAdded { reason };
            }
            GroupScaleResult::Failed(reason) => reason,
        };

        warn!(
            "node {}: spot scale-up failed ({}), falling back to on-demand asg {}",
            node_name, spot_reason, self.on_demand_asg_name
        );

        let fallback_reason = match self.scale_group(&self.on_demand_asg_name).await {
            GroupScaleResult::Scaled(new_instances) => {
                info!(
                    "node {}: on-demand asg {} took the replacement instance {:?}",
                    node_name, self.on_demand_asg_name, new_instances
                );
                return ScaleUpOutcome::OnDemandFallback { new_instances };
            }
            GroupScaleResult::AtMax => {
                format!("on-demand asg {} at max size", self.on_demand_asg_name)
            }
            GroupScaleResult::GroupMissing(reason) | GroupScaleResult::Failed(reason) => reason,
        };

        let reason = format!("{}; {}", spot_reason, fallback_reason);
        warn!("node {}: no replacement capacity added: {}", node_name, reason);
        ScaleUpOutcome::NoCapacityAdded { reason }
    }

    /// Scale one group by +1 and wait for a new InService instance.
    async fn scale_group(&self, group_name: &str) -> GroupScaleResult {
        let scale_start_time = Utc::now();

        let group = match self.asg.describe_group(group_name).await {
            Ok(group) => group,
            Err(AsgError::NotFound(_)) => {
                return GroupScaleResult::GroupMissing(format!(
                    "auto scaling group {} not found",
                    group_name
                ))
            }
            Err(e) => return GroupScaleResult::Failed(format!("describe {}: {}", group_name, e)),
        };
        if group.desired_capacity + 1 > group.max_size {
            return GroupScaleResult::AtMax;
        }

        let initial_count = group.in_service_count();
        let initial_instances: HashSet<String> =
            group.healthy_in_service_instance_ids().into_iter().collect();

        if let Err(e) = self
            .asg
            .set_desired_capacity(group_name, group.desired_capacity + 1, false)
            .await
        {
            return GroupScaleResult::Failed(format!("set desired capacity on {}: {}", group_name, e));
        }

        let deadline = tokio::time::Instant::now() + self.scale_timeout;
        loop {
            tokio::time::sleep(self.poll_interval).await;

            match self.asg.describe_group(group_name).await {
                Ok(group) => {
                    if group.in_service_count() > initial_count {
                        let new_instances = group
                            .healthy_in_service_instance_ids()
                            .into_iter()
                            .filter(|id| !initial_instances.contains(id))
                            .collect();
                        return GroupScaleResult::Scaled(new_instances);
                    }
                }
                Err(e) if e.is_throttle() => {
                    warn!("asg {}: describe throttled while waiting: {}", group_name, e);
                }
                Err(e) => {
                    return GroupScaleResult::Failed(format!("describe {}: {}", group_name, e))
                }
            }

            match self
                .capacity
                .capacity_failure_observed(group_name, scale_start_time)
                .await
            {
                Ok(true) => {
                    return GroupScaleResult::Failed(format!(
                        "capacity failure observed on {}",
                        group_name
                    ))
                }
                Ok(false) => {}
                Err(e) => return GroupScaleResult::Failed(format!("activity list on {}: {}", group_name, e)),
            }

            if tokio::time::Instant::now() >= deadline {
                return GroupScaleResult::Failed(format!(
                    "timed out waiting for {} to reach InService",
                    group_name
                ));
            }
        }
    }
}

