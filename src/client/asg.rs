//! Port for the cloud auto-scaling service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AsgError {
    #[error("auto scaling API throttled: {0}")]
    Throttled(String),
    #[error("auto scaling group not found: {0}")]
    NotFound(String),
    #[error("auto scaling API error: {0}")]
    Api(String),
}

impl AsgError {
    pub fn is_throttle(&self) -> bool {
        matches!(self, AsgError::Throttled(_))
    }

    /// Classify a raw API error message. Throttle tokens map to a soft-retry
    /// error, everything else bubbles up as an API error.
    pub fn from_api_message(message: &str) -> Self {
        if message.contains("Throttling") || message.contains("Rate exceeded") {
            AsgError::Throttled(message.to_string())
        } else {
            AsgError::Api(message.to_string())
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct AutoScalingGroup {
    pub name: String,
    pub desired_capacity: u32,
    pub min_size: u32,
    pub max_size: u32,
    #[serde(default)]
    pub instances: Vec<AsgInstance>,
}

impl AutoScalingGroup {
    pub fn in_service_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|instance| instance.lifecycle_state == LifecycleState::InService)
            .count()
    }

    /// Instances counted towards ASG health: InService and reported Healthy.
    pub fn healthy_in_service_instance_ids(&self) -> Vec<String> {
        self.instances
            .iter()
            .filter(|instance| {
                instance.lifecycle_state == LifecycleState::InService
                    && instance.health_status == InstanceHealth::Healthy
            })
            .map(|instance| instance.instance_id.clone())
            .collect()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AsgInstance {
    pub instance_id: String,
    #[serde(default)]
    pub lifecycle_state: LifecycleState,
    #[serde(default)]
    pub health_status: InstanceHealth,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Pending,
    #[default]
    InService,
    Terminating,
    Terminated,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum InstanceHealth {
    #[default]
    Healthy,
    Unhealthy,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct InstanceGroupMembership {
    pub instance_id: String,
    pub group_name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ScalingActivity {
    pub start_time: DateTime<Utc>,
    pub status_code: ActivityStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cause: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum ActivityStatus {
    InProgress,
    Successful,
    Failed,
    Cancelled,
}

#[async_trait]
pub trait AsgClient: Send + Sync {
    async fn describe_auto_scaling_groups(
        &self,
        names: &[String],
    ) -> Result<Vec<AutoScalingGroup>, AsgError>;

    async fn describe_auto_scaling_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceGroupMembership>, AsgError>;

    /// Most recent scaling activities first, up to `max_records`.
    async fn describe_scaling_activities(
        &self,
        group_name: &str,
        max_records: u32,
    ) -> Result<Vec<ScalingActivity>, AsgError>;

    async fn set_desired_capacity(
        &self,
        group_name: &str,
        desired_capacity: u32,
        honor_cooldown: bool,
    ) -> Result<(), AsgError>;

    async fn describe_group(&self, name: &str) -> Result<AutoScalingGroup, AsgError> {
        let groups = self
            .describe_auto_scaling_groups(&[name.to_string()])
            .await?;
        groups
            .into_iter()
            .find(|group| group.name == name)
            .ok_or_else(|| AsgError::NotFound(name.to_string()))
    }
}

/// Applies the port's retry policy on top of any client: throttle and
/// not-found errors pass straight through (callers know how to handle
/// them), anything else is retried once before bubbling up.
pub struct RetryingAsgClient {
    inner: std::sync::Arc<dyn AsgClient>,
}

impl RetryingAsgClient {
    pub fn new(inner: std::sync::Arc<dyn AsgClient>) -> Self {
        Self { inner }
    }

    fn should_retry(error: &AsgError) -> bool {
        matches!(error, AsgError::Api(_))
    }
}

#[async_trait]
impl AsgClient for RetryingAsgClient {
    async fn describe_auto_scaling_groups(
        &self,
        names: &[String],
    ) -> Result<Vec<AutoScalingGroup>, AsgError> {
        match self.inner.describe_auto_scaling_groups(names).await {
            Err(e) if Self::should_retry(&e) => self.inner.describe_auto_scaling_groups(names).await,
            other => other,
        }
    }

    async fn describe_auto_scaling_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceGroupMembership>, AsgError> {
        match self.inner.describe_auto_scaling_instances(instance_ids).await {
            Err(e) if Self::should_retry(&e) => {
                self.inner.describe_auto_scaling_instances(instance_ids).await
            }
            other => other,
        }
    }

    async fn describe_scaling_activities(
        &self,
        group_name: &str,
        max_records: u32,
    ) -> Result<Vec<ScalingActivity>, AsgError> {
        match self
            .inner
            .describe_scaling_activities(group_name, max_records)
            .await
        {
            Err(e) if Self::should_retry(&e) => {
                self.inner
                    .describe_scaling_activities(group_name, max_records)
                    .await
            }
            other => other,
        }
    }

    async fn set_desired_capacity(
        &self,
        group_name: &str,
        desired_capacity: u32,
        honor_cooldown: bool,
    ) -> Result<(), AsgError> {
        match self
            .inner
            .set_desired_capacity(group_name, desired_capacity, honor_cooldown)
            .await
        {
            Err(e) if Self::should_retry(&e) => {
                self.inner
                    .set_desired_capacity(group_name, desired_capacity, honor_cooldown)
                    .await
            }
            other => other,
        }
    }
}
