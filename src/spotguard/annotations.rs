//! Typed read/write of the per-node persistent state carried as node
//! annotations. Annotations are the only cross-restart artifact: the agent
//! re-reads them at startup instead of keeping any durable store of its own.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use log::warn;

use crate::client::k8s::{K8sClient, K8sError};
use crate::core::node::Node;

pub const ON_DEMAND_START_TIME_ANNOTATION: &str =
    "spot-guard.aws.amazon.com/on-demand-start-time";
pub const SPOT_ASG_NAME_ANNOTATION: &str = "spot-guard.aws.amazon.com/spot-asg-name";
pub const ON_DEMAND_ASG_NAME_ANNOTATION: &str = "spot-guard.aws.amazon.com/on-demand-asg-name";
pub const SCALE_DOWN_COMPLETED_ANNOTATION: &str =
    "spot-guard.aws.amazon.com/scale-down-completed";
pub const CA_PROTECTED_UNTIL_ANNOTATION: &str = "spot-guard.aws.amazon.com/ca-protected-until";

/// Well-known annotation honored by the external cluster autoscaler.
pub const CA_SCALE_DOWN_DISABLED_ANNOTATION: &str =
    "cluster-autoscaler.kubernetes.io/scale-down-disabled";

/// Retries for optimistic-concurrency conflicts. Unrelated node edits by
/// other controllers bump the resource version, so a couple of retries with
/// a freshly fetched object resolve the common case.
const MAX_CONFLICT_RETRIES: usize = 3;

pub fn format_rfc3339(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[derive(Clone)]
pub struct AnnotationStore {
    k8s: Arc<dyn K8sClient>,
}

impl AnnotationStore {
    pub fn new(k8s: Arc<dyn K8sClient>) -> Self {
        Self { k8s }
    }

    /// Returns the recorded monitor start time, writing it (together with the
    /// ASG names, for audit) if absent. The annotation is written at most
    /// once per node lifetime: a value already present is never overwritten.
    ///
    /// A write failure is non-fatal: the unwritten in-memory time is returned
    /// and the next tick retries the write.
    pub async fn get_or_create_start_time(
        &self,
        node_name: &str,
        spot_asg_name: &str,
        on_demand_asg_name: &str,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        for _ in 0..=MAX_CONFLICT_RETRIES {
            let mut node = match self.k8s.get_node(node_name).await {
                Ok(node) => node,
                Err(e) => {
                    warn!("node {}: failed to read start-time annotation: {}", node_name, e);
                    return now;
                }
            };
            if let Some(existing) = node
                .annotation(ON_DEMAND_START_TIME_ANNOTATION)
                .and_then(parse_rfc3339)
            {
                return existing;
            }
            node.metadata.annotations.insert(
                ON_DEMAND_START_TIME_ANNOTATION.to_string(),
                format_rfc3339(now),
            );
            node.metadata.annotations.insert(
                SPOT_ASG_NAME_ANNOTATION.to_string(),
                spot_asg_name.to_string(),
            );
            node.metadata.annotations.insert(
                ON_DEMAND_ASG_NAME_ANNOTATION.to_string(),
                on_demand_asg_name.to_string(),
            );
            match self.k8s.update_node(&node).await {
                Ok(_) => return now,
                Err(e) if e.is_conflict() => continue,
                Err(e) => {
                    warn!("node {}: failed to write start-time annotation: {}", node_name, e);
                    return now;
                }
            }
        }
        warn!(
            "node {}: start-time annotation write kept conflicting, using in-memory time",
            node_name
        );
        now
    }

    /// Compare-and-swap write of the scale-down idempotence marker. Returns
    /// false when the marker was already present, i.e. another writer won.
    pub async fn mark_scale_down_completed(
        &self,
        node_name: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, K8sError> {
        for _ in 0..=MAX_CONFLICT_RETRIES {
            let mut node = self.k8s.get_node(node_name).await?;
            if node.annotation(SCALE_DOWN_COMPLETED_ANNOTATION).is_some() {
                return Ok(false);
            }
            node.metadata.annotations.insert(
                SCALE_DOWN_COMPLETED_ANNOTATION.to_string(),
                format_rfc3339(now),
            );
            match self.k8s.update_node(&node).await {
                Ok(_) => return Ok(true),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(K8sError::Conflict(node_name.to_string()))
    }

    pub async fn is_scale_down_completed(&self, node_name: &str) -> Result<bool, K8sError> {
        let node = self.k8s.get_node(node_name).await?;
        Ok(node.annotation(SCALE_DOWN_COMPLETED_ANNOTATION).is_some())
    }

    pub async fn set_annotations(
        &self,
        node_name: &str,
        entries: &[(&str, String)],
    ) -> Result<Node, K8sError> {
        self.mutate(node_name, |node| {
            for (key, value) in entries {
                node.metadata
                    .annotations
                    .insert(key.to_string(), value.clone());
            }
        })
        .await
    }

    pub async fn delete_annotations(
        &self,
        node_name: &str,
        keys: &[&str],
    ) -> Result<Node, K8sError> {
        self.mutate(node_name, |node| {
            for key in keys {
                node.metadata.annotations.remove(*key);
            }
        })
        .await
    }

    async fn mutate<F>(&self, node_name: &str, apply: F) -> Result<Node, K8sError>
    where
        F: Fn(&mut Node) + Send + Sync,
    {
        for _ in 0..=MAX_CONFLICT_RETRIES {
            let mut node = self.k8s.get_node(node_name).await?;
            apply(&mut node);
            match self.k8s.update_node(&node).await {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(K8sError::Conflict(node_name.to_string()))
    }
}
