//! Type definition for Node primitive of k8s cluster

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::common::Resources;

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct Node {
    #[serde(default)]
    pub metadata: NodeMetadata,

    #[serde(default)]
    pub spec: NodeSpec,

    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct NodeMetadata {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Monotonic counter bumped by the API server on every update. Used for
    /// optimistic concurrency: an update carrying a stale version is rejected.
    #[serde(default)]
    pub resource_version: u64,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct NodeSpec {
    /// Cloud instance reference of the form `aws:///<zone>/i-...`.
    #[serde(default)]
    pub provider_id: Option<String>,

    #[serde(default)]
    pub unschedulable: bool,

    #[serde(default)]
    pub taints: Vec<Taint>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct NodeStatus {
    #[serde(default)]
    pub capacity: Resources,

    #[serde(default)]
    pub allocatable: Resources,

    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct NodeCondition {
    pub condition_type: NodeConditionType,
    pub status: ConditionStatus,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum NodeConditionType {
    Ready,
    MemoryPressure,
    DiskPressure,
    NetworkUnavailable,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl Node {
    pub fn new(name: String, cpu: u32, ram: u64) -> Self {
        let capacity = Resources::new(cpu, ram);
        Self {
            metadata: NodeMetadata {
                name,
                ..Default::default()
            },
            spec: Default::default(),
            status: NodeStatus {
                capacity,
                allocatable: capacity,
                conditions: vec![NodeCondition {
                    condition_type: NodeConditionType::Ready,
                    status: ConditionStatus::True,
                }],
            },
        }
    }

    pub fn with_provider_id(mut self, provider_id: &str) -> Self {
        self.spec.provider_id = Some(provider_id.to_string());
        self
    }

    pub fn with_creation_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.metadata.creation_timestamp = Some(timestamp);
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .labels
            .insert(key.to_string(), value.to_string());
        self
    }

    /// A node is ready when it carries a Ready condition with status True.
    pub fn is_ready(&self) -> bool {
        self.status.conditions.iter().any(|condition| {
            condition.condition_type == NodeConditionType::Ready
                && condition.status == ConditionStatus::True
        })
    }

    pub fn set_ready(&mut self, ready: bool) {
        let status = if ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        match self
            .status
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == NodeConditionType::Ready)
        {
            Some(condition) => condition.status = status,
            None => self.status.conditions.push(NodeCondition {
                condition_type: NodeConditionType::Ready,
                status,
            }),
        }
    }

    /// Trailing `i-...` segment of the provider id. Matching nodes to ASG
    /// instances goes through this instead of distribution-specific labels.
    pub fn instance_id(&self) -> Option<&str> {
        let provider_id = self.spec.provider_id.as_deref()?;
        let last = provider_id.rsplit('/').next()?;
        if last.starts_with("i-") {
            Some(last)
        } else {
            None
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(|v| v.as_str())
    }

    pub fn has_taint(&self, key: &str) -> bool {
        self.spec.taints.iter().any(|taint| taint.key == key)
    }
}
