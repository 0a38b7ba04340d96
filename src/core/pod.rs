//! Type definition for Pod primitive in k8s cluster

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::common::Resources;

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct Pod {
    #[serde(default)]
    pub metadata: PodMetadata,

    #[serde(default)]
    pub spec: PodSpec,

    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PodMetadata {
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Kind of the controller owning this pod, e.g. "DaemonSet" or "ReplicaSet".
    #[serde(default)]
    pub owner_kind: Option<String>,

    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl Default for PodMetadata {
    fn default() -> Self {
        Self {
            name: Default::default(),
            namespace: default_namespace(),
            labels: Default::default(),
            owner_kind: None,
            deletion_timestamp: None,
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct PodSpec {
    #[serde(default)]
    pub node_name: Option<String>,

    #[serde(default)]
    pub resources: PodResourceSpec,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct PodResourceSpec {
    /// Sum of per-container resource requests.
    #[serde(default)]
    pub requests: Resources,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Pod {
    pub fn new(name: String, cpu: u32, ram: u64) -> Self {
        Self {
            metadata: PodMetadata {
                name,
                ..Default::default()
            },
            spec: PodSpec {
                node_name: None,
                resources: PodResourceSpec {
                    requests: Resources::new(cpu, ram),
                },
            },
            status: PodStatus {
                phase: PodPhase::Running,
            },
        }
    }

    pub fn on_node(mut self, node_name: &str) -> Self {
        self.spec.node_name = Some(node_name.to_string());
        self
    }

    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.metadata.namespace = namespace.to_string();
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn owned_by(mut self, kind: &str) -> Self {
        self.metadata.owner_kind = Some(kind.to_string());
        self
    }

    pub fn is_daemon_set(&self) -> bool {
        self.metadata.owner_kind.as_deref() == Some("DaemonSet")
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.status.phase == PodPhase::Running
    }
}
