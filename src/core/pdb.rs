//! Type definition for PodDisruptionBudget primitive in k8s cluster

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::pod::Pod;

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct PodDisruptionBudget {
    #[serde(default)]
    pub metadata: PdbMetadata,

    #[serde(default)]
    pub spec: PdbSpec,

    #[serde(default)]
    pub status: PdbStatus,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct PdbMetadata {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct PdbSpec {
    /// Label selector in matchLabels form. An empty selector matches every
    /// pod in the budget's namespace, as in Kubernetes.
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct PdbStatus {
    #[serde(default)]
    pub disruptions_allowed: i32,
}

impl PodDisruptionBudget {
    pub fn new(name: &str, namespace: &str, disruptions_allowed: i32) -> Self {
        Self {
            metadata: PdbMetadata {
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            spec: Default::default(),
            status: PdbStatus {
                disruptions_allowed,
            },
        }
    }

    pub fn selecting(mut self, key: &str, value: &str) -> Self {
        self.spec
            .match_labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches_pod(&self, pod: &Pod) -> bool {
        if self.metadata.namespace != pod.metadata.namespace {
            return false;
        }
        self.spec
            .match_labels
            .iter()
            .all(|(key, value)| pod.metadata.labels.get(key) == Some(value))
    }
}
