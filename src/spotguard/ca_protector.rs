//! Spot-side protection against external cluster-autoscaler removal during
//! the pod-migration window of a freshly created node.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::client::k8s::{K8sClient, K8sError};
use crate::config::SpotGuardConfig;
use crate::spotguard::annotations::{
    format_rfc3339, AnnotationStore, CA_PROTECTED_UNTIL_ANNOTATION,
    CA_SCALE_DOWN_DISABLED_ANNOTATION,
};

const CA_PROTECTOR_INTERVAL: Duration = Duration::from_secs(300);

/// End of the protection window: node creation plus the time the fleet needs
/// to prove stable plus the minimum wait plus the migration buffer.
pub fn protection_deadline(
    creation_timestamp: DateTime<Utc>,
    config: &SpotGuardConfig,
) -> DateTime<Utc> {
    creation_timestamp + config.spot_stability() + config.minimum_wait() + config.migration_buffer()
}

pub struct CaProtector {
    node_name: String,
    k8s: Arc<dyn K8sClient>,
    annotations: AnnotationStore,
    config: Arc<SpotGuardConfig>,
    interval: Duration,
}

impl CaProtector {
    pub fn new(node_name: &str, k8s: Arc<dyn K8sClient>, config: Arc<SpotGuardConfig>) -> Self {
        Self {
            node_name: node_name.to_string(),
            annotations: AnnotationStore::new(k8s.clone()),
            k8s,
            config,
            interval: CA_PROTECTOR_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "node {}: cluster-autoscaler protector running every {:?}",
            self.node_name, self.interval
        );
        loop {
            if let Err(e) = self.tick(Utc::now()).await {
                warn!("node {}: CA protection tick failed: {}", self.node_name, e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Applies the scale-down-disabled annotation inside the protection
    /// window and removes it after. Idempotent: any number of ticks inside
    /// the window leave exactly one annotation set.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), K8sError> {
        let node = self.k8s.get_node(&self.node_name).await?;
        let creation_timestamp = match node.metadata.creation_timestamp {
            Some(timestamp) => timestamp,
            None => {
                warn!(
                    "node {}: no creation timestamp, skipping CA protection",
                    self.node_name
                );
                return Ok(());
            }
        };
        let protected_until = protection_deadline(creation_timestamp, &self.config);
        let annotated = node.annotation(CA_SCALE_DOWN_DISABLED_ANNOTATION).is_some();

        if now < protected_until && !annotated {
            info!(
                "node {}: protecting from cluster-autoscaler scale-down until {}",
                self.node_name, protected_until
            );
            self.annotations
                .set_annotations(
                    &self.node_name,
                    &[
                        (CA_SCALE_DOWN_DISABLED_ANNOTATION, "true".to_string()),
                        (
                            CA_PROTECTED_UNTIL_ANNOTATION,
                            format_rfc3339(protected_until),
                        ),
                    ],
                )
                .await?;
        } else if now >= protected_until && annotated {
            info!(
                "node {}: protection window ended, removing CA annotations",
                self.node_name
            );
            self.annotations
                .delete_annotations(
                    &self.node_name,
                    &[
                        CA_SCALE_DOWN_DISABLED_ANNOTATION,
                        CA_PROTECTED_UNTIL_ANNOTATION,
                    ],
                )
                .await?;
        } else {
            debug!(
                "node {}: CA protection unchanged (annotated={}, until {})",
                self.node_name, annotated, protected_until
            );
        }
        Ok(())
    }
}
