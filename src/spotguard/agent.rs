//! Wires the agent for the role its node plays: spot nodes get the
//! cluster-autoscaler protector, on-demand nodes get the self-monitor, and
//! every agent serves rebalance events through the scale-up orchestrator.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::asg::{AsgClient, RetryingAsgClient};
use crate::client::k8s::K8sClient;
use crate::client::metadata::InstanceMetadata;
use crate::client::node_ops::NodeOps;
use crate::config::{ConfigError, SpotGuardConfig};
use crate::spotguard::ca_protector::CaProtector;
use crate::spotguard::node_detector::{NodeDetector, NodeLineage};
use crate::spotguard::scale_up::ScaleUpOrchestrator;
use crate::spotguard::self_monitor::SelfMonitor;

pub struct Agent {
    config: Arc<SpotGuardConfig>,
    node_name: String,
    asg: Arc<dyn AsgClient>,
    k8s: Arc<dyn K8sClient>,
    node_ops: Arc<dyn NodeOps>,
    metadata: Arc<dyn InstanceMetadata>,
}

impl Agent {
    /// Validates the configuration; this is the only fatal failure path of
    /// the agent.
    pub fn new(
        config: SpotGuardConfig,
        node_name: &str,
        asg: Arc<dyn AsgClient>,
        k8s: Arc<dyn K8sClient>,
        node_ops: Arc<dyn NodeOps>,
        metadata: Arc<dyn InstanceMetadata>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            node_name: node_name.to_string(),
            asg: Arc::new(RetryingAsgClient::new(asg)),
            k8s,
            node_ops,
            metadata,
        })
    }

    /// Detects the node's lineage, starts the matching role task and serves
    /// rebalance events until cancelled. Rebalance events are node names
    /// delivered by the external interruption monitors; they are processed
    /// sequentially on this task.
    pub async fn run(
        self,
        mut rebalance_rx: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) {
        if !self.config.enabled {
            info!("spot guard is disabled, agent idle");
            cancel.cancelled().await;
            return;
        }

        let detector = NodeDetector::new(
            self.metadata.clone(),
            self.asg.clone(),
            self.k8s.clone(),
            &self.config.on_demand_asg_name,
        );
        let detection = detector.detect(&self.node_name).await;
        info!(
            "node {}: detected lineage {:?} via {:?}",
            self.node_name, detection.lineage, detection.method
        );

        let role_task = match detection.lineage {
            NodeLineage::Spot => {
                let protector = CaProtector::new(
                    &self.node_name,
                    self.k8s.clone(),
                    self.config.clone(),
                );
                tokio::spawn(protector.run(cancel.child_token()))
            }
            NodeLineage::OnDemand => {
                let instance_id = match self.metadata.instance_id().await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!("node {}: instance id unavailable: {}", self.node_name, e);
                        None
                    }
                };
                let monitor = SelfMonitor::new(
                    &self.node_name,
                    instance_id,
                    self.config.clone(),
                    self.asg.clone(),
                    self.k8s.clone(),
                    self.node_ops.clone(),
                );
                tokio::spawn(monitor.run(cancel.child_token()))
            }
        };

        let orchestrator = ScaleUpOrchestrator::new(self.asg.clone(), &self.config);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rebalance_rx.recv() => match event {
                    Some(node_name) => {
                        orchestrator.handle_rebalance(&node_name).await;
                    }
                    None => break,
                },
            }
        }

        if let Err(e) = role_task.await {
            warn!("node {}: role task ended abnormally: {}", self.node_name, e);
        }
    }
}
