//! YAML-driven scenarios against the in-memory backends: build a cluster,
//! fire rebalance events, drive self-monitor cycles on a synthetic clock and
//! report what the agent did.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::info;
use prettytable::{row, Table};
use serde::Deserialize;

use crate::client::asg::AutoScalingGroup;
use crate::config::SpotGuardConfig;
use crate::core::common::Resources;
use crate::core::node::Node;
use crate::core::pdb::PodDisruptionBudget;
use crate::core::pod::Pod;
use crate::sim::cluster::SimCluster;
use crate::spotguard::ca_protector::CaProtector;
use crate::spotguard::pre_scale::PreScalePlanner;
use crate::spotguard::scale_up::ScaleUpOrchestrator;
use crate::spotguard::self_monitor::{CycleOutcome, SelfMonitor};

/// Pacing for scenario runs: external waits shrink to keep runs snappy while
/// the decision clock advances synthetically per event.
const SCENARIO_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SCENARIO_PIPELINE_PACING: Duration = Duration::from_millis(10);

#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct Scenario {
    #[serde(default)]
    pub cluster: ClusterSpec,
    #[serde(default)]
    pub events: Vec<ScenarioEvent>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct ClusterSpec {
    #[serde(default)]
    pub asgs: Vec<AsgSpec>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub pods: Vec<Pod>,
    #[serde(default)]
    pub pdbs: Vec<PodDisruptionBudget>,
    #[serde(default)]
    pub local_instance_id: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct AsgSpec {
    pub name: String,
    pub desired_capacity: u32,
    #[serde(default)]
    pub min_size: u32,
    pub max_size: u32,
    /// Pre-existing InService instance ids.
    #[serde(default)]
    pub instances: Vec<String>,
    /// Scale-ups launch instances and Ready nodes immediately.
    #[serde(default)]
    pub provision_on_scale: bool,
    /// Scale-ups fail with InsufficientInstanceCapacity.
    #[serde(default)]
    pub fail_capacity_on_scale: bool,
}

#[derive(Debug, Deserialize, PartialEq)]
pub enum ScenarioEvent {
    /// Rebalance recommendation on a node; runs the scale-up orchestrator.
    Rebalance { node: String },
    /// Drive self-monitor cycles on a node, advancing the decision clock by
    /// `tick_seconds` (default: the configured check interval) per cycle.
    SelfMonitorCycles {
        node: String,
        cycles: u32,
        #[serde(default)]
        tick_seconds: Option<f64>,
    },
    /// One CA-protector tick at the given offset from scenario start.
    CaProtectorTick {
        node: String,
        #[serde(default)]
        offset_seconds: f64,
    },
    /// Spot capacity returns: stop injecting failures and fill the group to
    /// its desired size.
    RestoreCapacity { asg: String },
}

#[derive(Debug)]
pub struct ScenarioReport {
    pub event_outcomes: Vec<(String, String)>,
    pub asgs: Vec<AutoScalingGroup>,
    pub desired_capacity_calls: Vec<(String, u32)>,
    pub node_annotations: Vec<(String, String, String)>,
}

pub fn build_cluster(spec: &ClusterSpec) -> Arc<SimCluster> {
    let cluster = SimCluster::new();
    for asg in &spec.asgs {
        cluster.add_asg(&asg.name, asg.desired_capacity, asg.min_size, asg.max_size);
        for instance_id in &asg.instances {
            cluster.add_asg_instance(&asg.name, instance_id);
        }
        if asg.provision_on_scale {
            cluster.provision_on_scale(&asg.name);
        }
        if asg.fail_capacity_on_scale {
            cluster.fail_capacity_on_scale(&asg.name);
        }
    }
    for node in &spec.nodes {
        let mut node = node.clone();
        if node.metadata.creation_timestamp.is_none() {
            node.metadata.creation_timestamp = Some(Utc::now());
        }
        if node.status.allocatable == Resources::default() {
            node.status.allocatable = node.status.capacity;
        }
        if node.status.conditions.is_empty() {
            node.set_ready(true);
        }
        cluster.add_node(node);
    }
    for pod in &spec.pods {
        cluster.add_pod(pod.clone());
    }
    for pdb in &spec.pdbs {
        cluster.add_pdb(pdb.clone());
    }
    if let Some(instance_id) = &spec.local_instance_id {
        cluster.set_local_instance_id(instance_id);
    }
    cluster
}

pub async fn run_scenario(config: &SpotGuardConfig, scenario: &Scenario) -> ScenarioReport {
    let cluster = build_cluster(&scenario.cluster);
    let config = Arc::new(config.clone());
    let start = Utc::now();
    let mut event_outcomes = vec![];

    for event in &scenario.events {
        match event {
            ScenarioEvent::Rebalance { node } => {
                info!("scenario: rebalance recommendation on {}", node);
                let orchestrator = ScaleUpOrchestrator::new(cluster.asg_client(), &config)
                    .with_poll_interval(SCENARIO_POLL_INTERVAL);
                let outcome = orchestrator.handle_rebalance(node).await;
                event_outcomes.push((format!("rebalance {}", node), format!("{:?}", outcome)));
            }
            ScenarioEvent::SelfMonitorCycles {
                node,
                cycles,
                tick_seconds,
            } => {
                info!("scenario: {} self-monitor cycles on {}", cycles, node);
                let mut monitor = SelfMonitor::new(
                    node,
                    None,
                    config.clone(),
                    cluster.asg_client(),
                    cluster.k8s_client(),
                    cluster.node_ops(),
                )
                .with_pipeline_pacing(SCENARIO_PIPELINE_PACING, SCENARIO_PIPELINE_PACING);
                if config.enable_pre_scale {
                    monitor = monitor.with_pre_scale_planner(
                        PreScalePlanner::new(cluster.asg_client(), cluster.k8s_client(), &config)
                            .with_poll_interval(SCENARIO_POLL_INTERVAL),
                    );
                }
                match monitor.init(start).await {
                    Ok(true) => {
                        let tick = tick_seconds.unwrap_or(config.check_interval);
                        for cycle in 1..=*cycles {
                            let now = start
                                + chrono::Duration::milliseconds((tick * 1000.0) as i64 * cycle as i64);
                            let outcome = monitor.run_cycle(now).await;
                            event_outcomes.push((
                                format!("self-monitor {} cycle {}", node, cycle),
                                format!("{:?}", outcome),
                            ));
                            if matches!(
                                outcome,
                                CycleOutcome::ScaledDown | CycleOutcome::AlreadyCompleted
                            ) {
                                break;
                            }
                        }
                    }
                    Ok(false) => {
                        event_outcomes.push((
                            format!("self-monitor {}", node),
                            "AlreadyCompleted".to_string(),
                        ));
                    }
                    Err(e) => {
                        event_outcomes
                            .push((format!("self-monitor {}", node), format!("init failed: {}", e)));
                    }
                }
            }
            ScenarioEvent::RestoreCapacity { asg } => {
                info!("scenario: capacity restored on {}", asg);
                cluster.clear_capacity_failure(asg);
                cluster.provision_now(asg);
                event_outcomes.push((format!("restore capacity {}", asg), "ok".to_string()));
            }
            ScenarioEvent::CaProtectorTick {
                node,
                offset_seconds,
            } => {
                let now = start + chrono::Duration::milliseconds((offset_seconds * 1000.0) as i64);
                let protector = CaProtector::new(node, cluster.k8s_client(), config.clone());
                let outcome = match protector.tick(now).await {
                    Ok(()) => "ok".to_string(),
                    Err(e) => format!("failed: {}", e),
                };
                event_outcomes.push((format!("ca-protector {} tick", node), outcome));
            }
        }
    }

    let mut node_annotations = vec![];
    for node in cluster.all_nodes() {
        for (key, value) in &node.metadata.annotations {
            node_annotations.push((node.metadata.name.clone(), key.clone(), value.clone()));
        }
    }

    ScenarioReport {
        event_outcomes,
        asgs: cluster.asgs(),
        desired_capacity_calls: cluster.desired_capacity_calls(),
        node_annotations,
    }
}

pub fn print_report(report: &ScenarioReport) {
    let mut events_table = Table::new();
    events_table.add_row(row!["Event", "Outcome"]);
    for (event, outcome) in &report.event_outcomes {
        events_table.add_row(row![event, outcome]);
    }
    events_table.printstd();

    let mut asg_table = Table::new();
    asg_table.add_row(row!["ASG", "Desired", "InService", "Min", "Max"]);
    for group in &report.asgs {
        asg_table.add_row(row![
            group.name,
            group.desired_capacity,
            group.in_service_count(),
            group.min_size,
            group.max_size
        ]);
    }
    asg_table.printstd();

    let mut calls_table = Table::new();
    calls_table.add_row(row!["SetDesiredCapacity target", "Desired"]);
    for (group, desired) in &report.desired_capacity_calls {
        calls_table.add_row(row![group, desired]);
    }
    calls_table.printstd();

    let mut annotations_table = Table::new();
    annotations_table.add_row(row!["Node", "Annotation", "Value"]);
    for (node, key, value) in &report.node_annotations {
        annotations_table.add_row(row![node, key, value]);
    }
    annotations_table.printstd();
}
