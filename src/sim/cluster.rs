//! One in-memory state shared by fake implementations of every port. The
//! behaviors that matter to the agent are programmable: instance
//! provisioning on scale-up, capacity-failure injection, API throttling and
//! update conflicts. All desired-capacity calls are recorded so tests can
//! assert how often a group was touched.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::client::asg::{
    ActivityStatus, AsgClient, AsgError, AsgInstance, AutoScalingGroup, InstanceGroupMembership,
    InstanceHealth, LifecycleState, ScalingActivity,
};
use crate::client::k8s::{K8sClient, K8sError};
use crate::client::metadata::{InstanceMetadata, MetadataError};
use crate::client::node_ops::NodeOps;
use crate::core::node::Node;
use crate::core::pdb::PodDisruptionBudget;
use crate::core::pod::Pod;

#[derive(Default)]
struct SimState {
    asgs: BTreeMap<String, AutoScalingGroup>,
    activities: BTreeMap<String, Vec<ScalingActivity>>,
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<String, Pod>,
    pdbs: Vec<PodDisruptionBudget>,
    local_instance_id: Option<String>,

    provision_groups: HashSet<String>,
    capacity_failure_groups: HashSet<String>,
    asg_throttles_remaining: u32,
    asg_failures_remaining: u32,
    node_update_conflicts_remaining: u32,
    pdb_lists_fail: bool,

    desired_capacity_calls: Vec<(String, u32)>,
    next_auto_instance: u32,
}

pub struct SimCluster {
    state: Mutex<SimState>,
}

impl SimCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::default()),
        })
    }

    // --- cluster construction ---

    pub fn add_asg(&self, name: &str, desired_capacity: u32, min_size: u32, max_size: u32) {
        let mut state = self.state.lock().unwrap();
        state.asgs.insert(
            name.to_string(),
            AutoScalingGroup {
                name: name.to_string(),
                desired_capacity,
                min_size,
                max_size,
                instances: vec![],
            },
        );
    }

    pub fn add_asg_instance(&self, group_name: &str, instance_id: &str) {
        let mut state = self.state.lock().unwrap();
        let group = state
            .asgs
            .get_mut(group_name)
            .unwrap_or_else(|| panic!("unknown sim asg {}", group_name));
        group.instances.push(AsgInstance {
            instance_id: instance_id.to_string(),
            lifecycle_state: LifecycleState::InService,
            health_status: InstanceHealth::Healthy,
        });
    }

    pub fn add_node(&self, mut node: Node) {
        let mut state = self.state.lock().unwrap();
        node.metadata.resource_version = 1;
        state.nodes.insert(node.metadata.name.clone(), node);
    }

    pub fn add_pod(&self, pod: Pod) {
        let mut state = self.state.lock().unwrap();
        state.pods.insert(pod.metadata.name.clone(), pod);
    }

    pub fn add_pdb(&self, pdb: PodDisruptionBudget) {
        self.state.lock().unwrap().pdbs.push(pdb);
    }

    pub fn set_local_instance_id(&self, instance_id: &str) {
        self.state.lock().unwrap().local_instance_id = Some(instance_id.to_string());
    }

    // --- programmable behaviors ---

    /// Scale-ups on this group create InService instances and matching Ready
    /// nodes immediately. Scale-downs only lower desired capacity; instances
    /// linger the way they do while the cloud works through terminations.
    pub fn provision_on_scale(&self, group_name: &str) {
        self.state
            .lock()
            .unwrap()
            .provision_groups
            .insert(group_name.to_string());
    }

    /// Scale-ups on this group raise desired capacity but launch nothing,
    /// recording a Failed InsufficientInstanceCapacity activity instead.
    pub fn fail_capacity_on_scale(&self, group_name: &str) {
        self.state
            .lock()
            .unwrap()
            .capacity_failure_groups
            .insert(group_name.to_string());
    }

    pub fn clear_capacity_failure(&self, group_name: &str) {
        self.state
            .lock()
            .unwrap()
            .capacity_failure_groups
            .remove(group_name);
    }

    pub fn throttle_next_asg_calls(&self, count: u32) {
        self.state.lock().unwrap().asg_throttles_remaining = count;
    }

    pub fn fail_next_asg_calls(&self, count: u32) {
        self.state.lock().unwrap().asg_failures_remaining = count;
    }

    pub fn conflict_next_node_updates(&self, count: u32) {
        self.state.lock().unwrap().node_update_conflicts_remaining = count;
    }

    pub fn fail_pdb_lists(&self, fail: bool) {
        self.state.lock().unwrap().pdb_lists_fail = fail;
    }

    /// Fill the group with InService instances (and Ready nodes) up to its
    /// current desired capacity, as if pending launches just completed.
    pub fn provision_now(&self, group_name: &str) {
        let mut state = self.state.lock().unwrap();
        if state.asgs.contains_key(group_name) {
            state.provision_to_desired(group_name);
        }
    }

    pub fn record_activity(&self, group_name: &str, activity: ScalingActivity) {
        let mut state = self.state.lock().unwrap();
        state
            .activities
            .entry(group_name.to_string())
            .or_default()
            .push(activity);
    }

    // --- direct state access for tests and the scenario report ---

    pub fn get_node(&self, name: &str) -> Option<Node> {
        self.state.lock().unwrap().nodes.get(name).cloned()
    }

    pub fn get_asg(&self, name: &str) -> Option<AutoScalingGroup> {
        self.state.lock().unwrap().asgs.get(name).cloned()
    }

    pub fn asgs(&self) -> Vec<AutoScalingGroup> {
        self.state.lock().unwrap().asgs.values().cloned().collect()
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.state.lock().unwrap().nodes.values().cloned().collect()
    }

    pub fn set_asg_desired(&self, name: &str, desired_capacity: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(group) = state.asgs.get_mut(name) {
            group.desired_capacity = desired_capacity;
        }
    }

    pub fn set_node_ready(&self, name: &str, ready: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.get_mut(name) {
            node.set_ready(ready);
            node.metadata.resource_version += 1;
        }
    }

    pub fn set_node_unschedulable(&self, name: &str, unschedulable: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.get_mut(name) {
            node.spec.unschedulable = unschedulable;
            node.metadata.resource_version += 1;
        }
    }

    pub fn pods_on_node(&self, node_name: &str) -> Vec<Pod> {
        let state = self.state.lock().unwrap();
        state
            .pods
            .values()
            .filter(|pod| pod.spec.node_name.as_deref() == Some(node_name))
            .cloned()
            .collect()
    }

    /// Every set-desired-capacity call observed, in order.
    pub fn desired_capacity_calls(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().desired_capacity_calls.clone()
    }

    pub fn desired_capacity_calls_for(&self, group_name: &str) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .desired_capacity_calls
            .iter()
            .filter(|(name, _)| name == group_name)
            .map(|(_, desired)| *desired)
            .collect()
    }

    // --- port handles ---

    pub fn asg_client(self: &Arc<Self>) -> Arc<dyn AsgClient> {
        Arc::new(SimAsgClient(self.clone()))
    }

    pub fn k8s_client(self: &Arc<Self>) -> Arc<dyn K8sClient> {
        Arc::new(SimK8sClient(self.clone()))
    }

    pub fn node_ops(self: &Arc<Self>) -> Arc<dyn NodeOps> {
        Arc::new(SimNodeOps(self.clone()))
    }

    pub fn metadata_client(self: &Arc<Self>) -> Arc<dyn InstanceMetadata> {
        Arc::new(SimInstanceMetadata(self.clone()))
    }
}

impl SimState {
    fn check_asg_throttle(&mut self) -> Result<(), AsgError> {
        if self.asg_throttles_remaining > 0 {
            self.asg_throttles_remaining -= 1;
            return Err(AsgError::Throttled("Rate exceeded".to_string()));
        }
        if self.asg_failures_remaining > 0 {
            self.asg_failures_remaining -= 1;
            return Err(AsgError::Api("simulated transient API failure".to_string()));
        }
        Ok(())
    }

    fn provision_to_desired(&mut self, group_name: &str) {
        let desired = self.asgs[group_name].desired_capacity as usize;
        while self.asgs[group_name].instances.len() < desired {
            self.next_auto_instance += 1;
            let instance_id = format!("i-sim{:04}", self.next_auto_instance);
            self.asgs
                .get_mut(group_name)
                .unwrap()
                .instances
                .push(AsgInstance {
                    instance_id: instance_id.clone(),
                    lifecycle_state: LifecycleState::InService,
                    health_status: InstanceHealth::Healthy,
                });
            let node_name = format!("{}-node-{}", group_name, self.next_auto_instance);
            let mut node = Node::new(node_name.clone(), 4000, 8589934592)
                .with_provider_id(&format!("aws:///sim-zone/{}", instance_id))
                .with_creation_timestamp(Utc::now());
            node.metadata.resource_version = 1;
            self.nodes.insert(node_name, node);
        }
    }
}

struct SimAsgClient(Arc<SimCluster>);

#[async_trait]
impl AsgClient for SimAsgClient {
    async fn describe_auto_scaling_groups(
        &self,
        names: &[String],
    ) -> Result<Vec<AutoScalingGroup>, AsgError> {
        let mut state = self.0.state.lock().unwrap();
        state.check_asg_throttle()?;
        Ok(names
            .iter()
            .filter_map(|name| state.asgs.get(name).cloned())
            .collect())
    }

    async fn describe_auto_scaling_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceGroupMembership>, AsgError> {
        let mut state = self.0.state.lock().unwrap();
        state.check_asg_throttle()?;
        let mut memberships = vec![];
        for group in state.asgs.values() {
            for instance in &group.instances {
                if instance_ids.contains(&instance.instance_id) {
                    memberships.push(InstanceGroupMembership {
                        instance_id: instance.instance_id.clone(),
                        group_name: group.name.clone(),
                    });
                }
            }
        }
        Ok(memberships)
    }

    async fn describe_scaling_activities(
        &self,
        group_name: &str,
        max_records: u32,
    ) -> Result<Vec<ScalingActivity>, AsgError> {
        let mut state = self.0.state.lock().unwrap();
        state.check_asg_throttle()?;
        if !state.asgs.contains_key(group_name) {
            return Err(AsgError::NotFound(group_name.to_string()));
        }
        let mut activities = state
            .activities
            .get(group_name)
            .cloned()
            .unwrap_or_default();
        activities.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        activities.truncate(max_records as usize);
        Ok(activities)
    }

    async fn set_desired_capacity(
        &self,
        group_name: &str,
        desired_capacity: u32,
        _honor_cooldown: bool,
    ) -> Result<(), AsgError> {
        let mut state = self.0.state.lock().unwrap();
        state.check_asg_throttle()?;
        if !state.asgs.contains_key(group_name) {
            return Err(AsgError::NotFound(group_name.to_string()));
        }
        state
            .desired_capacity_calls
            .push((group_name.to_string(), desired_capacity));

        let scaling_up = desired_capacity > state.asgs[group_name].desired_capacity;
        state.asgs.get_mut(group_name).unwrap().desired_capacity = desired_capacity;

        if scaling_up && state.capacity_failure_groups.contains(group_name) {
            state
                .activities
                .entry(group_name.to_string())
                .or_default()
                .push(ScalingActivity {
                    start_time: Utc::now(),
                    status_code: ActivityStatus::Failed,
                    description: format!(
                        "Launching a new EC2 instance into {}. Status Reason: \
                         InsufficientInstanceCapacity",
                        group_name
                    ),
                    cause: "capacity-not-available".to_string(),
                });
            return Ok(());
        }
        if state.provision_groups.contains(group_name) {
            state.provision_to_desired(group_name);
        }
        Ok(())
    }
}

struct SimK8sClient(Arc<SimCluster>);

#[async_trait]
impl K8sClient for SimK8sClient {
    async fn get_node(&self, name: &str) -> Result<Node, K8sError> {
        let state = self.0.state.lock().unwrap();
        state
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| K8sError::NotFound(name.to_string()))
    }

    async fn update_node(&self, node: &Node) -> Result<Node, K8sError> {
        let mut state = self.0.state.lock().unwrap();
        if state.node_update_conflicts_remaining > 0 {
            state.node_update_conflicts_remaining -= 1;
            return Err(K8sError::Conflict(node.metadata.name.clone()));
        }
        let stored = state
            .nodes
            .get_mut(&node.metadata.name)
            .ok_or_else(|| K8sError::NotFound(node.metadata.name.clone()))?;
        if stored.metadata.resource_version != node.metadata.resource_version {
            return Err(K8sError::Conflict(node.metadata.name.clone()));
        }
        *stored = node.clone();
        stored.metadata.resource_version += 1;
        Ok(stored.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, K8sError> {
        Ok(self.0.state.lock().unwrap().nodes.values().cloned().collect())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, K8sError> {
        Ok(self.0.pods_on_node(node_name))
    }

    async fn list_all_pods(&self) -> Result<Vec<Pod>, K8sError> {
        Ok(self.0.state.lock().unwrap().pods.values().cloned().collect())
    }

    async fn list_pod_disruption_budgets(
        &self,
        namespace: &str,
    ) -> Result<Vec<PodDisruptionBudget>, K8sError> {
        let state = self.0.state.lock().unwrap();
        if state.pdb_lists_fail {
            return Err(K8sError::Api("simulated PDB list failure".to_string()));
        }
        Ok(state
            .pdbs
            .iter()
            .filter(|pdb| pdb.metadata.namespace == namespace)
            .cloned()
            .collect())
    }
}

struct SimNodeOps(Arc<SimCluster>);

#[async_trait]
impl NodeOps for SimNodeOps {
    async fn cordon(&self, node_name: &str) -> Result<(), K8sError> {
        let mut state = self.0.state.lock().unwrap();
        let node = state
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| K8sError::NotFound(node_name.to_string()))?;
        node.spec.unschedulable = true;
        node.metadata.resource_version += 1;
        Ok(())
    }

    async fn drain(&self, node_name: &str, _timeout: Duration) -> Result<(), K8sError> {
        let mut state = self.0.state.lock().unwrap();
        if !state.nodes.contains_key(node_name) {
            return Err(K8sError::NotFound(node_name.to_string()));
        }
        if let Some(node) = state.nodes.get_mut(node_name) {
            node.spec.unschedulable = true;
            node.metadata.resource_version += 1;
        }
        state.pods.retain(|_, pod| {
            pod.spec.node_name.as_deref() != Some(node_name) || pod.is_daemon_set()
        });
        Ok(())
    }
}

struct SimInstanceMetadata(Arc<SimCluster>);

#[async_trait]
impl InstanceMetadata for SimInstanceMetadata {
    async fn instance_id(&self) -> Result<String, MetadataError> {
        self.0
            .state
            .lock()
            .unwrap()
            .local_instance_id
            .clone()
            .ok_or_else(|| MetadataError("no instance identity configured".to_string()))
    }
}
