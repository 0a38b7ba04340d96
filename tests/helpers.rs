use std::sync::Arc;

use spot_guard::config::SpotGuardConfig;
use spot_guard::core::node::Node;
use spot_guard::sim::cluster::SimCluster;

/// Defaults apply except for the wait budgets, which shrink so tests do not
/// sleep. Pass a suffix to set keys the base block does not mention.
pub fn default_test_config(with_suffix: Option<&str>) -> SpotGuardConfig {
    let mut default = r#"
    enabled: true
    spot_asg_name: "spot-workers"
    on_demand_asg_name: "od-workers"
    scale_timeout: 1.0
    pod_eviction_timeout: 1.0
    "#
    .to_string();

    if let Some(suffix) = with_suffix {
        default.push_str(suffix);
    }

    serde_yaml::from_str::<SpotGuardConfig>(&default).unwrap()
}

/// A spot fleet of `count` healthy InService instances with matching Ready
/// nodes, desired capacity equal to the instance count.
pub fn add_healthy_spot_fleet(cluster: &Arc<SimCluster>, count: u32, max_size: u32) {
    cluster.add_asg("spot-workers", count, 0, max_size);
    for i in 1..=count {
        let instance_id = format!("i-spot{}", i);
        cluster.add_asg_instance("spot-workers", &instance_id);
        cluster.add_node(
            Node::new(format!("spot-node-{}", i), 4000, 8589934592)
                .with_provider_id(&format!("aws:///us-west-2a/{}", instance_id)),
        );
    }
}

/// An on-demand group holding exactly one instance backing `node_name`.
pub fn add_on_demand_node(cluster: &Arc<SimCluster>, node_name: &str, min_size: u32) {
    cluster.add_asg("od-workers", 1, min_size, 3);
    cluster.add_asg_instance("od-workers", "i-od1");
    cluster.add_node(
        Node::new(node_name.to_string(), 4000, 8589934592)
            .with_provider_id("aws:///us-west-2a/i-od1"),
    );
}

pub fn check_desired_capacity_calls_equals_to(
    expected: &[u32],
    cluster: &Arc<SimCluster>,
    group_name: &str,
) {
    assert_eq!(expected, cluster.desired_capacity_calls_for(group_name));
}

pub fn check_annotation_present(cluster: &Arc<SimCluster>, node_name: &str, key: &str) {
    let node = cluster.get_node(node_name).unwrap();
    assert!(
        node.annotation(key).is_some(),
        "expected annotation {} on node {}",
        key,
        node_name
    );
}

pub fn check_annotation_absent(cluster: &Arc<SimCluster>, node_name: &str, key: &str) {
    let node = cluster.get_node(node_name).unwrap();
    assert!(
        node.annotation(key).is_none(),
        "unexpected annotation {} on node {}",
        key,
        node_name
    );
}
