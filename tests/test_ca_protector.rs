mod helpers;

use std::sync::Arc;

use chrono::Utc;

use spot_guard::core::node::Node;
use spot_guard::sim::cluster::SimCluster;
use spot_guard::spotguard::annotations::{
    format_rfc3339, CA_PROTECTED_UNTIL_ANNOTATION, CA_SCALE_DOWN_DISABLED_ANNOTATION,
};
use spot_guard::spotguard::ca_protector::{protection_deadline, CaProtector};

use helpers::{check_annotation_absent, default_test_config};

// 2 min stability + 2 min wait + 3 min buffer: a 7 minute window.
const WINDOW_CONFIG: &str = r#"
    minimum_wait_duration: 120.0
    pod_migration_buffer: 180.0
"#;

#[tokio::test]
async fn test_protection_applied_inside_window_and_removed_after() {
    let _ = env_logger::try_init();

    let config = default_test_config(Some(WINDOW_CONFIG));
    let t0 = Utc::now();
    let cluster = SimCluster::new();
    cluster.add_node(
        Node::new("spot-node-1".to_string(), 4000, 8589934592).with_creation_timestamp(t0),
    );

    let protector = CaProtector::new(
        "spot-node-1",
        cluster.k8s_client(),
        Arc::new(config.clone()),
    );
    let deadline = protection_deadline(t0, &config);
    assert_eq!(deadline, t0 + chrono::Duration::seconds(420));

    protector.tick(t0 + chrono::Duration::minutes(1)).await.unwrap();
    let node = cluster.get_node("spot-node-1").unwrap();
    assert_eq!(node.annotation(CA_SCALE_DOWN_DISABLED_ANNOTATION), Some("true"));
    assert_eq!(
        node.annotation(CA_PROTECTED_UNTIL_ANNOTATION),
        Some(format_rfc3339(deadline).as_str())
    );

    // One second past the window both annotations disappear.
    protector
        .tick(t0 + chrono::Duration::seconds(421))
        .await
        .unwrap();
    check_annotation_absent(&cluster, "spot-node-1", CA_SCALE_DOWN_DISABLED_ANNOTATION);
    check_annotation_absent(&cluster, "spot-node-1", CA_PROTECTED_UNTIL_ANNOTATION);
}

#[tokio::test]
async fn test_repeated_ticks_inside_window_write_once() {
    let config = default_test_config(Some(WINDOW_CONFIG));
    let t0 = Utc::now();
    let cluster = SimCluster::new();
    cluster.add_node(
        Node::new("spot-node-1".to_string(), 4000, 8589934592).with_creation_timestamp(t0),
    );

    let protector = CaProtector::new(
        "spot-node-1",
        cluster.k8s_client(),
        Arc::new(config.clone()),
    );

    protector.tick(t0 + chrono::Duration::minutes(1)).await.unwrap();
    let version_after_first = cluster
        .get_node("spot-node-1")
        .unwrap()
        .metadata
        .resource_version;

    // Further ticks inside the window change nothing on the node object.
    protector.tick(t0 + chrono::Duration::minutes(2)).await.unwrap();
    protector.tick(t0 + chrono::Duration::minutes(3)).await.unwrap();
    let node = cluster.get_node("spot-node-1").unwrap();
    assert_eq!(node.metadata.resource_version, version_after_first);
    assert_eq!(node.annotation(CA_SCALE_DOWN_DISABLED_ANNOTATION), Some("true"));
}

#[tokio::test]
async fn test_ticks_after_removal_stay_quiet() {
    let config = default_test_config(Some(WINDOW_CONFIG));
    let t0 = Utc::now();
    let cluster = SimCluster::new();
    cluster.add_node(
        Node::new("spot-node-1".to_string(), 4000, 8589934592).with_creation_timestamp(t0),
    );

    let protector = CaProtector::new(
        "spot-node-1",
        cluster.k8s_client(),
        Arc::new(config.clone()),
    );
    protector.tick(t0 + chrono::Duration::minutes(1)).await.unwrap();
    protector.tick(t0 + chrono::Duration::minutes(8)).await.unwrap();
    check_annotation_absent(&cluster, "spot-node-1", CA_SCALE_DOWN_DISABLED_ANNOTATION);

    let version_after_removal = cluster
        .get_node("spot-node-1")
        .unwrap()
        .metadata
        .resource_version;
    protector.tick(t0 + chrono::Duration::minutes(9)).await.unwrap();
    assert_eq!(
        cluster
            .get_node("spot-node-1")
            .unwrap()
            .metadata
            .resource_version,
        version_after_removal
    );
}

#[tokio::test]
async fn test_node_created_before_window_is_never_annotated() {
    let config = default_test_config(Some(WINDOW_CONFIG));
    let t0 = Utc::now();
    let cluster = SimCluster::new();
    cluster.add_node(
        Node::new("spot-node-1".to_string(), 4000, 8589934592)
            .with_creation_timestamp(t0 - chrono::Duration::hours(1)),
    );

    let protector = CaProtector::new(
        "spot-node-1",
        cluster.k8s_client(),
        Arc::new(config.clone()),
    );
    protector.tick(t0).await.unwrap();
    check_annotation_absent(&cluster, "spot-node-1", CA_SCALE_DOWN_DISABLED_ANNOTATION);
    check_annotation_absent(&cluster, "spot-node-1", CA_PROTECTED_UNTIL_ANNOTATION);
}
