mod helpers;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use spot_guard::config::SpotGuardConfig;
use spot_guard::core::pod::Pod;
use spot_guard::sim::cluster::SimCluster;
use spot_guard::spotguard::annotations::SCALE_DOWN_COMPLETED_ANNOTATION;
use spot_guard::spotguard::self_monitor::{CycleOutcome, SelfMonitor, SCALE_DOWN_PENDING_TAINT};

use helpers::{
    add_healthy_spot_fleet, add_on_demand_node, check_annotation_absent, check_annotation_present,
    check_desired_capacity_calls_equals_to, default_test_config,
};

const FAST: Duration = Duration::from_millis(10);

fn monitor_for(cluster: &Arc<SimCluster>, config: &SpotGuardConfig) -> SelfMonitor {
    SelfMonitor::new(
        "od-node-1",
        Some("i-od1".to_string()),
        Arc::new(config.clone()),
        cluster.asg_client(),
        cluster.k8s_client(),
        cluster.node_ops(),
    )
    .with_pipeline_pacing(FAST, FAST)
}

fn retirement_ready_cluster(min_size: u32) -> Arc<SimCluster> {
    let cluster = SimCluster::new();
    add_healthy_spot_fleet(&cluster, 3, 5);
    add_on_demand_node(&cluster, "od-node-1", min_size);
    cluster.add_pod(Pod::new("web-1".to_string(), 500, 1073741824).on_node("od-node-1"));
    cluster
}

#[tokio::test]
async fn test_full_retirement_after_gates_open() {
    let _ = env_logger::try_init();

    let cluster = retirement_ready_cluster(0);
    let config = default_test_config(None);
    let mut monitor = monitor_for(&cluster, &config);

    let t0 = Utc::now();
    assert!(monitor.init(t0).await.unwrap());

    // G1 closed: the node has not run for the minimum wait.
    assert_eq!(
        monitor.run_cycle(t0 + chrono::Duration::seconds(300)).await,
        CycleOutcome::MinimumWaitPending
    );

    // G1 open, G2 starts its stability streak on first observation.
    let first_healthy = t0 + chrono::Duration::seconds(650);
    assert_eq!(
        monitor.run_cycle(first_healthy).await,
        CycleOutcome::AwaitingStability
    );

    // The streak reaches the stability duration: everything fires.
    let outcome = monitor
        .run_cycle(first_healthy + chrono::Duration::seconds(120))
        .await;
    assert_eq!(outcome, CycleOutcome::ScaledDown);

    check_annotation_present(&cluster, "od-node-1", SCALE_DOWN_COMPLETED_ANNOTATION);
    let node = cluster.get_node("od-node-1").unwrap();
    assert!(node.has_taint(SCALE_DOWN_PENDING_TAINT));
    assert!(node.spec.unschedulable);
    assert!(cluster.pods_on_node("od-node-1").is_empty());

    // Exactly one decrement, to zero.
    check_desired_capacity_calls_equals_to(&[0], &cluster, "od-workers");
    assert_eq!(cluster.get_asg("od-workers").unwrap().desired_capacity, 0);
    // The spot group was never scaled by the monitor.
    check_desired_capacity_calls_equals_to(&[], &cluster, "spot-workers");
}

#[tokio::test]
async fn test_restart_preserves_start_time() {
    let cluster = retirement_ready_cluster(0);
    let config = default_test_config(None);
    let t0 = Utc::now();

    let mut first = monitor_for(&cluster, &config);
    assert!(first.init(t0).await.unwrap());
    assert_eq!(first.start_time(), t0);
    drop(first);

    // A replacement process two minutes later must adopt the original start
    // time, so the minimum wait still opens at t0 + 10min.
    let mut second = monitor_for(&cluster, &config);
    assert!(second
        .init(t0 + chrono::Duration::minutes(2))
        .await
        .unwrap());
    let reread = second.start_time();
    assert!((reread - t0).num_seconds().abs() <= 1);

    assert_eq!(
        second.run_cycle(t0 + chrono::Duration::seconds(550)).await,
        CycleOutcome::MinimumWaitPending
    );
    assert_eq!(
        second.run_cycle(t0 + chrono::Duration::seconds(650)).await,
        CycleOutcome::AwaitingStability
    );
}

#[tokio::test]
async fn test_completed_marker_stops_restarted_monitor() {
    let cluster = retirement_ready_cluster(0);
    let config = default_test_config(None);
    let t0 = Utc::now();

    let mut monitor = monitor_for(&cluster, &config);
    assert!(monitor.init(t0).await.unwrap());
    let first_healthy = t0 + chrono::Duration::seconds(650);
    monitor.run_cycle(first_healthy).await;
    assert_eq!(
        monitor
            .run_cycle(first_healthy + chrono::Duration::seconds(120))
            .await,
        CycleOutcome::ScaledDown
    );

    // A restarted monitor refuses to run at all.
    let mut restarted = monitor_for(&cluster, &config);
    assert!(!restarted.init(Utc::now()).await.unwrap());
}

#[tokio::test]
async fn test_stale_replica_issues_no_second_decrement() {
    let cluster = retirement_ready_cluster(0);
    let config = default_test_config(None);
    let t0 = Utc::now();

    let mut live = monitor_for(&cluster, &config);
    let mut stale = monitor_for(&cluster, &config);
    assert!(live.init(t0).await.unwrap());
    assert!(stale.init(t0).await.unwrap());

    let first_healthy = t0 + chrono::Duration::seconds(650);
    let decision_time = first_healthy + chrono::Duration::seconds(120);
    live.run_cycle(first_healthy).await;
    assert_eq!(live.run_cycle(decision_time).await, CycleOutcome::ScaledDown);

    // The stale replica walks the same gates but loses the annotation CAS.
    stale.run_cycle(first_healthy).await;
    assert_eq!(
        stale.run_cycle(decision_time).await,
        CycleOutcome::AlreadyCompleted
    );
    check_desired_capacity_calls_equals_to(&[0], &cluster, "od-workers");
}

#[tokio::test]
async fn test_decrement_below_min_size_is_refused() {
    let cluster = retirement_ready_cluster(1);
    let config = default_test_config(None);
    let t0 = Utc::now();

    let mut monitor = monitor_for(&cluster, &config);
    assert!(monitor.init(t0).await.unwrap());
    let first_healthy = t0 + chrono::Duration::seconds(650);
    monitor.run_cycle(first_healthy).await;
    let outcome = monitor
        .run_cycle(first_healthy + chrono::Duration::seconds(120))
        .await;
    match outcome {
        CycleOutcome::Aborted(reason) => {
            assert!(reason.contains("min"), "reason was: {}", reason)
        }
        other => panic!("expected abort, got {:?}", other),
    }

    // The marker was written before the refused decrement; no retry happens.
    check_annotation_present(&cluster, "od-node-1", SCALE_DOWN_COMPLETED_ANNOTATION);
    check_desired_capacity_calls_equals_to(&[], &cluster, "od-workers");
    assert_eq!(
        monitor
            .run_cycle(first_healthy + chrono::Duration::seconds(240))
            .await,
        CycleOutcome::AlreadyCompleted
    );
    check_desired_capacity_calls_equals_to(&[], &cluster, "od-workers");
}

#[tokio::test]
async fn test_unsafe_drain_blocks_without_side_effects() {
    let cluster = SimCluster::new();
    add_healthy_spot_fleet(&cluster, 3, 5);
    add_on_demand_node(&cluster, "od-node-1", 0);
    // Requests exceed what any single spot node can absorb.
    cluster.add_pod(Pod::new("big-1".to_string(), 6000, 1073741824).on_node("od-node-1"));

    let config = default_test_config(None);
    let mut monitor = monitor_for(&cluster, &config);
    let t0 = Utc::now();
    assert!(monitor.init(t0).await.unwrap());

    let first_healthy = t0 + chrono::Duration::seconds(650);
    monitor.run_cycle(first_healthy).await;
    let outcome = monitor
        .run_cycle(first_healthy + chrono::Duration::seconds(120))
        .await;
    assert!(matches!(outcome, CycleOutcome::DrainBlocked(_)));

    check_annotation_absent(&cluster, "od-node-1", SCALE_DOWN_COMPLETED_ANNOTATION);
    let node = cluster.get_node("od-node-1").unwrap();
    assert!(!node.has_taint(SCALE_DOWN_PENDING_TAINT));
    assert!(!node.spec.unschedulable);
    check_desired_capacity_calls_equals_to(&[], &cluster, "od-workers");
}

#[tokio::test]
async fn test_spot_instability_resets_the_streak() {
    let cluster = retirement_ready_cluster(0);
    let config = default_test_config(None);
    let t0 = Utc::now();

    let mut monitor = monitor_for(&cluster, &config);
    assert!(monitor.init(t0).await.unwrap());

    let first_healthy = t0 + chrono::Duration::seconds(650);
    monitor.run_cycle(first_healthy).await;

    // The fleet dips right before the stability window closes.
    cluster.set_node_ready("spot-node-2", false);
    assert_eq!(
        monitor
            .run_cycle(first_healthy + chrono::Duration::seconds(120))
            .await,
        CycleOutcome::AwaitingStability
    );

    // Recovery restarts the streak: still not stable one tick later.
    cluster.set_node_ready("spot-node-2", true);
    let recovery = first_healthy + chrono::Duration::seconds(150);
    assert_eq!(
        monitor.run_cycle(recovery).await,
        CycleOutcome::AwaitingStability
    );
    assert_eq!(
        monitor
            .run_cycle(recovery + chrono::Duration::seconds(60))
            .await,
        CycleOutcome::AwaitingStability
    );
    assert_eq!(
        monitor
            .run_cycle(recovery + chrono::Duration::seconds(120))
            .await,
        CycleOutcome::ScaledDown
    );
}
