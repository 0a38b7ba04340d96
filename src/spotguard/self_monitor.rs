//! On-demand-side self-monitor: gates the retirement of its own node on
//! minimum wait, spot fleet stability and drain safety, then runs the
//! scale-down pipeline exactly once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::client::asg::AsgClient;
use crate::client::k8s::{K8sClient, K8sError};
use crate::client::node_ops::NodeOps;
use crate::config::SpotGuardConfig;
use crate::core::node::{Taint, TaintEffect};
use crate::spotguard::annotations::AnnotationStore;
use crate::spotguard::event::FallbackEvent;
use crate::spotguard::health::HealthEvaluator;
use crate::spotguard::pre_scale::{PreScaleOutcome, PreScalePlanner};
use crate::spotguard::safety::SafetyEvaluator;

pub const SCALE_DOWN_PENDING_TAINT: &str = "spotguard/scale-down-pending";

const EVICTION_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DECREMENT_SETTLE_DELAY: Duration = Duration::from_secs(2);
const MAX_TAINT_CONFLICT_RETRIES: usize = 3;

/// Jitter added to the tick period so the check load of a fleet of agents
/// smears over a ten second window instead of arriving in bursts.
const TICK_JITTER_MAX_SECS: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A scale-down already completed on this node; the monitor is done.
    AlreadyCompleted,
    /// Backing off after an abandoned pre-scale.
    BackingOff,
    /// G1: the node has not run for the minimum wait yet.
    MinimumWaitPending,
    /// G2: the spot fleet is not healthy-and-stable.
    AwaitingStability,
    /// G3: drain is vetoed; retried next tick.
    DrainBlocked(String),
    /// The scale-down pipeline ran to completion.
    ScaledDown,
    /// A pipeline step failed; retried next tick.
    Aborted(String),
}

pub struct SelfMonitor {
    node_name: String,
    instance_id: Option<String>,
    config: Arc<SpotGuardConfig>,
    asg: Arc<dyn AsgClient>,
    k8s: Arc<dyn K8sClient>,
    node_ops: Arc<dyn NodeOps>,
    annotations: AnnotationStore,
    health: HealthEvaluator,
    safety: SafetyEvaluator,
    pre_scale: Option<PreScalePlanner>,

    start_time: DateTime<Utc>,
    healthy_since: Option<DateTime<Utc>>,
    skip_until: Option<DateTime<Utc>>,

    eviction_poll_interval: Duration,
    settle_delay: Duration,
}

impl SelfMonitor {
    pub fn new(
        node_name: &str,
        instance_id: Option<String>,
        config: Arc<SpotGuardConfig>,
        asg: Arc<dyn AsgClient>,
        k8s: Arc<dyn K8sClient>,
        node_ops: Arc<dyn NodeOps>,
    ) -> Self {
        let pre_scale = if config.enable_pre_scale {
            Some(PreScalePlanner::new(asg.clone(), k8s.clone(), &config))
        } else {
            None
        };
        Self {
            node_name: node_name.to_string(),
            instance_id,
            annotations: AnnotationStore::new(k8s.clone()),
            health: HealthEvaluator::new(asg.clone(), k8s.clone()),
            safety: SafetyEvaluator::new(k8s.clone()),
            pre_scale,
            asg,
            k8s,
            node_ops,
            config,
            start_time: Utc::now(),
            healthy_since: None,
            skip_until: None,
            eviction_poll_interval: EVICTION_POLL_INTERVAL,
            settle_delay: DECREMENT_SETTLE_DELAY,
        }
    }

    pub fn with_pre_scale_planner(mut self, planner: PreScalePlanner) -> Self {
        self.pre_scale = Some(planner);
        self
    }

    pub fn with_pipeline_pacing(mut self, eviction_poll: Duration, settle: Duration) -> Self {
        self.eviction_poll_interval = eviction_poll;
        self.settle_delay = settle;
        self
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Reads or creates the persistent start time, then checks the
    /// idempotence marker. Returns false when a previous life of this
    /// monitor already finished the scale-down.
    pub async fn init(&mut self, now: DateTime<Utc>) -> Result<bool, K8sError> {
        self.start_time = self
            .annotations
            .get_or_create_start_time(
                &self.node_name,
                &self.config.spot_asg_name,
                &self.config.on_demand_asg_name,
                now,
            )
            .await;
        if self.annotations.is_scale_down_completed(&self.node_name).await? {
            info!(
                "node {}: scale-down already completed, self-monitor exiting",
                self.node_name
            );
            return Ok(false);
        }
        info!(
            "node {}: self-monitor started, watching spot asg {} (start time {})",
            self.node_name, self.config.spot_asg_name, self.start_time
        );
        Ok(true)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        match self.init(Utc::now()).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("node {}: self-monitor init failed: {}", self.node_name, e);
                return;
            }
        }

        let jitter = rand::thread_rng().gen_range(0.0..TICK_JITTER_MAX_SECS);
        let tick = self.config.tick_interval() + Duration::from_secs_f64(jitter);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(tick) => {}
            }
            match self.run_cycle(Utc::now()).await {
                CycleOutcome::ScaledDown | CycleOutcome::AlreadyCompleted => return,
                _ => {}
            }
        }
    }

    /// One full evaluation: gates G1..G3 in order, then the scale-down
    /// pipeline. Drain is only ever attempted when all three gates passed
    /// within this same cycle.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        if let Some(until) = self.skip_until {
            if now < until {
                return CycleOutcome::BackingOff;
            }
            self.skip_until = None;
        }

        // G1: minimum runtime before any retirement is considered.
        if now - self.start_time < self.config.minimum_wait() {
            return CycleOutcome::MinimumWaitPending;
        }

        // G2: spot fleet healthy, its nodes ready, and both for long enough.
        match self
            .health
            .check_comprehensive(
                &self.config.spot_asg_name,
                self.config.spot_stability(),
                self.healthy_since,
                now,
            )
            .await
        {
            Ok(status) => {
                self.healthy_since = status.healthy_since;
                if !(status.is_fully_healthy() && status.stable) {
                    return CycleOutcome::AwaitingStability;
                }
            }
            Err(e) => {
                warn!("node {}: health check failed at gate G2: {}", self.node_name, e);
                return CycleOutcome::AwaitingStability;
            }
        }

        // G3: drain must be provably safe.
        match self
            .safety
            .can_safely_drain(&self.node_name, self.config.max_cluster_utilization)
            .await
        {
            Ok(None) => {}
            Ok(Some(blocker)) if blocker.is_utilization() && self.pre_scale.is_some() => {
                match self.try_pre_scale(now).await {
                    PreScaleResolution::Proceed => {}
                    PreScaleResolution::Blocked(outcome) => return outcome,
                }
            }
            Ok(Some(blocker)) => {
                info!("node {}: drain vetoed at gate G3: {}", self.node_name, blocker);
                return CycleOutcome::DrainBlocked(blocker.to_string());
            }
            Err(e) => {
                warn!("node {}: safety check failed at gate G3: {}", self.node_name, e);
                return CycleOutcome::DrainBlocked(e.to_string());
            }
        }

        self.execute_scale_down(now).await
    }

    async fn try_pre_scale(&mut self, now: DateTime<Utc>) -> PreScaleResolution {
        let planner = self.pre_scale.as_ref().unwrap();
        let current_utilization = self.safety.cluster_utilization().await;
        let current_node_count = match self.k8s.list_nodes().await {
            Ok(nodes) => nodes.iter().filter(|node| node.is_ready()).count(),
            Err(e) => {
                warn!("node {}: node list failed before pre-scale: {}", self.node_name, e);
                return PreScaleResolution::Blocked(CycleOutcome::DrainBlocked(e.to_string()));
            }
        };

        match planner
            .execute(
                &self.node_name,
                current_utilization,
                current_node_count,
                &self.safety,
                now,
            )
            .await
        {
            PreScaleOutcome::CapacityRestored => {
                match self
                    .safety
                    .can_safely_drain(&self.node_name, self.config.max_cluster_utilization)
                    .await
                {
                    Ok(None) => PreScaleResolution::Proceed,
                    Ok(Some(blocker)) => PreScaleResolution::Blocked(CycleOutcome::DrainBlocked(
                        blocker.to_string(),
                    )),
                    Err(e) => {
                        PreScaleResolution::Blocked(CycleOutcome::DrainBlocked(e.to_string()))
                    }
                }
            }
            PreScaleOutcome::ThresholdRelaxed => PreScaleResolution::Proceed,
            PreScaleOutcome::Abandoned { retry_at } => {
                self.skip_until = Some(retry_at);
                PreScaleResolution::Blocked(CycleOutcome::BackingOff)
            }
        }
    }

    /// Steps S1..S7. The idempotence marker is written first so a restart
    /// during any later step can never trigger a second attempt; drain
    /// problems after the point of no return are warnings, not aborts.
    async fn execute_scale_down(&mut self, now: DateTime<Utc>) -> CycleOutcome {
        let mut event = FallbackEvent::new(
            &self.node_name,
            self.instance_id.clone(),
            &self.config.spot_asg_name,
            &self.config.on_demand_asg_name,
            self.start_time,
            self.healthy_since,
            now,
        );
        info!(
            "{}: all gates passed, retiring on-demand node {}",
            event.id, self.node_name
        );

        // S1: idempotence marker, the single claim on this node's lifecycle.
        match self
            .annotations
            .mark_scale_down_completed(&self.node_name, now)
            .await
        {
            Ok(true) => event.scale_down_initiated = true,
            Ok(false) => {
                warn!(
                    "{}: scale-down already marked by another writer, standing down",
                    event.id
                );
                return CycleOutcome::AlreadyCompleted;
            }
            Err(e) => {
                warn!("{}: failed to mark scale-down: {}", event.id, e);
                return CycleOutcome::Aborted(format!("mark scale-down: {}", e));
            }
        }

        // S2: keep new pods away while the drain runs.
        if let Err(e) = self.apply_scale_down_taint().await {
            warn!("{}: failed to taint node: {}", event.id, e);
            return CycleOutcome::Aborted(format!("taint: {}", e));
        }

        // S3 + S4: cordon, then evict.
        if let Err(e) = self.node_ops.cordon(&self.node_name).await {
            warn!("{}: cordon failed: {}", event.id, e);
            return CycleOutcome::Aborted(format!("cordon: {}", e));
        }
        if let Err(e) = self
            .node_ops
            .drain(&self.node_name, self.config.eviction_timeout())
            .await
        {
            // The node is cordoned and most workload is gone; refusing to
            // decrement now would strand the node forever.
            warn!("{}: drain reported an error, continuing: {}", event.id, e);
        }

        // S5: watch the node empty out.
        self.verify_eviction(&event.id).await;

        // S6: release the claimed capacity.
        match self.decrement_on_demand(&event.id).await {
            Ok(()) => {}
            Err(reason) => return CycleOutcome::Aborted(reason),
        }

        // S7: nothing left to do; the agent terminates with its node.
        info!("{}: scale-down complete", event.id);
        CycleOutcome::ScaledDown
    }

    async fn apply_scale_down_taint(&self) -> Result<(), K8sError> {
        for _ in 0..=MAX_TAINT_CONFLICT_RETRIES {
            let mut node = self.k8s.get_node(&self.node_name).await?;
            if node.has_taint(SCALE_DOWN_PENDING_TAINT) {
                return Ok(());
            }
            node.spec.taints.push(Taint {
                key: SCALE_DOWN_PENDING_TAINT.to_string(),
                value: "true".to_string(),
                effect: TaintEffect::NoSchedule,
            });
            match self.k8s.update_node(&node).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(K8sError::Conflict(self.node_name.clone()))
    }

    async fn verify_eviction(&self, event_id: &str) {
        let deadline = tokio::time::Instant::now() + self.config.eviction_timeout();
        loop {
            match self.k8s.list_pods_on_node(&self.node_name).await {
                Ok(pods) => {
                    let remaining = pods.iter().filter(|pod| !pod.is_daemon_set()).count();
                    if remaining == 0 {
                        return;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        warn!(
                            "{}: {} non-daemonset pods remain after eviction budget, continuing",
                            event_id, remaining
                        );
                        return;
                    }
                }
                Err(e) => {
                    warn!("{}: pod list failed during eviction wait: {}", event_id, e);
                    return;
                }
            }
            tokio::time::sleep(self.eviction_poll_interval).await;
        }
    }

    async fn decrement_on_demand(&self, event_id: &str) -> Result<(), String> {
        let group_name = &self.config.on_demand_asg_name;
        let group = self
            .asg
            .describe_group(group_name)
            .await
            .map_err(|e| format!("describe {}: {}", group_name, e))?;

        if group.desired_capacity == 0 || group.desired_capacity - 1 < group.min_size {
            return Err(format!(
                "decrement of {} refused: desired {} would drop below min {}",
                group_name, group.desired_capacity, group.min_size
            ));
        }

        let expected = group.desired_capacity - 1;
        self.asg
            .set_desired_capacity(group_name, expected, false)
            .await
            .map_err(|e| format!("set desired capacity on {}: {}", group_name, e))?;

        // Re-read after a short settle to surface concurrent modification.
        tokio::time::sleep(self.settle_delay).await;
        match self.asg.describe_group(group_name).await {
            Ok(group) if group.desired_capacity != expected => warn!(
                "{}: asg {} desired capacity is {} after decrement to {}, concurrent change?",
                event_id, group_name, group.desired_capacity, expected
            ),
            Ok(_) => {}
            Err(e) => warn!("{}: post-decrement describe failed: {}", event_id, e),
        }
        Ok(())
    }
}

enum PreScaleResolution {
    Proceed,
    Blocked(CycleOutcome),
}
