//! Process-local record of a fallback retirement in flight.

use chrono::{DateTime, Utc};

/// Created at the moment the self-monitor decides to retire its on-demand
/// node, consumed by the scale-down pipeline, and never persisted: the
/// durable trail lives in node annotations instead.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackEvent {
    /// Node name plus decision timestamp, unique enough for log correlation.
    pub id: String,
    pub spot_asg_name: String,
    pub on_demand_asg_name: String,
    pub node_name: String,
    pub instance_id: Option<String>,
    pub monitor_start_time: DateTime<Utc>,
    /// When the spot ASG first became healthy in the current streak.
    pub spot_healthy_since: Option<DateTime<Utc>>,
    pub scale_down_initiated: bool,
}

impl FallbackEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: &str,
        instance_id: Option<String>,
        spot_asg_name: &str,
        on_demand_asg_name: &str,
        monitor_start_time: DateTime<Utc>,
        spot_healthy_since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{}-{}", node_name, now.timestamp()),
            spot_asg_name: spot_asg_name.to_string(),
            on_demand_asg_name: on_demand_asg_name.to_string(),
            node_name: node_name.to_string(),
            instance_id,
            monitor_start_time,
            spot_healthy_since,
            scale_down_initiated: false,
        }
    }
}
