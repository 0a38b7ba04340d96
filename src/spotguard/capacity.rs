//! Detects capacity exhaustion from ASG scaling activity history.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};

use crate::client::asg::{ActivityStatus, AsgClient, AsgError, ScalingActivity};

/// How many recent activities to inspect per check.
const ACTIVITY_FETCH_LIMIT: u32 = 50;

/// Activities that started earlier than the scale attempt minus this
/// tolerance are stale history, not evidence about the current attempt.
/// Covers clock skew and eventual consistency of the activity feed.
const START_TIME_SKEW_TOLERANCE_SECS: i64 = 5;

/// Substrings identifying capacity exhaustion. The generic token "capacity"
/// alone is not used: it matches too many unrelated messages.
const CAPACITY_ERROR_TOKENS: &[&str] = &[
    "InsufficientInstanceCapacity",
    "Spot request failed",
    "capacity-not-available",
    "capacity-not-available-zone",
];

pub struct CapacityFailureDetector {
    asg: Arc<dyn AsgClient>,
}

impl CapacityFailureDetector {
    pub fn new(asg: Arc<dyn AsgClient>) -> Self {
        Self { asg }
    }

    /// Whether scaling activities posted after `scale_start_time` indicate
    /// that the group ran out of capacity.
    ///
    /// Throttle errors from the activity feed are swallowed and reported as
    /// "no failure observed" so the surrounding wait loop retries on its
    /// next tick instead of aborting.
    pub async fn capacity_failure_observed(
        &self,
        asg_name: &str,
        scale_start_time: DateTime<Utc>,
    ) -> Result<bool, AsgError> {
        let activities = match self
            .asg
            .describe_scaling_activities(asg_name, ACTIVITY_FETCH_LIMIT)
            .await
        {
            Ok(activities) => activities,
            Err(e) if e.is_throttle() => {
                warn!("asg {}: scaling activity list throttled: {}", asg_name, e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let cutoff = scale_start_time - Duration::seconds(START_TIME_SKEW_TOLERANCE_SECS);
        for activity in &activities {
            if activity.start_time < cutoff {
                continue;
            }
            if activity_indicates_capacity_failure(activity) {
                debug!(
                    "asg {}: capacity failure in activity started at {}: {}",
                    asg_name, activity.start_time, activity.description
                );
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn activity_indicates_capacity_failure(activity: &ScalingActivity) -> bool {
    if !matches!(
        activity.status_code,
        ActivityStatus::Failed | ActivityStatus::Cancelled
    ) {
        return false;
    }
    CAPACITY_ERROR_TOKENS
        .iter()
        .any(|token| activity.description.contains(token) || activity.cause.contains(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    use crate::sim::cluster::SimCluster;

    fn activity(
        start_time: DateTime<Utc>,
        status_code: ActivityStatus,
        description: &str,
    ) -> ScalingActivity {
        ScalingActivity {
            start_time,
            status_code,
            description: description.to_string(),
            cause: String::new(),
        }
    }

    fn detector_with_activities(
        asg_name: &str,
        activities: Vec<ScalingActivity>,
    ) -> CapacityFailureDetector {
        let cluster = SimCluster::new();
        cluster.add_asg(asg_name, 1, 0, 5);
        for a in activities {
            cluster.record_activity(asg_name, a);
        }
        CapacityFailureDetector::new(cluster.asg_client())
    }

    #[test]
    fn test_failed_activity_with_token_matches() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert!(activity_indicates_capacity_failure(&activity(
            t,
            ActivityStatus::Failed,
            "Launching a new EC2 instance. Status Reason: InsufficientInstanceCapacity"
        )));
        assert!(activity_indicates_capacity_failure(&activity(
            t,
            ActivityStatus::Cancelled,
            "Spot request failed: capacity-not-available"
        )));
    }

    #[test]
    fn test_generic_capacity_word_does_not_match() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert!(!activity_indicates_capacity_failure(&activity(
            t,
            ActivityStatus::Failed,
            "Validation error: desired capacity exceeds max size"
        )));
        // Successful activities never count, whatever their text.
        assert!(!activity_indicates_capacity_failure(&activity(
            t,
            ActivityStatus::Successful,
            "InsufficientInstanceCapacity"
        )));
    }

    #[tokio::test]
    async fn test_stale_activity_before_attempt_is_ignored() {
        let scale_start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let detector = detector_with_activities(
            "spot-workers",
            vec![activity(
                scale_start - Duration::hours(1),
                ActivityStatus::Failed,
                "InsufficientInstanceCapacity",
            )],
        );
        assert!(!detector
            .capacity_failure_observed("spot-workers", scale_start)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_activity_within_skew_tolerance_counts() {
        let scale_start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let detector = detector_with_activities(
            "spot-workers",
            vec![activity(
                scale_start - Duration::seconds(3),
                ActivityStatus::Failed,
                "InsufficientInstanceCapacity",
            )],
        );
        assert!(detector
            .capacity_failure_observed("spot-workers", scale_start)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_throttled_activity_feed_reports_no_failure() {
        let cluster = SimCluster::new();
        cluster.add_asg("spot-workers", 1, 0, 5);
        cluster.throttle_next_asg_calls(1);
        let detector = CapacityFailureDetector::new(cluster.asg_client());
        let scale_start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert!(!detector
            .capacity_failure_observed("spot-workers", scale_start)
            .await
            .unwrap());
    }
}
