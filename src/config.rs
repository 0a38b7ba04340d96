//! Config fields definitions for the spot guard agent

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} is required when spot guard is enabled")]
    MissingField(&'static str),
    #[error("{field} must be within (0, 100], got {value}")]
    PercentOutOfRange { field: &'static str, value: f64 },
    #[error("{field} must be positive, got {value}")]
    NonPositiveDuration { field: &'static str, value: f64 },
}

/// All durations are in seconds with fractional part, all utilization
/// thresholds are percentages.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct SpotGuardConfig {
    #[serde(default = "enabled_default")]
    pub enabled: bool,

    /// Required when enabled.
    #[serde(default)]
    pub spot_asg_name: String,
    /// Required when enabled.
    #[serde(default)]
    pub on_demand_asg_name: String,

    /// Minimum time an on-demand node runs before scale-down is considered.
    #[serde(default = "minimum_wait_duration_default")]
    pub minimum_wait_duration: f64,

    /// Self-monitor tick period, before jitter.
    #[serde(default = "check_interval_default")]
    pub check_interval: f64,

    /// How long the spot ASG must stay healthy before it counts as stable.
    #[serde(default = "spot_stability_duration_default")]
    pub spot_stability_duration: f64,

    /// Ceiling on projected cluster utilization after draining, in percent.
    #[serde(default = "max_cluster_utilization_default")]
    pub max_cluster_utilization: f64,

    /// Drain budget.
    #[serde(default = "pod_eviction_timeout_default")]
    pub pod_eviction_timeout: f64,

    /// How long to wait for a scaled-up instance to reach InService.
    #[serde(default = "scale_timeout_default")]
    pub scale_timeout: f64,

    /// Extra cluster-autoscaler protection time on top of the stability and
    /// minimum-wait windows.
    #[serde(default = "pod_migration_buffer_default")]
    pub pod_migration_buffer: f64,

    #[serde(default = "enable_pre_scale_default")]
    pub enable_pre_scale: bool,

    #[serde(default = "pre_scale_timeout_default")]
    pub pre_scale_timeout: f64,

    /// Target utilization after proactive spot scale-up, in percent.
    #[serde(default = "pre_scale_target_utilization_default")]
    pub pre_scale_target_utilization: f64,

    /// Overshoot applied to the computed node deficit, in percent.
    #[serde(default = "pre_scale_safety_buffer_default")]
    pub pre_scale_safety_buffer: f64,

    /// Relaxed utilization ceiling used when proactive scale-up fails.
    #[serde(default = "pre_scale_fallback_threshold_default")]
    pub pre_scale_fallback_threshold: f64,

    /// How long the self-monitor backs off after all pre-scale levels failed.
    #[serde(default = "pre_scale_retry_backoff_default")]
    pub pre_scale_retry_backoff: f64,

    /// If not set default output of logs is stdout/stderr
    pub logs_filepath: Option<String>,
}

impl Default for SpotGuardConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").unwrap()
    }
}

fn enabled_default() -> bool {
    false // disabled by default
}
fn minimum_wait_duration_default() -> f64 {
    600.0 // 10 minutes
}
fn check_interval_default() -> f64 {
    30.0
}
fn spot_stability_duration_default() -> f64 {
    120.0 // 2 minutes
}
fn max_cluster_utilization_default() -> f64 {
    75.0
}
fn pod_eviction_timeout_default() -> f64 {
    300.0 // 5 minutes
}
fn scale_timeout_default() -> f64 {
    300.0
}
fn pod_migration_buffer_default() -> f64 {
    180.0 // 3 minutes
}
fn enable_pre_scale_default() -> bool {
    false
}
fn pre_scale_timeout_default() -> f64 {
    300.0
}
fn pre_scale_target_utilization_default() -> f64 {
    65.0
}
fn pre_scale_safety_buffer_default() -> f64 {
    10.0
}
fn pre_scale_fallback_threshold_default() -> f64 {
    95.0
}
fn pre_scale_retry_backoff_default() -> f64 {
    600.0 // 10 minutes
}

impl SpotGuardConfig {
    /// Configuration errors are the only fatal startup errors; everything
    /// else the agent retries at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.spot_asg_name.is_empty() {
            return Err(ConfigError::MissingField("spot_asg_name"));
        }
        if self.on_demand_asg_name.is_empty() {
            return Err(ConfigError::MissingField("on_demand_asg_name"));
        }
        for (field, value) in [
            ("max_cluster_utilization", self.max_cluster_utilization),
            (
                "pre_scale_target_utilization",
                self.pre_scale_target_utilization,
            ),
            (
                "pre_scale_fallback_threshold",
                self.pre_scale_fallback_threshold,
            ),
        ] {
            if value <= 0.0 || value > 100.0 {
                return Err(ConfigError::PercentOutOfRange { field, value });
            }
        }
        for (field, value) in [
            ("minimum_wait_duration", self.minimum_wait_duration),
            ("check_interval", self.check_interval),
            ("spot_stability_duration", self.spot_stability_duration),
            ("pod_eviction_timeout", self.pod_eviction_timeout),
            ("scale_timeout", self.scale_timeout),
            ("pod_migration_buffer", self.pod_migration_buffer),
            ("pre_scale_timeout", self.pre_scale_timeout),
            ("pre_scale_retry_backoff", self.pre_scale_retry_backoff),
        ] {
            if value <= 0.0 {
                return Err(ConfigError::NonPositiveDuration { field, value });
            }
        }
        Ok(())
    }

    pub fn minimum_wait(&self) -> chrono::Duration {
        secs_f64_to_chrono(self.minimum_wait_duration)
    }

    pub fn spot_stability(&self) -> chrono::Duration {
        secs_f64_to_chrono(self.spot_stability_duration)
    }

    pub fn migration_buffer(&self) -> chrono::Duration {
        secs_f64_to_chrono(self.pod_migration_buffer)
    }

    pub fn retry_backoff(&self) -> chrono::Duration {
        secs_f64_to_chrono(self.pre_scale_retry_backoff)
    }

    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.pod_eviction_timeout)
    }

    pub fn scale_wait(&self) -> Duration {
        Duration::from_secs_f64(self.scale_timeout)
    }

    pub fn pre_scale_wait(&self) -> Duration {
        Duration::from_secs_f64(self.pre_scale_timeout)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval)
    }
}

fn secs_f64_to_chrono(seconds: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((seconds * 1000.0) as i64)
}
