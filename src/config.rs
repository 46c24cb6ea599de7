use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduler-wide settings. Durations are (de)serialized as milliseconds.
///
/// Every field has a default, so partial documents deserialize:
///
/// ```
/// let config: cronkeeper::SchedulerConfig =
///     serde_json::from_str(r#"{ "max_concurrent_jobs": 4, "health_check_interval": 15000 }"#).unwrap();
/// assert_eq!(config.max_concurrent_jobs, 4);
/// assert_eq!(config.failure_threshold, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  /// Global cap on simultaneously running attempts.
  pub max_concurrent_jobs: usize,
  #[serde(with = "millis")]
  pub health_check_interval: Duration,
  /// Consecutive failures at which a job raises `recovery_needed`.
  pub failure_threshold: u32,
  /// Rehydrate metrics on start and flush them periodically.
  pub enable_metrics: bool,
  pub enable_auto_recovery: bool,
  /// How far back rehydration reads execution history.
  #[serde(with = "millis")]
  pub metrics_window: Duration,
  #[serde(with = "millis")]
  pub metrics_flush_interval: Duration,
  /// Upper bound on how long `stop()` waits for in-flight attempts.
  #[serde(with = "millis")]
  pub stop_timeout: Duration,
  pub command_buffer_size: usize,
  pub event_buffer_size: usize,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      max_concurrent_jobs: 10,
      health_check_interval: Duration::from_secs(60),
      failure_threshold: 3,
      enable_metrics: true,
      enable_auto_recovery: true,
      metrics_window: Duration::from_secs(30 * 24 * 60 * 60),
      metrics_flush_interval: Duration::from_secs(5 * 60),
      stop_timeout: Duration::from_secs(30),
      command_buffer_size: 128,
      event_buffer_size: 256,
    }
  }
}

mod millis {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}
