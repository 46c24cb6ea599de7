use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Gets the total sum of durations recorded (in microseconds).
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Scheduler-wide counters, shared between the facade, the trigger
/// coordinator, the job runner and the health monitor.
///
/// Cloning only clones the `Arc`s. Per-job figures live in
/// [`crate::tracker::ExecutionTracker`]; these are process totals.
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
  // --- Counters (Monotonically increasing) ---
  /// Attempts that passed the concurrency gate.
  pub executions_started: Arc<AtomicUsize>,
  pub executions_succeeded: Arc<AtomicUsize>,
  /// Failed attempts, timeouts and panics included.
  pub executions_failed: Arc<AtomicUsize>,
  pub executions_timed_out: Arc<AtomicUsize>,
  pub executions_panicked: Arc<AtomicUsize>,
  pub retries_scheduled: Arc<AtomicUsize>,
  /// Attempts rejected because the gate was saturated.
  pub rejected_concurrency_limit: Arc<AtomicUsize>,
  /// Attempts rejected because the same job was still running.
  pub rejected_overlap: Arc<AtomicUsize>,
  /// Natural schedule fires dispatched by the coordinator.
  pub triggers_fired: Arc<AtomicUsize>,
  pub manual_triggers: Arc<AtomicUsize>,
  /// `recovery_needed` alerts raised by the failure threshold check.
  pub recovery_alerts: Arc<AtomicUsize>,
  pub health_checks: Arc<AtomicUsize>,
  pub critical_health_checks: Arc<AtomicUsize>,
  pub recoveries_attempted: Arc<AtomicUsize>,
  /// Journal writes that failed and were swallowed.
  pub persistence_failures: Arc<AtomicUsize>,

  // --- Gauges (Current state values) ---
  /// Attempts currently holding a gate slot.
  pub executions_running: Arc<AtomicUsize>,
  /// Jobs currently bound to an armed trigger.
  pub triggers_armed: Arc<AtomicUsize>,

  // --- Histograms/Summaries ---
  /// Wall-clock duration of finalized attempts.
  pub execution_duration: Arc<SimpleHistogram>,
}

impl Default for SchedulerMetrics {
  fn default() -> Self {
    Self::new()
  }
}

impl SchedulerMetrics {
  pub fn new() -> Self {
    Self {
      executions_started: Default::default(),
      executions_succeeded: Default::default(),
      executions_failed: Default::default(),
      executions_timed_out: Default::default(),
      executions_panicked: Default::default(),
      retries_scheduled: Default::default(),
      rejected_concurrency_limit: Default::default(),
      rejected_overlap: Default::default(),
      triggers_fired: Default::default(),
      manual_triggers: Default::default(),
      recovery_alerts: Default::default(),
      health_checks: Default::default(),
      critical_health_checks: Default::default(),
      recoveries_attempted: Default::default(),
      persistence_failures: Default::default(),
      executions_running: Default::default(),
      triggers_armed: Default::default(),
      execution_duration: Arc::new(SimpleHistogram::default()),
    }
  }

  /// Creates a point-in-time snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      executions_started: self.executions_started.load(order),
      executions_succeeded: self.executions_succeeded.load(order),
      executions_failed: self.executions_failed.load(order),
      executions_timed_out: self.executions_timed_out.load(order),
      executions_panicked: self.executions_panicked.load(order),
      retries_scheduled: self.retries_scheduled.load(order),
      rejected_concurrency_limit: self.rejected_concurrency_limit.load(order),
      rejected_overlap: self.rejected_overlap.load(order),
      triggers_fired: self.triggers_fired.load(order),
      manual_triggers: self.manual_triggers.load(order),
      recovery_alerts: self.recovery_alerts.load(order),
      health_checks: self.health_checks.load(order),
      critical_health_checks: self.critical_health_checks.load(order),
      recoveries_attempted: self.recoveries_attempted.load(order),
      persistence_failures: self.persistence_failures.load(order),
      executions_running: self.executions_running.load(order),
      triggers_armed: self.triggers_armed.load(order),
      execution_duration_count: self.execution_duration.get_count(),
      execution_duration_sum_micros: self.execution_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of the scheduler's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
  // Counters
  pub executions_started: usize,
  pub executions_succeeded: usize,
  pub executions_failed: usize,
  pub executions_timed_out: usize,
  pub executions_panicked: usize,
  pub retries_scheduled: usize,
  pub rejected_concurrency_limit: usize,
  pub rejected_overlap: usize,
  pub triggers_fired: usize,
  pub manual_triggers: usize,
  pub recovery_alerts: usize,
  pub health_checks: usize,
  pub critical_health_checks: usize,
  pub recoveries_attempted: usize,
  pub persistence_failures: usize,
  // Gauges
  pub executions_running: usize,
  pub triggers_armed: usize,
  // Histogram Data
  pub execution_duration_count: usize,
  pub execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean attempt duration in microseconds, or `None` before any attempt finished.
  pub fn mean_execution_duration_micros(&self) -> Option<f64> {
    if self.execution_duration_count == 0 {
      None
    } else {
      Some(self.execution_duration_sum_micros as f64 / self.execution_duration_count as f64)
    }
  }

  pub fn mean_execution_duration(&self) -> Option<Duration> {
    self
      .mean_execution_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }
}
