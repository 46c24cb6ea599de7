//! Periodic health verdicts and auto-recovery.

use crate::coordinator::TriggerHandle;
use crate::events::{EventBus, SchedulerEvent};
use crate::gate::ConcurrencyGate;
use crate::metrics::SchedulerMetrics;
use crate::notify::{AlertPriority, Notification, NotificationSink};
use crate::persistence::ExecutionJournal;
use crate::probe::{ProcessProbe, ProcessSample};
use crate::registry::JobRegistry;
use crate::scheduler::LifecycleState;
use crate::tracker::ExecutionTracker;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Load above this percentage degrades health and throttles concurrency on recovery.
pub const LOAD_DEGRADED_PERCENT: f64 = 80.0;
/// Memory above this percentage makes health critical.
pub const MEMORY_CRITICAL_PERCENT: f64 = 90.0;
/// Factor applied to `max_concurrent_jobs` when recovery throttles.
pub const CONCURRENCY_SHRINK_FACTOR: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
  Healthy,
  Degraded,
  Critical,
}

impl HealthStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      HealthStatus::Healthy => "healthy",
      HealthStatus::Degraded => "degraded",
      HealthStatus::Critical => "critical",
    }
  }
}

impl fmt::Display for HealthStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Point-in-time health snapshot. Recomputed from scratch on every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
  pub status: HealthStatus,
  /// Jobs bound to an armed trigger.
  pub active_jobs: usize,
  /// Jobs with at least one consecutive failure.
  pub failed_jobs: usize,
  pub system_load: f64,
  pub memory_usage: f64,
  pub issues: Vec<String>,
  pub checked_at: DateTime<Utc>,
}

impl SystemHealth {
  pub fn is_critical(&self) -> bool {
    self.status == HealthStatus::Critical
  }

  pub fn memory_pressure(&self) -> bool {
    self.memory_usage > MEMORY_CRITICAL_PERCENT
  }

  pub fn load_pressure(&self) -> bool {
    self.system_load > LOAD_DEGRADED_PERCENT
  }
}

/// Signals the health rules are evaluated against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthInputs {
  pub active_jobs: usize,
  pub failed_jobs: usize,
  pub sample: ProcessSample,
  pub scheduler_running: bool,
}

/// Applies the health rules. Each triggered rule adds an issue and the most
/// severe triggered status wins.
pub fn assess(inputs: HealthInputs, checked_at: DateTime<Utc>) -> SystemHealth {
  let mut status = HealthStatus::Healthy;
  let mut issues = Vec::new();
  let ProcessSample {
    system_load,
    memory_usage,
  } = inputs.sample;

  if inputs.failed_jobs > 0 {
    issues.push(format!("{} jobs have consecutive failures", inputs.failed_jobs));
    status = status.max(HealthStatus::Degraded);
  }
  if system_load > LOAD_DEGRADED_PERCENT {
    issues.push(format!("High system load: {:.1}%", system_load));
    status = status.max(HealthStatus::Degraded);
  }
  if memory_usage > MEMORY_CRITICAL_PERCENT {
    issues.push(format!("High memory usage: {:.1}%", memory_usage));
    status = HealthStatus::Critical;
  }
  if inputs.active_jobs == 0 && inputs.scheduler_running {
    issues.push("No active jobs while the scheduler is running".to_string());
    status = HealthStatus::Critical;
  }

  SystemHealth {
    status,
    active_jobs: inputs.active_jobs,
    failed_jobs: inputs.failed_jobs,
    system_load,
    memory_usage,
    issues,
    checked_at,
  }
}

/// What an auto-recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RecoveryReport {
  pub restarted_jobs: Vec<String>,
  pub memory_reclaimed: bool,
  pub concurrency_reduced: Option<(usize, usize)>,
  /// Steps that could not be carried out.
  pub failures: Vec<String>,
}

/// Samples tracker and process signals and drives recovery when critical.
pub(crate) struct HealthMonitor {
  pub tracker: Arc<ExecutionTracker>,
  pub gate: Arc<ConcurrencyGate>,
  pub probe: Arc<dyn ProcessProbe>,
  pub registry: Arc<RwLock<JobRegistry>>,
  pub paused: Arc<Mutex<HashSet<String>>>,
  pub journal: Option<ExecutionJournal>,
  pub notifier: Arc<dyn NotificationSink>,
  pub events: EventBus,
  pub metrics: SchedulerMetrics,
  pub lifecycle: watch::Receiver<LifecycleState>,
  pub enable_auto_recovery: bool,
}

impl HealthMonitor {
  /// Computes a verdict without side effects.
  pub fn snapshot(&self) -> SystemHealth {
    let scheduler_running = *self.lifecycle.borrow() == LifecycleState::Running;
    let inputs = HealthInputs {
      active_jobs: self.metrics.triggers_armed.load(AtomicOrdering::Relaxed),
      failed_jobs: self.tracker.failing_count(),
      sample: self.probe.sample(),
      scheduler_running,
    };
    assess(inputs, Utc::now())
  }

  /// One health tick: assess, persist, alert and recover when critical,
  /// then publish. `triggers` is `None` when the coordinator is not running,
  /// in which case no job can be restarted.
  pub async fn tick(&self, triggers: Option<&TriggerHandle>) -> SystemHealth {
    let health = self.snapshot();
    self.metrics.health_checks.fetch_add(1, AtomicOrdering::Relaxed);
    debug!(status = %health.status, issues = health.issues.len(), "Health check.");

    if let Some(journal) = &self.journal {
      journal.record_health(&health).await;
    }

    if health.is_critical() {
      self.handle_critical(&health, triggers).await;
    }

    self.events.emit(SchedulerEvent::HealthChecked {
      health: health.clone(),
    });
    health
  }

  async fn handle_critical(&self, health: &SystemHealth, triggers: Option<&TriggerHandle>) {
    self.metrics.critical_health_checks.fetch_add(1, AtomicOrdering::Relaxed);
    error!(issues = ?health.issues, "Critical health status detected.");

    let notification = Notification::new(
      "system_critical",
      "Scheduler Critical Health Alert",
      format!("Scheduler health is critical: {}", health.issues.join(", ")),
      AlertPriority::Critical,
      "system_health",
    );
    if let Err(e) = self.notifier.notify(notification).await {
      warn!(error = %e, "Failed to deliver critical health alert.");
    }

    if self.enable_auto_recovery {
      self.metrics.recoveries_attempted.fetch_add(1, AtomicOrdering::Relaxed);
      let report = self.recover(health, triggers).await;
      info!(
        restarted = ?report.restarted_jobs,
        memory_reclaimed = report.memory_reclaimed,
        concurrency_reduced = ?report.concurrency_reduced,
        failed_steps = report.failures.len(),
        "Auto-recovery completed."
      );
      self.events.emit(SchedulerEvent::RecoveryCompleted {
        restarted_jobs: report.restarted_jobs,
        memory_reclaimed: report.memory_reclaimed,
        concurrency_reduced: report.concurrency_reduced,
      });
      if !report.failures.is_empty() {
        let reason = report.failures.join("; ");
        error!(%reason, "Auto-recovery partially failed.");
        self.events.emit(SchedulerEvent::RecoveryFailed { reason });
      }
    }

    self.events.emit(SchedulerEvent::HealthCritical {
      health: health.clone(),
    });
  }

  /// Best-effort corrective actions, in order: restart failing jobs whose
  /// trigger is not armed, reclaim memory, throttle concurrency. A failed
  /// step is recorded in the report and the remaining steps still run.
  async fn recover(&self, health: &SystemHealth, triggers: Option<&TriggerHandle>) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    if let Some(triggers) = triggers {
      self.restart_failing_jobs(triggers, &mut report).await;
    }

    if health.memory_pressure() {
      report.memory_reclaimed = self.probe.reclaim_memory();
      if !report.memory_reclaimed {
        debug!("No memory reclamation available; relying on throttling.");
      }
    }

    if health.load_pressure() {
      report.concurrency_reduced = Some(self.gate.shrink(CONCURRENCY_SHRINK_FACTOR));
    }

    report
  }

  async fn restart_failing_jobs(&self, triggers: &TriggerHandle, report: &mut RecoveryReport) {
    let failing = self.tracker.failing_jobs();
    if failing.is_empty() {
      return;
    }
    let armed: HashSet<String> = match triggers.armed().await {
      Ok(armed) => armed.into_iter().map(|t| t.job_name).collect(),
      Err(e) => {
        warn!(error = %e, "Could not list armed triggers; skipping job restarts.");
        report.failures.push(format!("listing armed triggers: {}", e));
        return;
      }
    };

    for name in failing {
      if armed.contains(&name) {
        continue;
      }
      let definition = self.registry.read().get(&name);
      let Some(definition) = definition else {
        continue;
      };
      if !definition.enabled {
        continue;
      }
      match triggers.arm(definition).await {
        Ok(Some(_)) => {
          self.paused.lock().remove(&name);
          info!(job_name = %name, "Restarted failing job.");
          self.tracker.reset_consecutive(&name);
          report.restarted_jobs.push(name);
        }
        Ok(None) => debug!(job_name = %name, "Failing job has no upcoming fire; not restarted."),
        Err(e) => {
          warn!(job_name = %name, error = %e, "Failed to restart job.");
          report.failures.push(format!("restarting `{}`: {}", name, e));
        }
      }
    }
  }

  /// Health ticker task. Exits when the scheduler leaves `starting`/`running`.
  /// When `flush_interval` is set, job metrics are also appended to the
  /// journal on that cadence.
  pub async fn run(self: Arc<Self>, triggers: TriggerHandle, period: Duration, flush_interval: Option<Duration>) {
    info!(period_ms = period.as_millis() as u64, "Health monitor started.");
    let mut lifecycle = self.lifecycle.clone();
    let flush_interval = flush_interval.filter(|interval| !interval.is_zero());

    let mut health_tick = interval_at(Instant::now() + period, period);
    health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let flush_period = flush_interval.unwrap_or(period);
    let mut flush_tick = interval_at(Instant::now() + flush_period, flush_period);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let flush_enabled = flush_interval.is_some() && self.journal.is_some();

    loop {
      tokio::select! {
          biased;

          _ = async { let _ = lifecycle.wait_for(|state| !state.is_active()).await; } => {
              break;
          },

          _ = health_tick.tick() => {
              self.tick(Some(&triggers)).await;
          },

          _ = flush_tick.tick(), if flush_enabled => {
              if let Some(journal) = &self.journal {
                  journal.flush_metrics(&self.tracker.snapshot()).await;
              }
          },
      }
    }
    info!("Health monitor stopped.");
  }
}
