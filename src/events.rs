//! Typed publish/subscribe channel of scheduler outcomes.

use crate::error::ExecutionError;
use crate::health::SystemHealth;
use crate::job::{ExecutionRecord, TriggerSource};

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

/// Everything observable about the scheduler, published on a broadcast channel.
///
/// Subscribers that fall behind lose the oldest events (`RecvError::Lagged`);
/// the scheduler never waits on them.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
  SchedulerStarted { at: DateTime<Utc> },
  SchedulerStopped { at: DateTime<Utc> },
  JobStarted {
    job_name: String,
    execution_id: String,
    trigger: TriggerSource,
  },
  JobSucceeded { record: ExecutionRecord },
  JobFailed {
    record: ExecutionRecord,
    error: ExecutionError,
  },
  /// A fire was turned away by the concurrency gate. No record exists for it.
  JobRejected {
    job_name: String,
    trigger: TriggerSource,
    reason: ExecutionError,
  },
  RetryScheduled {
    job_name: String,
    attempt: u32,
    delay: Duration,
  },
  RecoveryNeeded {
    job_name: String,
    consecutive_failures: u32,
  },
  HealthChecked { health: SystemHealth },
  HealthCritical { health: SystemHealth },
  RecoveryCompleted {
    restarted_jobs: Vec<String>,
    memory_reclaimed: bool,
    /// `(old, new)` max concurrent jobs when throttling was applied.
    concurrency_reduced: Option<(usize, usize)>,
  },
  RecoveryFailed { reason: String },
}

impl SchedulerEvent {
  /// `area:event` topic name, for log routing.
  pub fn topic(&self) -> &'static str {
    match self {
      SchedulerEvent::SchedulerStarted { .. } => "scheduler:started",
      SchedulerEvent::SchedulerStopped { .. } => "scheduler:stopped",
      SchedulerEvent::JobStarted { .. } => "job:started",
      SchedulerEvent::JobSucceeded { .. } => "job:success",
      SchedulerEvent::JobFailed { .. } => "job:failed",
      SchedulerEvent::JobRejected { .. } => "job:rejected",
      SchedulerEvent::RetryScheduled { .. } => "job:retry_scheduled",
      SchedulerEvent::RecoveryNeeded { .. } => "job:recovery_needed",
      SchedulerEvent::HealthChecked { .. } => "health:check",
      SchedulerEvent::HealthCritical { .. } => "health:critical",
      SchedulerEvent::RecoveryCompleted { .. } => "recovery:success",
      SchedulerEvent::RecoveryFailed { .. } => "recovery:failed",
    }
  }

  /// Job the event concerns, if any.
  pub fn job_name(&self) -> Option<&str> {
    match self {
      SchedulerEvent::JobStarted { job_name, .. }
      | SchedulerEvent::JobRejected { job_name, .. }
      | SchedulerEvent::RetryScheduled { job_name, .. }
      | SchedulerEvent::RecoveryNeeded { job_name, .. } => Some(job_name),
      SchedulerEvent::JobSucceeded { record } | SchedulerEvent::JobFailed { record, .. } => {
        Some(&record.job_name)
      }
      _ => None,
    }
  }
}

#[derive(Debug, Clone)]
pub struct EventBus {
  sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self { sender }
  }

  /// Publishes an event. Having no subscribers is not an error.
  pub fn emit(&self, event: SchedulerEvent) {
    trace!(topic = event.topic(), "Emitting event.");
    let _ = self.sender.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
    self.sender.subscribe()
  }
}
