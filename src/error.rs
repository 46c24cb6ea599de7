use crate::scheduler::LifecycleState;

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while building a scheduler with `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("`max_concurrent_jobs` must be greater than zero")]
  ZeroMaxConcurrentJobs,
  #[error("`health_check_interval` must be greater than zero")]
  ZeroHealthCheckInterval,
}

/// Errors surfaced synchronously by the `CronKeeper` facade.
///
/// Only lifecycle misuse and registry lookups end up here. Failures of an
/// individual job are recorded, retried and alerted on, but never returned
/// to the caller (the single exception being a fast-fail rejection of a
/// manual trigger, see [`SchedulerError::Execution`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
  #[error("Job `{0}` is already registered.")]
  DuplicateJob(String),
  #[error("Job `{0}` not found.")]
  JobNotFound(String),
  #[error("Scheduler cannot start while {0}.")]
  AlreadyRunning(LifecycleState),
  #[error("Scheduler cannot stop while {0}.")]
  NotRunning(LifecycleState),
  #[error("Job `{job}` has an invalid schedule: {reason}")]
  InvalidSchedule { job: String, reason: String },
  #[error("Trigger coordinator is not reachable (scheduler stopped or task panicked).")]
  CoordinatorUnavailable,
  #[error(transparent)]
  Execution(#[from] ExecutionError),
}

/// Why an execution attempt was rejected or how it failed.
///
/// Cloneable so it can travel inside [`crate::SchedulerEvent`]s.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
  /// The global gate is saturated. Transient and expected under load; the
  /// attempt is abandoned, not queued, and is never retried immediately.
  #[error("Maximum concurrent jobs limit reached ({limit})")]
  ConcurrencyLimitExceeded { limit: usize },
  /// A previous attempt of the same job is still running.
  #[error("Job `{job}` is already running")]
  AlreadyRunning { job: String },
  /// The handler returned an error.
  #[error("{message}")]
  Handler { message: String },
  /// The handler did not settle within its budget. It may still be running.
  #[error("execution timeout")]
  Timeout { after: Duration },
  /// The handler panicked.
  #[error("handler panicked")]
  Panicked,
}

impl ExecutionError {
  /// `true` for the fast-fail rejections that never create an execution record.
  pub fn is_rejection(&self) -> bool {
    matches!(
      self,
      ExecutionError::ConcurrencyLimitExceeded { .. } | ExecutionError::AlreadyRunning { .. }
    )
  }
}

/// Errors reported by a [`crate::persistence::Persistence`] backend.
#[derive(Error, Debug)]
pub enum PersistenceError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("failed to decode row: {0}")]
  Decode(String),
  #[error("persistence backend unavailable: {0}")]
  Unavailable(String),
}

/// Errors reported by a [`crate::notify::NotificationSink`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
  #[error("notification delivery failed: {0}")]
  Delivery(String),
}
