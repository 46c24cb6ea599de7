//! Orchestrates one execution attempt of a job.

use crate::error::ExecutionError;
use crate::events::{EventBus, SchedulerEvent};
use crate::gate::ConcurrencyGate;
use crate::job::{ExecutionRecord, JobDefinition, TriggerSource};
use crate::metrics::SchedulerMetrics;
use crate::notify::{AlertPriority, Notification, NotificationSink};
use crate::persistence::ExecutionJournal;
use crate::registry::JobRegistry;
use crate::scheduler::LifecycleState;
use crate::tracker::ExecutionTracker;

#[cfg(feature = "job_context")]
use crate::job::context::{JobContext, CURRENT_JOB_CONTEXT};

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Runs attempts through the concurrency gate, records their outcome and
/// schedules linear retries.
pub(crate) struct JobRunner {
  registry: Arc<RwLock<JobRegistry>>,
  gate: Arc<ConcurrencyGate>,
  tracker: Arc<ExecutionTracker>,
  journal: Option<ExecutionJournal>,
  notifier: Arc<dyn NotificationSink>,
  events: EventBus,
  metrics: SchedulerMetrics,
  failure_threshold: u32,
  lifecycle: watch::Receiver<LifecycleState>,
  // Last start (ms) per job, keeps execution ids unique.
  last_started: Mutex<HashMap<String, i64>>,
  // Retry timers still waiting, per job.
  pending_retries: Mutex<HashMap<String, Vec<AbortHandle>>>,
}

impl JobRunner {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    registry: Arc<RwLock<JobRegistry>>,
    gate: Arc<ConcurrencyGate>,
    tracker: Arc<ExecutionTracker>,
    journal: Option<ExecutionJournal>,
    notifier: Arc<dyn NotificationSink>,
    events: EventBus,
    metrics: SchedulerMetrics,
    failure_threshold: u32,
    lifecycle: watch::Receiver<LifecycleState>,
  ) -> Self {
    Self {
      registry,
      gate,
      tracker,
      journal,
      notifier,
      events,
      metrics,
      failure_threshold,
      lifecycle,
      last_started: Mutex::new(HashMap::new()),
      pending_retries: Mutex::new(HashMap::new()),
    }
  }

  /// Executes one attempt of `definition`.
  ///
  /// Returns `Err` only when the gate rejects the attempt, in which case no
  /// record exists. Handler failures and timeouts yield `Ok` with a failed
  /// record, after a retry has been scheduled if the job's bound allows it.
  pub async fn execute(
    self: &Arc<Self>,
    definition: Arc<JobDefinition>,
    trigger: TriggerSource,
  ) -> Result<ExecutionRecord, ExecutionError> {
    let permit = match self.gate.try_acquire(&definition.name) {
      Ok(permit) => permit,
      Err(reason) => {
        self.record_rejection(&definition.name, trigger, &reason);
        return Err(reason);
      }
    };

    let started_at = self.start_instant(&definition.name);
    let record = ExecutionRecord::running(&definition.name, trigger, started_at);
    let span = info_span!(
      "job_exec",
      job_name = %definition.name,
      execution_id = %record.execution_id,
      %trigger
    );

    async move {
      self.metrics.executions_started.fetch_add(1, AtomicOrdering::Relaxed);
      self.metrics.executions_running.fetch_add(1, AtomicOrdering::Relaxed);
      self.events.emit(SchedulerEvent::JobStarted {
        job_name: definition.name.clone(),
        execution_id: record.execution_id.clone(),
        trigger,
      });
      debug!("Attempt started.");

      let mut record = record;
      let audit = self.journal.as_ref().map(|journal| {
        let (finished_tx, finished_rx) = oneshot::channel();
        journal.track_attempt(record.clone(), finished_rx);
        finished_tx
      });

      let clock = Instant::now();
      let outcome = self.invoke(&definition, &record).await;
      let duration = clock.elapsed();
      let completed_at = Utc::now();
      self.metrics.execution_duration.record(duration);

      match outcome {
        Ok(()) => {
          record.complete(completed_at, duration);
          let metrics = self.tracker.record_success(&definition.name, completed_at, duration);
          self.metrics.executions_succeeded.fetch_add(1, AtomicOrdering::Relaxed);
          self.release(permit);
          if let Some(finished_tx) = audit {
            let _ = finished_tx.send(record.clone());
          }
          info!(
            duration_ms = duration.as_millis() as u64,
            uptime = metrics.as_ref().map(|m| m.uptime),
            "Job completed."
          );

          if let Some(callback) = &definition.on_success {
            if catch_unwind(AssertUnwindSafe(|| callback(&record))).is_err() {
              warn!("on_success callback panicked.");
            }
          }
          self.events.emit(SchedulerEvent::JobSucceeded {
            record: record.clone(),
          });
        }
        Err(error) => {
          record.fail(completed_at, duration, &error);
          let metrics = self.tracker.record_failure(&definition.name, completed_at);
          self.metrics.executions_failed.fetch_add(1, AtomicOrdering::Relaxed);
          self.release(permit);
          if let Some(finished_tx) = audit {
            let _ = finished_tx.send(record.clone());
          }
          warn!(
            error = %error,
            consecutive_failures = metrics.as_ref().map(|m| m.consecutive_failures),
            "Job failed."
          );

          if let Some(callback) = &definition.on_error {
            if catch_unwind(AssertUnwindSafe(|| callback(&error))).is_err() {
              warn!("on_error callback panicked.");
            }
          }
          self.events.emit(SchedulerEvent::JobFailed {
            record: record.clone(),
            error,
          });

          let Some(metrics) = metrics else {
            debug!("Job is no longer registered; no retry.");
            return Ok(record);
          };

          self.check_recovery(&definition.name).await;

          if metrics.consecutive_failures <= definition.retry_attempts {
            self.schedule_retry(definition.clone(), metrics.consecutive_failures);
          } else {
            info!(
              retry_attempts = definition.retry_attempts,
              "Retry bound exhausted; waiting for the next scheduled fire."
            );
          }
        }
      }
      Ok(record)
    }
    .instrument(span)
    .await
  }

  /// Races the handler against the job's timeout. The handler runs in its
  /// own task so panics are contained and a timed-out handler is abandoned
  /// rather than cancelled.
  async fn invoke(&self, definition: &JobDefinition, record: &ExecutionRecord) -> Result<(), ExecutionError> {
    let handler = definition.handler.clone();
    let future_to_run = async move { (*handler)().await };

    #[cfg(feature = "job_context")]
    let mut task = {
      let context = JobContext {
        job_name: record.job_name.clone(),
        execution_id: record.execution_id.clone(),
        trigger: record.trigger,
      };
      tokio::spawn(CURRENT_JOB_CONTEXT.scope(context, future_to_run))
    };
    #[cfg(not(feature = "job_context"))]
    let mut task = {
      let _ = record;
      tokio::spawn(future_to_run)
    };

    match tokio::time::timeout(definition.timeout, &mut task).await {
      Err(_elapsed) => {
        self.metrics.executions_timed_out.fetch_add(1, AtomicOrdering::Relaxed);
        warn!(
          timeout_ms = definition.timeout.as_millis() as u64,
          "Handler exceeded its timeout and was abandoned; it may still be running."
        );
        Err(ExecutionError::Timeout {
          after: definition.timeout,
        })
      }
      Ok(Ok(Ok(()))) => Ok(()),
      Ok(Ok(Err(e))) => Err(ExecutionError::Handler {
        message: format!("{:#}", e),
      }),
      Ok(Err(join_error)) if join_error.is_panic() => {
        error!("Job handler panicked!");
        self.metrics.executions_panicked.fetch_add(1, AtomicOrdering::Relaxed);
        Err(ExecutionError::Panicked)
      }
      Ok(Err(_)) => Err(ExecutionError::Handler {
        message: "handler task was cancelled".to_string(),
      }),
    }
  }

  fn release(&self, permit: crate::gate::GatePermit) {
    drop(permit);
    self.metrics.executions_running.fetch_sub(1, AtomicOrdering::Relaxed);
  }

  fn record_rejection(&self, job_name: &str, trigger: TriggerSource, reason: &ExecutionError) {
    match reason {
      ExecutionError::AlreadyRunning { .. } => {
        self.metrics.rejected_overlap.fetch_add(1, AtomicOrdering::Relaxed);
      }
      _ => {
        self.metrics.rejected_concurrency_limit.fetch_add(1, AtomicOrdering::Relaxed);
      }
    }
    warn!(job_name = %job_name, %trigger, reason = %reason, "Attempt rejected.");
    self.events.emit(SchedulerEvent::JobRejected {
      job_name: job_name.to_string(),
      trigger,
      reason: reason.clone(),
    });
  }

  /// Raises a `recovery_needed` alert once a job's consecutive failures
  /// reach the scheduler-wide threshold. Restarting is left to the health
  /// monitor.
  pub async fn check_recovery(&self, job_name: &str) {
    let Some(failures) = self.tracker.needs_recovery(job_name, self.failure_threshold) else {
      return;
    };
    self.metrics.recovery_alerts.fetch_add(1, AtomicOrdering::Relaxed);
    warn!(consecutive_failures = failures, "Job needs recovery.");
    self.events.emit(SchedulerEvent::RecoveryNeeded {
      job_name: job_name.to_string(),
      consecutive_failures: failures,
    });

    let notification = Notification::new(
      "job_failure",
      format!("Job Failure Alert: {}", job_name),
      format!("Job has failed {} times consecutively", failures),
      AlertPriority::High,
      "job_monitoring",
    );
    if let Err(e) = self.notifier.notify(notification).await {
      warn!(error = %e, "Failed to deliver job failure alert.");
    }
  }

  /// Re-enters `execute` after the job's fixed retry delay. The pending retry
  /// is dropped if the scheduler leaves the running state first, if the job
  /// is unregistered or replaced meanwhile, or by [`JobRunner::cancel_retries`].
  fn schedule_retry(self: &Arc<Self>, definition: Arc<JobDefinition>, attempt: u32) {
    self.metrics.retries_scheduled.fetch_add(1, AtomicOrdering::Relaxed);
    let delay = definition.retry_delay;
    info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling retry.");
    self.events.emit(SchedulerEvent::RetryScheduled {
      job_name: definition.name.clone(),
      attempt,
      delay,
    });

    let job_name = definition.name.clone();
    let runner = self.clone();
    let mut lifecycle = self.lifecycle.clone();
    let timer = tokio::spawn(async move {
      tokio::select! {
        biased;
        _ = async { let _ = lifecycle.wait_for(|state| !state.is_active()).await; } => {
          debug!(job_name = %definition.name, attempt, "Scheduler no longer running; dropping retry.");
        }
        _ = tokio::time::sleep(delay) => {
          if !runner.is_registered(&definition) {
            debug!(job_name = %definition.name, attempt, "Job was unregistered or replaced; dropping retry.");
            return;
          }
          // Cancelling the timer must never cut an attempt short.
          tokio::spawn(async move {
            let _ = runner.execute(definition, TriggerSource::Retry { attempt }).await;
          });
        }
      }
    });

    let mut pending = self.pending_retries.lock();
    let timers = pending.entry(job_name).or_default();
    timers.retain(|t| !t.is_finished());
    timers.push(timer.abort_handle());
  }

  /// Aborts every retry of `job_name` that is still waiting for its delay.
  /// Returns how many were cancelled.
  pub fn cancel_retries(&self, job_name: &str) -> usize {
    let Some(timers) = self.pending_retries.lock().remove(job_name) else {
      return 0;
    };
    let mut cancelled = 0;
    for timer in timers.into_iter().filter(|t| !t.is_finished()) {
      timer.abort();
      cancelled += 1;
    }
    if cancelled > 0 {
      debug!(job_name = %job_name, cancelled, "Cancelled pending retries.");
    }
    cancelled
  }

  /// Whether the registry still holds this very definition.
  fn is_registered(&self, definition: &Arc<JobDefinition>) -> bool {
    self
      .registry
      .read()
      .get(&definition.name)
      .is_some_and(|current| Arc::ptr_eq(&current, definition))
  }

  fn start_instant(&self, job_name: &str) -> DateTime<Utc> {
    let mut now = Utc::now();
    let mut last_started = self.last_started.lock();
    if let Some(previous) = last_started.get(job_name) {
      if now.timestamp_millis() <= *previous {
        now = DateTime::from_timestamp_millis(previous + 1).unwrap_or(now);
      }
    }
    last_started.insert(job_name.to_string(), now.timestamp_millis());
    now
  }
}
