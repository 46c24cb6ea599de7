//! Per-job execution metrics.

use crate::job::{ExecutionRecord, ExecutionStatus};

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Outcome of the most recent finalized attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastExecutionStatus {
  Success,
  Failed,
}

/// Accumulated figures for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
  pub total_executions: u64,
  pub successful_executions: u64,
  pub failed_executions: u64,
  /// Back-to-back failures since the last success.
  pub consecutive_failures: u32,
  /// Mean duration of successful attempts, in milliseconds.
  pub average_duration_ms: f64,
  pub last_execution_time: Option<DateTime<Utc>>,
  pub last_execution_status: Option<LastExecutionStatus>,
  /// `successful / total * 100`, or 100 before the first attempt.
  pub uptime: f64,
}

impl Default for JobMetrics {
  fn default() -> Self {
    Self {
      total_executions: 0,
      successful_executions: 0,
      failed_executions: 0,
      consecutive_failures: 0,
      average_duration_ms: 0.0,
      last_execution_time: None,
      last_execution_status: None,
      uptime: 100.0,
    }
  }
}

impl JobMetrics {
  fn record_success(&mut self, at: DateTime<Utc>, duration: Duration) {
    self.total_executions += 1;
    self.successful_executions += 1;
    self.consecutive_failures = 0;
    let duration_ms = duration.as_secs_f64() * 1000.0;
    let n = self.successful_executions as f64;
    self.average_duration_ms += (duration_ms - self.average_duration_ms) / n;
    self.last_execution_time = Some(at);
    self.last_execution_status = Some(LastExecutionStatus::Success);
    self.recompute_uptime();
  }

  fn record_failure(&mut self, at: DateTime<Utc>) {
    self.total_executions += 1;
    self.failed_executions += 1;
    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    self.last_execution_time = Some(at);
    self.last_execution_status = Some(LastExecutionStatus::Failed);
    self.recompute_uptime();
  }

  fn recompute_uptime(&mut self) {
    self.uptime = if self.total_executions == 0 {
      100.0
    } else {
      self.successful_executions as f64 / self.total_executions as f64 * 100.0
    };
  }
}

/// The JobMetrics map, guarded for use from concurrent attempts.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
  jobs: Mutex<HashMap<String, JobMetrics>>,
}

impl ExecutionTracker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a zeroed entry if the job has none.
  pub fn ensure(&self, job_name: &str) {
    self.jobs.lock().entry(job_name.to_string()).or_default();
  }

  pub fn remove(&self, job_name: &str) {
    self.jobs.lock().remove(job_name);
  }

  /// Applies a successful attempt and returns the updated metrics.
  /// Returns `None`, recording nothing, for a job with no entry.
  pub fn record_success(&self, job_name: &str, at: DateTime<Utc>, duration: Duration) -> Option<JobMetrics> {
    let mut jobs = self.jobs.lock();
    let metrics = jobs.get_mut(job_name)?;
    metrics.record_success(at, duration);
    Some(metrics.clone())
  }

  /// Applies a failed attempt and returns the updated metrics.
  /// Returns `None`, recording nothing, for a job with no entry.
  pub fn record_failure(&self, job_name: &str, at: DateTime<Utc>) -> Option<JobMetrics> {
    let mut jobs = self.jobs.lock();
    let metrics = jobs.get_mut(job_name)?;
    metrics.record_failure(at);
    Some(metrics.clone())
  }

  pub fn get(&self, job_name: &str) -> Option<JobMetrics> {
    self.jobs.lock().get(job_name).cloned()
  }

  pub fn snapshot(&self) -> HashMap<String, JobMetrics> {
    self.jobs.lock().clone()
  }

  /// Names of jobs with at least one consecutive failure, sorted.
  pub fn failing_jobs(&self) -> Vec<String> {
    let mut names: Vec<String> = self
      .jobs
      .lock()
      .iter()
      .filter(|(_, m)| m.consecutive_failures > 0)
      .map(|(name, _)| name.clone())
      .collect();
    names.sort();
    names
  }

  pub fn failing_count(&self) -> usize {
    self
      .jobs
      .lock()
      .values()
      .filter(|m| m.consecutive_failures > 0)
      .count()
  }

  pub fn reset_consecutive(&self, job_name: &str) {
    if let Some(metrics) = self.jobs.lock().get_mut(job_name) {
      metrics.consecutive_failures = 0;
    }
  }

  /// Returns the consecutive failure count when it has reached `threshold`.
  pub fn needs_recovery(&self, job_name: &str, threshold: u32) -> Option<u32> {
    self
      .jobs
      .lock()
      .get(job_name)
      .map(|m| m.consecutive_failures)
      .filter(|failures| *failures >= threshold)
  }

  /// Rebuilds metrics for `registered` jobs from finalized history records.
  ///
  /// Records must be ordered by start time. Records of unknown jobs and
  /// records still marked running are skipped. Returns the number of
  /// records applied.
  pub fn rehydrate(&self, registered: &HashSet<String>, history: &[ExecutionRecord]) -> usize {
    let mut rebuilt: HashMap<String, JobMetrics> = HashMap::new();
    let mut applied = 0;
    for record in history {
      if record.status == ExecutionStatus::Running || !registered.contains(&record.job_name) {
        continue;
      }
      let at = record.completed_at.unwrap_or(record.started_at);
      let metrics = rebuilt.entry(record.job_name.clone()).or_default();
      if record.status.is_failure() {
        metrics.record_failure(at);
      } else {
        metrics.record_success(at, record.duration.unwrap_or_default());
      }
      applied += 1;
    }

    let mut jobs = self.jobs.lock();
    for name in registered {
      let metrics = rebuilt.remove(name).unwrap_or_default();
      jobs.insert(name.clone(), metrics);
    }
    applied
  }
}
