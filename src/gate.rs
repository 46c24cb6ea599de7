//! Global cap on simultaneously running executions.

use crate::error::ExecutionError;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug)]
struct GateState {
  limit: usize,
  running: HashSet<String>,
}

/// Admits at most `limit` attempts at once and at most one attempt per job.
///
/// Admission is fast-fail: a saturated gate or an overlapping fire of the same
/// job is rejected, never queued.
#[derive(Debug)]
pub struct ConcurrencyGate {
  state: Mutex<GateState>,
  released: Notify,
}

/// A held gate slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct GatePermit {
  gate: Arc<ConcurrencyGate>,
  job_name: String,
}

impl GatePermit {
  pub fn job_name(&self) -> &str {
    &self.job_name
  }
}

impl Drop for GatePermit {
  fn drop(&mut self) {
    self.gate.state.lock().running.remove(&self.job_name);
    self.gate.released.notify_waiters();
  }
}

impl ConcurrencyGate {
  pub fn new(limit: usize) -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(GateState {
        limit: limit.max(1),
        running: HashSet::new(),
      }),
      released: Notify::new(),
    })
  }

  /// Claims a slot for `job_name`.
  pub fn try_acquire(self: &Arc<Self>, job_name: &str) -> Result<GatePermit, ExecutionError> {
    let mut state = self.state.lock();
    if state.running.contains(job_name) {
      return Err(ExecutionError::AlreadyRunning {
        job: job_name.to_string(),
      });
    }
    if state.running.len() >= state.limit {
      return Err(ExecutionError::ConcurrencyLimitExceeded { limit: state.limit });
    }
    state.running.insert(job_name.to_string());
    Ok(GatePermit {
      gate: self.clone(),
      job_name: job_name.to_string(),
    })
  }

  pub fn active(&self) -> usize {
    self.state.lock().running.len()
  }

  pub fn limit(&self) -> usize {
    self.state.lock().limit
  }

  pub fn is_running(&self, job_name: &str) -> bool {
    self.state.lock().running.contains(job_name)
  }

  /// Changes the cap. Attempts already admitted keep their slot. Floors at 1.
  pub fn set_limit(&self, limit: usize) {
    let limit = limit.max(1);
    let mut state = self.state.lock();
    debug!(old = state.limit, new = limit, "Concurrency limit changed.");
    state.limit = limit;
  }

  /// Reduces the cap to `floor(limit * factor)`, never below 1.
  /// Returns `(old, new)`.
  pub fn shrink(&self, factor: f64) -> (usize, usize) {
    let mut state = self.state.lock();
    let old = state.limit;
    let new = ((old as f64) * factor).floor().max(1.0) as usize;
    state.limit = new;
    info!(old, new, "Reduced max concurrent jobs.");
    (old, new)
  }

  /// Resolves once no attempt holds a slot.
  pub async fn wait_idle(&self) {
    loop {
      let released = self.released.notified();
      if self.active() == 0 {
        return;
      }
      released.await;
    }
  }
}

