use crate::command::{ArmedTrigger, CoordinatorCommand};
use crate::error::SchedulerError;
use crate::job::{JobDefinition, JobPriority, TriggerSource};
use crate::metrics::SchedulerMetrics;
use crate::runner::JobRunner;
use crate::scheduler::LifecycleState;

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use priority_queue::PriorityQueue;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

/// Earliest fire first; at equal instants the higher job priority wins.
type FireKey = (Reverse<DateTime<Utc>>, JobPriority);

/// The cron trigger loop. Owns every armed binding and fires due jobs into
/// the runner, each in its own task.
pub(crate) struct Coordinator {
  pq: PriorityQueue<String, FireKey>,
  armed: HashMap<String, Arc<JobDefinition>>,
  cmd_rx: mpsc::Receiver<CoordinatorCommand>,
  lifecycle_rx: watch::Receiver<LifecycleState>,
  runner: Arc<JobRunner>,
  metrics: SchedulerMetrics,
}

impl Coordinator {
  pub fn new(
    cmd_rx: mpsc::Receiver<CoordinatorCommand>,
    lifecycle_rx: watch::Receiver<LifecycleState>,
    runner: Arc<JobRunner>,
    metrics: SchedulerMetrics,
  ) -> Self {
    Self {
      pq: PriorityQueue::new(),
      armed: HashMap::new(),
      cmd_rx,
      lifecycle_rx,
      runner,
      metrics,
    }
  }

  /// Binds `definition` to its schedule. Returns the first fire time, or
  /// `None` (and leaves the job unarmed) if the schedule never fires.
  pub fn arm(&mut self, definition: Arc<JobDefinition>) -> Option<DateTime<Utc>> {
    let name = definition.name.clone();
    let first = definition.schedule.first_fire(Utc::now(), definition.timezone);
    match first {
      Some(at) => {
        debug!(job_name = %name, next_fire = %at, "Armed trigger.");
        self.pq.push(name.clone(), (Reverse(at), definition.priority));
        self.armed.insert(name, definition);
      }
      None => {
        debug!(job_name = %name, "Schedule has no upcoming fire; not armed.");
        self.disarm(&name);
      }
    }
    self.update_gauge();
    first
  }

  pub fn disarm(&mut self, job_name: &str) -> bool {
    self.pq.remove(job_name);
    let removed = self.armed.remove(job_name).is_some();
    self.update_gauge();
    removed
  }

  fn list_armed(&self) -> Vec<ArmedTrigger> {
    let mut armed: Vec<ArmedTrigger> = self
      .pq
      .iter()
      .map(|(name, (Reverse(at), _))| ArmedTrigger {
        job_name: name.clone(),
        next_fire: *at,
      })
      .collect();
    armed.sort_by(|a, b| a.next_fire.cmp(&b.next_fire).then_with(|| a.job_name.cmp(&b.job_name)));
    armed
  }

  /// Runs the trigger loop until the scheduler leaves `starting`/`running`
  /// or every handle is dropped.
  pub async fn run(mut self) {
    info!(armed = self.armed.len(), "Trigger coordinator started.");

    loop {
      let sleep_duration = self
        .pq
        .peek()
        .map(|(_, (Reverse(at), _))| (*at - Utc::now()).to_std().unwrap_or(Duration::ZERO));

      tokio::select! {
          biased;

          changed = self.lifecycle_rx.changed() => {
              let active = changed.is_ok() && self.lifecycle_rx.borrow().is_active();
              if !active {
                  debug!("Lifecycle left running state; coordinator exiting.");
                  break;
              }
          },

          maybe_cmd = self.cmd_rx.recv() => {
              match maybe_cmd {
                  Some(cmd) => self.handle_command(cmd),
                  None => {
                      warn!("Command channel closed. Coordinator exiting.");
                      break;
                  }
              }
          },

          _ = sleep(sleep_duration.unwrap_or_default()), if sleep_duration.is_some() => {
              trace!("Timer fired.");
              self.fire_due_jobs();
          },
      }
    }

    self.pq.clear();
    self.armed.clear();
    self.update_gauge();
    info!("Trigger coordinator stopped.");
  }

  fn handle_command(&mut self, cmd: CoordinatorCommand) {
    match cmd {
      CoordinatorCommand::Arm {
        definition,
        responder,
      } => {
        let _ = responder.send(self.arm(definition));
      }
      CoordinatorCommand::Disarm {
        job_name,
        responder,
      } => {
        let _ = responder.send(self.disarm(&job_name));
      }
      CoordinatorCommand::ListArmed { responder } => {
        let _ = responder.send(self.list_armed());
      }
    }
  }

  /// Pops every due entry, re-arms it for its next fire, and hands the job
  /// to the runner in a separate task.
  fn fire_due_jobs(&mut self) {
    let now = Utc::now();
    loop {
      let due = matches!(self.pq.peek(), Some((_, (Reverse(at), _))) if *at <= now);
      if !due {
        break;
      }
      let Some((name, (Reverse(fired_at), priority))) = self.pq.pop() else {
        break;
      };
      let Some(definition) = self.armed.get(&name).cloned() else {
        continue;
      };

      // Missed fires collapse into this one.
      match definition.next_fire_after(std::cmp::max(fired_at, now)) {
        Some(next) => {
          self.pq.push(name.clone(), (Reverse(next), priority));
        }
        None => {
          self.armed.remove(&name);
        }
      }

      self.metrics.triggers_fired.fetch_add(1, AtomicOrdering::Relaxed);
      debug!(job_name = %name, %fired_at, "Trigger fired.");
      let runner = self.runner.clone();
      tokio::spawn(async move {
        let _ = runner.execute(definition, TriggerSource::Schedule).await;
      });
    }
    self.update_gauge();
  }

  fn update_gauge(&self) {
    self
      .metrics
      .triggers_armed
      .store(self.armed.len(), AtomicOrdering::Relaxed);
  }
}

/// Cloneable client for the coordinator task.
#[derive(Debug, Clone)]
pub(crate) struct TriggerHandle {
  cmd_tx: mpsc::Sender<CoordinatorCommand>,
}

impl TriggerHandle {
  pub fn new(cmd_tx: mpsc::Sender<CoordinatorCommand>) -> Self {
    Self { cmd_tx }
  }

  async fn request<T>(
    &self,
    build: impl FnOnce(oneshot::Sender<T>) -> CoordinatorCommand,
  ) -> Result<T, SchedulerError> {
    let (tx, rx) = oneshot::channel();
    self
      .cmd_tx
      .send(build(tx))
      .await
      .map_err(|_| SchedulerError::CoordinatorUnavailable)?;
    rx.await.map_err(|_| SchedulerError::CoordinatorUnavailable)
  }

  pub async fn arm(&self, definition: Arc<JobDefinition>) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    self
      .request(|responder| CoordinatorCommand::Arm {
        definition,
        responder,
      })
      .await
  }

  pub async fn disarm(&self, job_name: &str) -> Result<bool, SchedulerError> {
    let job_name = job_name.to_string();
    self
      .request(|responder| CoordinatorCommand::Disarm {
        job_name,
        responder,
      })
      .await
  }

  pub async fn armed(&self) -> Result<Vec<ArmedTrigger>, SchedulerError> {
    self
      .request(|responder| CoordinatorCommand::ListArmed { responder })
      .await
  }
}
