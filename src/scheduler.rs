use crate::command::ArmedTrigger;
use crate::config::SchedulerConfig;
use crate::coordinator::{Coordinator, TriggerHandle};
use crate::error::{BuildError, PersistenceError, SchedulerError};
use crate::events::{EventBus, SchedulerEvent};
use crate::gate::ConcurrencyGate;
use crate::health::{HealthMonitor, SystemHealth};
use crate::job::{ExecutionRecord, JobDefinition, JobSummary, TriggerSource};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::notify::{NotificationSink, TracingNotifier};
use crate::persistence::{ExecutionJournal, Persistence};
use crate::probe::{ProcessProbe, SysinfoProbe};
use crate::registry::JobRegistry;
use crate::runner::JobRunner;
use crate::tracker::{ExecutionTracker, JobMetrics};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Scheduler lifecycle: `stopped -> starting -> running -> stopping -> stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Stopped,
  Starting,
  Running,
  Stopping,
}

impl LifecycleState {
  /// Whether triggers, retries and health ticks may run.
  pub fn is_active(&self) -> bool {
    matches!(self, LifecycleState::Starting | LifecycleState::Running)
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      LifecycleState::Stopped => "stopped",
      LifecycleState::Starting => "starting",
      LifecycleState::Running => "running",
      LifecycleState::Stopping => "stopping",
    };
    f.write_str(s)
  }
}

/// Operational summary returned by [`CronKeeper::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
  pub state: LifecycleState,
  pub is_running: bool,
  pub total_jobs: usize,
  /// Jobs bound to an armed trigger.
  pub active_jobs: usize,
  /// Attempts currently holding a gate slot.
  pub running_executions: usize,
  /// Current cap; auto-recovery may have lowered it.
  pub max_concurrent_jobs: usize,
  pub paused_jobs: usize,
  pub started_at: Option<DateTime<Utc>>,
  pub uptime: Option<Duration>,
}

/// Builder for configuring and creating a `CronKeeper` scheduler instance.
///
/// # Example
///
/// ```no_run
/// use cronkeeper::CronKeeper;
/// use std::time::Duration;
///
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = CronKeeper::builder()
///     .max_concurrent_jobs(4)
///     .health_check_interval(Duration::from_secs(30))
///     .failure_threshold(5)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder {
  config: SchedulerConfig,
  persistence: Option<Arc<dyn Persistence>>,
  notifier: Option<Arc<dyn NotificationSink>>,
  probe: Option<Arc<dyn ProcessProbe>>,
}

impl fmt::Debug for SchedulerBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SchedulerBuilder")
      .field("config", &self.config)
      .field("persistence", &self.persistence.is_some())
      .field("notifier", &self.notifier.is_some())
      .field("probe", &self.probe.is_some())
      .finish()
  }
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      config: SchedulerConfig::default(),
      persistence: None,
      notifier: None,
      probe: None,
    }
  }
}

impl SchedulerBuilder {
  /// Creates a new builder with [`SchedulerConfig::default`], no persistence,
  /// a [`TracingNotifier`] and a [`SysinfoProbe`].
  pub fn new() -> Self {
    Self::default()
  }

  /// Replaces the whole configuration.
  pub fn config(mut self, config: SchedulerConfig) -> Self {
    self.config = config;
    self
  }

  pub fn max_concurrent_jobs(mut self, count: usize) -> Self {
    self.config.max_concurrent_jobs = count;
    self
  }

  pub fn health_check_interval(mut self, interval: Duration) -> Self {
    self.config.health_check_interval = interval;
    self
  }

  pub fn failure_threshold(mut self, threshold: u32) -> Self {
    self.config.failure_threshold = threshold;
    self
  }

  pub fn enable_metrics(mut self, enabled: bool) -> Self {
    self.config.enable_metrics = enabled;
    self
  }

  pub fn enable_auto_recovery(mut self, enabled: bool) -> Self {
    self.config.enable_auto_recovery = enabled;
    self
  }

  pub fn metrics_window(mut self, window: Duration) -> Self {
    self.config.metrics_window = window;
    self
  }

  pub fn metrics_flush_interval(mut self, interval: Duration) -> Self {
    self.config.metrics_flush_interval = interval;
    self
  }

  pub fn stop_timeout(mut self, timeout: Duration) -> Self {
    self.config.stop_timeout = timeout;
    self
  }

  /// Sets the size of the internal buffer for trigger commands.
  pub fn command_buffer_size(mut self, size: usize) -> Self {
    self.config.command_buffer_size = size;
    self
  }

  /// Sets how many events a slow subscriber may fall behind before losing some.
  pub fn event_buffer_size(mut self, size: usize) -> Self {
    self.config.event_buffer_size = size;
    self
  }

  /// Audit trail for execution records, health snapshots and metrics.
  pub fn persistence(mut self, store: Arc<dyn Persistence>) -> Self {
    self.persistence = Some(store);
    self
  }

  pub fn notifier(mut self, sink: Arc<dyn NotificationSink>) -> Self {
    self.notifier = Some(sink);
    self
  }

  pub fn probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
    self.probe = Some(probe);
    self
  }

  /// Builds a stopped scheduler. No task is spawned until [`CronKeeper::start`].
  ///
  /// # Errors
  ///
  /// - [`BuildError::ZeroMaxConcurrentJobs`] if `max_concurrent_jobs` is 0.
  /// - [`BuildError::ZeroHealthCheckInterval`] if `health_check_interval` is zero.
  pub fn build(self) -> Result<CronKeeper, BuildError> {
    let config = self.config;
    if config.max_concurrent_jobs == 0 {
      return Err(BuildError::ZeroMaxConcurrentJobs);
    }
    if config.health_check_interval.is_zero() {
      return Err(BuildError::ZeroHealthCheckInterval);
    }

    // --- Initialize Shared State & Channels ---
    let metrics = SchedulerMetrics::new();
    let events = EventBus::new(config.event_buffer_size);
    let (lifecycle_tx, lifecycle_rx) = watch::channel(LifecycleState::Stopped);
    let registry = Arc::new(RwLock::new(JobRegistry::new()));
    let paused = Arc::new(Mutex::new(HashSet::new()));
    let tracker = Arc::new(ExecutionTracker::new());
    let gate = ConcurrencyGate::new(config.max_concurrent_jobs);
    let journal = self
      .persistence
      .map(|store| ExecutionJournal::new(store, metrics.clone()));
    let notifier = self
      .notifier
      .unwrap_or_else(|| Arc::new(TracingNotifier) as Arc<dyn NotificationSink>);
    let probe = self
      .probe
      .unwrap_or_else(|| Arc::new(SysinfoProbe::new()) as Arc<dyn ProcessProbe>);

    let runner = Arc::new(JobRunner::new(
      registry.clone(),
      gate.clone(),
      tracker.clone(),
      journal.clone(),
      notifier.clone(),
      events.clone(),
      metrics.clone(),
      config.failure_threshold,
      lifecycle_rx.clone(),
    ));

    let health = Arc::new(HealthMonitor {
      tracker: tracker.clone(),
      gate: gate.clone(),
      probe,
      registry: registry.clone(),
      paused: paused.clone(),
      journal: journal.clone(),
      notifier,
      events: events.clone(),
      metrics: metrics.clone(),
      lifecycle: lifecycle_rx,
      enable_auto_recovery: config.enable_auto_recovery,
    });

    Ok(CronKeeper {
      inner: Arc::new(Inner {
        config,
        registry,
        paused,
        tracker,
        gate,
        runner,
        health,
        journal,
        events,
        metrics,
        lifecycle: lifecycle_tx,
        run: Mutex::new(None),
        started_at: Mutex::new(None),
      }),
    })
  }
}

/// Tasks and channels that exist only while the scheduler runs.
struct RunHandles {
  triggers: TriggerHandle,
  coordinator: JoinHandle<()>,
  monitor: JoinHandle<()>,
}

struct Inner {
  config: SchedulerConfig,
  registry: Arc<RwLock<JobRegistry>>,
  paused: Arc<Mutex<HashSet<String>>>,
  tracker: Arc<ExecutionTracker>,
  gate: Arc<ConcurrencyGate>,
  runner: Arc<JobRunner>,
  health: Arc<HealthMonitor>,
  journal: Option<ExecutionJournal>,
  events: EventBus,
  metrics: SchedulerMetrics,
  lifecycle: watch::Sender<LifecycleState>,
  run: Mutex<Option<RunHandles>>,
  started_at: Mutex<Option<DateTime<Utc>>>,
}

/// The self-healing cron scheduler.
///
/// Composes the job registry, trigger coordinator, concurrency gate, job
/// runner, execution tracker and health monitor behind one API. The handle is
/// cheap to clone; construct one per process with [`CronKeeper::builder()`]
/// and pass it to whatever needs it.
#[derive(Clone)]
pub struct CronKeeper {
  inner: Arc<Inner>,
}

impl fmt::Debug for CronKeeper {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CronKeeper")
      .field("state", &self.lifecycle())
      .field("jobs", &self.inner.registry.read().len())
      .finish_non_exhaustive()
  }
}

impl CronKeeper {
  /// Returns a builder to configure and create a `CronKeeper` instance.
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  fn triggers(&self) -> Option<TriggerHandle> {
    self.inner.run.lock().as_ref().map(|run| run.triggers.clone())
  }

  // --- Registry ---

  /// Registers a job. If the scheduler is running and the job is enabled,
  /// its trigger is armed immediately.
  ///
  /// # Errors
  ///
  /// - [`SchedulerError::DuplicateJob`] if the name is already registered.
  /// - [`SchedulerError::InvalidSchedule`] if the schedule cannot be evaluated.
  pub async fn register(&self, definition: JobDefinition) -> Result<(), SchedulerError> {
    let definition = self.inner.registry.write().register(definition)?;
    self.inner.tracker.ensure(&definition.name);
    info!(job_name = %definition.name, schedule = %definition.schedule, "Job registered.");

    let paused = self.inner.paused.lock().contains(&definition.name);
    if definition.enabled && !paused {
      if let Some(triggers) = self.triggers() {
        triggers.arm(definition).await?;
      }
    }
    Ok(())
  }

  /// Removes a job, its trigger and its pending retries. Idempotent: returns
  /// `false` if the job was not registered. An attempt already in flight
  /// finishes normally but is no longer counted in the job's metrics.
  pub async fn unregister(&self, name: &str) -> bool {
    let removed = self.inner.registry.write().unregister(name).is_some();
    if !removed {
      return false;
    }
    self.inner.runner.cancel_retries(name);
    if let Some(triggers) = self.triggers() {
      if let Err(e) = triggers.disarm(name).await {
        warn!(job_name = %name, error = %e, "Failed to disarm unregistered job.");
      }
    }
    self.inner.tracker.remove(name);
    self.inner.paused.lock().remove(name);
    info!(job_name = %name, "Job unregistered.");
    true
  }

  /// Registered jobs in registration order.
  pub fn list_jobs(&self) -> Vec<JobSummary> {
    let paused = self.inner.paused.lock().clone();
    self
      .inner
      .registry
      .read()
      .list()
      .iter()
      .map(|d| JobSummary {
        name: d.name.clone(),
        description: d.description.clone(),
        schedule: d.schedule.clone(),
        timezone: d.timezone.name().to_string(),
        enabled: d.enabled,
        priority: d.priority,
        paused: paused.contains(&d.name),
      })
      .collect()
  }

  // --- Lifecycle ---

  /// Starts the scheduler: rehydrates metrics, arms every enabled and
  /// unpaused job, and starts the health monitor.
  ///
  /// Must be called from within a Tokio runtime.
  ///
  /// # Errors
  ///
  /// [`SchedulerError::AlreadyRunning`] unless the scheduler is `stopped`.
  pub async fn start(&self) -> Result<(), SchedulerError> {
    let mut previous = LifecycleState::Stopped;
    let transitioned = self.inner.lifecycle.send_if_modified(|state| {
      previous = *state;
      if *state == LifecycleState::Stopped {
        *state = LifecycleState::Starting;
        true
      } else {
        false
      }
    });
    if !transitioned {
      return Err(SchedulerError::AlreadyRunning(previous));
    }
    info!("Starting scheduler...");

    if let Some(journal) = &self.inner.journal {
      match journal.ensure_schema().await {
        Ok(()) => {
          if self.inner.config.enable_metrics {
            self.rehydrate(journal).await;
          }
        }
        Err(e) => {
          self.inner.metrics.persistence_failures.fetch_add(1, AtomicOrdering::Relaxed);
          warn!(error = %e, "Failed to prepare persistence schema; continuing without history.");
        }
      }
    }

    // --- Spawn Coordinator & Health Monitor ---
    let (cmd_tx, cmd_rx) = mpsc::channel(self.inner.config.command_buffer_size.max(1));
    let coordinator = Coordinator::new(
      cmd_rx,
      self.inner.lifecycle.subscribe(),
      self.inner.runner.clone(),
      self.inner.metrics.clone(),
    );
    let coordinator_handle = tokio::spawn(coordinator.run());
    let triggers = TriggerHandle::new(cmd_tx);

    let flush_interval = self.inner.config.enable_metrics.then_some(self.inner.config.metrics_flush_interval);
    let monitor_handle = tokio::spawn(self.inner.health.clone().run(
      triggers.clone(),
      self.inner.config.health_check_interval,
      flush_interval,
    ));

    *self.inner.run.lock() = Some(RunHandles {
      triggers: triggers.clone(),
      coordinator: coordinator_handle,
      monitor: monitor_handle,
    });

    let paused = self.inner.paused.lock().clone();
    let to_arm: Vec<_> = self
      .inner
      .registry
      .read()
      .enabled()
      .into_iter()
      .filter(|d| !paused.contains(&d.name))
      .collect();
    let mut armed = 0;
    for definition in to_arm {
      let name = definition.name.clone();
      match triggers.arm(definition).await {
        Ok(Some(_)) => armed += 1,
        Ok(None) => debug!(job_name = %name, "Job has no upcoming fire."),
        Err(e) => error!(job_name = %name, error = %e, "Failed to arm job."),
      }
    }

    let now = Utc::now();
    *self.inner.started_at.lock() = Some(now);
    self.inner.lifecycle.send_replace(LifecycleState::Running);
    self.inner.events.emit(SchedulerEvent::SchedulerStarted { at: now });
    info!(armed, total = self.inner.registry.read().len(), "Scheduler running.");
    Ok(())
  }

  async fn rehydrate(&self, journal: &ExecutionJournal) {
    let window = chrono::Duration::from_std(self.inner.config.metrics_window).unwrap_or(chrono::Duration::days(30));
    let since = Utc::now() - window;
    match journal.load_history(since).await {
      Ok(history) => {
        let names: HashSet<String> = self.inner.registry.read().names().into_iter().collect();
        let applied = self.inner.tracker.rehydrate(&names, &history);
        info!(records = applied, jobs = names.len(), "Rehydrated job metrics from history.");
      }
      Err(e) => {
        self.inner.metrics.persistence_failures.fetch_add(1, AtomicOrdering::Relaxed);
        warn!(error = %e, "Failed to load execution history.");
      }
    }
  }

  /// Stops the scheduler. Triggers, the health ticker and pending retries are
  /// cancelled; in-flight attempts are awaited (bounded by `stop_timeout`),
  /// never cancelled. Metrics are flushed before returning.
  ///
  /// # Errors
  ///
  /// [`SchedulerError::NotRunning`] unless the scheduler is `running`.
  pub async fn stop(&self) -> Result<(), SchedulerError> {
    let mut previous = LifecycleState::Running;
    let transitioned = self.inner.lifecycle.send_if_modified(|state| {
      previous = *state;
      if *state == LifecycleState::Running {
        *state = LifecycleState::Stopping;
        true
      } else {
        false
      }
    });
    if !transitioned {
      return Err(SchedulerError::NotRunning(previous));
    }
    info!("Stopping scheduler...");

    let stop_timeout = self.inner.config.stop_timeout;
    let handles = self.inner.run.lock().take();
    if let Some(RunHandles {
      triggers,
      coordinator,
      monitor,
    }) = handles
    {
      drop(triggers);
      let abort_handles = [coordinator.abort_handle(), monitor.abort_handle()];
      let tasks = [("coordinator", coordinator), ("health monitor", monitor)]
        .into_iter()
        .map(|(task, handle)| async move {
          handle.await.map_err(|e| {
            error!(task, "Task panicked: {:?}", e);
            e
          })
        });
      match tokio::time::timeout(stop_timeout, try_join_all(tasks)).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => error!("A scheduler task panicked before shutdown."),
        Err(_) => {
          // A health tick stuck on a sink or store.
          warn!("Scheduler tasks did not exit within stop timeout; aborting them.");
          for handle in abort_handles {
            handle.abort();
          }
        }
      }
    } else {
      warn!("Run handles missing during stop.");
    }

    if tokio::time::timeout(stop_timeout, self.inner.gate.wait_idle()).await.is_err() {
      warn!(
        in_flight = self.inner.gate.active(),
        "Stop timed out waiting for in-flight executions; leaving them running."
      );
    }

    if let Some(journal) = &self.inner.journal {
      if tokio::time::timeout(stop_timeout, journal.settle()).await.is_err() {
        warn!(
          pending = journal.pending_writes(),
          "Stop timed out waiting for execution records to be written."
        );
      }
    }

    if self.inner.config.enable_metrics {
      if let Some(journal) = &self.inner.journal {
        journal.flush_metrics(&self.inner.tracker.snapshot()).await;
      }
    }

    *self.inner.started_at.lock() = None;
    self.inner.lifecycle.send_replace(LifecycleState::Stopped);
    self.inner.events.emit(SchedulerEvent::SchedulerStopped { at: Utc::now() });
    info!("Scheduler stopped.");
    Ok(())
  }

  pub fn lifecycle(&self) -> LifecycleState {
    *self.inner.lifecycle.borrow()
  }

  pub fn is_running(&self) -> bool {
    self.lifecycle() == LifecycleState::Running
  }

  // --- Job control ---

  /// Disables the job's scheduled trigger. Manual triggers still run.
  /// Returns `false` if the job is not registered. Survives restarts.
  pub async fn pause_job(&self, name: &str) -> bool {
    if !self.inner.registry.read().contains(name) {
      return false;
    }
    self.inner.paused.lock().insert(name.to_string());
    if let Some(triggers) = self.triggers() {
      if let Err(e) = triggers.disarm(name).await {
        warn!(job_name = %name, error = %e, "Failed to disarm paused job.");
      }
    }
    info!(job_name = %name, "Job paused.");
    true
  }

  /// Re-enables the job's scheduled trigger. Returns `false` if the job is
  /// not registered.
  pub async fn resume_job(&self, name: &str) -> bool {
    let definition = self.inner.registry.read().get(name);
    let Some(definition) = definition else {
      return false;
    };
    self.inner.paused.lock().remove(name);
    if definition.enabled {
      if let Some(triggers) = self.triggers() {
        if let Err(e) = triggers.arm(definition).await {
          warn!(job_name = %name, error = %e, "Failed to arm resumed job.");
        }
      }
    }
    info!(job_name = %name, "Job resumed.");
    true
  }

  /// Runs the job now, bypassing its schedule and pause state, and waits for
  /// the attempt to finish. A failed attempt is returned as a record.
  ///
  /// Works in any lifecycle state, but retries only run while the scheduler
  /// is `starting` or `running`: on a stopped scheduler a failed manual
  /// attempt still emits `RetryScheduled`, and that retry is then dropped.
  ///
  /// # Errors
  ///
  /// - [`SchedulerError::JobNotFound`] if the job is not registered.
  /// - [`SchedulerError::Execution`] if the concurrency gate rejected the attempt.
  pub async fn trigger_job(&self, name: &str) -> Result<ExecutionRecord, SchedulerError> {
    let definition = self
      .inner
      .registry
      .read()
      .get(name)
      .ok_or_else(|| SchedulerError::JobNotFound(name.to_string()))?;
    self.inner.metrics.manual_triggers.fetch_add(1, AtomicOrdering::Relaxed);
    info!(job_name = %name, "Manual trigger.");
    Ok(self.inner.runner.execute(definition, TriggerSource::Manual).await?)
  }

  // --- Queries ---

  pub fn get_status(&self) -> SchedulerStatus {
    let state = self.lifecycle();
    let started_at = *self.inner.started_at.lock();
    SchedulerStatus {
      state,
      is_running: state == LifecycleState::Running,
      total_jobs: self.inner.registry.read().len(),
      active_jobs: self.inner.metrics.triggers_armed.load(AtomicOrdering::Relaxed),
      running_executions: self.inner.gate.active(),
      max_concurrent_jobs: self.inner.gate.limit(),
      paused_jobs: self.inner.paused.lock().len(),
      started_at,
      uptime: started_at.and_then(|at| (Utc::now() - at).to_std().ok()),
    }
  }

  pub fn job_metrics(&self, name: &str) -> Option<JobMetrics> {
    self.inner.tracker.get(name)
  }

  pub fn all_job_metrics(&self) -> HashMap<String, JobMetrics> {
    self.inner.tracker.snapshot()
  }

  /// Computes a fresh health verdict without persisting, alerting or recovering.
  pub fn get_system_health(&self) -> SystemHealth {
    self.inner.health.snapshot()
  }

  /// Runs one full health tick now: persist, alert and recover when
  /// critical, publish. Independent of the periodic ticker.
  pub async fn run_health_check(&self) -> SystemHealth {
    let triggers = self.triggers();
    self.inner.health.tick(triggers.as_ref()).await
  }

  /// Armed triggers, soonest first. Empty when the scheduler is not running.
  pub async fn armed_triggers(&self) -> Vec<ArmedTrigger> {
    match self.triggers() {
      Some(triggers) => triggers.armed().await.unwrap_or_default(),
      None => Vec::new(),
    }
  }

  /// Most recent persisted records for a job, newest first. Empty without
  /// persistence.
  pub async fn execution_history(&self, name: &str, limit: usize) -> Result<Vec<ExecutionRecord>, PersistenceError> {
    match &self.inner.journal {
      Some(journal) => journal.recent_executions(name, limit).await,
      None => Ok(Vec::new()),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
    self.inner.events.subscribe()
  }

  /// Retrieves a snapshot of the scheduler-wide counters.
  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.inner.metrics.snapshot()
  }

  pub fn config(&self) -> &SchedulerConfig {
    &self.inner.config
  }
}
