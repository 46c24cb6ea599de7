#[cfg(feature = "job_context")]
pub mod context;

use crate::error::ExecutionError;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

// --- Public Type Aliases ---

/// The future a job handler returns. `Err` marks the attempt as failed.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// The function type that job attempts execute.
///
/// The business payload of a job lives entirely inside its handler. The
/// scheduler only cares whether the returned future resolves to `Ok`, resolves
/// to `Err`, panics, or fails to settle before the job's timeout. A timed-out
/// handler is abandoned, not cancelled, so handlers must tolerate that.
pub type BoxedHandler = Box<dyn Fn() -> HandlerFuture + Send + Sync + 'static>;

/// Invoked after a successful attempt with the finalized record.
pub type SuccessCallback = Arc<dyn Fn(&ExecutionRecord) + Send + Sync + 'static>;

/// Invoked after a failed attempt with the failure cause.
pub type ErrorCallback = Arc<dyn Fn(&ExecutionError) + Send + Sync + 'static>;

const DEFAULT_TIMEOUT: StdDuration = StdDuration::from_secs(300);
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: StdDuration = StdDuration::from_secs(60);

// --- Schedule ---

/// Represents the different ways a job can be scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Schedule {
  /// Standard CRON expression, evaluated in the job's timezone.
  /// Both 5-field Unix expressions and the 6/7-field extended form are accepted.
  Cron(String),
  /// Run repeatedly at a fixed interval after each fire.
  FixedInterval(StdDuration),
  /// Run once at the given instant (immediately, if it has already passed when armed).
  Once(DateTime<Utc>),
  /// No schedule; the job only runs through manual triggers.
  Never,
}

impl Schedule {
  /// Checks that the schedule can produce fire times.
  pub fn validate(&self) -> Result<(), String> {
    match self {
      Schedule::Cron(expression) => parse_cron(expression).map(|_| ()),
      Schedule::FixedInterval(interval) if interval.is_zero() => {
        Err("fixed interval must be greater than zero".to_string())
      }
      Schedule::FixedInterval(interval) => ChronoDuration::from_std(*interval)
        .map(|_| ())
        .map_err(|e| e.to_string()),
      Schedule::Once(_) | Schedule::Never => Ok(()),
    }
  }

  /// Calculates the next fire time strictly after `reference_time`.
  /// Returns `None` when the schedule has no further fires.
  pub fn next_fire(&self, reference_time: DateTime<Utc>, timezone: Tz) -> Option<DateTime<Utc>> {
    match self {
      Schedule::Cron(expression) => match parse_cron(expression) {
        Ok(cron_schedule) => cron_schedule
          .after(&reference_time.with_timezone(&timezone))
          .next()
          .map(|local| local.with_timezone(&Utc)),
        Err(e) => {
          warn!("Failed to parse cron expression '{}': {}", expression, e);
          None
        }
      },
      Schedule::FixedInterval(interval) => match ChronoDuration::from_std(*interval) {
        Ok(chrono_interval) => reference_time.checked_add_signed(chrono_interval),
        Err(e) => {
          warn!("Failed to convert interval duration {:?}: {}", interval, e);
          None
        }
      },
      Schedule::Once(run_at) => {
        if reference_time < *run_at {
          Some(*run_at)
        } else {
          None
        }
      }
      Schedule::Never => None,
    }
  }

  /// Fire time used when a trigger is armed. Differs from `next_fire` only for
  /// `Once`, which fires right away if its instant already passed.
  pub(crate) fn first_fire(&self, now: DateTime<Utc>, timezone: Tz) -> Option<DateTime<Utc>> {
    match self {
      Schedule::Once(run_at) => Some(std::cmp::max(*run_at, now)),
      other => other.next_fire(now, timezone),
    }
  }
}

impl fmt::Display for Schedule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Schedule::Cron(expression) => write!(f, "cron({})", expression),
      Schedule::FixedInterval(interval) => write!(f, "every {:?}", interval),
      Schedule::Once(at) => write!(f, "once at {}", at),
      Schedule::Never => write!(f, "never"),
    }
  }
}

/// Expands a 5-field Unix expression (minute hour dom month dow) into the
/// 7-field form the `cron` crate parses, firing at second 0 of any year.
fn expand_cron_expression(expression: &str) -> String {
  if expression.split_whitespace().count() == 5 {
    format!("0 {} *", expression.trim())
  } else {
    expression.trim().to_string()
  }
}

fn parse_cron(expression: &str) -> Result<CronSchedule, String> {
  CronSchedule::from_str(&expand_cron_expression(expression)).map_err(|e| e.to_string())
}

// --- Priority & Trigger Source ---

/// Relative importance of a job. When several triggers are due at the same
/// instant, higher priorities are dispatched first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
  Low,
  #[default]
  Medium,
  High,
  Critical,
}

/// What caused an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
  /// A natural fire of the job's schedule.
  Schedule,
  /// An out-of-band `trigger_job` call.
  Manual,
  /// An automatic retry after a failure. `attempt` starts at 1.
  Retry { attempt: u32 },
}

impl TriggerSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      TriggerSource::Schedule => "schedule",
      TriggerSource::Manual => "manual",
      TriggerSource::Retry { .. } => "retry",
    }
  }
}

impl fmt::Display for TriggerSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TriggerSource::Retry { attempt } => write!(f, "retry#{}", attempt),
      other => f.write_str(other.as_str()),
    }
  }
}

// --- Job Definition ---

/// Immutable description of a job: what to run, when, and how to treat failures.
///
/// Created with [`JobDefinition::new`] and the `with_*` builder methods, then
/// handed to [`crate::CronKeeper::register`]. A registered definition is never
/// mutated; re-register under the same name (after `unregister`) to change it.
///
/// # Example
///
/// ```no_run
/// use cronkeeper::job::{JobDefinition, JobPriority, Schedule};
/// use cronkeeper::job_fn;
/// use std::time::Duration;
///
/// let job = JobDefinition::new(
///     "license-expiry-check",
///     Schedule::Cron("0 9 * * *".into()),
///     job_fn! {{ Ok(()) }},
/// )
/// .with_timezone(chrono_tz::Europe::Berlin)
/// .with_priority(JobPriority::Critical)
/// .with_timeout(Duration::from_secs(300))
/// .with_retry(3, Duration::from_secs(60));
/// ```
#[derive(Clone)]
pub struct JobDefinition {
  /// Unique key across the registry.
  pub name: String,
  pub description: String,
  pub schedule: Schedule,
  /// Timezone in which cron expressions are evaluated.
  pub timezone: Tz,
  /// Disabled definitions stay registered but are never bound to a trigger.
  pub enabled: bool,
  pub priority: JobPriority,
  /// Budget for a single attempt; the handler is raced against it.
  pub timeout: StdDuration,
  /// Automatic retries allowed while `consecutive_failures <= retry_attempts`.
  pub retry_attempts: u32,
  /// Fixed (linear) delay before each retry.
  pub retry_delay: StdDuration,
  pub(crate) handler: Arc<BoxedHandler>,
  pub(crate) on_success: Option<SuccessCallback>,
  pub(crate) on_error: Option<ErrorCallback>,
}

// Manual implementation of Debug since handlers and callbacks are opaque.
impl fmt::Debug for JobDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobDefinition")
      .field("name", &self.name)
      .field("schedule", &self.schedule)
      .field("timezone", &self.timezone)
      .field("enabled", &self.enabled)
      .field("priority", &self.priority)
      .field("timeout", &self.timeout)
      .field("retry_attempts", &self.retry_attempts)
      .field("retry_delay", &self.retry_delay)
      .field("handler", &format_args!("<Fn>"))
      .field("on_success", &self.on_success.as_ref().map(|_| "<Fn>"))
      .field("on_error", &self.on_error.as_ref().map(|_| "<Fn>"))
      .finish()
  }
}

impl JobDefinition {
  /// Creates an enabled, medium-priority job evaluated in UTC, with a 5 minute
  /// timeout and 3 retries spaced one minute apart.
  pub fn new<F>(name: impl Into<String>, schedule: Schedule, handler: F) -> Self
  where
    F: Fn() -> HandlerFuture + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      description: String::new(),
      schedule,
      timezone: Tz::UTC,
      enabled: true,
      priority: JobPriority::default(),
      timeout: DEFAULT_TIMEOUT,
      retry_attempts: DEFAULT_RETRY_ATTEMPTS,
      retry_delay: DEFAULT_RETRY_DELAY,
      handler: Arc::new(Box::new(handler)),
      on_success: None,
      on_error: None,
    }
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  pub fn with_timezone(mut self, timezone: Tz) -> Self {
    self.timezone = timezone;
    self
  }

  pub fn with_priority(mut self, priority: JobPriority) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Sets the retry bound and the fixed delay between retries.
  pub fn with_retry(mut self, attempts: u32, delay: StdDuration) -> Self {
    self.retry_attempts = attempts;
    self.retry_delay = delay;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn on_success<F>(mut self, callback: F) -> Self
  where
    F: Fn(&ExecutionRecord) + Send + Sync + 'static,
  {
    self.on_success = Some(Arc::new(callback));
    self
  }

  pub fn on_error<F>(mut self, callback: F) -> Self
  where
    F: Fn(&ExecutionError) + Send + Sync + 'static,
  {
    self.on_error = Some(Arc::new(callback));
    self
  }

  /// Parses an IANA timezone name (e.g. `"Asia/Riyadh"`) and applies it.
  pub fn with_timezone_name(self, timezone: &str) -> Result<Self, String> {
    let tz: Tz = timezone
      .parse()
      .map_err(|_| format!("unknown timezone `{}`", timezone))?;
    Ok(self.with_timezone(tz))
  }

  /// Next natural fire strictly after `after`, in UTC.
  pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    self.schedule.next_fire(after, self.timezone)
  }
}

// --- Execution Records ---

/// Lifecycle status of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
  Running,
  Completed,
  Failed,
  Timeout,
}

impl ExecutionStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ExecutionStatus::Running => "running",
      ExecutionStatus::Completed => "completed",
      ExecutionStatus::Failed => "failed",
      ExecutionStatus::Timeout => "timeout",
    }
  }

  /// Failed attempts, timeouts included.
  pub fn is_failure(&self) -> bool {
    matches!(self, ExecutionStatus::Failed | ExecutionStatus::Timeout)
  }

  pub fn is_final(&self) -> bool {
    !matches!(self, ExecutionStatus::Running)
  }
}

impl FromStr for ExecutionStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "running" => Ok(ExecutionStatus::Running),
      "completed" => Ok(ExecutionStatus::Completed),
      "failed" => Ok(ExecutionStatus::Failed),
      "timeout" => Ok(ExecutionStatus::Timeout),
      other => Err(format!("unknown execution status `{}`", other)),
    }
  }
}

impl fmt::Display for ExecutionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One execution attempt. Created as `running` when the attempt begins and
/// finalized exactly once when it ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
  pub record_id: Uuid,
  pub job_name: String,
  /// `<job name>_<start timestamp in ms>`.
  pub execution_id: String,
  pub status: ExecutionStatus,
  pub trigger: TriggerSource,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  pub duration: Option<StdDuration>,
  pub error: Option<String>,
}

impl ExecutionRecord {
  pub(crate) fn running(job_name: &str, trigger: TriggerSource, started_at: DateTime<Utc>) -> Self {
    Self {
      record_id: Uuid::new_v4(),
      job_name: job_name.to_string(),
      execution_id: format!("{}_{}", job_name, started_at.timestamp_millis()),
      status: ExecutionStatus::Running,
      trigger,
      started_at,
      completed_at: None,
      duration: None,
      error: None,
    }
  }

  pub(crate) fn complete(&mut self, completed_at: DateTime<Utc>, duration: StdDuration) {
    self.status = ExecutionStatus::Completed;
    self.completed_at = Some(completed_at);
    self.duration = Some(duration);
  }

  pub(crate) fn fail(
    &mut self,
    completed_at: DateTime<Utc>,
    duration: StdDuration,
    error: &ExecutionError,
  ) {
    self.status = match error {
      ExecutionError::Timeout { .. } => ExecutionStatus::Timeout,
      _ => ExecutionStatus::Failed,
    };
    self.completed_at = Some(completed_at);
    self.duration = Some(duration);
    self.error = Some(error.to_string());
  }
}

// --- Public Snapshot Structs for Querying ---

/// A summary of a registered job, suitable for listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
  pub name: String,
  pub description: String,
  pub schedule: Schedule,
  pub timezone: String,
  pub enabled: bool,
  pub priority: JobPriority,
  /// Whether the job's scheduled trigger is paused. Manual triggers still run.
  pub paused: bool,
}
