//! CronKeeper: A Self-Healing Cron Job Engine
//!
//! Runs recurring background jobs on cron-style schedules with bounded
//! concurrency, per-job execution metrics, timeouts, linear retries, a
//! periodic health monitor and automatic recovery.
//!
//! # Features
//!
//! - Schedule jobs using:
//!   - Standard CRON expressions (5-field Unix or extended), evaluated in any IANA timezone.
//!   - Fixed intervals.
//!   - One-time execution at a specific `DateTime<Utc>`.
//!   - No schedule at all (manual triggers only).
//! - A global concurrency gate that rejects (never queues) attempts when saturated,
//!   and never runs two attempts of the same job at once.
//! - Per-attempt timeouts raced against the handler; timed-out handlers are abandoned.
//! - Linear retries bounded per job, plus a scheduler-wide failure threshold alert.
//! - Per-job metrics (counts, consecutive failures, average duration, uptime %),
//!   rehydrated from persisted history on start.
//! - A health monitor producing `healthy`/`degraded`/`critical` verdicts and, when
//!   critical, restarting failing jobs, reclaiming memory and throttling concurrency.
//! - A typed broadcast channel of outcome events (`CronKeeper::subscribe`).
//! - Pluggable persistence (SQLite provided), notification sink and process probe.
//! - Optional task-local job context (`JobContext`) for handlers (requires `job_context` feature).
//!
//! # Usage
//!
//! ```no_run
//! use cronkeeper::{job_fn, CronKeeper, JobDefinition, JobPriority, Schedule, SqlitePersistence};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // tracing_subscriber::fmt().with_env_filter("warn,cronkeeper=info").init();
//!
//!     let scheduler = CronKeeper::builder()
//!         .max_concurrent_jobs(10)
//!         .health_check_interval(Duration::from_secs(60))
//!         .failure_threshold(3)
//!         .persistence(Arc::new(SqlitePersistence::open("scheduler.db")?))
//!         .build()?;
//!
//!     scheduler
//!         .register(
//!             JobDefinition::new(
//!                 "license-expiry-check",
//!                 Schedule::Cron("0 9 * * *".into()),
//!                 job_fn! {
//!                     {
//!                         tracing::info!("checking licenses");
//!                         Ok(())
//!                     }
//!                 },
//!             )
//!             .with_timezone(chrono_tz::Asia::Riyadh)
//!             .with_priority(JobPriority::Critical)
//!             .with_timeout(Duration::from_secs(300))
//!             .with_retry(3, Duration::from_secs(60)),
//!         )
//!         .await?;
//!
//!     scheduler.start().await?;
//!
//!     let mut events = scheduler.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("{}: {:?}", event.topic(), event.job_name());
//!         }
//!     });
//!
//!     let record = scheduler.trigger_job("license-expiry-check").await?;
//!     println!("manual run finished: {}", record.status);
//!     println!("status: {:?}", scheduler.get_status());
//!     println!("health: {:?}", scheduler.get_system_health());
//!
//!     scheduler.stop().await?;
//!     Ok(())
//! }
//! ```

// Declare modules
pub mod command;
pub mod config;
mod coordinator;
pub mod error;
pub mod events;
pub mod gate;
pub mod health;
pub mod job;
mod macros;
pub mod metrics;
pub mod notify;
pub mod persistence;
pub mod probe;
pub mod registry;
mod runner;
pub mod scheduler;
pub mod tracker;

// --- Public Re-exports ---
pub use command::ArmedTrigger;
pub use config::SchedulerConfig;
pub use error::{BuildError, ExecutionError, NotifyError, PersistenceError, SchedulerError};
pub use events::SchedulerEvent;
pub use health::{HealthStatus, SystemHealth};
pub use job::{
  ExecutionRecord, ExecutionStatus, HandlerFuture, JobDefinition, JobPriority, JobSummary, Schedule,
  TriggerSource,
};
pub use metrics::MetricsSnapshot;
pub use notify::{AlertPriority, Notification, NotificationSink, TracingNotifier};
pub use persistence::{ExecutionJournal, Persistence, SqlitePersistence};
pub use probe::{FixedProbe, ProcessProbe, ProcessSample, SysinfoProbe};
pub use scheduler::{CronKeeper, LifecycleState, SchedulerBuilder, SchedulerStatus};
pub use tracker::{JobMetrics, LastExecutionStatus};

#[cfg(feature = "job_context")]
pub use job::context::{try_get_current_job_context, JobContext};
