//! tests/persistence.rs
//! SQLite audit trail, execution history and metrics rehydration.

mod common;

use common::{builder, counting_handler, failing_handler, flaky_handler, memory_store, setup_tracing, wait_until};
use cronkeeper::metrics::SchedulerMetrics;
use cronkeeper::persistence::Row;
use cronkeeper::{
  CronKeeper, ExecutionJournal, ExecutionRecord, ExecutionStatus, JobDefinition, Persistence, PersistenceError,
  Schedule, SqlitePersistence, TriggerSource,
};

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

/// A backend whose every call fails.
struct UnavailableStore;

#[async_trait]
impl Persistence for UnavailableStore {
  async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>, PersistenceError> {
    Err(PersistenceError::Unavailable("disk full".into()))
  }

  async fn transaction(&self, _statements: Vec<(String, Vec<Value>)>) -> Result<(), PersistenceError> {
    Err(PersistenceError::Unavailable("disk full".into()))
  }
}

/// SQLite behind a slow link: every statement takes `delay` longer.
struct SlowStore {
  inner: SqlitePersistence,
  delay: Duration,
}

#[async_trait]
impl Persistence for SlowStore {
  async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, PersistenceError> {
    tokio::time::sleep(self.delay).await;
    self.inner.execute(sql, params).await
  }

  async fn transaction(&self, statements: Vec<(String, Vec<Value>)>) -> Result<(), PersistenceError> {
    self.inner.transaction(statements).await
  }
}

/// Polls until `limit` finalized records of `job` are readable.
async fn settled_history(scheduler: &CronKeeper, job: &str, expected: usize) -> Vec<ExecutionRecord> {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
  loop {
    let history = scheduler.execution_history(job, 50).await.unwrap();
    let finalized = history.iter().filter(|r| r.status.is_final()).count();
    if finalized >= expected || tokio::time::Instant::now() >= deadline {
      return history;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

async fn count(store: &SqlitePersistence, sql: &str) -> i64 {
  let rows = store.execute(sql, &[]).await.unwrap();
  rows[0]["n"].as_i64().unwrap()
}

#[tokio::test]
async fn test_sqlite_execute_and_transaction() {
  let store = SqlitePersistence::open_in_memory().unwrap();
  store
    .execute("CREATE TABLE kv (k TEXT PRIMARY KEY, v REAL, note TEXT)", &[])
    .await
    .unwrap();

  store
    .transaction(vec![
      (
        "INSERT INTO kv (k, v, note) VALUES (?1, ?2, ?3)".to_string(),
        vec![json!("a"), json!(1.5), Value::Null],
      ),
      (
        "INSERT INTO kv (k, v, note) VALUES (?1, ?2, ?3)".to_string(),
        vec![json!("b"), json!(2), json!("two")],
      ),
    ])
    .await
    .unwrap();

  let rows = store
    .execute("SELECT k, v, note FROM kv ORDER BY k", &[])
    .await
    .unwrap();
  assert_eq!(rows.len(), 2);
  assert_eq!(rows[0]["k"], json!("a"));
  assert_eq!(rows[0]["v"], json!(1.5));
  assert_eq!(rows[0]["note"], Value::Null);
  assert_eq!(rows[1]["note"], json!("two"));

  // A failing statement rolls back the whole transaction.
  let result = store
    .transaction(vec![
      (
        "INSERT INTO kv (k, v) VALUES (?1, ?2)".to_string(),
        vec![json!("c"), json!(3)],
      ),
      (
        "INSERT INTO kv (k, v) VALUES (?1, ?2)".to_string(),
        vec![json!("a"), json!(4)],
      ),
    ])
    .await;
  assert!(result.is_err());
  assert_eq!(count(&store, "SELECT COUNT(*) AS n FROM kv").await, 2);
}

#[tokio::test]
async fn test_execution_records_are_persisted() {
  setup_tracing();
  let store = memory_store();
  let scheduler = builder(4).persistence(store.clone()).build().unwrap();
  scheduler
    .register(
      JobDefinition::new(
        "audit",
        Schedule::Cron("0 0 1 1 *".into()),
        flaky_handler(1, Arc::new(AtomicUsize::new(0))),
      )
        .with_retry(0, Duration::from_millis(10)),
    )
    .await
    .unwrap();
  scheduler.start().await.unwrap();

  let failed = scheduler.trigger_job("audit").await.unwrap();
  let completed = scheduler.trigger_job("audit").await.unwrap();

  let history = settled_history(&scheduler, "audit", 2).await;
  assert_eq!(history.len(), 2);
  // Newest first.
  assert_eq!(history[0].execution_id, completed.execution_id);
  assert_eq!(history[0].status, ExecutionStatus::Completed);
  assert_eq!(history[0].trigger, TriggerSource::Manual);
  assert!(history[0].completed_at.is_some());
  assert_eq!(history[1].record_id, failed.record_id);
  assert_eq!(history[1].status, ExecutionStatus::Failed);
  assert_eq!(history[1].error.as_deref(), Some("simulated failure #1"));

  assert_eq!(scheduler.execution_history("audit", 1).await.unwrap().len(), 1);
  assert!(scheduler.execution_history("unknown", 10).await.unwrap().is_empty());

  scheduler.run_health_check().await;
  let rows = store
    .execute("SELECT status, issues FROM scheduler_health", &[])
    .await
    .unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0]["status"], json!("healthy"));
  assert_eq!(rows[0]["issues"], json!("[]"));

  scheduler.stop().await.unwrap();

  // Stop flushes one metrics row per job.
  let rows = store
    .execute(
      "SELECT job_name, total_executions, successful_executions, uptime FROM job_metrics",
      &[],
    )
    .await
    .unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0]["job_name"], json!("audit"));
  assert_eq!(rows[0]["total_executions"], json!(2));
  assert_eq!(rows[0]["successful_executions"], json!(1));
  assert_eq!(rows[0]["uptime"], json!(50.0));
}

#[tokio::test]
async fn test_metrics_rehydrate_after_restart() {
  setup_tracing();
  let store = memory_store();

  let register = |scheduler: cronkeeper::CronKeeper, schedule: Schedule| async move {
    scheduler
      .register(
        JobDefinition::new(
          "sync-orders",
          schedule,
          flaky_handler(2, Arc::new(AtomicUsize::new(0))),
        )
        .with_retry(3, Duration::from_millis(10)),
      )
      .await
      .unwrap();
    scheduler
      .register(
        JobDefinition::new("broken", Schedule::Never, failing_handler(Arc::new(AtomicUsize::new(0))))
          .with_retry(0, Duration::from_millis(10)),
      )
      .await
      .unwrap();
    scheduler
  };

  // --- First process ---
  let first = register(
    builder(4).persistence(store.clone()).build().unwrap(),
    Schedule::Once(Utc::now()),
  )
  .await;
  first.start().await.unwrap();
  let f = first.clone();
  assert!(
    wait_until(Duration::from_secs(3), || {
      f.job_metrics("sync-orders").map(|m| m.total_executions) == Some(3)
    })
    .await
  );
  first.trigger_job("broken").await.unwrap();
  first.trigger_job("broken").await.unwrap();
  first.stop().await.unwrap();
  let before = first.all_job_metrics();

  // --- Second process, same store ---
  let second = register(builder(4).persistence(store.clone()).build().unwrap(), Schedule::Never).await;
  assert_eq!(second.job_metrics("broken").unwrap().total_executions, 0);
  second.start().await.unwrap();

  for name in ["sync-orders", "broken"] {
    let old = &before[name];
    let new = second.job_metrics(name).unwrap();
    assert_eq!(new.total_executions, old.total_executions, "{}", name);
    assert_eq!(new.successful_executions, old.successful_executions, "{}", name);
    assert_eq!(new.failed_executions, old.failed_executions, "{}", name);
    assert_eq!(new.consecutive_failures, old.consecutive_failures, "{}", name);
    assert_eq!(new.last_execution_status, old.last_execution_status, "{}", name);
    assert!((new.uptime - old.uptime).abs() < 1e-9, "{}", name);
  }
  assert_eq!(second.job_metrics("broken").unwrap().consecutive_failures, 2);

  second.stop().await.unwrap();
}

#[tokio::test]
async fn test_rehydrate_disabled_without_metrics() {
  setup_tracing();
  let store = memory_store();
  let first = builder(2).persistence(store.clone()).build().unwrap();
  first
    .register(JobDefinition::new("job", Schedule::Never, flaky_handler(0, Arc::new(AtomicUsize::new(0)))))
    .await
    .unwrap();
  first.start().await.unwrap();
  first.trigger_job("job").await.unwrap();
  first.stop().await.unwrap();

  let second = builder(2)
    .persistence(store.clone())
    .enable_metrics(false)
    .build()
    .unwrap();
  second
    .register(JobDefinition::new("job", Schedule::Never, flaky_handler(0, Arc::new(AtomicUsize::new(0)))))
    .await
    .unwrap();
  second.start().await.unwrap();
  assert_eq!(second.job_metrics("job").unwrap().total_executions, 0);
  second.stop().await.unwrap();
}

#[tokio::test]
async fn test_persistence_failures_never_fail_jobs() {
  setup_tracing();
  let scheduler = builder(2).persistence(Arc::new(UnavailableStore)).build().unwrap();
  scheduler
    .register(JobDefinition::new("resilient", Schedule::Never, flaky_handler(0, Arc::new(AtomicUsize::new(0)))))
    .await
    .unwrap();
  scheduler.start().await.unwrap();

  let record = scheduler.trigger_job("resilient").await.unwrap();
  assert_eq!(record.status, ExecutionStatus::Completed);
  assert_eq!(scheduler.job_metrics("resilient").unwrap().successful_executions, 1);

  // Schema, start and finish writes were all dropped and counted.
  let s = scheduler.clone();
  assert!(wait_until(Duration::from_secs(2), || s.metrics_snapshot().persistence_failures >= 3).await);
  assert!(scheduler.execution_history("resilient", 5).await.is_err());

  scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_slow_store_never_delays_jobs() {
  setup_tracing();
  let store = Arc::new(SlowStore {
    inner: SqlitePersistence::open_in_memory().unwrap(),
    delay: Duration::from_millis(300),
  });
  let scheduler = builder(1).persistence(store).build().unwrap();
  for name in ["invoice-a", "invoice-b"] {
    scheduler
      .register(JobDefinition::new(name, Schedule::Never, counting_handler(Arc::new(AtomicUsize::new(0)))))
      .await
      .unwrap();
  }
  scheduler.start().await.unwrap();

  let started = tokio::time::Instant::now();
  let first = scheduler.trigger_job("invoice-a").await.unwrap();
  assert_eq!(first.status, ExecutionStatus::Completed);
  assert!(started.elapsed() < Duration::from_millis(200), "took {:?}", started.elapsed());

  // The only slot was given back before the audit rows were written.
  let second = scheduler.trigger_job("invoice-b").await.unwrap();
  assert_eq!(second.status, ExecutionStatus::Completed);
  assert_eq!(scheduler.metrics_snapshot().rejected_concurrency_limit, 0);

  // Stop waits for the pending rows.
  scheduler.stop().await.unwrap();
  let history = scheduler.execution_history("invoice-a", 5).await.unwrap();
  assert_eq!(history.len(), 1);
  assert_eq!(history[0].status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_rehydrate_reads_only_metrics_window() {
  setup_tracing();
  let store = memory_store();
  ExecutionJournal::new(store.clone(), SchedulerMetrics::new())
    .ensure_schema()
    .await
    .unwrap();

  let seed = |age: chrono::Duration, status: &str, error: Option<&str>| {
    let started_at = Utc::now() - age;
    let ts = started_at.to_rfc3339_opts(SecondsFormat::Micros, true);
    (
      "INSERT INTO job_executions (id, job_name, execution_id, status, triggered_by, started_at, completed_at, duration, error)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8)"
        .to_string(),
      vec![
        json!(Uuid::new_v4().to_string()),
        json!("nightly-export"),
        json!(format!("nightly-export_{}", started_at.timestamp_millis())),
        json!(status),
        json!("schedule"),
        json!(ts),
        json!(120),
        json!(error),
      ],
    )
  };
  store
    .transaction(vec![
      seed(chrono::Duration::days(10), "failed", Some("disk full")),
      seed(chrono::Duration::days(9), "timeout", Some("execution timeout")),
      seed(chrono::Duration::hours(2), "completed", None),
    ])
    .await
    .unwrap();

  let scheduler = builder(2)
    .persistence(store.clone())
    .metrics_window(Duration::from_secs(24 * 60 * 60))
    .build()
    .unwrap();
  scheduler
    .register(JobDefinition::new(
      "nightly-export",
      Schedule::Never,
      counting_handler(Arc::new(AtomicUsize::new(0))),
    ))
    .await
    .unwrap();
  scheduler.start().await.unwrap();

  let metrics = scheduler.job_metrics("nightly-export").unwrap();
  assert_eq!(metrics.total_executions, 1);
  assert_eq!(metrics.failed_executions, 0);
  assert_eq!(metrics.consecutive_failures, 0);
  assert_eq!(metrics.uptime, 100.0);
  assert!((metrics.average_duration_ms - 120.0).abs() < 1e-9);

  scheduler.stop().await.unwrap();
}
