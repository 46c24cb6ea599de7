//! tests/concurrency.rs
//! Tests for the global concurrency cap and same-job overlap rejection.

mod common;

use common::{
  build_scheduler, concurrency_tracker_handler, drain_events, setup_tracing, sleeping_handler, wait_until,
};
use cronkeeper::{
  ExecutionError, JobDefinition, JobPriority, Schedule, SchedulerError, SchedulerEvent, TriggerSource,
};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

#[tokio::test]
async fn test_saturated_gate_rejects_without_retry() {
  setup_tracing();
  let scheduler = build_scheduler(1);
  let current = Arc::new(AtomicUsize::new(0));
  let max_seen = Arc::new(AtomicUsize::new(0));
  let at = Utc::now();

  for name in ["job-a", "job-b"] {
    scheduler
      .register(
        JobDefinition::new(
          name,
          Schedule::Once(at),
          concurrency_tracker_handler(current.clone(), max_seen.clone(), Duration::from_millis(100)),
        )
        .with_retry(3, Duration::from_millis(10)),
      )
      .await
      .unwrap();
  }

  let mut events = scheduler.subscribe();
  scheduler.start().await.unwrap();

  let s = scheduler.clone();
  assert!(
    wait_until(Duration::from_secs(2), || {
      let snapshot = s.metrics_snapshot();
      snapshot.executions_succeeded == 1 && snapshot.rejected_concurrency_limit == 1
    })
    .await
  );
  // Long enough for a retry to have run, had one been scheduled.
  tokio::time::sleep(Duration::from_millis(100)).await;

  let snapshot = scheduler.metrics_snapshot();
  info!(?snapshot, "Concurrency test finished.");
  assert_eq!(snapshot.executions_started, 1);
  assert_eq!(snapshot.retries_scheduled, 0);
  assert_eq!(max_seen.load(Ordering::SeqCst), 1);

  let rejected: Vec<(String, TriggerSource, ExecutionError)> = drain_events(&mut events)
    .into_iter()
    .filter_map(|event| match event {
      SchedulerEvent::JobRejected {
        job_name,
        trigger,
        reason,
      } => Some((job_name, trigger, reason)),
      _ => None,
    })
    .collect();
  assert_eq!(rejected.len(), 1);
  assert_eq!(rejected[0].1, TriggerSource::Schedule);
  assert_eq!(rejected[0].2, ExecutionError::ConcurrencyLimitExceeded { limit: 1 });

  // A rejection leaves no trace in the job's metrics.
  let total: u64 = scheduler
    .all_job_metrics()
    .values()
    .map(|m| m.total_executions)
    .sum();
  assert_eq!(total, 1);

  scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_manual_triggers_respect_cap() {
  setup_tracing();
  let scheduler = build_scheduler(2);
  let current = Arc::new(AtomicUsize::new(0));
  let max_seen = Arc::new(AtomicUsize::new(0));

  for i in 0..5 {
    scheduler
      .register(JobDefinition::new(
        format!("batch-{}", i),
        Schedule::Never,
        concurrency_tracker_handler(current.clone(), max_seen.clone(), Duration::from_millis(200)),
      ))
      .await
      .unwrap();
  }

  let handles: Vec<_> = (0..5)
    .map(|i| {
      let scheduler = scheduler.clone();
      tokio::spawn(async move { scheduler.trigger_job(&format!("batch-{}", i)).await })
    })
    .collect();

  let mut completed = 0;
  let mut rejected = 0;
  for handle in handles {
    match handle.await.unwrap() {
      Ok(_) => completed += 1,
      Err(SchedulerError::Execution(ExecutionError::ConcurrencyLimitExceeded { limit })) => {
        assert_eq!(limit, 2);
        rejected += 1;
      }
      Err(other) => panic!("unexpected error: {}", other),
    }
  }

  assert_eq!(completed, 2);
  assert_eq!(rejected, 3);
  assert_eq!(max_seen.load(Ordering::SeqCst), 2);
  assert_eq!(scheduler.metrics_snapshot().rejected_concurrency_limit, 3);
}

#[tokio::test]
async fn test_same_job_never_overlaps() {
  setup_tracing();
  let scheduler = build_scheduler(4);
  let finished = Arc::new(AtomicBool::new(false));

  scheduler
    .register(JobDefinition::new(
      "nightly-rollup",
      Schedule::Never,
      sleeping_handler(Duration::from_millis(200), finished.clone()),
    ))
    .await
    .unwrap();

  let first = {
    let scheduler = scheduler.clone();
    tokio::spawn(async move { scheduler.trigger_job("nightly-rollup").await })
  };

  let s = scheduler.clone();
  assert!(wait_until(Duration::from_secs(1), || s.get_status().running_executions == 1).await);

  let err = scheduler.trigger_job("nightly-rollup").await.unwrap_err();
  assert_eq!(
    err,
    SchedulerError::Execution(ExecutionError::AlreadyRunning {
      job: "nightly-rollup".into()
    })
  );
  assert_eq!(scheduler.metrics_snapshot().rejected_overlap, 1);

  let record = first.await.unwrap().unwrap();
  assert!(record.status.is_final());
  assert!(finished.load(Ordering::SeqCst));

  // Free again once the first attempt finished.
  assert!(scheduler.trigger_job("nightly-rollup").await.is_ok());
}

#[tokio::test]
async fn test_higher_priority_wins_simultaneous_fires() {
  setup_tracing();
  let scheduler = build_scheduler(1);
  let at = Utc::now() + chrono::Duration::milliseconds(150);
  let low_done = Arc::new(AtomicBool::new(false));
  let critical_done = Arc::new(AtomicBool::new(false));

  // Registered first, so only priority can put it second.
  scheduler
    .register(
      JobDefinition::new(
        "low-digest",
        Schedule::Once(at),
        sleeping_handler(Duration::from_millis(200), low_done.clone()),
      )
      .with_priority(JobPriority::Low)
      .with_retry(0, Duration::from_secs(1)),
    )
    .await
    .unwrap();
  scheduler
    .register(
      JobDefinition::new(
        "critical-billing",
        Schedule::Once(at),
        sleeping_handler(Duration::from_millis(200), critical_done.clone()),
      )
      .with_priority(JobPriority::Critical)
      .with_retry(0, Duration::from_secs(1)),
    )
    .await
    .unwrap();

  let mut events = scheduler.subscribe();
  scheduler.start().await.unwrap();

  let done = critical_done.clone();
  assert!(wait_until(Duration::from_secs(2), move || done.load(Ordering::SeqCst)).await);
  assert!(!low_done.load(Ordering::SeqCst));

  let rejected: Vec<String> = drain_events(&mut events)
    .into_iter()
    .filter_map(|event| match event {
      SchedulerEvent::JobRejected { job_name, trigger, reason } => {
        assert_eq!(trigger, TriggerSource::Schedule);
        assert!(matches!(reason, ExecutionError::ConcurrencyLimitExceeded { limit: 1 }));
        Some(job_name)
      }
      _ => None,
    })
    .collect();
  assert_eq!(rejected, vec!["low-digest"]);
  assert_eq!(scheduler.job_metrics("low-digest").unwrap().total_executions, 0);

  scheduler.stop().await.unwrap();
}
