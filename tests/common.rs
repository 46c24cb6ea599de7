//! tests/common.rs
//! Shared helpers for integration tests.
#![allow(dead_code)]

use cronkeeper::{
  CronKeeper, FixedProbe, HandlerFuture, Notification, NotificationSink, NotifyError, SchedulerBuilder,
  SchedulerEvent, SqlitePersistence,
};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::fmt::TestWriter;

// Initialize tracing subscriber for tests (call once per test binary)
pub fn setup_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_max_level(Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

/// Builder with a quiet probe and a health interval long enough that the
/// periodic ticker never runs during a test.
pub fn builder(max_concurrent: usize) -> SchedulerBuilder {
  CronKeeper::builder()
    .max_concurrent_jobs(max_concurrent)
    .health_check_interval(Duration::from_secs(3600))
    .stop_timeout(Duration::from_secs(5))
    .probe(Arc::new(FixedProbe::new(10.0, 40.0)))
}

pub fn build_scheduler(max_concurrent: usize) -> CronKeeper {
  builder(max_concurrent).build().expect("Failed to build scheduler")
}

pub fn memory_store() -> Arc<SqlitePersistence> {
  Arc::new(SqlitePersistence::open_in_memory().expect("in-memory sqlite"))
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if condition() {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

/// Drains whatever events are buffered without waiting.
pub fn drain_events(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
  let mut events = Vec::new();
  while let Ok(event) = rx.try_recv() {
    events.push(event);
  }
  events
}

// --- Handlers ---

pub fn counting_handler(counter: Arc<AtomicUsize>) -> impl Fn() -> HandlerFuture + Send + Sync + 'static {
  move || {
    let counter = counter.clone();
    Box::pin(async move {
      let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
      info!("Counting handler ran ({})", count);
      Ok(())
    })
  }
}

/// Fails the first `failures` invocations, then succeeds.
pub fn flaky_handler(
  failures: usize,
  calls: Arc<AtomicUsize>,
) -> impl Fn() -> HandlerFuture + Send + Sync + 'static {
  move || {
    let calls = calls.clone();
    Box::pin(async move {
      let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
      if call <= failures {
        anyhow::bail!("simulated failure #{}", call);
      }
      Ok(())
    })
  }
}

pub fn failing_handler(calls: Arc<AtomicUsize>) -> impl Fn() -> HandlerFuture + Send + Sync + 'static {
  flaky_handler(usize::MAX, calls)
}

pub fn sleeping_handler(
  duration: Duration,
  finished: Arc<AtomicBool>,
) -> impl Fn() -> HandlerFuture + Send + Sync + 'static {
  move || {
    let finished = finished.clone();
    Box::pin(async move {
      tokio::time::sleep(duration).await;
      finished.store(true, Ordering::SeqCst);
      Ok(())
    })
  }
}

pub fn panic_handler() -> impl Fn() -> HandlerFuture + Send + Sync + 'static {
  || Box::pin(async { panic!("Job panicked intentionally!") })
}

/// Tracks how many handler invocations overlap.
pub fn concurrency_tracker_handler(
  current: Arc<AtomicUsize>,
  max_seen: Arc<AtomicUsize>,
  duration: Duration,
) -> impl Fn() -> HandlerFuture + Send + Sync + 'static {
  move || {
    let current = current.clone();
    let max_seen = max_seen.clone();
    Box::pin(async move {
      let now_running = current.fetch_add(1, Ordering::SeqCst) + 1;
      max_seen.fetch_max(now_running, Ordering::SeqCst);
      tokio::time::sleep(duration).await;
      current.fetch_sub(1, Ordering::SeqCst);
      Ok(())
    })
  }
}

// --- Notification sink ---

#[derive(Debug, Default)]
pub struct CollectingNotifier {
  sent: Mutex<Vec<Notification>>,
}

impl CollectingNotifier {
  pub fn sent(&self) -> Vec<Notification> {
    self.sent.lock().clone()
  }

  pub fn of_kind(&self, kind: &str) -> Vec<Notification> {
    self.sent.lock().iter().filter(|n| n.kind == kind).cloned().collect()
  }
}

#[async_trait]
impl NotificationSink for CollectingNotifier {
  async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
    self.sent.lock().push(notification);
    Ok(())
  }
}

/// Rejects every notification.
#[derive(Debug, Default)]
pub struct BrokenNotifier;

#[async_trait]
impl NotificationSink for BrokenNotifier {
  async fn notify(&self, _notification: Notification) -> Result<(), NotifyError> {
    Err(NotifyError::Delivery("smtp relay down".to_string()))
  }
}

/// Never finishes delivering.
#[derive(Debug, Default)]
pub struct HangingNotifier;

#[async_trait]
impl NotificationSink for HangingNotifier {
  async fn notify(&self, _notification: Notification) -> Result<(), NotifyError> {
    std::future::pending::<()>().await;
    Ok(())
  }
}
