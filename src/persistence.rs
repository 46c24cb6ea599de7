//! Audit trail: a minimal query interface plus the SQL the scheduler runs on it.

use crate::error::PersistenceError;
use crate::health::SystemHealth;
use crate::job::{ExecutionRecord, ExecutionStatus, TriggerSource};
use crate::metrics::SchedulerMetrics;
use crate::tracker::JobMetrics;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// One result row, column name to value.
pub type Row = Map<String, Value>;

/// Query/transaction interface the scheduler persists through.
///
/// Statements use positional `?N` placeholders. Implementations decide how
/// JSON values map onto their column types.
#[async_trait]
pub trait Persistence: Send + Sync {
  /// Runs one statement. Returns the produced rows (empty for writes).
  async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, PersistenceError>;

  /// Runs all statements atomically.
  async fn transaction(&self, statements: Vec<(String, Vec<Value>)>) -> Result<(), PersistenceError>;
}

// --- SQLite backend ---

/// [`Persistence`] over a single SQLite connection.
pub struct SqlitePersistence {
  conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqlitePersistence {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SqlitePersistence").finish_non_exhaustive()
  }
}

impl SqlitePersistence {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub fn open_in_memory() -> Result<Self, PersistenceError> {
    Ok(Self {
      conn: Mutex::new(Connection::open_in_memory()?),
    })
  }
}

fn to_sql_value(value: &Value) -> SqlValue {
  match value {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
    Value::Number(n) => match n.as_i64() {
      Some(i) => SqlValue::Integer(i),
      None => SqlValue::Real(n.as_f64().unwrap_or_default()),
    },
    Value::String(s) => SqlValue::Text(s.clone()),
    other => SqlValue::Text(other.to_string()),
  }
}

fn from_value_ref(value: ValueRef<'_>) -> Result<Value, PersistenceError> {
  Ok(match value {
    ValueRef::Null => Value::Null,
    ValueRef::Integer(i) => json!(i),
    ValueRef::Real(f) => serde_json::Number::from_f64(f)
      .map(Value::Number)
      .unwrap_or(Value::Null),
    ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    ValueRef::Blob(_) => return Err(PersistenceError::Decode("blob columns are not supported".into())),
  })
}

#[async_trait]
impl Persistence for SqlitePersistence {
  async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, PersistenceError> {
    let conn = self.conn.lock();
    let mut stmt = conn.prepare(sql)?;
    let params = rusqlite::params_from_iter(params.iter().map(to_sql_value));

    if stmt.column_count() == 0 {
      stmt.execute(params)?;
      return Ok(Vec::new());
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
      let mut map = Map::with_capacity(columns.len());
      for (idx, column) in columns.iter().enumerate() {
        map.insert(column.clone(), from_value_ref(row.get_ref(idx)?)?);
      }
      out.push(map);
    }
    Ok(out)
  }

  async fn transaction(&self, statements: Vec<(String, Vec<Value>)>) -> Result<(), PersistenceError> {
    let mut conn = self.conn.lock();
    let tx = conn.transaction()?;
    for (sql, params) in &statements {
      tx.execute(sql, rusqlite::params_from_iter(params.iter().map(to_sql_value)))?;
    }
    tx.commit()?;
    Ok(())
  }
}

// --- Execution journal ---

const SCHEMA: [&str; 4] = [
  "CREATE TABLE IF NOT EXISTS job_executions (
     id           TEXT PRIMARY KEY,
     job_name     TEXT NOT NULL,
     execution_id TEXT NOT NULL UNIQUE,
     status       TEXT NOT NULL,
     triggered_by TEXT NOT NULL,
     started_at   TEXT NOT NULL,
     completed_at TEXT,
     duration     INTEGER,
     error        TEXT
   )",
  "CREATE INDEX IF NOT EXISTS job_executions_job_started ON job_executions(job_name, started_at)",
  "CREATE TABLE IF NOT EXISTS scheduler_health (
     id           INTEGER PRIMARY KEY AUTOINCREMENT,
     status       TEXT NOT NULL,
     active_jobs  INTEGER NOT NULL,
     failed_jobs  INTEGER NOT NULL,
     system_load  REAL NOT NULL,
     memory_usage REAL NOT NULL,
     issues       TEXT NOT NULL,
     checked_at   TEXT NOT NULL
   )",
  "CREATE TABLE IF NOT EXISTS job_metrics (
     id                     INTEGER PRIMARY KEY AUTOINCREMENT,
     job_name               TEXT NOT NULL,
     total_executions       INTEGER NOT NULL,
     successful_executions  INTEGER NOT NULL,
     failed_executions      INTEGER NOT NULL,
     average_execution_time REAL NOT NULL,
     uptime                 REAL NOT NULL,
     consecutive_failures   INTEGER NOT NULL,
     last_execution_time    TEXT,
     recorded_at            TEXT NOT NULL
   )",
];

const RECORD_COLUMNS: &str =
  "id, job_name, execution_id, status, triggered_by, started_at, completed_at, duration, error";

/// Timestamps are stored as fixed-width RFC 3339 UTC text so that string
/// comparison orders them chronologically.
fn ts(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn trigger_to_column(trigger: TriggerSource) -> String {
  match trigger {
    TriggerSource::Retry { attempt } => format!("retry:{}", attempt),
    other => other.as_str().to_string(),
  }
}

fn trigger_from_column(value: &str) -> Result<TriggerSource, PersistenceError> {
  match value {
    "schedule" => Ok(TriggerSource::Schedule),
    "manual" => Ok(TriggerSource::Manual),
    other => other
      .strip_prefix("retry:")
      .and_then(|n| n.parse().ok())
      .map(|attempt| TriggerSource::Retry { attempt })
      .ok_or_else(|| PersistenceError::Decode(format!("unknown trigger `{}`", other))),
  }
}

fn text<'a>(row: &'a Row, column: &str) -> Result<&'a str, PersistenceError> {
  row
    .get(column)
    .and_then(Value::as_str)
    .ok_or_else(|| PersistenceError::Decode(format!("missing text column `{}`", column)))
}

fn opt_text<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
  row.get(column).and_then(Value::as_str)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, PersistenceError> {
  DateTime::parse_from_rfc3339(value)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| PersistenceError::Decode(format!("bad timestamp `{}`: {}", value, e)))
}

fn record_from_row(row: &Row) -> Result<ExecutionRecord, PersistenceError> {
  let record_id = Uuid::parse_str(text(row, "id")?).map_err(|e| PersistenceError::Decode(e.to_string()))?;
  let status: ExecutionStatus = text(row, "status")?.parse().map_err(PersistenceError::Decode)?;
  Ok(ExecutionRecord {
    record_id,
    job_name: text(row, "job_name")?.to_string(),
    execution_id: text(row, "execution_id")?.to_string(),
    status,
    trigger: trigger_from_column(text(row, "triggered_by")?)?,
    started_at: parse_ts(text(row, "started_at")?)?,
    completed_at: opt_text(row, "completed_at").map(parse_ts).transpose()?,
    duration: row
      .get("duration")
      .and_then(Value::as_u64)
      .map(Duration::from_millis),
    error: opt_text(row, "error").map(str::to_string),
  })
}

/// Background attempt writes that have not finished yet.
#[derive(Debug, Default)]
struct InFlightWrites {
  count: AtomicUsize,
  settled: Notify,
}

struct InFlightGuard(Arc<InFlightWrites>);

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    if self.0.count.fetch_sub(1, AtomicOrdering::AcqRel) == 1 {
      self.0.settled.notify_waiters();
    }
  }
}

/// Owns the scheduler's SQL. Write helpers never fail: errors are logged,
/// counted in `persistence_failures`, and dropped.
#[derive(Clone)]
pub struct ExecutionJournal {
  store: Arc<dyn Persistence>,
  metrics: SchedulerMetrics,
  in_flight: Arc<InFlightWrites>,
}

impl std::fmt::Debug for ExecutionJournal {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExecutionJournal").finish_non_exhaustive()
  }
}

impl ExecutionJournal {
  pub fn new(store: Arc<dyn Persistence>, metrics: SchedulerMetrics) -> Self {
    Self {
      store,
      metrics,
      in_flight: Arc::new(InFlightWrites::default()),
    }
  }

  /// Audits one attempt off the caller's path: the start row is written in
  /// a background task, followed by the outcome once `finished` delivers it.
  /// The two writes of an attempt stay ordered.
  pub(crate) fn track_attempt(&self, started: ExecutionRecord, finished: oneshot::Receiver<ExecutionRecord>) {
    self.in_flight.count.fetch_add(1, AtomicOrdering::AcqRel);
    let guard = InFlightGuard(self.in_flight.clone());
    let journal = self.clone();
    tokio::spawn(async move {
      let _guard = guard;
      journal.record_start(&started).await;
      match finished.await {
        Ok(record) => journal.record_finish(&record).await,
        Err(_) => debug!(execution_id = %started.execution_id, "Attempt dropped before finishing; outcome not recorded."),
      }
    });
  }

  /// Number of attempts whose audit writes are still pending.
  pub fn pending_writes(&self) -> usize {
    self.in_flight.count.load(AtomicOrdering::Acquire)
  }

  /// Resolves once every background attempt write has completed.
  pub async fn settle(&self) {
    loop {
      let settled = self.in_flight.settled.notified();
      if self.pending_writes() == 0 {
        return;
      }
      settled.await;
    }
  }

  pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
    let statements = SCHEMA.iter().map(|sql| (sql.to_string(), Vec::new())).collect();
    self.store.transaction(statements).await
  }

  fn swallow(&self, what: &str, result: Result<(), PersistenceError>) {
    if let Err(e) = result {
      self.metrics.persistence_failures.fetch_add(1, AtomicOrdering::Relaxed);
      warn!(error = %e, "Failed to persist {}.", what);
    }
  }

  pub async fn record_start(&self, record: &ExecutionRecord) {
    let result = self
      .store
      .execute(
        "INSERT INTO job_executions (id, job_name, execution_id, status, triggered_by, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        &[
          json!(record.record_id.to_string()),
          json!(record.job_name),
          json!(record.execution_id),
          json!(record.status.as_str()),
          json!(trigger_to_column(record.trigger)),
          json!(ts(record.started_at)),
        ],
      )
      .await
      .map(|_| ());
    self.swallow("execution start", result);
  }

  pub async fn record_finish(&self, record: &ExecutionRecord) {
    let result = self
      .store
      .execute(
        "UPDATE job_executions SET status = ?1, completed_at = ?2, duration = ?3, error = ?4 WHERE id = ?5",
        &[
          json!(record.status.as_str()),
          json!(record.completed_at.map(ts)),
          json!(record.duration.map(|d| d.as_millis() as u64)),
          json!(record.error),
          json!(record.record_id.to_string()),
        ],
      )
      .await
      .map(|_| ());
    self.swallow("execution outcome", result);
  }

  pub async fn record_health(&self, health: &SystemHealth) {
    let issues = serde_json::to_string(&health.issues).unwrap_or_else(|_| "[]".to_string());
    let result = self
      .store
      .execute(
        "INSERT INTO scheduler_health (status, active_jobs, failed_jobs, system_load, memory_usage, issues, checked_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        &[
          json!(health.status.as_str()),
          json!(health.active_jobs),
          json!(health.failed_jobs),
          json!(health.system_load),
          json!(health.memory_usage),
          json!(issues),
          json!(ts(health.checked_at)),
        ],
      )
      .await
      .map(|_| ());
    self.swallow("health snapshot", result);
  }

  /// Appends one `job_metrics` row per job, atomically.
  pub async fn flush_metrics(&self, snapshot: &HashMap<String, JobMetrics>) {
    if snapshot.is_empty() {
      return;
    }
    let recorded_at = ts(Utc::now());
    let mut names: Vec<&String> = snapshot.keys().collect();
    names.sort();
    let statements = names
      .into_iter()
      .map(|name| {
        let m = &snapshot[name];
        (
          "INSERT INTO job_metrics (job_name, total_executions, successful_executions, failed_executions,
             average_execution_time, uptime, consecutive_failures, last_execution_time, recorded_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            .to_string(),
          vec![
            json!(name),
            json!(m.total_executions),
            json!(m.successful_executions),
            json!(m.failed_executions),
            json!(m.average_duration_ms),
            json!(m.uptime),
            json!(m.consecutive_failures),
            json!(m.last_execution_time.map(ts)),
            json!(recorded_at),
          ],
        )
      })
      .collect();
    let result = self.store.transaction(statements).await;
    debug!(ok = result.is_ok(), "Flushed job metrics.");
    self.swallow("job metrics", result);
  }

  /// Finalized records started at or after `since`, oldest first.
  pub async fn load_history(&self, since: DateTime<Utc>) -> Result<Vec<ExecutionRecord>, PersistenceError> {
    let sql = format!(
      "SELECT {} FROM job_executions WHERE started_at >= ?1 AND status != 'running' ORDER BY started_at, rowid",
      RECORD_COLUMNS
    );
    let rows = self.store.execute(&sql, &[json!(ts(since))]).await?;
    rows.iter().map(record_from_row).collect()
  }

  /// Most recent records of one job, newest first.
  pub async fn recent_executions(
    &self,
    job_name: &str,
    limit: usize,
  ) -> Result<Vec<ExecutionRecord>, PersistenceError> {
    let sql = format!(
      "SELECT {} FROM job_executions WHERE job_name = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2",
      RECORD_COLUMNS
    );
    let rows = self
      .store
      .execute(&sql, &[json!(job_name), json!(limit as i64)])
      .await?;
    rows.iter().map(record_from_row).collect()
  }
}
