use crate::job::JobDefinition;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// A job currently bound to a cron trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmedTrigger {
  pub job_name: String,
  pub next_fire: DateTime<Utc>,
}

/// Commands sent from the `CronKeeper` handle to the trigger coordinator task.
///
/// Each command includes a `oneshot::Sender` for the coordinator to send
/// the response back to the requesting task.
#[derive(Debug)]
pub(crate) enum CoordinatorCommand {
  /// Bind a job to its schedule, replacing any existing binding.
  /// Responds with the first fire time, `None` if the schedule never fires.
  Arm {
    definition: Arc<JobDefinition>,
    responder: oneshot::Sender<Option<DateTime<Utc>>>,
  },
  /// Remove a job's binding. Responds `true` if it was armed.
  Disarm {
    job_name: String,
    responder: oneshot::Sender<bool>,
  },
  /// List armed triggers, soonest first.
  ListArmed {
    responder: oneshot::Sender<Vec<ArmedTrigger>>,
  },
}
