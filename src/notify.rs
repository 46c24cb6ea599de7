//! Alert delivery collaborator.

use crate::error::NotifyError;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPriority {
  Low,
  Medium,
  High,
  Critical,
}

impl fmt::Display for AlertPriority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      AlertPriority::Low => "low",
      AlertPriority::Medium => "medium",
      AlertPriority::High => "high",
      AlertPriority::Critical => "critical",
    };
    f.write_str(s)
  }
}

/// An operator alert raised by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  /// Alert type, e.g. `job_failure` or `system_critical`.
  pub kind: String,
  pub title: String,
  pub message: String,
  pub priority: AlertPriority,
  /// Routing category, e.g. `job_failure` or `system_health`.
  pub category: String,
}

impl Notification {
  pub fn new(
    kind: impl Into<String>,
    title: impl Into<String>,
    message: impl Into<String>,
    priority: AlertPriority,
    category: impl Into<String>,
  ) -> Self {
    Self {
      kind: kind.into(),
      title: title.into(),
      message: message.into(),
      priority,
      category: category.into(),
    }
  }
}

/// Delivers alerts to operators (email, SMS, chat...). Delivery failures are
/// logged by the scheduler and otherwise ignored.
#[async_trait]
pub trait NotificationSink: Send + Sync {
  async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Default sink: writes alerts to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
  async fn notify(&self, n: Notification) -> Result<(), NotifyError> {
    match n.priority {
      AlertPriority::Critical => error!(category = %n.category, title = %n.title, "{}", n.message),
      AlertPriority::High => warn!(category = %n.category, title = %n.title, "{}", n.message),
      _ => info!(category = %n.category, title = %n.title, "{}", n.message),
    }
    Ok(())
  }
}
