//! Static catalog of job definitions.

use crate::error::SchedulerError;
use crate::job::JobDefinition;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

/// Registered definitions keyed by name, remembering registration order.
#[derive(Debug, Default)]
pub struct JobRegistry {
  order: Vec<String>,
  definitions: HashMap<String, Arc<JobDefinition>>,
}

impl JobRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds a definition. Fails with `DuplicateJob` if the name is taken and
  /// with `InvalidSchedule` if its schedule cannot produce fire times.
  pub fn register(&mut self, definition: JobDefinition) -> Result<Arc<JobDefinition>, SchedulerError> {
    if self.definitions.contains_key(&definition.name) {
      return Err(SchedulerError::DuplicateJob(definition.name));
    }
    definition
      .schedule
      .validate()
      .map_err(|reason| SchedulerError::InvalidSchedule {
        job: definition.name.clone(),
        reason,
      })?;

    debug!(job_name = %definition.name, schedule = %definition.schedule, "Registering job.");
    let name = definition.name.clone();
    let definition = Arc::new(definition);
    self.order.push(name.clone());
    self.definitions.insert(name, definition.clone());
    Ok(definition)
  }

  /// Removes a definition. Returns the removed definition, `None` when the
  /// name was not registered.
  pub fn unregister(&mut self, name: &str) -> Option<Arc<JobDefinition>> {
    let removed = self.definitions.remove(name)?;
    self.order.retain(|n| n != name);
    debug!(job_name = %name, "Unregistered job.");
    Some(removed)
  }

  pub fn get(&self, name: &str) -> Option<Arc<JobDefinition>> {
    self.definitions.get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.definitions.contains_key(name)
  }

  /// All definitions in registration order.
  pub fn list(&self) -> Vec<Arc<JobDefinition>> {
    self
      .order
      .iter()
      .filter_map(|name| self.definitions.get(name).cloned())
      .collect()
  }

  /// Enabled definitions in registration order.
  pub fn enabled(&self) -> Vec<Arc<JobDefinition>> {
    self.list().into_iter().filter(|d| d.enabled).collect()
  }

  pub fn names(&self) -> Vec<String> {
    self.order.clone()
  }

  pub fn len(&self) -> usize {
    self.order.len()
  }

  pub fn is_empty(&self) -> bool {
    self.order.is_empty()
  }
}

