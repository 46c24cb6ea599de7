use super::TriggerSource;

/// Contextual information available to a running job attempt via task-locals.
/// Accessible within a handler using `try_get_current_job_context()`
/// or the `job_context!()` macro when the `job_context` feature is enabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobContext {
  /// Name of the registered job this attempt belongs to.
  pub job_name: String,
  /// Identifier of this specific attempt (`<job name>_<start ms>`).
  pub execution_id: String,
  /// What caused the attempt.
  pub trigger: TriggerSource,
}

tokio::task_local! {
    /// Provides access to the current `JobContext` within a handler's execution scope.
    /// Set by the job runner if the `job_context` feature is enabled.
    pub static CURRENT_JOB_CONTEXT: JobContext;
}

/// Attempts to retrieve the current `JobContext` for the executing attempt.
///
/// Returns `None` outside a runner-managed handler task.
pub fn try_get_current_job_context() -> Option<JobContext> {
  CURRENT_JOB_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current `JobContext`, panicking if called outside a
/// runner-managed handler task.
///
/// Use `try_get_current_job_context()` for safe, optional access.
///
/// # Panics
/// Panics if the `CURRENT_JOB_CONTEXT` task local has not been set.
#[macro_export]
macro_rules! job_context {
  () => {
    $crate::job::context::CURRENT_JOB_CONTEXT.with(|ctx| ctx.clone())
  };
}
