/// Macro to simplify creating a handler closure for [`crate::job::JobDefinition::new`].
///
/// Takes an optional synchronous setup block and a mandatory async logic block.
/// The logic block must evaluate to `anyhow::Result<()>`; boxing and pinning
/// are handled by the macro.
///
/// # Usage
///
/// ```ignore
/// # use cronkeeper::job_fn;
/// # use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// # let counter = Arc::new(AtomicUsize::new(0));
/// // With setup block:
/// let handler = job_fn! {
///     // Runs every time the handler is invoked, before the future is built.
///     {
///         let job_counter = counter.clone();
///     }
///     {
///         let count = job_counter.fetch_add(1, Ordering::SeqCst) + 1;
///         if count < 3 {
///             anyhow::bail!("attempt {} failed", count);
///         }
///         Ok(())
///     }
/// };
///
/// // Without setup block:
/// let simple = job_fn! {
///     {
///         tracing::info!("cleanup ran");
///         Ok(())
///     }
/// };
/// ```
#[macro_export]
macro_rules! job_fn {
    (
        { $($setup_stmts:stmt);* $(;)? }
        $main_block:block
    ) => {
        move || {
            $($setup_stmts)*

            let fut = async move {
                let result: ::anyhow::Result<()> = $main_block;
                result
            };

            Box::pin(fut) as $crate::job::HandlerFuture
        }
    };

    (
        $main_block:block
    ) => {
         move || {
            let fut = async move {
                let result: ::anyhow::Result<()> = $main_block;
                result
            };

            Box::pin(fut) as $crate::job::HandlerFuture
        }
    };
}
