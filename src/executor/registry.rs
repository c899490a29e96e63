//! Process-wide default executor.
//!
//! The slot owns one `Arc<TaskExecutor>`. It is filled explicitly with
//! [`init_default_executor`] or [`set_default_executor`] and emptied with
//! [`reset_default_executor`]; the executor is torn down once the last clone
//! handed out by [`default_executor`] is dropped as well.

use crate::{
    config::ExecutorConfig,
    executor::{ExecutorError, TaskExecutor},
};
use parking_lot::Mutex;
use std::sync::Arc;

// Not model-checked: loom primitives cannot live in a `static`.
static DEFAULT_EXECUTOR: Mutex<Option<Arc<TaskExecutor>>> = parking_lot::const_mutex(None);

/// Create an executor from `config` and install it as the default.
///
/// # Errors
/// If a default executor is already installed, or a worker thread cannot be
/// spawned.
pub fn init_default_executor(config: ExecutorConfig) -> Result<Arc<TaskExecutor>, ExecutorError> {
    let mut slot = DEFAULT_EXECUTOR.lock();
    if slot.is_some() {
        return Err(ExecutorError::DefaultAlreadyInitialized);
    }
    let executor = Arc::new(TaskExecutor::new(config)?);
    *slot = Some(executor.clone());
    log::debug!("Installed task executor {} as default", executor.id());
    Ok(executor)
}

/// Install an existing executor as the default.
///
/// # Errors
/// If a default executor is already installed.
pub fn set_default_executor(executor: Arc<TaskExecutor>) -> Result<(), ExecutorError> {
    let mut slot = DEFAULT_EXECUTOR.lock();
    if slot.is_some() {
        return Err(ExecutorError::DefaultAlreadyInitialized);
    }
    log::debug!("Installed task executor {} as default", executor.id());
    *slot = Some(executor);
    Ok(())
}

/// The default executor, if one is installed.
#[must_use]
pub fn default_executor() -> Option<Arc<TaskExecutor>> {
    DEFAULT_EXECUTOR.lock().clone()
}

/// Empty the slot and return the executor it held.
pub fn reset_default_executor() -> Option<Arc<TaskExecutor>> {
    let executor = DEFAULT_EXECUTOR.lock().take();
    if let Some(executor) = &executor {
        log::debug!("Removed default task executor {}", executor.id());
    }
    executor
}

impl TaskExecutor {
    /// The default executor.
    ///
    /// # Panics
    /// If no default executor is installed.
    #[must_use]
    pub fn instance() -> Arc<Self> {
        default_executor().expect("no default task executor is installed")
    }
}
