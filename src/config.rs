use crate::sync::available_parallelism;
use std::borrow::Cow;

/// Configuration entry-point for constructing a
/// [`TaskExecutor`](crate::executor::TaskExecutor).
///
/// The defaults spawn one worker per logical core, name them
/// `task-worker-{index}` and keep no diagnostics log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Number of worker threads. `0` means one per logical core.
    pub num_workers: usize,
    /// Worker threads are named `"{prefix}-{index}"`.
    pub thread_name_prefix: Cow<'static, str>,
    /// Capacity of the graph lifecycle log, see
    /// [`TaskExecutor::graph_event_log`](crate::executor::TaskExecutor::graph_event_log).
    /// `0` disables it.
    pub event_log_capacity: usize,
}

impl ExecutorConfig {
    /// Set the worker count, `0` meaning one per logical core.
    #[must_use]
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<Cow<'static, str>>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Enable the graph lifecycle log with the given capacity.
    #[must_use]
    pub fn with_event_log_capacity(mut self, capacity: usize) -> Self {
        self.event_log_capacity = capacity;
        self
    }

    /// The worker count after resolving `0` to the hardware concurrency.
    #[must_use]
    pub fn resolved_num_workers(&self) -> usize {
        match self.num_workers {
            0 => available_parallelism(),
            n => n,
        }
    }

    pub(crate) fn worker_thread_name(&self, index: usize) -> String {
        format!("{}-{index}", self.thread_name_prefix)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            thread_name_prefix: Cow::Borrowed("task-worker"),
            event_log_capacity: 0,
        }
    }
}
