use crate::{
    sync::{AtomicU64, AtomicUsize, Condvar, Mutex, Ordering},
    worker,
};
use std::sync::Arc;

/// Completion notification for submitted task graphs.
///
/// Every submission that references the event adds one outstanding signal;
/// the last task of that submission removes it. [`wait`](Self::wait) blocks
/// until no signals are outstanding, so one event can track several graphs,
/// or several runs of a retained graph.
///
/// Cloning is cheap: clones share the same state.
#[derive(Debug, Clone)]
pub struct TaskGraphEvent {
    state: Arc<EventState>,
}

#[derive(Debug)]
struct EventState {
    wait_count: AtomicUsize,
    /// Id of the last executor this event was submitted to, `0` if none.
    executor_id: AtomicU64,
    lock: Mutex<()>,
    drained: Condvar,
}

impl TaskGraphEvent {
    /// Event with no outstanding signals.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(EventState {
                wait_count: AtomicUsize::new(0),
                executor_id: AtomicU64::new(0),
                lock: Mutex::new(()),
                drained: Condvar::new(),
            }),
        }
    }

    /// Add one outstanding signal. Called once per submission that references
    /// this event.
    pub fn inc_wait_count(&self) {
        self.state.wait_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Remove one outstanding signal, waking waiters if it was the last.
    ///
    /// # Panics
    /// If no signal is outstanding.
    pub fn signal(&self) {
        let previous = self.state.wait_count.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(previous, 0, "TaskGraphEvent signalled more often than submitted");
        if previous == 1 {
            let _guard = self.state.lock.lock();
            self.state.drained.notify_all();
        }
    }

    /// Number of outstanding signals.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.wait_count.load(Ordering::Acquire)
    }

    /// Whether no signals are outstanding.
    #[must_use]
    pub fn is_signalled(&self) -> bool {
        self.pending() == 0
    }

    /// Block until every outstanding signal has arrived.
    ///
    /// # Panics
    /// If called from an enabled worker thread of the executor this event was
    /// last submitted to. That worker could never run the tasks queued to it
    /// while blocked here. Tasks that need to wait for a sub-graph should use
    /// [`TaskExecutor::wait_nested`](crate::executor::TaskExecutor::wait_nested).
    pub fn wait(&self) {
        let executor_id = self.state.executor_id.load(Ordering::Relaxed);
        assert!(
            executor_id == 0 || !worker::is_enabled_worker_of(executor_id),
            "TaskGraphEvent::wait called from an enabled worker of task executor {executor_id}; \
             this would deadlock"
        );

        if self.is_signalled() {
            return;
        }
        let mut guard = self.state.lock.lock();
        while !self.is_signalled() {
            self.state.drained.wait(&mut guard);
        }
    }

    /// Remember which executor the event has been submitted to.
    pub(crate) fn bind_executor(&self, executor_id: u64) {
        self.state.executor_id.store(executor_id, Ordering::Relaxed);
    }
}

impl Default for TaskGraphEvent {
    fn default() -> Self {
        Self::new()
    }
}
