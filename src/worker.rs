use crate::{
    executor::{ExecutorShared, GraphTransition},
    graph::compiled::{CompiledTaskGraph, GraphRelease},
    queue::{TaskPtr, TaskQueue},
    sync::*,
};
use core::cell::RefCell;
use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

#[cfg(not(feature = "loom"))]
thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<TaskWorker>>> = const { RefCell::new(None) };
}

#[cfg(feature = "loom")]
thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<TaskWorker>>> = RefCell::new(None);
}

/// Run `f` with the worker running on the calling thread, if any.
pub(crate) fn with_current_worker<R>(f: impl FnOnce(Option<&TaskWorker>) -> R) -> R {
    CURRENT_WORKER.with(|current| f(current.borrow().as_deref()))
}

/// Whether the calling thread is an enabled worker of the given executor.
pub(crate) fn is_enabled_worker_of(executor_id: u64) -> bool {
    with_current_worker(|worker| {
        worker.is_some_and(|worker| worker.executor_id == executor_id && worker.is_enabled())
    })
}

/// A worker thread's queue and flags, shared with its executor.
///
/// Lifecycle: spawned → running ⇄ disabled → stopped → joined.
#[derive(Debug)]
pub(crate) struct TaskWorker {
    index: usize,
    executor_id: u64,
    queue: TaskQueue,
    wake: Semaphore,
    /// Cleared once on executor teardown.
    active: AtomicBool,
    /// Cleared while the worker blocks in a nested wait, so that no new tasks
    /// are routed to it.
    enabled: AtomicBool,
}

impl TaskWorker {
    pub(crate) fn new(index: usize, executor_id: u64) -> Self {
        Self {
            index,
            executor_id,
            queue: TaskQueue::new(),
            wake: Semaphore::new(0),
            active: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn executor_id(&self) -> u64 {
        self.executor_id
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        log::trace!("Disabled task worker {}", self.index);
    }

    pub(crate) fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        log::trace!("Enabled task worker {}", self.index);
    }

    /// Take a queued task away from this worker, e.g. to reroute it while the
    /// worker is disabled.
    pub(crate) fn steal(&self) -> Option<TaskPtr> {
        self.queue.try_dequeue()
    }

    /// Queue a task and wake the worker.
    ///
    /// # Safety
    ///
    /// The task's graph must stay alive until the task has been processed.
    pub(crate) unsafe fn enqueue(&self, task: TaskPtr) {
        // SAFETY: Forwarded from the caller.
        unsafe { self.queue.enqueue(task) };
        self.wake.release();
    }

    /// Make the worker leave its run loop at the next wake-up.
    pub(crate) fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.wake.release();
    }

    /// Spawn the backing thread. It registers itself as the thread's current
    /// worker, releases `ready` once, then serves its queue until stopped.
    pub(crate) fn spawn(
        self: Arc<Self>,
        name: String,
        executor: Arc<ExecutorShared>,
        ready: Arc<Semaphore>,
    ) -> io::Result<JoinHandle<()>> {
        spawn_named(name, move || {
            CURRENT_WORKER.with(|current| *current.borrow_mut() = Some(self.clone()));
            log::debug!("Task worker {} started", self.index);
            ready.release();

            self.run(&executor);

            CURRENT_WORKER.with(|current| current.borrow_mut().take());
            log::debug!("Task worker {} exited", self.index);
        })
    }

    fn run(&self, executor: &ExecutorShared) {
        loop {
            self.wake.acquire();
            if !self.active.load(Ordering::Acquire) {
                break;
            }
            while let Some(task) = self.queue.try_dequeue() {
                // SAFETY: Every task is enqueued exactly once per submission,
                // and its graph is kept alive by the task's own reference.
                unsafe { self.process(executor, task) };
            }
        }
        if !self.queue.is_empty() {
            log::warn!(
                "Task worker {} exited with {} task(s) still queued",
                self.index,
                self.queue.len()
            );
        }
    }

    /// Run a task, release its ready successors and drop its reference on the
    /// graph.
    ///
    /// # Safety
    ///
    /// `task` must have been dequeued exactly once for the current submission
    /// of its graph.
    unsafe fn process(&self, executor: &ExecutorShared, task: TaskPtr) {
        // SAFETY: The task holds a reference on its graph until released below.
        let task = unsafe { task.as_ref() };
        let graph_ptr = task.graph();
        // SAFETY: As above.
        let graph = unsafe { graph_ptr.as_ref() };

        // SAFETY: This worker dequeued the task, so it is the only invoker.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| unsafe { task.invoke() })) {
            executor.record_panic(task.descriptor(), payload.as_ref());
        }

        // Publish this task's effects before any successor may observe its
        // dependency counter drop; the thread resolving the last dependency
        // acquires every predecessor's effects before queueing the successor.
        let mut successors = graph.successors(task).peekable();
        if successors.peek().is_some() {
            fence(Ordering::Release);
        }
        let mut acquired = false;
        for successor in successors {
            if successor.resolve_dependency() {
                if !acquired {
                    fence(Ordering::Acquire);
                    acquired = true;
                }
                // SAFETY: The successor belongs to the same graph, which
                // stays alive at least until the successor has run.
                unsafe { executor.submit_task(TaskPtr::new(successor)) };
            }
        }
        task.reset_dependency_count();

        let graph_id = graph.id();
        let task_count = graph.len();
        // SAFETY: The task's reference is given up exactly once; neither
        // `task` nor `graph` is touched afterwards.
        match unsafe { CompiledTaskGraph::release_task(graph_ptr) } {
            GraphRelease::Running => {}
            GraphRelease::Drained { event } => {
                executor.graph_finished(graph_id, task_count, GraphTransition::Drained, self.index);
                if let Some(event) = event {
                    event.signal();
                }
            }
            GraphRelease::Detached { graph, event } => {
                executor.graph_finished(graph_id, task_count, GraphTransition::Destroyed, self.index);
                // Task bodies may own the last handle to the executor, so the
                // graph goes only after the executor has stopped counting it.
                drop(graph);
                if let Some(event) = event {
                    event.signal();
                }
            }
        }
    }
}
