mod diagnostics;
mod registry;

pub use crate::executor::{
    diagnostics::{GraphLifecycleRecord, GraphTransition},
    registry::{default_executor, init_default_executor, reset_default_executor, set_default_executor},
};
use crate::{
    config::ExecutorConfig,
    event::TaskGraphEvent,
    executor::diagnostics::GraphEventLog,
    graph::{
        TaskGraph, TaskGraphError,
        compiled::CompiledTaskGraph,
    },
    queue::TaskPtr,
    sync::*,
    types::TaskDescriptor,
    worker::{self, TaskWorker},
};
use core::{any::Any, ptr::NonNull, sync::atomic};
use derive_more::Debug;
use std::{io, sync::Arc};
use thiserror::Error;

static NEXT_EXECUTOR_ID: atomic::AtomicU64 = atomic::AtomicU64::new(1);

/// Error returned when an executor cannot be created or installed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn task worker {index}")]
    SpawnWorker {
        /// Index of the worker that could not be spawned.
        index: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// A default executor is already installed.
    #[error("a default task executor is already installed")]
    DefaultAlreadyInitialized,
}

/// Fixed pool of worker threads running submitted task graphs.
///
/// Every worker owns a lock-free multi-priority queue. Root tasks of a
/// submitted graph, and successors as they become ready, are spread over the
/// enabled workers round-robin. A task body runs to completion on the worker
/// that dequeued it.
///
/// Dropping the executor waits for every graph still in flight, then stops and
/// joins the workers in index order. If the last handle is dropped on one of
/// the executor's own workers, e.g. by a task body that owned it, the workers
/// are detached instead and stop by themselves once the last graph drains.
#[derive(Debug)]
pub struct TaskExecutor {
    shared: Arc<ExecutorShared>,
    #[debug(skip)]
    threads: Vec<JoinHandle<()>>,
}

/// State shared between the executor handle and its worker threads.
#[derive(Debug)]
pub(crate) struct ExecutorShared {
    id: u64,
    workers: Box<[Arc<TaskWorker>]>,
    /// Workers not parked in a nested wait. Never drops below one.
    enabled_workers: AtomicUsize,
    /// Round-robin cursor over `workers`.
    last_submission: AtomicUsize,
    /// Submissions that have not drained yet.
    graphs_remaining: AtomicUsize,
    /// Guards the wait for `graphs_remaining` to reach zero.
    drain_lock: Mutex<()>,
    drained: Condvar,
    /// Set when the executor was dropped on one of its own workers. The worker
    /// draining the last graph then stops the pool.
    closing: AtomicBool,
    panicked_tasks: AtomicUsize,
    event_log: Option<GraphEventLog>,
}

impl TaskExecutor {
    /// Spawn the worker pool. Returns once every worker thread is running.
    ///
    /// # Errors
    /// If a worker thread cannot be spawned. Workers spawned before the failure
    /// are stopped and joined.
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        let num_workers = config.resolved_num_workers();
        let id = NEXT_EXECUTOR_ID.fetch_add(1, atomic::Ordering::Relaxed);
        let shared = Arc::new(ExecutorShared {
            id,
            workers: (0..num_workers)
                .map(|index| Arc::new(TaskWorker::new(index, id)))
                .collect(),
            enabled_workers: AtomicUsize::new(num_workers),
            last_submission: AtomicUsize::new(0),
            graphs_remaining: AtomicUsize::new(0),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
            closing: AtomicBool::new(false),
            panicked_tasks: AtomicUsize::new(0),
            event_log: GraphEventLog::new(config.event_log_capacity),
        });

        let ready = Arc::new(Semaphore::new(0));
        let mut threads = Vec::with_capacity(num_workers);
        for worker in &shared.workers {
            let name = config.worker_thread_name(worker.index());
            match worker.clone().spawn(name, shared.clone(), ready.clone()) {
                Ok(thread) => threads.push(thread),
                Err(source) => {
                    for started in &shared.workers[..threads.len()] {
                        started.stop();
                    }
                    for thread in threads {
                        let _ = thread.join();
                    }
                    return Err(ExecutorError::SpawnWorker {
                        index: worker.index(),
                        source,
                    });
                }
            }
        }
        for _ in 0..num_workers {
            ready.acquire();
        }

        log::debug!("Started task executor {id} with {num_workers} worker(s)");
        Ok(Self { shared, threads })
    }

    /// Executor with `num_workers` workers and default settings otherwise.
    ///
    /// # Errors
    /// Same as [`new`](Self::new).
    pub fn with_workers(num_workers: usize) -> Result<Self, ExecutorError> {
        Self::new(ExecutorConfig::default().with_num_workers(num_workers))
    }

    /// Process-unique identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Number of worker threads.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.shared.workers.len()
    }

    /// Number of submitted graphs that have not drained yet.
    #[must_use]
    pub fn graphs_in_flight(&self) -> usize {
        self.shared.graphs_remaining.load(Ordering::Acquire)
    }

    /// Number of task bodies that panicked since the executor was created.
    #[must_use]
    pub fn panicked_task_count(&self) -> usize {
        self.shared.panicked_tasks.load(Ordering::Relaxed)
    }

    /// Snapshot of the graph lifecycle log, oldest first. Empty unless
    /// [`ExecutorConfig::event_log_capacity`] is non-zero.
    #[must_use]
    pub fn graph_event_log(&self) -> Vec<GraphLifecycleRecord> {
        self.shared
            .event_log
            .as_ref()
            .map_or_else(Vec::new, GraphEventLog::snapshot)
    }

    /// Same as [`TaskGraph::submit`].
    ///
    /// # Errors
    /// If `graph` cannot be compiled.
    pub fn submit(
        &self,
        graph: &mut TaskGraph,
        event: Option<&TaskGraphEvent>,
    ) -> Result<(), TaskGraphError> {
        graph.submit(self, event)
    }

    /// Queue the root tasks of a compiled graph.
    ///
    /// # Safety
    ///
    /// `graph` must be alive and stay alive for the duration of the call,
    /// which the builder's reference guarantees.
    ///
    /// # Panics
    /// If the previous submission of `graph` has not drained yet.
    pub(crate) unsafe fn submit_compiled(
        &self,
        graph: NonNull<CompiledTaskGraph>,
        event: Option<&TaskGraphEvent>,
    ) {
        // SAFETY: Guaranteed by the caller.
        let graph = unsafe { graph.as_ref() };
        if graph.is_empty() {
            // Nothing would ever signal the event otherwise.
            if let Some(event) = event {
                event.bind_executor(self.shared.id);
                event.inc_wait_count();
                event.signal();
            }
            return;
        }

        assert!(
            graph.begin_submission(event.cloned()),
            "Task graph {} is resubmitted before its previous submission has drained",
            graph.id()
        );
        if let Some(event) = event {
            event.bind_executor(self.shared.id);
            event.inc_wait_count();
        }
        self.shared.graphs_remaining.fetch_add(1, Ordering::AcqRel);
        self.shared.record(GraphLifecycleRecord {
            graph_id: graph.id(),
            task_count: graph.len(),
            transition: GraphTransition::Submitted,
            worker: None,
        });
        log::trace!(
            "Submitted task graph {} ({} task(s)) to task executor {}",
            graph.id(),
            graph.len(),
            self.shared.id
        );

        for root in graph.roots() {
            // SAFETY: The graph has been claimed above; every task holds a
            // reference on it until processed.
            unsafe { self.shared.submit_task(TaskPtr::new(root)) };
        }
    }

    /// Stop routing new tasks to the calling worker thread, so that it may
    /// block in [`TaskGraphEvent::wait`]. Tasks already queued to it are
    /// handed to the other workers.
    ///
    /// Returns `false`, and changes nothing, if the calling thread is not an
    /// enabled worker of this executor, or if it is the last enabled one.
    pub fn deactivate_task_worker(&self) -> bool {
        let Some(worker) = self.shared.current_worker() else {
            return false;
        };
        if !worker.is_enabled() {
            return false;
        }
        let reserved = self
            .shared
            .enabled_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |enabled| {
                (enabled > 1).then(|| enabled - 1)
            })
            .is_ok();
        if !reserved {
            return false;
        }
        worker.disable();
        // Pairs with the fence in `submit_task`: either that submitter sees the
        // worker disabled, or this drain sees its task.
        fence(Ordering::SeqCst);
        self.shared.reroute_queued(worker);
        true
    }

    /// Undo [`deactivate_task_worker`](Self::deactivate_task_worker). No-op if
    /// the calling thread is not a disabled worker of this executor.
    pub fn reactivate_task_worker(&self) {
        let Some(worker) = self.shared.current_worker() else {
            return;
        };
        if worker.is_enabled() {
            return;
        }
        worker.enable();
        self.shared.enabled_workers.fetch_add(1, Ordering::AcqRel);
    }

    /// Wait for `event` from inside a task body.
    ///
    /// The calling worker is deactivated for the duration of the wait and
    /// reactivated afterwards, even if the wait unwinds. Off the worker
    /// threads of this executor this is a plain [`TaskGraphEvent::wait`].
    ///
    /// # Panics
    /// If the calling worker is the only enabled worker of this executor:
    /// nothing could run the awaited tasks.
    pub fn wait_nested(&self, event: &TaskGraphEvent) {
        let _nested = NestedWait::enter(self);
        event.wait();
    }

    /// Submit `graph` from inside a task body and wait for it, see
    /// [`wait_nested`](Self::wait_nested).
    ///
    /// # Errors
    /// If `graph` cannot be compiled.
    pub fn run_nested(&self, graph: &mut TaskGraph) -> Result<(), TaskGraphError> {
        let _nested = NestedWait::enter(self);
        graph.run(self)
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        let on_own_worker = worker::with_current_worker(|worker| {
            worker.is_some_and(|worker| worker.executor_id() == self.shared.id)
        });
        if on_own_worker {
            // Waiting here could block the very tasks being waited for, and a
            // worker cannot join itself.
            log::debug!(
                "Task executor {} dropped on its own task worker, detaching {} worker(s)",
                self.shared.id,
                self.threads.len()
            );
            self.shared.closing.store(true, Ordering::SeqCst);
            if self.shared.graphs_remaining.load(Ordering::SeqCst) == 0 {
                self.shared.stop_workers();
            }
            self.threads.clear();
            return;
        }

        let in_flight = self.graphs_in_flight();
        if in_flight != 0 {
            log::warn!(
                "Task executor {} dropped with {in_flight} graph(s) in flight, waiting for them \
                 to drain",
                self.shared.id
            );
            let mut guard = self.shared.drain_lock.lock();
            while self.shared.graphs_remaining.load(Ordering::Acquire) != 0 {
                self.shared.drained.wait(&mut guard);
            }
        }

        self.shared.stop_workers();
        for (index, thread) in self.threads.drain(..).enumerate() {
            if thread.join().is_err() {
                log::error!("Task worker {index} of task executor {} panicked", self.shared.id);
            }
        }
        log::debug!("Stopped task executor {}", self.shared.id);
    }
}

/// Keeps the calling worker deactivated while alive.
struct NestedWait<'a> {
    executor: &'a TaskExecutor,
    deactivated: bool,
}

impl<'a> NestedWait<'a> {
    fn enter(executor: &'a TaskExecutor) -> Self {
        let deactivated = executor.deactivate_task_worker();
        Self {
            executor,
            deactivated,
        }
    }
}

impl Drop for NestedWait<'_> {
    fn drop(&mut self) {
        if self.deactivated {
            self.executor.reactivate_task_worker();
        }
    }
}

impl ExecutorShared {
    /// The worker running on the calling thread, if it belongs to this
    /// executor.
    fn current_worker(&self) -> Option<&TaskWorker> {
        worker::with_current_worker(|worker| {
            worker
                .filter(|worker| worker.executor_id() == self.id)
                .map(TaskWorker::index)
        })
        .map(|index| &*self.workers[index])
    }

    /// Queue a ready task on the next enabled worker.
    ///
    /// # Safety
    ///
    /// The task's graph must stay alive until the task has been processed.
    ///
    /// # Panics
    /// If every worker is disabled.
    pub(crate) unsafe fn submit_task(&self, task: TaskPtr) {
        let num_workers = self.workers.len();
        let start = self.last_submission.fetch_add(1, Ordering::Relaxed);
        let worker = (0..num_workers)
            .map(|offset| &self.workers[start.wrapping_add(offset) % num_workers])
            .find(|worker| worker.is_enabled())
            .unwrap_or_else(|| {
                panic!("Every task worker of task executor {} is disabled", self.id)
            });
        // SAFETY: Forwarded from the caller.
        unsafe { worker.enqueue(task) };

        // The worker may have been disabled after it was picked; its queue
        // would then not be served until it is reactivated.
        fence(Ordering::SeqCst);
        if !worker.is_enabled() {
            self.reroute_queued(worker);
        }
    }

    /// Hand every task queued on a disabled worker to an enabled one.
    fn reroute_queued(&self, worker: &TaskWorker) {
        while let Some(task) = worker.steal() {
            log::trace!("Rerouting task queued on disabled task worker {}", worker.index());
            // SAFETY: The task was queued under the same contract.
            unsafe { self.submit_task(task) };
        }
    }

    /// Called by the worker that completed the last task of a submission,
    /// before the graph may be freed and before its event is signalled.
    pub(crate) fn graph_finished(
        &self,
        graph_id: u64,
        task_count: usize,
        transition: GraphTransition,
        worker: usize,
    ) {
        self.record(GraphLifecycleRecord {
            graph_id,
            task_count,
            transition,
            worker: Some(worker),
        });
        log::trace!("Task graph {graph_id} {transition:?} on task worker {worker}");
        let previous = self.graphs_remaining.fetch_sub(1, Ordering::SeqCst);
        assert_ne!(previous, 0, "ExecutorShared::graph_finished: [1]");
        if previous == 1 {
            // Taking the lock orders this notification after a waiter's check.
            drop(self.drain_lock.lock());
            self.drained.notify_all();
            // Pairs with the store in `Drop for TaskExecutor`: either this load
            // sees `closing`, or the dropping worker sees no graph in flight.
            if self.closing.load(Ordering::SeqCst) {
                self.stop_workers();
            }
        }
    }

    fn stop_workers(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }

    pub(crate) fn record_panic(&self, descriptor: &TaskDescriptor, payload: &(dyn Any + Send)) {
        self.panicked_tasks.fetch_add(1, Ordering::Relaxed);
        let message = payload
            .downcast_ref::<&'static str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic payload>");
        log::error!(
            "Task `{}` (category `{}`) panicked: {message}",
            descriptor.name,
            descriptor.category
        );
    }

    fn record(&self, record: GraphLifecycleRecord) {
        if let Some(log) = &self.event_log {
            log.push(record);
        }
    }
}
