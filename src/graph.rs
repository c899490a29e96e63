mod compile;
pub(crate) mod compiled;

/// Error returned when a [`TaskGraph`] cannot be compiled.
pub use crate::graph::compile::TaskGraphError;
use crate::{
    event::TaskGraphEvent,
    executor::TaskExecutor,
    graph::compiled::CompiledTaskGraph,
    task::Task,
    types::{IndexSet, TaskDescriptor, TaskHandle},
};
use core::{ptr::NonNull, sync::atomic};
use derive_more::Debug;

static NEXT_GRAPH_ID: atomic::AtomicU64 = atomic::AtomicU64::new(1);

/// Builder for a DAG of tasks.
///
/// Tasks are added with [`add_task`](Self::add_task) and ordered with
/// [`precedes`](Self::precedes) / [`follows`](Self::follows). The first
/// submission compiles the graph; from then on it is frozen and can be
/// resubmitted any number of times, once each previous submission has
/// drained.
///
/// Dropping the builder, or calling [`detach`](Self::detach), hands an
/// in-flight graph over to the executor, which frees it after its last task
/// completes.
///
/// ```
/// use ctg::{executor::TaskExecutor, graph::TaskGraph, types::TaskDescriptor};
/// use std::sync::{Arc, Mutex};
///
/// let executor = TaskExecutor::with_workers(4).unwrap();
/// let x = Arc::new(Mutex::new(0));
///
/// let mut graph = TaskGraph::new();
/// let add = graph.add_task(TaskDescriptor::new("add"), {
///     let x = x.clone();
///     move || *x.lock().unwrap() += 3
/// });
/// let mul = graph.add_task(TaskDescriptor::new("mul"), {
///     let x = x.clone();
///     move || *x.lock().unwrap() *= 4
/// });
/// graph.precedes(add, [mul]);
/// graph.run(&executor).unwrap();
///
/// assert_eq!(*x.lock().unwrap(), 12);
/// ```
#[must_use]
#[derive(Debug)]
pub struct TaskGraph {
    id: u64,
    tasks: Vec<Task>,
    /// Successor indices per task, in declaration order, without duplicates.
    successors: Vec<IndexSet<u32>>,
    #[debug(skip)]
    compiled: Option<NonNull<CompiledTaskGraph>>,
}

// SAFETY: Tasks are `Send`, and the compiled graph is only reached through
// atomics and per-task exclusive invocation.
unsafe impl Send for TaskGraph {}

impl TaskGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Empty graph with room for `capacity` tasks.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, atomic::Ordering::Relaxed),
            tasks: Vec::with_capacity(capacity),
            successors: Vec::with_capacity(capacity),
            compiled: None,
        }
    }

    /// Process-unique identifier, also used by the executor's lifecycle log.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.compiled {
            // SAFETY: The builder reference keeps the compiled graph alive.
            Some(compiled) => unsafe { compiled.as_ref() }.len(),
            None => self.tasks.len(),
        }
    }

    /// Whether the graph has no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the graph has been compiled and is therefore frozen.
    #[must_use]
    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// Whether a submission of this graph has not drained yet.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        // SAFETY: The builder reference keeps the compiled graph alive.
        self.compiled
            .is_some_and(|compiled| !unsafe { compiled.as_ref() }.is_idle())
    }

    /// Add a task running `body` once per submission.
    ///
    /// # Panics
    /// If the graph has already been compiled.
    pub fn add_task<F>(&mut self, descriptor: TaskDescriptor, body: F) -> TaskHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.assert_editable();
        let index = u32::try_from(self.tasks.len())
            .expect("TaskGraph::add_task: task index space exhausted");
        self.tasks.push(Task::new(descriptor, Box::new(body)));
        self.successors.push(IndexSet::default());
        TaskHandle {
            graph_id: self.id,
            index,
        }
    }

    /// Add one task per body, all sharing `descriptor`.
    ///
    /// # Panics
    /// If the graph has already been compiled.
    pub fn add_tasks<F, I>(&mut self, descriptor: &TaskDescriptor, bodies: I) -> Vec<TaskHandle>
    where
        F: FnMut() + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        bodies
            .into_iter()
            .map(|body| self.add_task(descriptor.clone(), body))
            .collect()
    }

    /// Declare that `task` must complete before each of `successors` starts.
    ///
    /// # Panics
    /// If the graph has already been compiled, if a handle belongs to another
    /// graph, or if `task` is listed as its own successor.
    pub fn precedes(
        &mut self,
        task: TaskHandle,
        successors: impl IntoIterator<Item = TaskHandle>,
    ) -> &mut Self {
        self.assert_editable();
        let task = self.resolve(task);
        for successor in successors {
            let successor = self.resolve(successor);
            assert_ne!(
                task, successor,
                "Task {task} cannot precede itself in task graph {}",
                self.id
            );
            self.successors[task as usize].insert(successor);
        }
        self
    }

    /// Declare that `task` may only start once each of `predecessors` has
    /// completed. The mirror image of [`precedes`](Self::precedes).
    ///
    /// # Panics
    /// Same as [`precedes`](Self::precedes).
    pub fn follows(
        &mut self,
        task: TaskHandle,
        predecessors: impl IntoIterator<Item = TaskHandle>,
    ) -> &mut Self {
        for predecessor in predecessors {
            self.precedes(predecessor, [task]);
        }
        self
    }

    /// Validate and freeze the graph. Idempotent.
    ///
    /// Submitting compiles implicitly; calling this up front reports cycles
    /// early.
    ///
    /// # Errors
    /// If the precedence edges contain a cycle, or the graph is too large.
    pub fn compile(&mut self) -> Result<(), TaskGraphError> {
        if self.compiled.is_some() {
            return Ok(());
        }
        let layout = compile::compile(&self.tasks, &self.successors)?;
        let num_links = layout.successors.len();
        let compiled = CompiledTaskGraph::allocate(
            self.id,
            core::mem::take(&mut self.tasks),
            layout.successors,
            &layout.links,
        );
        self.successors = Vec::new();
        self.compiled = Some(compiled);
        log::trace!(
            "Compiled task graph {} with {} task(s) and {num_links} link(s)",
            self.id,
            self.len()
        );
        Ok(())
    }

    /// Compile if needed and submit the graph to `executor`.
    ///
    /// If `event` is given, it is signalled once every task of this
    /// submission has completed.
    ///
    /// # Errors
    /// If compilation fails.
    ///
    /// # Panics
    /// If the previous submission of this graph has not drained yet.
    pub fn submit(
        &mut self,
        executor: &TaskExecutor,
        event: Option<&TaskGraphEvent>,
    ) -> Result<(), TaskGraphError> {
        self.compile()?;
        let compiled = self.compiled.expect("TaskGraph::submit: [1]");
        // SAFETY: The builder reference keeps the graph alive for the whole
        // call, and `&mut self` rules out a concurrent submission.
        unsafe { executor.submit_compiled(compiled, event) };
        Ok(())
    }

    /// Submit and block until every task has completed.
    ///
    /// # Errors
    /// If compilation fails.
    ///
    /// # Panics
    /// If the previous submission has not drained yet, or if called from an
    /// enabled worker thread of `executor`.
    pub fn run(&mut self, executor: &TaskExecutor) -> Result<(), TaskGraphError> {
        let event = TaskGraphEvent::new();
        self.submit(executor, Some(&event))?;
        event.wait();
        Ok(())
    }

    /// Give up the builder. An in-flight graph keeps running and frees itself
    /// once its last task completes.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(compiled) = self.compiled.take() {
            // SAFETY: The builder reference is released exactly once, here.
            let freed = unsafe { CompiledTaskGraph::release_builder(compiled) };
            if !freed {
                log::trace!("Detached in-flight task graph {}", self.id);
            }
        }
    }

    fn assert_editable(&self) {
        assert!(
            self.compiled.is_none(),
            "Task graph {} is already compiled; tasks and edges can no longer be added",
            self.id
        );
    }

    fn resolve(&self, handle: TaskHandle) -> u32 {
        assert_eq!(
            handle.graph_id, self.id,
            "{handle:?} belongs to another task graph than {}",
            self.id
        );
        assert!(
            (handle.index as usize) < self.tasks.len(),
            "{handle:?} is out of range"
        );
        handle.index
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskGraph {
    fn drop(&mut self) {
        self.release();
    }
}
