use crate::{
    event::TaskGraphEvent,
    sync::*,
    task::Task,
    types::SyncUnsafeCell,
};
use core::ptr::NonNull;
use crossbeam_utils::CachePadded;
use derive_more::Debug;

/// Weight of the builder's reference in `remaining`. While the builder keeps
/// the graph, `remaining == BUILDER_REF` means "idle, ready to resubmit".
pub(crate) const BUILDER_REF: usize = 1 << (usize::BITS - 1);

/// Where a task sits in the flattened successor array.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct TaskLinks {
    pub(crate) successor_offset: u32,
    pub(crate) outbound: u32,
    pub(crate) inbound: u32,
}

/// Outcome of a worker giving up its reference on a graph.
#[derive(Debug)]
pub(crate) enum GraphRelease {
    /// Other tasks of the submission are still outstanding.
    Running,
    /// The submission has drained; the builder keeps the graph for reuse.
    Drained { event: Option<TaskGraphEvent> },
    /// The submission has drained and the graph was detached. The caller holds
    /// the last reference and frees the graph by dropping it.
    Detached {
        graph: Box<CompiledTaskGraph>,
        event: Option<TaskGraphEvent>,
    },
}

/// Immutable, submission-ready form of a [`TaskGraph`](super::TaskGraph).
///
/// Heap-allocated once and addressed through raw pointers by the builder, the
/// tasks' back-references and the worker queues. Lifetime is governed by
/// `remaining`:
/// - every outstanding task of the current submission holds one reference;
/// - the builder holds [`BUILDER_REF`] until it is detached or dropped.
///
/// Whoever brings `remaining` to zero frees the graph.
#[derive(Debug)]
pub(crate) struct CompiledTaskGraph {
    id: u64,
    tasks: Box<[Task]>,
    /// Successor task indices, `Task::successor_range` selects a task's slice.
    successors: Box<[u32]>,
    remaining: CachePadded<AtomicUsize>,
    /// Event of the current submission. Written only while the graph is idle.
    #[debug(skip)]
    wait_event: SyncUnsafeCell<Option<TaskGraphEvent>>,
}

impl CompiledTaskGraph {
    /// Allocate the graph and link every task to it. The returned graph is
    /// idle and owned by the builder.
    pub(crate) fn allocate(
        id: u64,
        tasks: Vec<Task>,
        successors: Box<[u32]>,
        links: &[TaskLinks],
    ) -> NonNull<Self> {
        assert_eq!(tasks.len(), links.len(), "CompiledTaskGraph::allocate: [1]");
        let graph = NonNull::from(Box::leak(Box::new(Self {
            id,
            tasks: tasks.into_boxed_slice(),
            successors,
            remaining: CachePadded::new(AtomicUsize::new(BUILDER_REF)),
            wait_event: SyncUnsafeCell::new(None),
        })));
        // SAFETY: The allocation is fresh and not yet shared with anyone.
        let this = unsafe { &mut *graph.as_ptr() };
        for (task, links) in this.tasks.iter_mut().zip(links) {
            task.link(graph, links.successor_offset, links.outbound, links.inbound);
            assert!(
                task.successor_range().end <= this.successors.len(),
                "CompiledTaskGraph::allocate: [2]"
            );
        }
        graph
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether no submission is in flight.
    pub(crate) fn is_idle(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == BUILDER_REF
    }

    /// Tasks without predecessors.
    pub(crate) fn roots(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|task| task.is_root())
    }

    pub(crate) fn successors<'a>(&'a self, task: &Task) -> impl Iterator<Item = &'a Task> {
        self.successors[task.successor_range()]
            .iter()
            .map(|&index| &self.tasks[index as usize])
    }

    /// Claim the idle graph for a new submission and remember its event.
    ///
    /// Returns `false` if the previous submission has not drained yet.
    pub(crate) fn begin_submission(&self, event: Option<TaskGraphEvent>) -> bool {
        let claimed = self
            .remaining
            .compare_exchange(
                BUILDER_REF,
                BUILDER_REF + self.tasks.len(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if claimed {
            // SAFETY: No task of this graph is queued yet, so no worker reads
            // the event concurrently; the previous submission's readers are
            // ordered before the successful claim above.
            unsafe { self.wait_event.get_mut().with(|ptr| *ptr = event) };
        }
        claimed
    }

    /// Give up the reference held by a completed task.
    ///
    /// When this was the submission's last task, the submission's event is
    /// returned; the caller must signal it once its own bookkeeping is done.
    /// A detached graph is handed back to the caller to be dropped after that
    /// bookkeeping as well.
    ///
    /// # Safety
    ///
    /// `graph` must be alive and the caller must own one outstanding task
    /// reference on it. Neither the graph nor any of its tasks may be accessed
    /// by the caller afterwards.
    pub(crate) unsafe fn release_task(graph: NonNull<Self>) -> GraphRelease {
        // SAFETY: The caller's task reference keeps the graph alive here.
        let this = unsafe { graph.as_ref() };

        let mut event = None;
        let mut current = this.remaining.load(Ordering::Acquire);
        loop {
            // Only the submission's last task needs the event. It must be read
            // before the decrement: once that lands, the builder may resubmit
            // and overwrite it. Other tasks cannot move the task count while
            // ours is the last reference, so at most the builder bit changes
            // between retries.
            if current & !BUILDER_REF == 1 && event.is_none() {
                // SAFETY: The event is only written while the graph is idle,
                // which cannot happen before our decrement.
                event = unsafe { this.wait_event.get().with(|ptr| (*ptr).clone()) };
            }
            match this.remaining.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        match current - 1 {
            BUILDER_REF => GraphRelease::Drained { event },
            0 => GraphRelease::Detached {
                // SAFETY: The count reached zero, so this thread holds the only
                // reference and the builder has let go.
                graph: unsafe { Box::from_raw(graph.as_ptr()) },
                event,
            },
            _ => GraphRelease::Running,
        }
    }

    /// Give up the builder's reference. Returns `true` if the graph was idle
    /// and has been freed, `false` if a submission is still in flight and the
    /// last task will free it.
    ///
    /// # Safety
    ///
    /// `graph` must be alive and the builder reference must not have been
    /// released before. The caller must not access the graph afterwards.
    pub(crate) unsafe fn release_builder(graph: NonNull<Self>) -> bool {
        // SAFETY: The builder reference keeps the graph alive here.
        let previous = unsafe { graph.as_ref() }
            .remaining
            .fetch_sub(BUILDER_REF, Ordering::AcqRel);
        assert!(previous >= BUILDER_REF, "CompiledTaskGraph::release_builder: [1]");
        if previous == BUILDER_REF {
            // SAFETY: No task references remain and the builder has let go.
            drop(unsafe { Box::from_raw(graph.as_ptr()) });
            true
        } else {
            false
        }
    }
}
