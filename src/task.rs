use crate::{
    graph::compiled::CompiledTaskGraph,
    sync::*,
    types::{SyncUnsafeCell, TaskDescriptor},
};
use core::{ops::Range, ptr::NonNull};
use crossbeam_utils::CachePadded;
use derive_more::Debug;

/// Type-erased task body.
pub(crate) type TaskBody = Box<dyn FnMut() + Send>;

/// A single unit of work inside a compiled graph.
///
/// Created by the builder, linked once by the compile pass, then only read
/// except for `dependency_count`, which predecessors decrement concurrently.
#[derive(Debug)]
pub(crate) struct Task {
    descriptor: TaskDescriptor,
    #[debug(skip)]
    body: SyncUnsafeCell<TaskBody>,
    /// Number of successor edges.
    outbound_link_count: u32,
    /// Number of predecessor edges. Reset value of `dependency_count`.
    inbound_link_count: u32,
    /// Predecessors that have not completed yet in the current submission.
    dependency_count: CachePadded<AtomicU32>,
    /// Start of this task's successors in the owning graph's successor array.
    successor_offset: u32,
    #[debug(skip)]
    graph: Option<NonNull<CompiledTaskGraph>>,
}

// SAFETY: The body is `Send`, the counter is atomic and `graph` points at the
// compiled graph that owns this task, which outlives every access through it.
unsafe impl Send for Task {}
// SAFETY: Shared access only reads immutable fields or goes through atomics;
// the body is reached through `invoke`, whose contract grants exclusivity.
unsafe impl Sync for Task {}

impl Task {
    pub(crate) fn new(descriptor: TaskDescriptor, body: TaskBody) -> Self {
        Self {
            descriptor,
            body: SyncUnsafeCell::new(body),
            outbound_link_count: 0,
            inbound_link_count: 0,
            dependency_count: CachePadded::new(AtomicU32::new(0)),
            successor_offset: 0,
            graph: None,
        }
    }

    /// Record the task's place in its compiled graph. Called exactly once by
    /// the compile pass, before the graph is shared with any worker.
    pub(crate) fn link(
        &mut self,
        graph: NonNull<CompiledTaskGraph>,
        successor_offset: u32,
        outbound_link_count: u32,
        inbound_link_count: u32,
    ) {
        assert!(self.graph.is_none(), "Task::link: [1]");
        self.graph = Some(graph);
        self.successor_offset = successor_offset;
        self.outbound_link_count = outbound_link_count;
        self.inbound_link_count = inbound_link_count;
        self.dependency_count = CachePadded::new(AtomicU32::new(inbound_link_count));
    }

    pub(crate) fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    /// Queue lane of this task, `0` being the most urgent.
    pub(crate) fn priority_lane(&self) -> usize {
        self.descriptor.priority.lane()
    }

    /// Whether the task had no predecessors when its graph was compiled.
    pub(crate) fn is_root(&self) -> bool {
        self.inbound_link_count == 0
    }

    pub(crate) fn successor_range(&self) -> Range<usize> {
        let start = self.successor_offset as usize;
        start..start + self.outbound_link_count as usize
    }

    pub(crate) fn graph(&self) -> NonNull<CompiledTaskGraph> {
        self.graph.expect("Task::graph: task is not linked into a compiled graph")
    }

    /// Mark one predecessor as completed. Returns `true` for exactly one
    /// caller per submission: the one that resolved the last dependency.
    pub(crate) fn resolve_dependency(&self) -> bool {
        self.dependency_count.fetch_sub(1, Ordering::Relaxed) == 1
    }

    /// Re-arm the dependency counter for the next submission of a retained
    /// graph. Must only be called once the task itself has started, when no
    /// predecessor can touch the counter any more.
    pub(crate) fn reset_dependency_count(&self) {
        self.dependency_count
            .store(self.inbound_link_count, Ordering::Relaxed);
    }

    /// Run the body.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive logical access to this task: it was
    /// dequeued exactly once for the current submission and no other thread
    /// invokes it concurrently.
    pub(crate) unsafe fn invoke(&self) {
        // SAFETY: Exclusive access is guaranteed by the caller; the body is
        // never touched by anyone but the invoking worker while in flight.
        unsafe {
            self.body.get_mut().with(|ptr| {
                let body = &mut *ptr;
                body();
            });
        }
    }
}
