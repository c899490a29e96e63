use crate::sync::UnsafeCell;
use derive_more::{Deref, DerefMut};
use indexmap::IndexSet as _IndexSet;
use rustc_hash::FxBuildHasher;
use std::borrow::Cow;

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Send`.
///
/// Used for task bodies and the per-submission wait event of a compiled graph.
/// Correctness is ensured by scheduling: a task body is invoked by exactly one
/// worker per submission, and the wait event is written only while the graph
/// is idle.
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }
}

pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;

/// Scheduling priority of a task.
///
/// Each priority level maps to its own lane in a worker's task queue. Higher
/// lanes are always drained first.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Drained before everything else.
    Critical,
    /// Drained before medium and low priority tasks.
    High,
    /// The default priority.
    #[default]
    Medium,
    /// Drained last.
    Low,
}

impl TaskPriority {
    /// Number of distinct priority levels.
    pub const COUNT: usize = 4;

    /// All priorities, highest first.
    pub const ALL: [Self; Self::COUNT] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    /// Dense zero-based index of the queue lane serving this priority, `0`
    /// being the highest.
    #[must_use]
    pub const fn lane(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

/// Identity and debug information attached to a task. Immutable once the task
/// has been added to a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    /// Human-readable task name, used in logs and diagnostics.
    pub name: Cow<'static, str>,
    /// Free-form category, e.g. the subsystem the task belongs to.
    pub category: Cow<'static, str>,
    /// Queue lane selector.
    pub priority: TaskPriority,
}

impl TaskDescriptor {
    /// Descriptor with the given name, an empty category and
    /// [`TaskPriority::Medium`].
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            category: Cow::Borrowed(""),
            priority: TaskPriority::default(),
        }
    }

    /// Replace the category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<Cow<'static, str>>) -> Self {
        self.category = category.into();
        self
    }

    /// Replace the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

impl Default for TaskDescriptor {
    fn default() -> Self {
        Self::new("unnamed")
    }
}

/// Opaque handle to a task inside a [`TaskGraph`](crate::graph::TaskGraph),
/// used to declare precedence edges.
///
/// A handle is only valid for the graph that returned it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub(crate) graph_id: u64,
    pub(crate) index: u32,
}

impl TaskHandle {
    /// Position of the task in its graph, in insertion order.
    #[must_use]
    pub fn index(self) -> usize {
        self.index as usize
    }
}
