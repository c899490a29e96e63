use crate::sync::Mutex;
use std::collections::VecDeque;

/// Lifecycle step of a submitted task graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum GraphTransition {
    /// The graph's root tasks have been queued.
    Submitted,
    /// The last task completed; the builder keeps the graph for resubmission.
    Drained,
    /// The last task completed and the detached graph has been freed.
    Destroyed,
}

/// One entry of the executor's graph lifecycle log.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GraphLifecycleRecord {
    /// [`TaskGraph::id`](crate::graph::TaskGraph::id) of the graph.
    pub graph_id: u64,
    /// Number of tasks in the graph.
    pub task_count: usize,
    /// What happened.
    pub transition: GraphTransition,
    /// Index of the worker that completed the graph, `None` for submissions.
    pub worker: Option<usize>,
}

/// Bounded log of graph lifecycle records. Once full, the oldest record is
/// overwritten.
#[derive(Debug)]
pub(crate) struct GraphEventLog {
    capacity: usize,
    records: Mutex<VecDeque<GraphLifecycleRecord>>,
}

impl GraphEventLog {
    /// `None` when `capacity` is zero, i.e. logging is disabled.
    pub(crate) fn new(capacity: usize) -> Option<Self> {
        (capacity != 0).then(|| Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        })
    }

    pub(crate) fn push(&self, record: GraphLifecycleRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Records from oldest to newest.
    pub(crate) fn snapshot(&self) -> Vec<GraphLifecycleRecord> {
        self.records.lock().iter().copied().collect()
    }
}
