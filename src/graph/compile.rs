use crate::{graph::compiled::TaskLinks, task::Task, types::IndexSet};
use std::collections::VecDeque;
use thiserror::Error;

/// Error kind for task graph compilation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TaskGraphError {
    /// The precedence edges contain cycle(s), so some tasks could never
    /// become ready.
    #[error(
        "task graph contains cycle(s): {unresolved} task(s) can never become ready, \
         including `{task}`"
    )]
    Cycle {
        /// Name of one task that lies on or behind a cycle.
        task: String,
        /// Number of tasks that lie on or behind a cycle.
        unresolved: usize,
    },
    /// The graph has more tasks than task indices can address.
    #[error("task graph has {count} tasks, at most {max} are supported", max = u32::MAX)]
    TooManyTasks {
        /// Number of tasks in the graph.
        count: usize,
    },
    /// The graph has more precedence links than successor offsets can address.
    #[error("task graph has {count} precedence links, at most {max} are supported", max = u32::MAX)]
    TooManyLinks {
        /// Number of links in the graph.
        count: usize,
    },
}

/// Flattened adjacency of a validated graph.
#[derive(Debug)]
pub(super) struct GraphLayout {
    pub(super) successors: Box<[u32]>,
    pub(super) links: Vec<TaskLinks>,
}

/// Validate the builder's graph and flatten its edges.
///
/// - Counts inbound links per task.
/// - Runs Kahn's algorithm to prove the graph acyclic. The resulting order is
///   discarded: execution order is decided at runtime by the dependency
///   counters.
/// - Lays out all successor lists back to back, in task order.
pub(super) fn compile(
    tasks: &[Task],
    successors: &[IndexSet<u32>],
) -> Result<GraphLayout, TaskGraphError> {
    assert_eq!(tasks.len(), successors.len(), "TaskGraph::compile: [1]");
    let num_tasks = tasks.len();
    if u32::try_from(num_tasks).is_err() {
        return Err(TaskGraphError::TooManyTasks { count: num_tasks });
    }
    let num_links: usize = successors.iter().map(IndexSet::len).sum();
    if u32::try_from(num_links).is_err() {
        return Err(TaskGraphError::TooManyLinks { count: num_links });
    }

    // Phase 1: inbound link counts.
    let mut inbound = vec![0u32; num_tasks];
    for children in successors {
        for &child in children {
            inbound[child as usize] += 1;
        }
    }
    assert_eq!(
        inbound.iter().map(|&n| n as usize).sum::<usize>(),
        num_links,
        "TaskGraph::compile: [2]"
    );

    // Phase 2: Kahn's algorithm. Every task whose predecessors have all been
    // resolved is resolved in turn; whatever is left over sits on or behind a
    // cycle.
    let mut pending = inbound.clone();
    let mut ready: VecDeque<usize> = (0..num_tasks).filter(|&idx| pending[idx] == 0).collect();
    let mut resolved = 0usize;
    while let Some(idx) = ready.pop_front() {
        resolved += 1;
        for &child in &successors[idx] {
            let child = child as usize;
            pending[child] = pending[child]
                .checked_sub(1)
                .expect("TaskGraph::compile: [3]");
            if pending[child] == 0 {
                ready.push_back(child);
            }
        }
    }
    if resolved != num_tasks {
        let blocked = pending
            .iter()
            .position(|&n| n != 0)
            .expect("TaskGraph::compile: [4]");
        return Err(TaskGraphError::Cycle {
            task: tasks[blocked].descriptor().name.to_string(),
            unresolved: num_tasks - resolved,
        });
    }

    // Phase 3: flatten successor lists.
    let mut flat = Vec::with_capacity(num_links);
    let links = successors
        .iter()
        .zip(&inbound)
        .map(|(children, &inbound)| {
            let successor_offset = flat.len().try_into().expect("TaskGraph::compile: [5]");
            flat.extend(children.iter().copied());
            TaskLinks {
                successor_offset,
                outbound: children.len().try_into().expect("TaskGraph::compile: [6]"),
                inbound,
            }
        })
        .collect();
    assert_eq!(flat.len(), num_links, "TaskGraph::compile: [7]");

    Ok(GraphLayout {
        successors: flat.into_boxed_slice(),
        links,
    })
}
