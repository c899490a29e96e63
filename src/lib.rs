//! Task graph execution core: a fixed pool of worker threads running DAGs of
//! short-lived tasks with low scheduling overhead.
//!
//! A [`TaskGraph`](graph::TaskGraph) is built from closures and precedence
//! edges, compiled once into a flat, immutable form, and submitted to a
//! [`TaskExecutor`](executor::TaskExecutor). Root tasks are spread over the
//! workers round-robin; every completed task decrements the dependency
//! counters of its successors, and the one that brings a counter to zero
//! queues that successor. A [`TaskGraphEvent`](event::TaskGraphEvent) reports
//! when every task of a submission has completed.
//!
//! - Per-worker queues are lock-free, bounded and split into one FIFO lane per
//!   [`TaskPriority`](types::TaskPriority).
//! - Happens-before between a task and its successors is established with a
//!   Release fence before the counter decrements and an Acquire fence in the
//!   thread that resolves the last dependency.
//! - A retained graph can be resubmitted once drained, without being rebuilt;
//!   a detached graph frees itself after its last task.
//! - Cycles are rejected at compile time.
//!
//! The `loom` feature swaps every synchronization primitive for its `loom`
//! model-checked counterpart.

/// Executor configuration.
pub mod config;
/// Completion notification shared between submitters and workers.
pub mod event;
/// The worker pool.
///
/// Also holds the process-wide default executor and the optional graph
/// lifecycle log.
pub mod executor;
/// Task graph builder, compilation and the compiled, reference-counted form.
pub mod graph;
mod queue;
mod sync;
mod task;
/// Task descriptors, priorities and handles.
pub mod types;
mod worker;
