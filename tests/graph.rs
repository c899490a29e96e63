#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use ctg::{
    event::TaskGraphEvent,
    executor::TaskExecutor,
    graph::{TaskGraph, TaskGraphError},
    types::{TaskDescriptor, TaskPriority},
};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn noop() -> impl FnMut() + Send + 'static {
    || {}
}

/// Counts clones and drops of a value captured by a task body.
#[derive(Debug)]
struct Tracked {
    clones: Arc<AtomicUsize>,
    drops: Arc<AtomicUsize>,
}

impl Clone for Tracked {
    fn clone(&self) -> Self {
        self.clones.fetch_add(1, Ordering::SeqCst);
        Self {
            clones: self.clones.clone(),
            drops: self.drops.clone(),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn new_graph_is_empty_and_editable() {
    let graph = TaskGraph::new();
    assert!(graph.is_empty());
    assert_eq!(graph.len(), 0);
    assert!(!graph.is_compiled());
    assert!(!graph.is_in_flight());
}

#[test]
fn graph_ids_are_unique() {
    let a = TaskGraph::new();
    let b = TaskGraph::default();
    assert_ne!(a.id(), b.id());
}

#[test]
fn handles_are_numbered_in_insertion_order() {
    let mut graph = TaskGraph::with_capacity(3);
    let a = graph.add_task(TaskDescriptor::new("a"), noop());
    let rest = graph.add_tasks(&TaskDescriptor::new("rest"), [noop(), noop()]);
    assert_eq!(a.index(), 0);
    assert_eq!(rest.iter().map(|h| h.index()).collect::<Vec<_>>(), [1, 2]);
    assert_eq!(graph.len(), 3);
}

#[test]
fn compile_is_idempotent() {
    let mut graph = TaskGraph::new();
    let a = graph.add_task(TaskDescriptor::new("a"), noop());
    let b = graph.add_task(TaskDescriptor::new("b"), noop());
    graph.precedes(a, [b]);
    graph.compile().unwrap();
    graph.compile().unwrap();
    assert!(graph.is_compiled());
    assert!(!graph.is_in_flight());
    assert_eq!(graph.len(), 2);
}

#[test]
fn two_task_cycle_fails_to_compile() {
    let mut graph = TaskGraph::new();
    let a = graph.add_task(TaskDescriptor::new("a"), noop());
    let b = graph.add_task(TaskDescriptor::new("b"), noop());
    graph.precedes(a, [b]).precedes(b, [a]);

    let err = graph.compile().unwrap_err();
    assert!(matches!(err, TaskGraphError::Cycle { unresolved: 2, .. }));
    assert!(!graph.is_compiled());
}

#[test]
fn cycle_is_reported_on_submit() {
    init_logger();
    let executor = TaskExecutor::with_workers(2).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let mut graph = TaskGraph::new();
    let handles = graph.add_tasks(
        &TaskDescriptor::new("loop"),
        (0..3).map(|_| {
            let ran = ran.clone();
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        }),
    );
    graph
        .precedes(handles[0], [handles[1]])
        .precedes(handles[1], [handles[2]])
        .precedes(handles[2], [handles[0]]);

    let event = TaskGraphEvent::new();
    let err = graph.submit(&executor, Some(&event)).unwrap_err();
    assert_eq!(
        err,
        TaskGraphError::Cycle {
            task: "loop".into(),
            unresolved: 3,
        }
    );
    // Nothing was submitted.
    assert!(event.is_signalled());
    assert_eq!(executor.graphs_in_flight(), 0);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
#[should_panic(expected = "already compiled")]
fn adding_tasks_after_compile_panics() {
    let mut graph = TaskGraph::new();
    graph.add_task(TaskDescriptor::new("a"), noop());
    graph.compile().unwrap();
    graph.add_task(TaskDescriptor::new("b"), noop());
}

#[test]
#[should_panic(expected = "belongs to another task graph")]
fn foreign_handles_are_rejected() {
    let mut first = TaskGraph::new();
    let mut second = TaskGraph::new();
    let a = first.add_task(TaskDescriptor::new("a"), noop());
    let b = second.add_task(TaskDescriptor::new("b"), noop());
    first.precedes(a, [b]);
}

#[test]
#[should_panic(expected = "cannot precede itself")]
fn self_edges_are_rejected() {
    let mut graph = TaskGraph::new();
    let a = graph.add_task(TaskDescriptor::new("a"), noop());
    graph.precedes(a, [a]);
}

#[test]
fn follows_mirrors_precedes() {
    init_logger();
    let executor = TaskExecutor::with_workers(4).unwrap();
    let x = Arc::new(Mutex::new(0));

    let mut graph = TaskGraph::new();
    let mul = graph.add_task(TaskDescriptor::new("mul"), {
        let x = x.clone();
        move || *x.lock().unwrap() *= 4
    });
    let add = graph.add_task(TaskDescriptor::new("add"), {
        let x = x.clone();
        move || *x.lock().unwrap() += 3
    });
    graph.follows(mul, [add]);
    graph.run(&executor).unwrap();

    assert_eq!(*x.lock().unwrap(), 12);
}

#[test]
fn duplicate_edges_collapse() {
    init_logger();
    let executor = TaskExecutor::with_workers(2).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut graph = TaskGraph::new();
    let [a, b] = ["a", "b"].map(|name| {
        let order = order.clone();
        graph.add_task(TaskDescriptor::new(name), move || {
            order.lock().unwrap().push(name);
        })
    });
    graph.precedes(a, [b, b]).follows(b, [a]);
    graph.run(&executor).unwrap();
    graph.run(&executor).unwrap();

    assert_eq!(*order.lock().unwrap(), ["a", "b", "a", "b"]);
}

#[test]
fn descriptor_builders() {
    let descriptor = TaskDescriptor::new("io")
        .with_category("storage")
        .with_priority(TaskPriority::High);
    assert_eq!(descriptor.name, "io");
    assert_eq!(descriptor.category, "storage");
    assert_eq!(descriptor.priority, TaskPriority::High);
    assert_eq!(TaskDescriptor::default().priority, TaskPriority::Medium);
    assert_eq!(
        TaskPriority::ALL.map(TaskPriority::lane),
        [0, 1, 2, 3]
    );
}

#[test]
fn captured_state_is_never_cloned_and_dropped_once() {
    init_logger();
    let executor = TaskExecutor::with_workers(2).unwrap();
    let clones = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));

    let tracked = Tracked {
        clones: clones.clone(),
        drops: drops.clone(),
    };
    let mut graph = TaskGraph::new();
    graph.add_task(TaskDescriptor::new("tracked"), {
        let calls = calls.clone();
        move || {
            let _tracked = &tracked;
            calls.fetch_add(1, Ordering::SeqCst);
        }
    });

    // Moving the builder around moves the box, never the captured state.
    let graph = Box::new(graph);
    let mut graphs = vec![*graph];
    let mut graph = graphs.pop().unwrap();

    graph.run(&executor).unwrap();
    graph.run(&executor).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(clones.load(Ordering::SeqCst), 0);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    drop(graph);
    assert_eq!(clones.load(Ordering::SeqCst), 0);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn uncompiled_graph_drops_captured_state() {
    let drops = Arc::new(AtomicUsize::new(0));
    let tracked = Tracked {
        clones: Arc::new(AtomicUsize::new(0)),
        drops: drops.clone(),
    };
    let mut graph = TaskGraph::new();
    graph.add_task(TaskDescriptor::new("never run"), move || {
        let _tracked = &tracked;
    });
    drop(graph);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn detached_graph_drops_captured_state_before_signalling() {
    init_logger();
    let executor = TaskExecutor::with_workers(2).unwrap();
    let drops = Arc::new(AtomicUsize::new(0));
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

    let tracked = Tracked {
        clones: Arc::new(AtomicUsize::new(0)),
        drops: drops.clone(),
    };
    let mut graph = TaskGraph::new();
    graph.add_task(TaskDescriptor::new("gated"), move || {
        let _tracked = &tracked;
        release_rx.recv().unwrap();
    });

    let event = TaskGraphEvent::new();
    graph.submit(&executor, Some(&event)).unwrap();
    assert!(graph.is_in_flight());
    graph.detach();
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    release_tx.send(()).unwrap();
    event.wait();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}
