#![allow(missing_docs)]
#![cfg(feature = "loom")]

use ctg::{
    config::ExecutorConfig,
    event::TaskGraphEvent,
    executor::TaskExecutor,
    graph::TaskGraph,
    types::TaskDescriptor,
};
use loom::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

fn model(f: impl Fn() + Sync + Send + 'static) {
    let mut builder = loom::model::Builder::new();
    builder.preemption_bound = Some(3);
    builder.check(f);
}

fn executor() -> TaskExecutor {
    TaskExecutor::new(ExecutorConfig::default().with_num_workers(1)).unwrap()
}

#[test]
fn loom_chain_publishes_predecessor_effects() {
    model(|| {
        // a -> b. `b` reads what `a` wrote with Relaxed loads only; the
        // executor's fences must make it visible.
        let x = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let executor = executor();

        let mut graph = TaskGraph::new();
        let a = graph.add_task(TaskDescriptor::new("a"), {
            let x = x.clone();
            move || x.store(3, Ordering::Relaxed)
        });
        let b = graph.add_task(TaskDescriptor::new("b"), {
            let (x, seen) = (x.clone(), seen.clone());
            move || seen.store(x.load(Ordering::Relaxed) * 4, Ordering::Relaxed)
        });
        graph.precedes(a, [b]);

        let event = TaskGraphEvent::new();
        graph.submit(&executor, Some(&event)).unwrap();
        event.wait();

        assert_eq!(seen.load(Ordering::Relaxed), 12);
        drop(graph);
        drop(executor);
    });
}

#[test]
fn loom_diamond_runs_every_task_once() {
    model(|| {
        //     a
        //    / \
        //   b   c
        //    \ /
        //     d
        let counts: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
        let executor = executor();

        let mut graph = TaskGraph::new();
        let tasks: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .enumerate()
            .map(|(idx, name)| {
                let counts = counts.clone();
                graph.add_task(TaskDescriptor::new(name), move || {
                    counts[idx].fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        graph.precedes(tasks[0], [tasks[1], tasks[2]]);
        graph.follows(tasks[3], [tasks[1], tasks[2]]);

        graph.run(&executor).unwrap();

        for count in counts.iter() {
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }
        drop(graph);
        drop(executor);
    });
}

#[test]
fn loom_detached_graph_is_freed_before_signal() {
    model(|| {
        let token = Arc::new(());
        let executor = executor();

        let mut graph = TaskGraph::new();
        graph.add_task(TaskDescriptor::new("hold"), {
            let token = token.clone();
            move || {
                let _token = &token;
            }
        });
        let event = TaskGraphEvent::new();
        graph.submit(&executor, Some(&event)).unwrap();
        graph.detach();
        event.wait();

        // The closure, and with it its clone of `token`, is gone.
        assert_eq!(Arc::strong_count(&token), 1);
        drop(executor);
    });
}
