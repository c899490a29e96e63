//! Lock-free multi-priority task queue.
//!
//! One ring buffer per [`TaskPriority`](crate::types::TaskPriority) lane.
//! Every lane has three 16-bit cursors:
//!
//! ```text
//!   head ........ tail ........ reserve
//!    |  published  |  claimed,   |
//!    |  (ready)    |  being      |
//!    |             |  written    |
//! ```
//!
//! A producer claims a slot by advancing `reserve`, stores the task pointer,
//! then publishes it by advancing `tail` from its claimed index. Producers
//! therefore publish in reservation order, and consumers never observe a
//! slot that has been claimed but not yet written. Consumers advance `head`.
//!
//! The ring spans the whole `u16` space, so indices wrap for free and one slot
//! is kept empty to tell a full lane from an empty one.

use crate::{
    sync::{AtomicU16, Backoff, Ordering},
    task::Task,
    types::TaskPriority,
};
// Slots are published through `tail`, so they stay plain atomics even when
// the cursors are model-checked.
use core::{
    ptr::{self, NonNull},
    sync::atomic::AtomicPtr,
};
use crossbeam_utils::CachePadded;
use derive_more::Debug;

/// Number of slots in a lane ring.
const LANE_SLOTS: usize = 1 << u16::BITS;

/// Maximum number of tasks a single lane can hold.
const LANE_CAPACITY: usize = LANE_SLOTS - 1;

/// Pointer to a task of a live compiled graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct TaskPtr(NonNull<Task>);

// SAFETY: `Task` is `Sync`; the pointee is kept alive by the reference count
// of the compiled graph that owns it until the task has been processed.
unsafe impl Send for TaskPtr {}

impl TaskPtr {
    pub(crate) fn new(task: &Task) -> Self {
        Self(NonNull::from(task))
    }

    /// # Safety
    ///
    /// The owning compiled graph must still be alive, i.e. the task has not
    /// released its reference on the graph yet.
    pub(crate) unsafe fn as_ref<'a>(self) -> &'a Task {
        // SAFETY: Guaranteed by the caller.
        unsafe { self.0.as_ref() }
    }
}

#[derive(Debug)]
struct Lane {
    head: CachePadded<AtomicU16>,
    tail: CachePadded<AtomicU16>,
    reserve: CachePadded<AtomicU16>,
    #[debug(skip)]
    slots: Box<[AtomicPtr<Task>]>,
}

impl Lane {
    fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicU16::new(0)),
            tail: CachePadded::new(AtomicU16::new(0)),
            reserve: CachePadded::new(AtomicU16::new(0)),
            slots: (0..LANE_SLOTS)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
        }
    }

    fn enqueue(&self, task: TaskPtr) {
        let backoff = Backoff::new();
        loop {
            let reserve = self.reserve.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);
            if usize::from(reserve.wrapping_sub(head)) == LANE_CAPACITY {
                // Full: wait for a consumer to make room.
                backoff.snooze();
                continue;
            }
            let next = reserve.wrapping_add(1);
            if self
                .reserve
                .compare_exchange_weak(reserve, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
            {
                backoff.spin();
                continue;
            }

            self.slots[usize::from(reserve)].store(task.0.as_ptr(), Ordering::Relaxed);

            // Earlier reservations must be published first.
            let publish = Backoff::new();
            while self
                .tail
                .compare_exchange_weak(reserve, next, Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                publish.spin();
            }
            return;
        }
    }

    fn try_dequeue(&self) -> Option<TaskPtr> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            // Read before claiming: once `head` moves past the slot a producer
            // may reuse it.
            let task = self.slots[usize::from(head)].load(Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let task = NonNull::new(task).expect("Lane::try_dequeue: [1]");
                return Some(TaskPtr(task));
            }
            backoff.spin();
        }
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        usize::from(tail.wrapping_sub(head))
    }
}

/// Bounded multi-producer multi-consumer queue with one lane per priority.
///
/// Dequeue order is strict across lanes (a higher lane is always drained
/// first) and FIFO within a lane.
#[derive(Debug)]
pub(crate) struct TaskQueue {
    lanes: [Lane; TaskPriority::COUNT],
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            lanes: core::array::from_fn(|_| Lane::new()),
        }
    }

    /// Push a task onto the lane of its priority.
    ///
    /// Never fails: if the lane is full the caller spins with exponential
    /// backoff until a consumer makes room.
    ///
    /// # Safety
    ///
    /// `task` must stay alive until it has been dequeued and processed.
    pub(crate) unsafe fn enqueue(&self, task: TaskPtr) {
        // SAFETY: The task is alive per the caller's contract.
        let lane = unsafe { task.as_ref() }.priority_lane();
        self.lanes[lane].enqueue(task);
    }

    /// Pop the oldest task of the most urgent non-empty lane.
    pub(crate) fn try_dequeue(&self) -> Option<TaskPtr> {
        self.lanes.iter().find_map(Lane::try_dequeue)
    }

    /// Number of published tasks. Only a snapshot under concurrent use.
    pub(crate) fn len(&self) -> usize {
        self.lanes.iter().map(Lane::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::types::TaskDescriptor;
    use std::{
        collections::HashSet,
        sync::{Arc, atomic::AtomicBool},
        thread,
        time::Duration,
    };

    fn task(name: &'static str, priority: TaskPriority) -> Task {
        Task::new(
            TaskDescriptor::new(name).with_priority(priority),
            Box::new(|| {}),
        )
    }

    fn name_of(task: TaskPtr) -> String {
        unsafe { task.as_ref() }.descriptor().name.to_string()
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let queue = TaskQueue::new();
        assert!(queue.is_empty());
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn fifo_within_lane() {
        let queue = TaskQueue::new();
        let tasks = [
            task("a", TaskPriority::Medium),
            task("b", TaskPriority::Medium),
            task("c", TaskPriority::Medium),
        ];
        for t in &tasks {
            unsafe { queue.enqueue(TaskPtr::new(t)) };
        }
        assert_eq!(queue.len(), 3);
        let order: Vec<_> = std::iter::from_fn(|| queue.try_dequeue())
            .map(name_of)
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn higher_lanes_drain_first() {
        let queue = TaskQueue::new();
        let tasks = [
            task("low", TaskPriority::Low),
            task("medium", TaskPriority::Medium),
            task("critical", TaskPriority::Critical),
            task("high", TaskPriority::High),
            task("critical-2", TaskPriority::Critical),
        ];
        for t in &tasks {
            unsafe { queue.enqueue(TaskPtr::new(t)) };
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.try_dequeue())
            .map(name_of)
            .collect();
        assert_eq!(order, ["critical", "critical-2", "high", "medium", "low"]);
    }

    #[test]
    fn cursors_wrap_around_the_ring() {
        let queue = TaskQueue::new();
        let tasks: Vec<_> = (0..4).map(|_| task("t", TaskPriority::High)).collect();
        // Push the cursors through the 16-bit space more than once, keeping a
        // few tasks queued across the wrap point.
        for round in 0..(LANE_SLOTS + LANE_SLOTS / 2) {
            let t = &tasks[round % tasks.len()];
            unsafe { queue.enqueue(TaskPtr::new(t)) };
            if queue.len() == 3 {
                let popped = queue.try_dequeue().unwrap();
                assert_eq!(popped, TaskPtr::new(&tasks[(round + 2) % tasks.len()]));
            }
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn lane_holds_its_full_capacity() {
        let queue = TaskQueue::new();
        let t = task("t", TaskPriority::Low);
        for _ in 0..LANE_CAPACITY {
            unsafe { queue.enqueue(TaskPtr::new(&t)) };
        }
        assert_eq!(queue.len(), LANE_CAPACITY);
        let mut drained = 0;
        while queue.try_dequeue().is_some() {
            drained += 1;
        }
        assert_eq!(drained, LANE_CAPACITY);
    }

    #[test]
    fn full_lane_blocks_producer_until_a_slot_frees() {
        let queue = TaskQueue::new();
        let [first, filler, last] =
            ["first", "filler", "last"].map(|name| task(name, TaskPriority::Low));
        unsafe { queue.enqueue(TaskPtr::new(&first)) };
        for _ in 1..LANE_CAPACITY {
            unsafe { queue.enqueue(TaskPtr::new(&filler)) };
        }
        assert_eq!(queue.len(), LANE_CAPACITY);

        let enqueued = AtomicBool::new(false);
        let (blocked, len_while_blocked, popped) = thread::scope(|scope| {
            let producer = scope.spawn(|| {
                unsafe { queue.enqueue(TaskPtr::new(&last)) };
                enqueued.store(true, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(100));
            let blocked = !enqueued.load(Ordering::SeqCst);
            let len_while_blocked = queue.len();
            // Free one slot so that the producer can finish.
            let popped = queue.try_dequeue().map(name_of);
            producer.join().unwrap();
            (blocked, len_while_blocked, popped)
        });

        assert!(blocked, "enqueue on a full lane returned early");
        assert_eq!(len_while_blocked, LANE_CAPACITY);
        assert_eq!(popped.as_deref(), Some("first"));
        assert!(enqueued.load(Ordering::SeqCst));
        assert_eq!(queue.len(), LANE_CAPACITY);

        let order: Vec<_> = std::iter::from_fn(|| queue.try_dequeue())
            .map(name_of)
            .collect();
        assert_eq!(order.len(), LANE_CAPACITY);
        assert!(order[..LANE_CAPACITY - 1].iter().all(|name| name == "filler"));
        assert_eq!(order[LANE_CAPACITY - 1], "last");
    }

    #[test]
    fn concurrent_producers_and_consumers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 5_000;

        let tasks: Arc<Vec<Task>> = Arc::new(
            (0..PRODUCERS * PER_PRODUCER)
                .map(|i| task("t", TaskPriority::ALL[i % TaskPriority::COUNT]))
                .collect(),
        );
        let queue = Arc::new(TaskQueue::new());

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let (queue, tasks) = (queue.clone(), tasks.clone());
                thread::spawn(move || {
                    for t in &tasks[p * PER_PRODUCER..(p + 1) * PER_PRODUCER] {
                        unsafe { queue.enqueue(TaskPtr::new(t)) };
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while seen.len() < PRODUCERS * PER_PRODUCER / 4 {
                        match queue.try_dequeue() {
                            Some(t) => seen.push(t.0.as_ptr() as usize),
                            None => thread::yield_now(),
                        }
                    }
                    seen
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        let mut seen = HashSet::new();
        for consumer in consumers {
            for addr in consumer.join().unwrap() {
                assert!(seen.insert(addr), "task dequeued twice");
            }
        }
        while let Some(t) = queue.try_dequeue() {
            assert!(seen.insert(t.0.as_ptr() as usize), "task dequeued twice");
        }
        assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
    }
}
