// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! A fixed-size FIFO ring with spill-to-growable storage, tuned for the
//! microtask pattern: the producer and the consumer are almost always the same
//! (owner) thread. See [`MicrotaskRing`].

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

/// A queued microtask: a nullary closure, no metadata.
pub type Microtask = Box<dyn FnOnce() + Send + 'static>;

/// Capacity of the fixed ring. Bursts beyond this spill to a growable
/// [`VecDeque`]; steady-state workloads never touch the spill path.
pub const RING_CAPACITY: usize = 256;

/// FIFO microtask queue with a lock-free length mirror.
///
/// # Storage
///
/// Two tiers behind one mutex:
///
/// 1. **Ring** — a fixed `RING_CAPACITY` circular buffer. The common case
///    (promise handler fan-out within a tick) lives entirely here, with no
///    allocation per push.
/// 2. **Spill** — a growable [`VecDeque`] used only while the ring is full.
///    Once anything has spilled, *all* pushes go to the spill until it drains,
///    so FIFO order is preserved across the tiers: every ring entry is older
///    than every spill entry.
///
/// The mutex is held only for pointer/size manipulation — never across a task
/// invocation. The consumer pops one task at a time (`pop`) and runs it with
/// the lock released.
///
/// # Lock-free reads
///
/// [`len()`] and [`is_empty()`] read an [`AtomicUsize`] mirror of the queue
/// length, so the loop's block decision (and any other thread's peek) never
/// takes the lock.
///
/// [`is_empty()`]: Self::is_empty
/// [`len()`]: Self::len
#[derive(Debug)]
pub struct MicrotaskRing {
    storage: Mutex<RingStorage>,
    len: AtomicUsize,
}

struct RingStorage {
    ring: Vec<Option<Microtask>>,
    head: usize,
    tail: usize,
    count: usize,
    spill: VecDeque<Microtask>,
}

impl std::fmt::Debug for RingStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingStorage")
            .field("count", &self.count)
            .field("spill_len", &self.spill.len())
            .finish_non_exhaustive()
    }
}

impl Default for MicrotaskRing {
    fn default() -> Self { Self::new() }
}

impl MicrotaskRing {
    #[must_use]
    pub fn new() -> Self {
        Self {
            storage: Mutex::new(RingStorage {
                ring: Vec::with_capacity(RING_CAPACITY),
                head: 0,
                tail: 0,
                count: 0,
                spill: VecDeque::new(),
            }),
            len: AtomicUsize::new(0),
        }
    }

    /// Appends a microtask at the back of the queue.
    pub fn push(&self, task: Microtask) {
        let mut storage = match self.storage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if storage.count == RING_CAPACITY || !storage.spill.is_empty() {
            storage.spill.push_back(task);
        } else {
            // Insert at head (the newest slot).
            if storage.ring.len() < RING_CAPACITY {
                storage.ring.push(Some(task));
            } else {
                let head = storage.head;
                storage.ring[head] = Some(task);
            }
            storage.head = (storage.head + 1) % RING_CAPACITY;
            storage.count += 1;
        }
        self.len.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes the oldest microtask, or `None` when the queue is empty.
    ///
    /// The caller invokes the returned closure with no queue lock held.
    pub fn pop(&self) -> Option<Microtask> {
        let mut storage = match self.storage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let task = if storage.count > 0 {
            let tail = storage.tail;
            let task = storage.ring[tail].take();
            storage.tail = (storage.tail + 1) % RING_CAPACITY;
            storage.count -= 1;
            task
        } else {
            storage.spill.pop_front()
        };
        if task.is_some() {
            self.len.fetch_sub(1, Ordering::SeqCst);
        }
        task
    }

    /// Lock-free queue length.
    #[must_use]
    pub fn len(&self) -> usize { self.len.load(Ordering::SeqCst) }

    /// Lock-free emptiness check.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
