// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Chunked, mutex-guarded FIFO for the loop's task buffers. See
//! [`TaskQueue`].

use std::{
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use crate::LoopError;

/// A unit of work handed to the loop: a nullary closure plus provenance.
///
/// The enqueue timestamp exists for hooks and queue-latency tracing; it plays
/// no part in scheduling.
pub struct Task {
    /// The closure the loop will invoke on the owner thread.
    pub run: Box<dyn FnOnce() + Send + 'static>,
    /// When the task entered a queue.
    pub enqueued_at: Instant,
}

impl Task {
    /// Wraps a closure with a fresh enqueue timestamp.
    pub fn new(run: impl FnOnce() + Send + 'static) -> Self {
        Self { run: Box::new(run), enqueued_at: Instant::now() }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

/// Number of tasks per chunk. Pushes allocate once per `CHUNK_SIZE` tasks
/// instead of once per task.
pub const CHUNK_SIZE: usize = 32;

/// A lock-protected task FIFO. One instance backs each of the loop's three
/// task buffers: the cross-thread ingress, the next-tick buffer, and the
/// same-thread internal queue — the buffers differ only in which tick phase
/// drains them and in who is allowed to push.
///
/// # Storage
///
/// Chunked FIFO: a `current` chunk receives pushes; full chunks move to a
/// `sealed` list. [`drain_into`] moves the backing storage wholesale into the
/// caller's buffer, leaving the queue empty — the lock is held for the swap,
/// never while any task runs.
///
/// # Terminal close
///
/// [`close_and_drain_into`] flips a closed flag *under the same lock* as the
/// final drain. Every racing [`push`] therefore lands on exactly one side of
/// the fence: either its task is in the drained batch (and will be executed by
/// the terminal drain), or the push observes `closed` and returns
/// [`LoopError::LoopTerminated`] to the submitter. Accepted-but-lost is
/// impossible.
///
/// # Length mirror
///
/// [`len()`] / [`is_empty()`] read an [`AtomicUsize`] so the loop's block
/// decision never takes the lock.
///
/// [`close_and_drain_into`]: Self::close_and_drain_into
/// [`drain_into`]: Self::drain_into
/// [`is_empty()`]: Self::is_empty
/// [`len()`]: Self::len
/// [`push`]: Self::push
#[derive(Debug)]
pub struct TaskQueue {
    storage: Mutex<QueueStorage>,
    len: AtomicUsize,
}

#[derive(Debug, Default)]
struct QueueStorage {
    sealed: Vec<Vec<Task>>,
    current: Vec<Task>,
    closed: bool,
}

impl Default for TaskQueue {
    fn default() -> Self { Self::new() }
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            storage: Mutex::new(QueueStorage::default()),
            len: AtomicUsize::new(0),
        }
    }

    /// Appends a task.
    ///
    /// Returns the queue length after the push (the overload check input).
    ///
    /// # Errors
    ///
    /// [`LoopError::LoopTerminated`] once the terminal drain has closed the
    /// queue. The task is handed back inside the closure's captured state —
    /// it was never enqueued.
    pub fn push(&self, task: Task) -> Result<usize, LoopError> {
        let mut storage = match self.storage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if storage.closed {
            return Err(LoopError::LoopTerminated);
        }
        if storage.current.len() == CHUNK_SIZE {
            let full = std::mem::replace(
                &mut storage.current,
                Vec::with_capacity(CHUNK_SIZE),
            );
            storage.sealed.push(full);
        }
        storage.current.push(task);
        Ok(self.len.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Moves the entire backlog into `buffer` (FIFO order), leaving the queue
    /// empty. The caller executes the buffer with no lock held.
    pub fn drain_into(&self, buffer: &mut Vec<Task>) {
        let mut storage = match self.storage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::move_out(&mut storage, buffer);
        self.len.store(0, Ordering::SeqCst);
    }

    /// The terminal drain: closes the queue and moves the final backlog into
    /// `buffer` in one critical section. Idempotent; later calls drain
    /// nothing.
    pub fn close_and_drain_into(&self, buffer: &mut Vec<Task>) {
        let mut storage = match self.storage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        storage.closed = true;
        Self::move_out(&mut storage, buffer);
        self.len.store(0, Ordering::SeqCst);
    }

    fn move_out(storage: &mut QueueStorage, buffer: &mut Vec<Task>) {
        for mut chunk in storage.sealed.drain(..) {
            buffer.append(&mut chunk);
        }
        buffer.append(&mut storage.current);
    }

    /// Lock-free queue length.
    #[must_use]
    pub fn len(&self) -> usize { self.len.load(Ordering::SeqCst) }

    /// Lock-free emptiness check.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
