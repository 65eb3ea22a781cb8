// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The thread-safe timer surface the loop exposes. See [`TimerService`].

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use super::{TimerCallback, TimerEntry, TimerHeap, TimerRecord, clamp_nested_delay};
use crate::{MonotonicId, TimerId};

/// Timer bookkeeping shared between the loop thread and submitters.
///
/// # Ownership split
///
/// - The **heap** is mutated only on the owner thread in steady state
///   (schedules from other threads are routed to the owner thread by the loop
///   before they reach [`schedule`]); the mutex exists so the routing does not
///   have to be trusted for memory safety.
/// - The **registry** (id → record) is the cross-thread surface:
///   [`cancel`] flips the record's tombstone from any thread without touching
///   the heap.
/// - `pending` mirrors the number of live (scheduled, not yet
///   finished-or-cancelled) timers so the loop's block decision is lock-free.
///
/// [`cancel`]: Self::cancel
/// [`schedule`]: Self::schedule
#[derive(Debug, Default)]
pub struct TimerService {
    heap: Mutex<TimerHeap>,
    registry: Mutex<HashMap<u64, Arc<TimerRecord>>>,
    timer_ids: MonotonicId,
    insertion_ids: MonotonicId,
    pending: AtomicUsize,
}

impl TimerService {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Schedules a timer.
    ///
    /// `nesting_depth` is the scheduling context's depth (0 outside timer
    /// callbacks); the HTML5 clamp is applied here, so a deeply nested
    /// zero-delay timer lands at least [`MIN_CLAMPED_DELAY`] out.
    ///
    /// [`MIN_CLAMPED_DELAY`]: super::MIN_CLAMPED_DELAY
    pub fn schedule(
        &self,
        delay: Duration,
        repeat: Option<Duration>,
        nesting_depth: u32,
        callback: TimerCallback,
    ) -> TimerId {
        let (id, entry) = self.create(delay, repeat, nesting_depth, callback);
        self.enqueue(entry);
        id
    }

    /// Allocates the record (id, deadline, insertion id, registry entry)
    /// without touching the heap.
    ///
    /// This is the cross-thread half of scheduling: a non-owner thread calls
    /// `create` to get a synchronous [`TimerId`], then routes the returned
    /// entry to the owner thread, which calls [`enqueue`]. The deadline and
    /// the insertion id are fixed here, so ordering reflects the original
    /// schedule call, not the routing hop.
    ///
    /// [`enqueue`]: Self::enqueue
    pub fn create(
        &self,
        delay: Duration,
        repeat: Option<Duration>,
        nesting_depth: u32,
        callback: TimerCallback,
    ) -> (TimerId, TimerEntry) {
        let effective = clamp_nested_delay(delay, nesting_depth);
        let id = TimerId(self.timer_ids.next());
        let record = Arc::new(TimerRecord {
            id,
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
            repeat,
            nesting_depth: AtomicU32::new(nesting_depth),
        });

        self.lock_registry().insert(id.0, Arc::clone(&record));
        self.pending.fetch_add(1, Ordering::SeqCst);
        let entry = TimerEntry {
            deadline: Instant::now() + effective,
            insertion_id: self.insertion_ids.next(),
            record,
        };
        (id, entry)
    }

    /// Pushes a created entry into the heap. Entries cancelled between
    /// [`create`] and `enqueue` are dropped instead of pushed.
    ///
    /// [`create`]: Self::create
    pub fn enqueue(&self, entry: TimerEntry) {
        if entry.record.is_cancelled() {
            return;
        }
        self.lock_heap().push(entry);
    }

    /// Re-arms a repeating timer after a fire. The deadline is anchored at
    /// the fire time (not "now"), the nesting depth increments, and the clamp
    /// is re-applied — mirroring the HTML5 interval rules.
    ///
    /// No-op if the record was cancelled mid-callback.
    pub fn re_arm(&self, record: Arc<TimerRecord>, fired_at: Instant) {
        if record.is_cancelled() {
            return;
        }
        let Some(interval) = record.repeat else { return };
        let depth = record.nesting_depth.fetch_add(1, Ordering::SeqCst) + 1;
        let effective = clamp_nested_delay(interval, depth);
        self.lock_heap().push(TimerEntry {
            deadline: fired_at + effective,
            insertion_id: self.insertion_ids.next(),
            record,
        });
    }

    /// Cancels a pending timer. Returns `true` if the id was live.
    ///
    /// Callable from any thread: only the tombstone flag and the registry are
    /// touched; the heap discards the entry when it surfaces.
    pub fn cancel(&self, id: TimerId) -> bool {
        let record = self.lock_registry().remove(&id.0);
        match record {
            Some(record) => {
                record.cancel();
                self.pending.fetch_sub(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Retires a one-shot timer after it fired (or a repeating timer whose
    /// callback slot was poisoned). Safe to call when `cancel` raced and won.
    pub fn retire(&self, id: TimerId) {
        if self.lock_registry().remove(&id.0).is_some() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Pops every entry due at `now` into `out` (freshness snapshot — see
    /// [`TimerHeap::pop_expired_into`]).
    pub fn take_expired(&self, now: Instant, out: &mut Vec<TimerEntry>) {
        self.lock_heap().pop_expired_into(now, out);
    }

    /// The earliest live deadline, if any timer is scheduled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock_heap().peek_deadline()
    }

    /// Lock-free count of live timers.
    #[must_use]
    pub fn pending_count(&self) -> usize { self.pending.load(Ordering::SeqCst) }

    /// `true` when any timer is live.
    #[must_use]
    pub fn has_pending(&self) -> bool { self.pending_count() > 0 }

    /// Drops every scheduled timer. Used by the terminal drain.
    pub fn clear(&self) {
        self.lock_heap().clear();
        let drained = {
            let mut registry = self.lock_registry();
            let n = registry.len();
            registry.clear();
            n
        };
        self.pending.fetch_sub(drained, Ordering::SeqCst);
    }

    fn lock_heap(&self) -> MutexGuard<'_, TimerHeap> {
        match self.heap.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashMap<u64, Arc<TimerRecord>>> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_then_cancel_round_trip() {
        let service = TimerService::new();
        assert!(!service.has_pending());

        let id = service.schedule(Duration::from_secs(60), None, 0, Box::new(|| {}));
        assert_eq!(service.pending_count(), 1);
        assert!(service.next_deadline().is_some());

        assert!(service.cancel(id));
        assert_eq!(service.pending_count(), 0);
        // Second cancel of the same id reports "not live".
        assert!(!service.cancel(id));
        // The tombstone is pruned at peek.
        assert_eq!(service.next_deadline(), None);
    }

    #[test]
    fn expired_timers_surface_in_order() {
        let service = TimerService::new();
        let a = service.schedule(Duration::ZERO, None, 0, Box::new(|| {}));
        let b = service.schedule(Duration::ZERO, None, 0, Box::new(|| {}));

        let mut out = Vec::new();
        service.take_expired(Instant::now() + Duration::from_millis(1), &mut out);
        let ids: Vec<TimerId> = out.iter().map(|e| e.record.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn nested_depth_clamps_the_deadline() {
        let service = TimerService::new();
        let start = Instant::now();
        service.schedule(Duration::ZERO, None, 5, Box::new(|| {}));

        // Nothing is due before the 4 ms clamp elapses.
        let mut out = Vec::new();
        service.take_expired(start, &mut out);
        assert!(out.is_empty());
        let deadline = service.next_deadline().unwrap();
        assert!(deadline >= start + super::super::MIN_CLAMPED_DELAY);
    }

    #[test]
    fn re_arm_respects_cancellation() {
        let service = TimerService::new();
        let interval = Duration::from_millis(5);
        let id =
            service.schedule(Duration::ZERO, Some(interval), 0, Box::new(|| {}));

        let mut out = Vec::new();
        service.take_expired(Instant::now() + Duration::from_millis(1), &mut out);
        assert_eq!(out.len(), 1);
        let entry = out.pop().unwrap();

        // Cancel between fire and re-arm: re_arm must be a no-op.
        assert!(service.cancel(id));
        service.re_arm(entry.record, Instant::now());
        assert_eq!(service.next_deadline(), None);
        assert!(!service.has_pending());
    }

    #[test]
    fn re_arm_pushes_a_fresh_entry() {
        let service = TimerService::new();
        let interval = Duration::from_millis(5);
        service.schedule(Duration::ZERO, Some(interval), 0, Box::new(|| {}));

        let mut out = Vec::new();
        let fired_at = Instant::now() + Duration::from_millis(1);
        service.take_expired(fired_at, &mut out);
        let entry = out.pop().unwrap();
        service.re_arm(Arc::clone(&entry.record), fired_at);

        assert!(service.has_pending());
        let next = service.next_deadline().unwrap();
        assert!(next >= fired_at + interval);
        assert_eq!(entry.record.nesting_depth.load(Ordering::SeqCst), 1);
    }
}
