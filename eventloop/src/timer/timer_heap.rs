// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The deadline-ordered min-heap. See [`TimerHeap`].

use std::{cmp::Ordering as CmpOrdering, collections::BinaryHeap, sync::Arc, time::Instant};

use super::TimerRecord;

/// One scheduled firing: a deadline, the stable tie-break, and the shared
/// record.
///
/// A repeating timer contributes a fresh entry (with a fresh insertion id)
/// per re-arm; the record is shared across all of them.
#[derive(Debug)]
pub struct TimerEntry {
    /// When this entry becomes due.
    pub deadline: Instant,
    /// Stable tie-break: entries with equal deadlines fire in insertion
    /// order.
    pub insertion_id: u64,
    /// The shared cancellable record.
    pub record: Arc<TimerRecord>,
}

// Ordering is (deadline, insertion_id); the heap wraps entries in `Reverse`
// to get min-heap behavior out of `BinaryHeap`.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.insertion_id == other.insertion_id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.insertion_id.cmp(&other.insertion_id))
    }
}

/// Binary min-heap keyed by `(deadline, insertion_id)`.
///
/// Cancellation is O(1) amortized: cancelled records stay in the heap as
/// tombstones and are discarded when they surface at [`peek_deadline`] or
/// [`pop_expired_into`].
///
/// Not thread-safe by itself; [`TimerService`] provides the locked surface.
///
/// [`TimerService`]: super::TimerService
/// [`peek_deadline`]: Self::peek_deadline
/// [`pop_expired_into`]: Self::pop_expired_into
#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: BinaryHeap<std::cmp::Reverse<TimerEntry>>,
}

impl TimerHeap {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, entry: TimerEntry) {
        self.heap.push(std::cmp::Reverse(entry));
    }

    /// The earliest live deadline, pruning tombstones off the top.
    pub fn peek_deadline(&mut self) -> Option<Instant> {
        while let Some(std::cmp::Reverse(top)) = self.heap.peek() {
            if top.record.is_cancelled() {
                self.heap.pop();
            } else {
                return Some(top.deadline);
            }
        }
        None
    }

    /// Pops every live entry with `deadline <= now` into `out`, in
    /// `(deadline, insertion_id)` order. Tombstones are discarded silently.
    ///
    /// `now` is the caller's freshness snapshot: entries pushed after this
    /// call began are untouched even if already due.
    pub fn pop_expired_into(&mut self, now: Instant, out: &mut Vec<TimerEntry>) {
        while let Some(std::cmp::Reverse(top)) = self.heap.peek() {
            if top.record.is_cancelled() {
                self.heap.pop();
                continue;
            }
            if top.deadline > now {
                break;
            }
            if let Some(std::cmp::Reverse(entry)) = self.heap.pop() {
                out.push(entry);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize { self.heap.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.heap.is_empty() }

    pub fn clear(&mut self) { self.heap.clear(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TimerCallback, TimerId};
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicBool, AtomicU32},
        },
        time::Duration,
    };

    fn record(id: u64) -> Arc<TimerRecord> {
        Arc::new(TimerRecord {
            id: TimerId(id),
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(|| {}) as TimerCallback)),
            repeat: None,
            nesting_depth: AtomicU32::new(0),
        })
    }

    #[test]
    fn pops_in_deadline_then_insertion_order() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        let later = base + Duration::from_millis(10);

        // Two entries share `later`; insertion order must break the tie.
        heap.push(TimerEntry { deadline: later, insertion_id: 2, record: record(2) });
        heap.push(TimerEntry { deadline: base, insertion_id: 3, record: record(3) });
        heap.push(TimerEntry { deadline: later, insertion_id: 1, record: record(1) });

        let mut out = Vec::new();
        heap.pop_expired_into(later, &mut out);
        let ids: Vec<u64> = out.iter().map(|e| e.record.id.as_u64()).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert!(heap.is_empty());
    }

    #[test]
    fn freshness_snapshot_excludes_later_deadlines() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        heap.push(TimerEntry { deadline: now, insertion_id: 1, record: record(1) });
        heap.push(TimerEntry {
            deadline: now + Duration::from_secs(60),
            insertion_id: 2,
            record: record(2),
        });

        let mut out = Vec::new();
        heap.pop_expired_into(now, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.peek_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn tombstones_are_pruned_silently() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let cancelled = record(1);
        cancelled.cancel();
        heap.push(TimerEntry { deadline: now, insertion_id: 1, record: cancelled });
        heap.push(TimerEntry { deadline: now, insertion_id: 2, record: record(2) });

        // Peek skips the tombstone and reports the live deadline.
        assert_eq!(heap.peek_deadline(), Some(now));

        let mut out = Vec::new();
        heap.pop_expired_into(now, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].record.id.as_u64(), 2);
    }

    #[test]
    fn peek_on_all_cancelled_heap_is_none() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        for n in 1..=3 {
            let r = record(n);
            r.cancel();
            heap.push(TimerEntry { deadline: now, insertion_id: n, record: r });
        }
        assert_eq!(heap.peek_deadline(), None);
        assert!(heap.is_empty());
    }
}
