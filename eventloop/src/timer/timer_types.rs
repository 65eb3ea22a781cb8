// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Timer records and the HTML5 nested-timeout clamp.

use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

/// Handle returned by timer scheduling; passed to cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

impl TimerId {
    /// The raw id value.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// A timer callback. `FnMut` because repeating timers fire it many times.
pub type TimerCallback = Box<dyn FnMut() + Send + 'static>;

/// Nesting depth at which the minimum-delay clamp engages (HTML5 §8.8: after
/// five levels of timer-schedules-timer, delays are clamped).
pub const NESTING_CLAMP_DEPTH: u32 = 5;

/// The minimum delay applied once [`NESTING_CLAMP_DEPTH`] is reached.
pub const MIN_CLAMPED_DELAY: Duration = Duration::from_millis(4);

/// Applies the HTML5 nested-timeout clamp: at nesting depth ≥
/// [`NESTING_CLAMP_DEPTH`], the effective delay is
/// `max(requested, MIN_CLAMPED_DELAY)`.
#[must_use]
pub fn clamp_nested_delay(requested: Duration, nesting_depth: u32) -> Duration {
    if nesting_depth >= NESTING_CLAMP_DEPTH {
        requested.max(MIN_CLAMPED_DELAY)
    } else {
        requested
    }
}

/// The shared, cancellable state of one scheduled timer.
///
/// Shared via [`Arc`] between the heap entry, the id registry, and (while the
/// callback runs) the tick executor — which is what lets `cancel_timer` flip
/// the flag from any thread while the heap itself stays owner-thread-only.
///
/// The callback lives in a `Mutex<Option<…>>` slot: the executor takes it
/// out, runs it with no lock held, and puts it back if the timer re-arms.
///
/// [`Arc`]: std::sync::Arc
pub struct TimerRecord {
    /// Public identity.
    pub id: TimerId,
    /// Tombstone flag checked when the heap entry surfaces.
    pub cancelled: AtomicBool,
    /// The callback slot. `None` only while the executor is running it.
    pub callback: Mutex<Option<TimerCallback>>,
    /// `Some(interval)` for repeating timers; `None` for one-shot.
    pub repeat: Option<Duration>,
    /// How many timer-schedules-timer hops led here. Bumped on each repeat
    /// re-arm, mirroring the HTML5 interval rules.
    pub nesting_depth: AtomicU32,
}

impl TimerRecord {
    /// Marks the record cancelled. Returns `true` on the first call.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    /// Reads the tombstone flag.
    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.cancelled.load(Ordering::SeqCst) }
}

impl std::fmt::Debug for TimerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerRecord")
            .field("id", &self.id)
            .field("cancelled", &self.cancelled)
            .field("repeat", &self.repeat)
            .field("nesting_depth", &self.nesting_depth)
            .finish_non_exhaustive()
    }
}
