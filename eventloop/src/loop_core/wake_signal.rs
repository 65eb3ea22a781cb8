// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words eventfd

//! The wake discipline: a single logical wake channel with a pending bit
//! that coalesces bursts. See [`WakeSignal`].

use std::{
    sync::{
        Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// One logical wake channel with at-most-one outstanding signal.
///
/// Two delivery legs share the same pending bit:
///
/// - **Poller leg** — when the loop sleeps in the OS poller, the caller
///   forwards the wake to the poller's waker (eventfd / pipe). The pending
///   bit guarantees at most one outstanding write, so bursts of submissions
///   coalesce into a single wakeup without dropping any semantically.
/// - **Gate leg** — when the loop sleeps on the fast path, [`notify_gate`]
///   flips a condvar-guarded flag. A signal posted before the sleeper
///   arrives is consumed on entry, so no wakeup is lost to the classic
///   check-then-block race.
///
/// After any wakeup the loop calls [`consume`] to clear both the pending bit
/// and the gate flag in one step.
///
/// [`consume`]: Self::consume
/// [`notify_gate`]: Self::notify_gate
#[derive(Debug, Default)]
pub struct WakeSignal {
    pending: AtomicBool,
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl WakeSignal {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Claims the right to deliver a signal. Returns `true` exactly once per
    /// un-consumed wake: the caller that gets `true` must deliver (gate
    /// and/or poller); callers that get `false` know a signal is already
    /// outstanding.
    pub fn request(&self) -> bool {
        self.pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Reads the pending bit without claiming anything.
    #[must_use]
    pub fn is_pending(&self) -> bool { self.pending.load(Ordering::SeqCst) }

    /// Delivers the gate leg of a wake.
    pub fn notify_gate(&self) {
        let mut signaled = self.lock_signaled();
        *signaled = true;
        drop(signaled);
        self.condvar.notify_all();
    }

    /// Blocks on the gate until a signal arrives or `timeout` elapses
    /// (`None` = forever). A signal posted before this call returns
    /// immediately. The gate flag is consumed on return.
    pub fn wait_gate(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signaled = self.lock_signaled();
        while !*signaled {
            match deadline {
                None => {
                    signaled = match self.condvar.wait(signaled) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _timeout_result) =
                        match self.condvar.wait_timeout(signaled, deadline - now) {
                            Ok(pair) => pair,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                    signaled = guard;
                }
            }
        }
        *signaled = false;
    }

    /// Clears the pending bit and the gate flag after a wakeup (from either
    /// leg), re-arming the channel for the next signal.
    pub fn consume(&self) {
        self.pending.store(false, Ordering::SeqCst);
        *self.lock_signaled() = false;
    }

    /// Consumes a pending signal if there is one. Used by the pre-block
    /// re-check: a `true` return means "do not block, someone signaled".
    pub fn take_pending(&self) -> bool {
        let was_pending = self.pending.swap(false, Ordering::SeqCst);
        if was_pending {
            *self.lock_signaled() = false;
        }
        was_pending
    }

    fn lock_signaled(&self) -> std::sync::MutexGuard<'_, bool> {
        match self.signaled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn request_claims_exactly_once_until_consumed() {
        let signal = WakeSignal::new();
        assert!(signal.request());
        assert!(!signal.request());
        assert!(signal.is_pending());

        signal.consume();
        assert!(!signal.is_pending());
        assert!(signal.request());
    }

    #[test]
    fn gate_signal_posted_before_wait_returns_immediately() {
        let signal = WakeSignal::new();
        signal.notify_gate();
        let start = Instant::now();
        signal.wait_gate(Some(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn gate_wakes_a_blocked_waiter() {
        let signal = Arc::new(WakeSignal::new());
        let signal_clone = Arc::clone(&signal);
        let notifier = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signal_clone.notify_gate();
        });

        let start = Instant::now();
        signal.wait_gate(Some(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
        notifier.join().unwrap();
    }

    #[test]
    fn gate_wait_times_out() {
        let signal = WakeSignal::new();
        let start = Instant::now();
        signal.wait_gate(Some(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn take_pending_consumes_the_signal() {
        let signal = WakeSignal::new();
        assert!(!signal.take_pending());
        signal.request();
        signal.notify_gate();
        assert!(signal.take_pending());
        assert!(!signal.is_pending());
        // Gate flag was consumed too: a fresh wait blocks until timeout.
        let start = Instant::now();
        signal.wait_gate(Some(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
