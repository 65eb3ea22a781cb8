// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Cooperative cancellation for [`EventLoop::run`]. See [`CancelToken`].
//!
//! [`EventLoop::run`]: crate::EventLoop::run

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

/// A cloneable cancellation token for the loop's run call.
///
/// Cancelling the token is equivalent to requesting an immediate graceful
/// shutdown: the loop finishes its in-flight tick, performs one terminal
/// drain, and terminates.
///
/// # Wake slot
///
/// The token alone cannot interrupt a loop that is blocked in its poller or
/// fast-path gate — something has to *wake* it so it notices the flag. The
/// loop installs a wake closure into the token's shared slot when `run`
/// starts, and [`cancel()`] invokes whatever closure is installed at that
/// moment. The slot is a `Mutex<Option<…>>` swapped per run, so a token
/// cancelled before `run` begins simply finds the slot empty (the flag is
/// still observed at run entry).
///
/// Multiple concurrent [`cancel()`] calls are safe and harmless; wakes
/// coalesce in the loop's wake-pending bit.
///
/// [`cancel()`]: Self::cancel
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    wake: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl std::fmt::Debug for CancelInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelInner")
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

impl CancelToken {
    /// Creates a token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Flags the token as cancelled and wakes the loop (if one is attached).
    ///
    /// Idempotent. The first call after `run` begins causes the loop to
    /// terminate gracefully; later calls are no-ops.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        // Invoke outside any loop-internal lock: the slot lock guards only the
        // closure pointer, and the closure itself is the loop's wake routine
        // which takes its own (independent) locks.
        let guard = self.inner.wake.lock();
        if let Ok(guard) = guard
            && let Some(wake) = guard.as_ref()
        {
            wake();
        }
    }

    /// Reads the cancellation flag.
    #[must_use]
    pub fn is_cancelled(&self) -> bool { self.inner.cancelled.load(Ordering::SeqCst) }

    /// Installs the wake closure invoked by [`cancel()`]. Called by the loop
    /// when `run` starts; replaced wholesale on each install.
    ///
    /// [`cancel()`]: Self::cancel
    pub(crate) fn install_wake(&self, wake: Box<dyn Fn() + Send>) {
        if let Ok(mut guard) = self.inner.wake.lock() {
            *guard = Some(wake);
        }
    }

    /// Clears the wake closure. Called when the loop terminates so a late
    /// `cancel()` does not poke a dead loop.
    pub(crate) fn clear_wake(&self) {
        if let Ok(mut guard) = self.inner.wake.lock() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_sets_flag_and_invokes_wake() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        token.install_wake(Box::new(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));

        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Idempotent flag; wake fires again (coalescing is the loop's job).
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel_before_install_is_observed_later() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());

        // Installing after the fact does not lose the flag.
        token.install_wake(Box::new(|| {}));
        assert!(token.is_cancelled());
    }

    #[test]
    fn clear_wake_detaches_the_loop() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        token.install_wake(Box::new(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));
        token.clear_wake();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
