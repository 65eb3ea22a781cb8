// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The loop lifecycle state machine. See [`LoopState`] and [`LoopStateCell`].

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of an event loop.
///
/// ```text
///             run()                 block             work/wake
///  Awake ───────────► Running ───────────► Sleeping ───────────► Running
///    │                   │                     │
///    │    shutdown() /   │      cancel /       │
///    └──────────────────►┴─────────────────────┴──► Terminating ──► Terminated
/// ```
///
/// `Awake`, `Running`, and `Sleeping` accept work; the two terminal states
/// refuse it with `LoopTerminated`. `Terminating → Terminated` is
/// irreversible.
///
/// # Why Not Just `bool`s?
///
/// Five states collapse several booleans (started, sleeping, draining, done)
/// into one word that can be transitioned atomically. Pattern matching
/// catches all cases and the code reads like documentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[repr(u8)]
pub enum LoopState {
    /// Created; `run()` has not begun. Accepts work.
    Awake = 0,
    /// The owner thread is inside a tick. Accepts work.
    Running = 1,
    /// Blocked in the poller or the fast-path gate. Accepts work (and the
    /// submitter wakes the loop).
    Sleeping = 2,
    /// Shutdown requested; the terminal drain is (or will be) running. New
    /// work is refused.
    Terminating = 3,
    /// Drain complete, poller closed. Final state.
    Terminated = 4,
}

impl LoopState {
    /// `true` while submissions are accepted.
    #[must_use]
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Awake | Self::Running | Self::Sleeping)
    }

    /// `true` for the two terminal states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Awake,
            1 => Self::Running,
            2 => Self::Sleeping,
            3 => Self::Terminating,
            _ => Self::Terminated,
        }
    }
}

/// Atomic storage for [`LoopState`]. All operations use `SeqCst` so callers
/// never have to choose an ordering.
#[derive(Debug)]
pub struct LoopStateCell {
    state: AtomicU8,
}

impl Default for LoopStateCell {
    fn default() -> Self { Self::new() }
}

impl LoopStateCell {
    /// Starts in [`LoopState::Awake`].
    #[must_use]
    pub fn new() -> Self {
        Self { state: AtomicU8::new(LoopState::Awake as u8) }
    }

    /// Reads the current state.
    #[must_use]
    pub fn get(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Attempts the transition `from → to`. Returns `true` on success; on
    /// failure the state is untouched (some other transition won).
    pub fn transition(&self, from: LoopState, to: LoopState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Forces the state. Reserved for the terminal sequence
    /// (`… → Terminating → Terminated`), which must win against every
    /// concurrent transition.
    pub fn force(&self, to: LoopState) {
        self.state.store(to as u8, Ordering::SeqCst);
    }

    /// Moves any non-terminal state to [`LoopState::Terminating`].
    ///
    /// Returns `true` if this call performed the transition, `false` if the
    /// loop was already terminal.
    pub fn request_termination(&self) -> bool {
        loop {
            let current = self.get();
            if current.is_terminal() {
                return false;
            }
            if self.transition(current, LoopState::Terminating) {
                return true;
            }
        }
    }
}
