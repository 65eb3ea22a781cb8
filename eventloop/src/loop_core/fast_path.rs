// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue

//! The poller-bypass fast path mode. See [`FastPathMode`] and
//! [`FastPathCell`].

use std::sync::atomic::{AtomicU8, Ordering};

/// Controls whether a zero-fd loop may bypass the OS poller and block on the
/// in-process wake gate instead.
///
/// In the bypassed steady state a submit→drain round trip makes no syscalls
/// at all.
///
/// # Mode Switching Protocol
///
/// `set_fast_path_mode` runs a three-step optimistic protocol against
/// concurrent `register_fd` calls:
///
/// 1. Read `fd_count`; `Forced` with fds registered fails immediately.
/// 2. Swap the mode atomically, remembering the previous mode.
/// 3. Re-read `fd_count`; if a registration slipped in and the new mode is
///    `Forced`, roll back via compare-and-swap and fail.
///
/// The rollback uses CAS (not a blind store) so a concurrent
/// `set_fast_path_mode` with a legitimately different value wins instead of
/// being clobbered. Symmetrically, `register_fd` fails immediately in
/// `Forced` mode, and increments `fd_count` *before* the OS registration so
/// step 3 observes it.
///
/// The net invariant: `Forced ⇒ fd_count == 0` at every quiescent point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::Display)]
#[repr(u8)]
pub enum FastPathMode {
    /// Bypass the poller whenever no fds are registered. The default.
    #[default]
    Auto = 0,
    /// Always block in the OS poller, even with zero fds registered.
    Disabled = 1,
    /// Require the bypass; fd registration is refused while forced.
    Forced = 2,
}

impl FastPathMode {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Auto,
            1 => Self::Disabled,
            _ => Self::Forced,
        }
    }
}

/// Atomic storage for [`FastPathMode`] (`SeqCst` throughout).
#[derive(Debug, Default)]
pub struct FastPathCell {
    mode: AtomicU8,
}

impl FastPathCell {
    /// Starts in [`FastPathMode::Auto`].
    #[must_use]
    pub fn new() -> Self { Self::default() }

    #[must_use]
    pub fn get(&self) -> FastPathMode {
        FastPathMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    /// Swaps in `mode`, returning the previous mode.
    pub fn swap(&self, mode: FastPathMode) -> FastPathMode {
        FastPathMode::from_u8(self.mode.swap(mode as u8, Ordering::SeqCst))
    }

    /// The rollback step: restore `previous` only if the cell still holds
    /// `expected`. A concurrent mode switch that already replaced the value
    /// wins.
    pub fn rollback(&self, expected: FastPathMode, previous: FastPathMode) {
        let _ignored = self.mode.compare_exchange(
            expected as u8,
            previous as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_auto() {
        let cell = FastPathCell::new();
        assert_eq!(cell.get(), FastPathMode::Auto);
    }

    #[test]
    fn swap_returns_previous() {
        let cell = FastPathCell::new();
        assert_eq!(cell.swap(FastPathMode::Forced), FastPathMode::Auto);
        assert_eq!(cell.swap(FastPathMode::Disabled), FastPathMode::Forced);
        assert_eq!(cell.get(), FastPathMode::Disabled);
    }

    #[test]
    fn rollback_only_replaces_the_expected_value() {
        let cell = FastPathCell::new();
        cell.swap(FastPathMode::Forced);

        // Expected matches: rollback applies.
        cell.rollback(FastPathMode::Forced, FastPathMode::Auto);
        assert_eq!(cell.get(), FastPathMode::Auto);

        // Expected stale: a concurrent switch's value survives.
        cell.swap(FastPathMode::Disabled);
        cell.rollback(FastPathMode::Forced, FastPathMode::Auto);
        assert_eq!(cell.get(), FastPathMode::Disabled);
    }
}
