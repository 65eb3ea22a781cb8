// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! `setTimeout`-family wrappers. See [`HostScope`].

use std::time::Duration;

use crate::{EventLoop, LoopError, TimerId};

/// A thin facade exposing the scheduling primitives under their JavaScript
/// host names: `set_timeout`, `set_interval`, `clear_timeout`,
/// `clear_interval`, `queue_microtask`.
///
/// Pure argument translation — ordering, the nesting-depth clamp, and
/// repeat re-arm all come from the underlying loop operations. The strict
/// `clear_*` variants surface [`LoopError::TimerNotFound`] where the web
/// APIs would silently ignore an unknown handle.
#[derive(Debug, Clone)]
pub struct HostScope {
    looph: EventLoop,
}

impl HostScope {
    /// Wraps a loop handle.
    #[must_use]
    pub fn new(looph: &EventLoop) -> Self { Self { looph: looph.clone() } }

    /// One-shot timer after `delay`.
    ///
    /// # Errors
    ///
    /// [`LoopError::LoopTerminated`] once shutdown has begun.
    pub fn set_timeout(
        &self,
        delay: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerId, LoopError> {
        self.looph.schedule_timer(delay, callback)
    }

    /// Repeating timer: first fire after `interval`, then every `interval`.
    ///
    /// # Errors
    ///
    /// [`LoopError::LoopTerminated`] once shutdown has begun.
    pub fn set_interval(
        &self,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerId, LoopError> {
        self.looph.schedule_repeating_timer(interval, interval, callback)
    }

    /// Cancels a `set_timeout` handle. Unknown handles are ignored, like the
    /// web API.
    pub fn clear_timeout(&self, id: TimerId) { let _was_live = self.looph.cancel_timer(id); }

    /// Cancels a `set_interval` handle. Unknown handles are ignored.
    pub fn clear_interval(&self, id: TimerId) { self.clear_timeout(id); }

    /// Strict cancellation: reports whether the handle was live.
    ///
    /// # Errors
    ///
    /// [`LoopError::TimerNotFound`] when the timer already fired, was
    /// cancelled, or never existed.
    pub fn clear_timeout_strict(&self, id: TimerId) -> Result<(), LoopError> {
        if self.looph.cancel_timer(id) {
            Ok(())
        } else {
            Err(LoopError::TimerNotFound { id: id.as_u64() })
        }
    }

    /// Enqueues a microtask (runs in phase 6 of the current or next tick,
    /// before any timer or I/O callback of a later tick).
    ///
    /// # Errors
    ///
    /// [`LoopError::LoopTerminated`] once shutdown has begun.
    pub fn queue_microtask(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<(), LoopError> {
        self.looph.schedule_microtask(callback)
    }
}
