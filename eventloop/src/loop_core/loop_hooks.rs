// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Observer hooks: tick-boundary test hooks and the back-pressure signal.
//! See [`LoopHooks`].

use std::sync::{Arc, Mutex};

/// A tick-boundary hook. Receives the tick sequence number.
pub type TickHook = Arc<dyn Fn(u64) + Send + Sync + 'static>;

/// The overload callback. Receives a description of the back-pressure
/// condition.
pub type OverloadHook = Arc<dyn Fn(&BackPressure) + Send + Sync + 'static>;

/// Back-pressure description handed to the overload callback.
#[derive(Debug, Clone, Copy)]
pub struct BackPressure {
    /// External-queue length observed at the triggering push.
    pub queue_len: usize,
    /// The configured threshold that was crossed.
    pub threshold: usize,
}

impl std::fmt::Display for BackPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "external queue length {} crossed overload threshold {}",
            self.queue_len, self.threshold
        )
    }
}

/// Hook slots attached to a loop.
///
/// Each slot is a `Mutex<Option<Arc<…>>>`: installers swap the `Arc`, the
/// loop clones it out and invokes with no lock held — a panicking hook can
/// never poison loop state (invocations are additionally wrapped in
/// `catch_unwind` at the call sites).
#[derive(Default)]
pub struct LoopHooks {
    before_tick: Mutex<Option<TickHook>>,
    after_tick: Mutex<Option<TickHook>>,
    on_overload: Mutex<Option<OverloadHook>>,
}

impl std::fmt::Debug for LoopHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHooks").finish_non_exhaustive()
    }
}

impl LoopHooks {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    pub fn set_before_tick(&self, hook: Option<TickHook>) {
        *lock(&self.before_tick) = hook;
    }

    pub fn set_after_tick(&self, hook: Option<TickHook>) {
        *lock(&self.after_tick) = hook;
    }

    pub fn set_on_overload(&self, hook: Option<OverloadHook>) {
        *lock(&self.on_overload) = hook;
    }

    #[must_use]
    pub fn before_tick(&self) -> Option<TickHook> { lock(&self.before_tick).clone() }

    #[must_use]
    pub fn after_tick(&self) -> Option<TickHook> { lock(&self.after_tick).clone() }

    #[must_use]
    pub fn on_overload(&self) -> Option<OverloadHook> { lock(&self.on_overload).clone() }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
