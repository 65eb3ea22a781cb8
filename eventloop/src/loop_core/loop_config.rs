// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Tunables for an event loop instance. See [`LoopConfig`].

use std::time::Duration;

/// Per-drain microtask budget default. A drain that hits the budget with a
/// non-empty ring posts a wake so the loop re-enters the tick instead of
/// blocking.
pub const DEFAULT_MICROTASK_BUDGET: usize = 1024;

/// How long a rejection check waits for a handler racing the rejection.
pub const DEFAULT_HANDLER_READY_WAIT: Duration = Duration::from_millis(10);

/// External-queue length at which the overload callback fires.
pub const DEFAULT_OVERLOAD_THRESHOLD: usize = 65_536;

/// Promise-registry slots examined per scavenge pass.
pub const DEFAULT_SCAVENGE_BATCH: usize = 64;

/// Tunables fixed at loop construction.
///
/// The defaults suit typical workloads; construct with
/// [`EventLoop::with_config`] to override.
///
/// [`EventLoop::with_config`]: super::EventLoop::with_config
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Maximum microtasks executed per phase-6 drain.
    pub microtask_budget: usize,
    /// Bounded wait used by the unhandled-rejection check to tolerate a
    /// handler attached concurrently with the rejection.
    pub handler_ready_wait: Duration,
    /// External-queue length that triggers the overload callback. The signal
    /// re-arms when a drain empties the queue.
    pub overload_threshold: usize,
    /// Promise-registry slots examined per scavenge pass (bounds the pause).
    pub scavenge_batch: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            microtask_budget: DEFAULT_MICROTASK_BUDGET,
            handler_ready_wait: DEFAULT_HANDLER_READY_WAIT,
            overload_threshold: DEFAULT_OVERLOAD_THRESHOLD,
            scavenge_batch: DEFAULT_SCAVENGE_BATCH,
        }
    }
}

impl LoopConfig {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    #[must_use]
    pub fn microtask_budget(mut self, budget: usize) -> Self {
        self.microtask_budget = budget.max(1);
        self
    }

    #[must_use]
    pub fn handler_ready_wait(mut self, wait: Duration) -> Self {
        self.handler_ready_wait = wait;
        self
    }

    #[must_use]
    pub fn overload_threshold(mut self, threshold: usize) -> Self {
        self.overload_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn scavenge_batch(mut self, batch: usize) -> Self {
        self.scavenge_batch = batch.max(1);
        self
    }
}
