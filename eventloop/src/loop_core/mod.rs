// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue eventfd

//! The loop core: the state machine, the tick algorithm, the poller-bypass
//! fast path, and the wake discipline that ties them together.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            EVENT LOOP CORE                           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  producers (any thread)                 owner thread                 │
//! │  ──────────────────────                 ─────────────────────────    │
//! │  submit ──────────► ingress queue ──┐                                │
//! │  submit_internal ─► internal queue ─┤                                │
//! │  schedule_microtask ► MicrotaskRing ┤   tick (one iteration):        │
//! │  schedule_next_tick ► next-tick buf ┼─► 1 next-tick callbacks        │
//! │  schedule_timer ───► TimerService ──┤   2 expired timers             │
//! │  register_fd ─────► ReadinessPoller ┘   3 external drain             │
//! │                                         4 internal drain             │
//! │                                         5 I/O readiness dispatch     │
//! │                                         6 microtask drain (budget)   │
//! │                                         7 block decision             │
//! │                                              │                       │
//! │                      ┌───────────────────────┴─────────┐             │
//! │                      ▼                                 ▼             │
//! │             fd_count == 0 and mode ≠ Disabled   otherwise            │
//! │             → fast-path wake gate               → poller.poll()      │
//! │               (zero syscalls)                     (epoll/kqueue)     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The ingress, internal, and next-tick buffers are three instances of the
//! same chunked [`TaskQueue`] structure; they differ only in which phase
//! drains them and in who is allowed to push.
//!
//! Any callback running in phases 1–5 that enqueues microtasks is guaranteed
//! those microtasks run in phase 6 of the **same** tick — the JavaScript
//! "microtasks before macrotasks" rule.
//!
//! [`TaskQueue`]: crate::TaskQueue

// Attach.
mod event_loop;
mod fast_path;
mod loop_config;
mod loop_hooks;
mod loop_state;
mod tick;
mod wake_signal;

// Re-export.
pub use event_loop::*;
pub use fast_path::*;
pub use loop_config::*;
pub use loop_hooks::*;
pub use loop_state::*;
pub use tick::*;
pub use wake_signal::*;

#[cfg(test)]
mod tests;
