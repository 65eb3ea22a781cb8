// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue eventfd

//! # Context
//!
//! A single-threaded, cooperatively-scheduled event loop that reproduces the
//! observable scheduling semantics of a JavaScript host environment (HTML5 /
//! Node-style) for native, multi-threaded Rust programs.
//!
//! Producers on any thread hand work to the loop; **one owner thread** — the
//! one that calls [`EventLoop::run`] — executes every callback: timers,
//! microtasks, I/O readiness, and cross-thread submissions, interleaved
//! under the strict per-tick ordering documented in [`loop_core`].
//!
//! # The three subsystems
//!
//! 1. **Loop core** ([`loop_core`]) — the tick state machine. Strict phase
//!    order (next-tick → timers → external → internal → I/O → microtasks),
//!    a budgeted microtask drain, and a *fast path* that bypasses the OS
//!    poller entirely while no file descriptors are registered: a
//!    submit→drain round trip in the bypassed steady state makes no
//!    syscalls.
//! 2. **Promise engine** ([`promise`]) — Promise/A+-equivalent chaining
//!    ([`Promise::then`] / [`Promise::catch`] / [`Promise::finally`]),
//!    combinators ([`Promise::all`], [`Promise::any`], [`Promise::race`],
//!    [`Promise::all_settled`]), thenable adoption, and unhandled-rejection
//!    detection that tolerates a `catch` racing the rejection from another
//!    thread.
//! 3. **Readiness poller** ([`poller`]) — a lazily created, thin layer over
//!    the platform demultiplexer (`epoll` on Linux, `kqueue` on macOS / the
//!    BSDs, via [`mio`]) plus the wake channel that interrupts a blocked
//!    poll. A loop that never registers an fd never touches the OS
//!    demultiplexer.
//!
//! # Quick start
//!
//! ```no_run
//! use r3bl_eventloop::{CancelToken, EventLoop};
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::new();
//!
//! // Producers can live on any thread.
//! let handle = event_loop.clone();
//! std::thread::spawn(move || {
//!     handle.submit(|| println!("ran on the loop thread")).unwrap();
//!     handle
//!         .schedule_timer(Duration::from_millis(5), || println!("timer"))
//!         .unwrap();
//!     handle.shutdown(Duration::from_secs(1)).unwrap();
//! });
//!
//! // The calling thread becomes the owner thread until shutdown.
//! event_loop.run(CancelToken::new()).unwrap();
//! ```
//!
//! # Ordering cheat sheet
//!
//! | Guarantee | Where |
//! | :-------- | :---- |
//! | Microtasks run before any later-tick macrotask | tick phase 6 |
//! | Timers fire in `(deadline, insertion id)` order | [`timer`] |
//! | Nested timers (depth ≥ 5) clamp to ≥ 4 ms | [`timer`] |
//! | Handlers attached before settlement run before ones attached after | [`promise`] |
//! | A submission is executed or refused — never silently dropped | [`loop_core`] |

#![cfg_attr(not(test), deny(clippy::unwrap_in_result))]

// Attach.
pub mod common;
pub mod host;
pub mod ingress;
pub mod loop_core;
pub mod microtask;
pub mod poller;
pub mod promise;
pub mod timer;

#[cfg(test)]
pub(crate) mod test_fixtures;

// Re-export.
pub use common::*;
pub use host::*;
pub use ingress::*;
pub use loop_core::*;
pub use microtask::*;
pub use poller::*;
pub use promise::*;
pub use timer::*;
