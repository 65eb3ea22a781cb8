// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue

//! The readiness poller: a thin, lazily initialized abstraction over the OS
//! demultiplexer (`kqueue` on macOS / the BSDs, `epoll` on Linux, both via
//! [`mio`]) plus the wake channel that interrupts a blocked poll.
//!
//! Platform bits never leave this module: the rest of the crate sees only the
//! abstract [`IoEventSet`] bitmask and the [`ReadinessPoller`] contract.

// Attach.
mod io_event;
mod readiness_poller;

// Re-export.
pub use io_event::*;
pub use readiness_poller::*;
