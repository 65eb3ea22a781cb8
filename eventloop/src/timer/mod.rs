// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Timers: a deadline-ordered min-heap with stable tie-break, tombstone
//! cancellation, repeat re-arm, and the HTML5 nested-timeout clamp.
//!
//! See [`TimerHeap`] for the ordering structure and [`TimerService`] for the
//! thread-safe surface the loop uses.

// Attach.
mod timer_heap;
mod timer_service;
mod timer_types;

// Re-export.
pub use timer_heap::*;
pub use timer_service::*;
pub use timer_types::*;
