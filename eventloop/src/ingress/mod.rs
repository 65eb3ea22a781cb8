// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Task ingress: the chunked, lock-protected FIFO that carries queued work
//! onto the loop — cross-thread submissions, next-tick callbacks, and
//! same-thread internal tasks all ride the same structure. See [`TaskQueue`].

// Attach.
mod task_queue;

// Re-export.
pub use task_queue::*;
