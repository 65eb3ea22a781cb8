// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Shared infrastructure used by every subsystem: the error taxonomy
//! ([`LoopError`]), monotonic ID allocation ([`MonotonicId`]), and cooperative
//! cancellation ([`CancelToken`]).

// Attach.
mod cancel_token;
mod ids;
mod loop_error;

// Re-export.
pub use cancel_token::*;
pub use ids::*;
pub use loop_error::*;
