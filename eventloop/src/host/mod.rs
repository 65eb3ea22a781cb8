// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The JavaScript-named host facade over the scheduling primitives. See
//! [`HostScope`].

// Attach.
mod web_timers;

// Re-export.
pub use web_timers::*;
