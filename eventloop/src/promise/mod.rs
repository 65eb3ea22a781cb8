// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The promise engine: Promise/A+-equivalent chaining on top of the loop's
//! microtask ordering, combinators, a scavengeable registry of live
//! promises, and unhandled-rejection detection.
//!
//! See [`Promise`] for the chaining surface and the state rules.

// Attach.
mod combinators;
mod promise;
mod promise_types;
mod registry;
mod rejection_tracker;

// Re-export.
pub use combinators::*;
pub use promise::*;
pub use promise_types::*;
pub use registry::*;
pub use rejection_tracker::*;

#[cfg(test)]
mod tests;
