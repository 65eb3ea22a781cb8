// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Value, state, and reason types for the promise engine.

use std::{any::Any, sync::Arc};

use super::Promise;

/// A dynamically typed promise value or rejection reason.
///
/// Promises carry whatever the host hands them; handlers downcast as needed.
pub type PromiseValue = Arc<dyn Any + Send + Sync>;

/// Wraps an arbitrary value as a [`PromiseValue`].
#[must_use]
pub fn promise_value<T: Any + Send + Sync>(value: T) -> PromiseValue {
    Arc::new(value)
}

/// The three-state promise lifecycle. Written exactly once past
/// [`Pending`].
///
/// [`Pending`]: Self::Pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[repr(u8)]
pub enum PromiseState {
    /// Not yet settled; handlers accumulate.
    Pending = 0,
    /// Settled with a value.
    Fulfilled = 1,
    /// Settled with a reason.
    Rejected = 2,
}

impl PromiseState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Fulfilled,
            _ => Self::Rejected,
        }
    }
}

/// A settled outcome: the value or the reason.
#[derive(Clone)]
pub enum Settlement {
    /// Fulfilled with a value.
    Fulfilled(PromiseValue),
    /// Rejected with a reason.
    Rejected(PromiseValue),
}

impl Settlement {
    /// The state this settlement puts a promise in.
    #[must_use]
    pub fn state(&self) -> PromiseState {
        match self {
            Self::Fulfilled(_) => PromiseState::Fulfilled,
            Self::Rejected(_) => PromiseState::Rejected,
        }
    }

    /// The fulfillment value, if fulfilled.
    #[must_use]
    pub fn value(&self) -> Option<&PromiseValue> {
        match self {
            Self::Fulfilled(value) => Some(value),
            Self::Rejected(_) => None,
        }
    }

    /// The rejection reason, if rejected.
    #[must_use]
    pub fn reason(&self) -> Option<&PromiseValue> {
        match self {
            Self::Rejected(reason) => Some(reason),
            Self::Fulfilled(_) => None,
        }
    }
}

impl std::fmt::Debug for Settlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fulfilled(_) => write!(f, "Settlement::Fulfilled(..)"),
            Self::Rejected(_) => write!(f, "Settlement::Rejected(..)"),
        }
    }
}

/// What a handler hands back: a plain value, or a promise-like whose
/// eventual state the chained promise adopts (Promise/A+ §2.3.2).
pub enum HandlerOutput {
    /// An ordinary fulfillment value.
    Value(PromiseValue),
    /// A thenable; the chained promise assumes its eventual state.
    Thenable(Promise),
}

impl std::fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(_) => write!(f, "HandlerOutput::Value(..)"),
            Self::Thenable(p) => write!(f, "HandlerOutput::Thenable(promise#{})", p.id()),
        }
    }
}

/// A `then` callback: consumes the settled value (or reason) and produces
/// the chained promise's input. A panic inside settles the chained promise
/// with a [`PanicReason`].
pub type HandlerFn = Box<dyn FnOnce(PromiseValue) -> HandlerOutput + Send + 'static>;

/// Rejection reason wrapping a panic thrown inside a handler or callback.
#[derive(Debug, Clone)]
pub struct PanicReason {
    /// Best-effort rendering of the panic payload.
    pub message: String,
}

impl PanicReason {
    /// Extracts the conventional `&str` / `String` payload, falling back to
    /// a placeholder for exotic payload types.
    #[must_use]
    pub fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with non-string payload".to_string());
        Self { message }
    }
}

impl std::fmt::Display for PanicReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler panicked: {}", self.message)
    }
}

/// Rejection reason produced by `any` when every input rejects.
#[derive(Clone)]
pub struct AggregateError {
    /// Every input's rejection reason, in input order.
    pub reasons: Vec<PromiseValue>,
}

impl std::fmt::Debug for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateError")
            .field("reasons", &self.reasons.len())
            .finish()
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "all {} promises were rejected", self.reasons.len())
    }
}

/// Canonical reason for `resolve(P, P)`: a promise cannot adopt itself.
#[derive(Debug, Clone, Copy)]
pub struct SelfResolutionError;

impl std::fmt::Display for SelfResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chaining cycle: a promise cannot adopt itself")
    }
}

/// Canonical reason used to reject every still-pending promise when the loop
/// terminates.
#[derive(Debug, Clone, Copy)]
pub struct TerminationReason;

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event loop terminated before the promise settled")
    }
}
