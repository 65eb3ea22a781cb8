// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The promise combinators: `all`, `any`, `race`, `all_settled`.
//!
//! Every combinator attaches internal observers to its inputs and settles a
//! fresh output promise exactly once; a sentinel flag makes late settlements
//! of losing inputs harmless no-ops.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use super::{
    AggregateError, Promise, PromiseValue, Settlement, promise_value,
};
use crate::EventLoop;

impl Promise {
    /// Fulfills with every input's value (in input order) once all inputs
    /// fulfill; rejects with the first rejection. Empty input fulfills
    /// immediately with an empty vector.
    ///
    /// The fulfillment value downcasts to `Vec<PromiseValue>`.
    #[must_use]
    pub fn all(looph: &EventLoop, inputs: Vec<Promise>) -> Promise {
        let output = Promise::new_in(looph);
        if inputs.is_empty() {
            output.settle(Settlement::Fulfilled(promise_value(
                Vec::<PromiseValue>::new(),
            )));
            return output;
        }

        let count = inputs.len();
        let results = Arc::new(Mutex::new(vec![None::<PromiseValue>; count]));
        let remaining = Arc::new(AtomicUsize::new(count));
        let done = Arc::new(AtomicBool::new(false));

        for (index, input) in inputs.into_iter().enumerate() {
            let results = Arc::clone(&results);
            let remaining = Arc::clone(&remaining);
            let done = Arc::clone(&done);
            let output = output.clone();
            input.subscribe_internal(move |settlement| match settlement {
                Settlement::Fulfilled(value) => {
                    if done.load(Ordering::SeqCst) {
                        return;
                    }
                    lock(&results)[index] = Some(value);
                    let last = remaining.fetch_sub(1, Ordering::SeqCst) == 1;
                    if last && !done.swap(true, Ordering::SeqCst) {
                        let values: Vec<PromiseValue> = lock(&results)
                            .iter_mut()
                            .map(|slot| slot.take().expect("all slots filled"))
                            .collect();
                        output.settle(Settlement::Fulfilled(promise_value(values)));
                    }
                }
                Settlement::Rejected(reason) => {
                    // First rejection wins; later settlements are ignored.
                    if !done.swap(true, Ordering::SeqCst) {
                        output.settle(Settlement::Rejected(reason));
                    }
                }
            });
        }
        output
    }

    /// Fulfills with the first fulfillment; once **all** inputs reject,
    /// rejects with an [`AggregateError`] carrying every reason in input
    /// order. Empty input rejects immediately.
    #[must_use]
    pub fn any(looph: &EventLoop, inputs: Vec<Promise>) -> Promise {
        let output = Promise::new_in(looph);
        if inputs.is_empty() {
            output.settle(Settlement::Rejected(promise_value(AggregateError {
                reasons: Vec::new(),
            })));
            return output;
        }

        let count = inputs.len();
        let reasons = Arc::new(Mutex::new(vec![None::<PromiseValue>; count]));
        let remaining = Arc::new(AtomicUsize::new(count));
        let done = Arc::new(AtomicBool::new(false));

        for (index, input) in inputs.into_iter().enumerate() {
            let reasons = Arc::clone(&reasons);
            let remaining = Arc::clone(&remaining);
            let done = Arc::clone(&done);
            let output = output.clone();
            input.subscribe_internal(move |settlement| match settlement {
                Settlement::Fulfilled(value) => {
                    if !done.swap(true, Ordering::SeqCst) {
                        output.settle(Settlement::Fulfilled(value));
                    }
                }
                Settlement::Rejected(reason) => {
                    if done.load(Ordering::SeqCst) {
                        return;
                    }
                    lock(&reasons)[index] = Some(reason);
                    let last = remaining.fetch_sub(1, Ordering::SeqCst) == 1;
                    if last && !done.swap(true, Ordering::SeqCst) {
                        let reasons: Vec<PromiseValue> = lock(&reasons)
                            .iter_mut()
                            .map(|slot| slot.take().expect("all slots filled"))
                            .collect();
                        output.settle(Settlement::Rejected(promise_value(
                            AggregateError { reasons },
                        )));
                    }
                }
            });
        }
        output
    }

    /// Settles with the first settlement of any input, whichever way it
    /// went. Empty input returns a promise that never settles.
    #[must_use]
    pub fn race(looph: &EventLoop, inputs: Vec<Promise>) -> Promise {
        let output = Promise::new_in(looph);
        let done = Arc::new(AtomicBool::new(false));
        for input in inputs {
            let done = Arc::clone(&done);
            let output = output.clone();
            input.subscribe_internal(move |settlement| {
                if !done.swap(true, Ordering::SeqCst) {
                    output.settle(settlement);
                }
            });
        }
        output
    }

    /// Always fulfills, with every input's [`Settlement`] in input order,
    /// once every input has settled. Empty input fulfills immediately.
    ///
    /// The fulfillment value downcasts to `Vec<Settlement>`.
    #[must_use]
    pub fn all_settled(looph: &EventLoop, inputs: Vec<Promise>) -> Promise {
        let output = Promise::new_in(looph);
        if inputs.is_empty() {
            output.settle(Settlement::Fulfilled(promise_value(
                Vec::<Settlement>::new(),
            )));
            return output;
        }

        let count = inputs.len();
        let outcomes = Arc::new(Mutex::new(vec![None::<Settlement>; count]));
        let remaining = Arc::new(AtomicUsize::new(count));

        for (index, input) in inputs.into_iter().enumerate() {
            let outcomes = Arc::clone(&outcomes);
            let remaining = Arc::clone(&remaining);
            let output = output.clone();
            input.subscribe_internal(move |settlement| {
                lock(&outcomes)[index] = Some(settlement);
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let records: Vec<Settlement> = lock(&outcomes)
                        .iter_mut()
                        .map(|slot| slot.take().expect("all slots filled"))
                        .collect();
                    output.settle(Settlement::Fulfilled(promise_value(records)));
                }
            });
        }
        output
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
