// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Unhandled-rejection bookkeeping. See [`RejectionTracker`].

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, mpsc},
};

use super::PromiseValue;

/// The unhandled-rejection callback. Receives the rejection reason.
pub type RejectionHook = Arc<dyn Fn(PromiseValue) + Send + Sync + 'static>;

/// Per-loop bookkeeping that decides, one microtask after each rejection,
/// whether anybody is handling it.
///
/// # The race this exists for
///
/// `reject()` on thread X and `catch()` on thread Y can be simultaneous. The
/// decision cannot be made at signal time — only at check time, and even
/// then a handler may be *in flight*. Three mechanisms stack up:
///
/// 1. Handler microtasks enqueued before `reject` returned run **before**
///    the check microtask (the settle path enqueues them first, under the
///    promise lock).
/// 2. Handlers attached after the rejection mark `has_handler` directly; the
///    check consults the map at run time, not signal time.
/// 3. For a `then` still racing when the check runs, the check waits —
///    bounded — on the promise's handler-ready channel before declaring the
///    rejection unhandled.
///
/// Entries are scoped: `note_handler_attached` records an id only while the
/// promise is pending or a rejection record is active, and every path ends
/// in [`cleanup`], so the maps do not grow with promise count.
///
/// [`cleanup`]: Self::cleanup
#[derive(Default)]
pub struct RejectionTracker {
    state: Mutex<TrackerState>,
    hook: Mutex<Option<RejectionHook>>,
}

#[derive(Default)]
struct TrackerState {
    /// Rejected promises whose check has not completed: id → reason.
    unhandled: HashMap<u64, PromiseValue>,
    /// Promises known to have at least one handler attached.
    has_handler: HashSet<u64>,
    /// Handler-ready senders for in-flight checks: id → sender.
    ready: HashMap<u64, mpsc::Sender<()>>,
}

impl std::fmt::Debug for RejectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RejectionTracker").finish_non_exhaustive()
    }
}

impl RejectionTracker {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Installs (or clears) the unhandled-rejection callback.
    pub fn set_hook(&self, hook: Option<RejectionHook>) {
        *lock(&self.hook) = hook;
    }

    #[must_use]
    pub fn hook(&self) -> Option<RejectionHook> { lock(&self.hook).clone() }

    /// Records a rejection and opens its handler-ready channel. Returns the
    /// receiver the check microtask will wait on.
    pub fn note_rejected(&self, id: u64, reason: PromiseValue) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel();
        let mut state = lock(&self.state);
        state.unhandled.insert(id, reason);
        state.ready.insert(id, tx);
        rx
    }

    /// Records that a handler was attached to promise `id`.
    ///
    /// `promise_pending` scopes the record: for an id with no active
    /// rejection record, the attachment is remembered only while the promise
    /// is still pending (a later rejection will consult it); attachments to
    /// long-settled promises are ignored so the map stays bounded.
    pub fn note_handler_attached(&self, id: u64, promise_pending: bool) {
        let mut state = lock(&self.state);
        let rejection_active =
            state.unhandled.contains_key(&id) || state.ready.contains_key(&id);
        if rejection_active || promise_pending {
            state.has_handler.insert(id);
        }
        if let Some(tx) = state.ready.get(&id) {
            // Receiver gone (check finished) is fine; the map insert above
            // already recorded the attachment.
            let _unused = tx.send(());
        }
    }

    /// `true` when a handler has been recorded for `id`.
    #[must_use]
    pub fn is_handled(&self, id: u64) -> bool {
        lock(&self.state).has_handler.contains(&id)
    }

    /// Takes the recorded reason for `id`, if its check is still active.
    #[must_use]
    pub fn take_unhandled(&self, id: u64) -> Option<PromiseValue> {
        lock(&self.state).unhandled.remove(&id)
    }

    /// Drops every record for `id`. Terminal step of both check outcomes and
    /// of fulfillment.
    pub fn cleanup(&self, id: u64) {
        let mut state = lock(&self.state);
        state.unhandled.remove(&id);
        state.has_handler.remove(&id);
        state.ready.remove(&id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
