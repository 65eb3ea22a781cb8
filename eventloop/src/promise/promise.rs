// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The promise state machine and chaining surface. See [`Promise`].

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicU8, Ordering},
    },
};

use smallvec::SmallVec;
use tokio::sync::oneshot;

use super::{
    HandlerFn, HandlerOutput, PanicReason, PromiseState, PromiseValue, RegistryRef,
    SelfResolutionError, Settlement, TerminationReason, promise_value,
};
use crate::EventLoop;

/// Capability to fulfill (or, via assimilation, chain) a pending promise.
/// Safe to invoke from any thread; only the first settlement wins.
pub type ResolveFn = Arc<dyn Fn(PromiseValue) + Send + Sync + 'static>;

/// Capability to reject a pending promise. Same rules as [`ResolveFn`].
pub type RejectFn = Arc<dyn Fn(PromiseValue) + Send + Sync + 'static>;

/// A Promise/A+-equivalent promise bound to one [`EventLoop`].
///
/// # State rules
///
/// The state word is written exactly once past `Pending` (compare-and-swap
/// under the per-promise lock); no observer ever sees `Fulfilled` become
/// `Rejected` or vice versa. Handlers attach while pending and are moved
/// out — and their microtasks enqueued — under the same lock that writes
/// the settlement, which is what makes the ordering guarantees hold:
///
/// - A handler registered strictly before `resolve`/`reject` returns is
///   invoked (as a microtask).
/// - A handler registered before settlement runs before a handler
///   registered after settlement.
///
/// # Threading
///
/// Attachment and settlement are safe from any thread; *handlers always
/// execute on the loop's owner thread* as microtasks, in phase 6 of the tick
/// that settles (or attaches to a settled) promise.
///
/// # Memory layout
///
/// The first handler lives inline (`SmallVec<[Handler; 1]>`) — the common
/// single-`then` chain allocates nothing for its handler list.
#[derive(Clone)]
pub struct Promise {
    inner: Arc<PromiseInner>,
}

/// Shared state of one promise.
pub struct PromiseInner {
    id: u64,
    state: AtomicU8,
    slots: Mutex<Slots>,
    /// The loop whose microtask ring orders this promise's handlers.
    looph: EventLoop,
    /// This promise's slot in the loop's registry (identity; reclaimed by
    /// the scavenger once the promise drops).
    registry_ref: OnceLock<RegistryRef>,
}

/// While pending: accumulated handlers and observer ports. After settlement:
/// the outcome. Guarded by the state word — the variant switches exactly
/// once.
enum Slots {
    Pending {
        handlers: SmallVec<[Handler; 1]>,
        ports: SmallVec<[oneshot::Sender<Settlement>; 1]>,
    },
    Settled(Settlement),
}

/// One attached reaction.
enum Handler {
    /// A `then` record: optional callbacks plus the chained promise they
    /// settle.
    Then {
        on_fulfilled: Option<HandlerFn>,
        on_rejected: Option<HandlerFn>,
        target: Promise,
    },
    /// An internal observer (combinators, adoption). Counts as handling the
    /// promise for rejection tracking.
    Subscribe(Box<dyn FnOnce(Settlement) + Send + 'static>),
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl std::fmt::Debug for PromiseInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromiseInner")
            .field("id", &self.id)
            .field("registry_ref", &self.registry_ref.get())
            .finish_non_exhaustive()
    }
}

impl PromiseInner {
    /// The loop-scoped promise id.
    pub(crate) fn id(&self) -> u64 { self.id }
}

impl Promise {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Creates a pending promise plus its settle capabilities.
    ///
    /// The capabilities are `Fn` and cloneable-by-`Arc`: call them from any
    /// thread, as often as you like — the first settlement wins, the rest
    /// are no-ops. Resolving with a value that is itself a [`Promise`]
    /// assimilates it (the new promise adopts its eventual state); resolving
    /// a promise with *itself* rejects with [`SelfResolutionError`].
    #[must_use]
    pub fn pending(looph: &EventLoop) -> (Self, ResolveFn, RejectFn) {
        let promise = Self::new_in(looph);
        let for_resolve = promise.clone();
        let resolve: ResolveFn =
            Arc::new(move |value| for_resolve.resolve_internal(value));
        let for_reject = promise.clone();
        let reject: RejectFn =
            Arc::new(move |reason| for_reject.reject_internal(reason));
        (promise, resolve, reject)
    }

    /// A promise already fulfilled with `value`.
    #[must_use]
    pub fn fulfilled(looph: &EventLoop, value: PromiseValue) -> Self {
        let promise = Self::new_in(looph);
        promise.settle(Settlement::Fulfilled(value));
        promise
    }

    /// A promise already rejected with `reason`. Like any rejection, it
    /// reports as unhandled unless a handler is attached before the check
    /// microtask runs.
    #[must_use]
    pub fn rejected(looph: &EventLoop, reason: PromiseValue) -> Self {
        let promise = Self::new_in(looph);
        promise.settle(Settlement::Rejected(reason));
        promise
    }

    pub(crate) fn new_in(looph: &EventLoop) -> Self {
        let inner = Arc::new(PromiseInner {
            id: looph.next_promise_id(),
            state: AtomicU8::new(PromiseState::Pending as u8),
            slots: Mutex::new(Slots::Pending {
                handlers: SmallVec::new(),
                ports: SmallVec::new(),
            }),
            looph: looph.clone(),
            registry_ref: OnceLock::new(),
        });
        let reference = looph.promises().insert(Arc::downgrade(&inner));
        let _unused = inner.registry_ref.set(reference);
        Self { inner }
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// The promise's loop-scoped id.
    #[must_use]
    pub fn id(&self) -> u64 { self.inner.id }

    /// Current state (racy by nature; settlement is still write-once).
    #[must_use]
    pub fn state(&self) -> PromiseState {
        PromiseState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// The fulfillment value, if already fulfilled.
    #[must_use]
    pub fn value(&self) -> Option<PromiseValue> {
        match &*lock_slots(&self.inner) {
            Slots::Settled(Settlement::Fulfilled(value)) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    /// The rejection reason, if already rejected.
    #[must_use]
    pub fn reason(&self) -> Option<PromiseValue> {
        match &*lock_slots(&self.inner) {
            Slots::Settled(Settlement::Rejected(reason)) => Some(Arc::clone(reason)),
            _ => None,
        }
    }

    /// A single-slot observer port: receives the eventual [`Settlement`] and
    /// closes. Called after settlement, the port arrives pre-filled.
    ///
    /// Unlike [`then`], a port does **not** count as handling a rejection.
    ///
    /// [`then`]: Self::then
    #[must_use]
    pub fn to_channel(&self) -> oneshot::Receiver<Settlement> {
        let (tx, rx) = oneshot::channel();
        let mut guard = lock_slots(&self.inner);
        match &mut *guard {
            Slots::Pending { ports, .. } => ports.push(tx),
            Slots::Settled(settlement) => {
                let settlement = settlement.clone();
                drop(guard);
                let _receiver_gone = tx.send(settlement);
            }
        }
        rx
    }

    // ========================================================================
    // Chaining
    // ========================================================================

    /// Attaches fulfillment/rejection handlers; returns the chained promise.
    ///
    /// Missing handlers propagate: no `on_fulfilled` forwards the value to
    /// the chained promise, no `on_rejected` forwards the reason. A handler
    /// that panics settles the chained promise with a [`PanicReason`]. A
    /// handler returning [`HandlerOutput::Thenable`] makes the chained
    /// promise adopt that promise's eventual state.
    pub fn then(
        &self,
        on_fulfilled: Option<HandlerFn>,
        on_rejected: Option<HandlerFn>,
    ) -> Self {
        let target = Self::new_in(&self.inner.looph);
        self.attach(Handler::Then {
            on_fulfilled,
            on_rejected,
            target: target.clone(),
        });
        target
    }

    /// `then(None, Some(on_rejected))`.
    pub fn catch(&self, on_rejected: HandlerFn) -> Self {
        self.then(None, Some(on_rejected))
    }

    /// Runs `cleanup` on either outcome, passing the settlement through: the
    /// chained promise fulfills with the same value or re-rejects with the
    /// same reason.
    pub fn finally(&self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        let shared = Arc::new(Mutex::new(Some(cleanup)));
        let looph = self.inner.looph.clone();

        let for_fulfilled = Arc::clone(&shared);
        let on_fulfilled: HandlerFn = Box::new(move |value| {
            run_cleanup(&for_fulfilled);
            HandlerOutput::Value(value)
        });
        let for_rejected = shared;
        let on_rejected: HandlerFn = Box::new(move |reason| {
            run_cleanup(&for_rejected);
            // Re-raise: hand the chained promise an already-rejected input.
            HandlerOutput::Thenable(Promise::rejected_quietly(&looph, reason))
        });
        self.then(Some(on_fulfilled), Some(on_rejected))
    }

    /// Internal observer attachment (combinators, adoption, host glue).
    /// Counts as handling a rejection.
    pub(crate) fn subscribe_internal(
        &self,
        observer: impl FnOnce(Settlement) + Send + 'static,
    ) {
        self.attach(Handler::Subscribe(Box::new(observer)));
    }

    fn attach(&self, handler: Handler) {
        let tracker = self.inner.looph.rejections();
        let mut guard = lock_slots(&self.inner);
        match &mut *guard {
            Slots::Pending { handlers, .. } => {
                handlers.push(handler);
                tracker.note_handler_attached(self.id(), true);
            }
            Slots::Settled(settlement) => {
                // Late attachment: run directly as a microtask.
                let settlement = settlement.clone();
                drop(guard);
                tracker.note_handler_attached(self.id(), false);
                let enqueued = self
                    .inner
                    .looph
                    .schedule_microtask(move || run_handler(handler, settlement));
                if enqueued.is_err() {
                    tracing::debug!(
                        promise = self.id(),
                        "handler attached after loop termination; dropped"
                    );
                }
            }
        }
    }

    // ========================================================================
    // Settlement
    // ========================================================================

    /// The resolve capability: assimilates promise values, detects
    /// self-resolution, otherwise fulfills.
    pub(crate) fn resolve_internal(&self, value: PromiseValue) {
        if let Some(thenable) = value.downcast_ref::<Promise>() {
            if thenable.id() == self.id() {
                self.reject_internal(promise_value(SelfResolutionError));
            } else {
                self.adopt(thenable.clone());
            }
            return;
        }
        self.settle(Settlement::Fulfilled(value));
    }

    /// The reject capability.
    pub(crate) fn reject_internal(&self, reason: PromiseValue) {
        self.settle(Settlement::Rejected(reason));
    }

    /// Adopts `source`'s eventual state (Promise/A+ §2.3.2).
    pub(crate) fn adopt(&self, source: Promise) {
        let target = self.clone();
        source.subscribe_internal(move |settlement| match settlement {
            // Re-resolve so a thenable chain collapses link by link.
            Settlement::Fulfilled(value) => target.resolve_internal(value),
            Settlement::Rejected(reason) => target.reject_internal(reason),
        });
    }

    /// The single settlement point. Returns `true` if this call won the
    /// write-once race.
    pub(crate) fn settle(&self, settlement: Settlement) -> bool {
        let mut guard = lock_slots(&self.inner);
        if matches!(&*guard, Slots::Settled(_)) {
            return false;
        }
        let previous =
            std::mem::replace(&mut *guard, Slots::Settled(settlement.clone()));
        let Slots::Pending { handlers, ports } = previous else {
            unreachable!("checked pending above");
        };

        // The write-once transition. Under the lock, so it cannot fail.
        let transition = self.inner.state.compare_exchange(
            PromiseState::Pending as u8,
            settlement.state() as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        debug_assert!(transition.is_ok(), "promise state written twice");

        // Pre-existing handlers enqueue while the lock is held: nothing can
        // slot a microtask between them and the settlement they saw.
        for handler in handlers {
            let for_handler = settlement.clone();
            if self
                .inner
                .looph
                .schedule_microtask(move || run_handler(handler, for_handler))
                .is_err()
            {
                tracing::debug!(
                    promise = self.inner.id,
                    "loop terminated; settled handler dropped"
                );
            }
        }
        drop(guard);

        // Observer ports are fire-and-close.
        for port in ports {
            let _receiver_gone = port.send(settlement.clone());
        }

        match &settlement {
            Settlement::Fulfilled(_) => {
                self.inner.looph.rejections().cleanup(self.inner.id);
            }
            Settlement::Rejected(reason) => {
                self.schedule_rejection_check(Arc::clone(reason));
            }
        }
        true
    }

    /// Schedules the unhandled-rejection check microtask. It runs after
    /// every handler microtask enqueued above, consults the handler map, and
    /// — for a `then` still racing in from another thread — waits a bounded
    /// interval on the handler-ready channel before reporting.
    fn schedule_rejection_check(&self, reason: PromiseValue) {
        let looph = self.inner.looph.clone();
        let tracker = looph.rejections();
        let id = self.inner.id;
        let ready = tracker.note_rejected(id, reason);
        let wait = looph.config().handler_ready_wait;
        let check_loop = looph.clone();
        let enqueued = looph.schedule_microtask(move || {
            let tracker = check_loop.rejections();
            if tracker.is_handled(id) {
                tracker.cleanup(id);
                return;
            }
            // Bounded wait for a handler racing the rejection.
            if ready.recv_timeout(wait).is_ok() || tracker.is_handled(id) {
                tracker.cleanup(id);
                return;
            }
            let Some(reason) = tracker.take_unhandled(id) else {
                tracker.cleanup(id);
                return;
            };
            tracker.cleanup(id);
            match tracker.hook() {
                Some(hook) => {
                    if catch_unwind(AssertUnwindSafe(|| hook(Arc::clone(&reason))))
                        .is_err()
                    {
                        tracing::error!(
                            promise = id,
                            "unhandled-rejection hook panicked"
                        );
                    }
                }
                None => tracing::warn!(promise = id, "unhandled promise rejection"),
            }
        });
        if enqueued.is_err() {
            tracker.cleanup(id);
        }
    }

    /// A rejected promise that does not participate in unhandled-rejection
    /// reporting — used where the rejection is about to be consumed by
    /// construction (e.g. `finally` re-raising).
    fn rejected_quietly(looph: &EventLoop, reason: PromiseValue) -> Self {
        let promise = Self::new_in(looph);
        promise.inner.looph.rejections().note_handler_attached(promise.id(), true);
        promise.settle(Settlement::Rejected(reason));
        promise
    }
}

/// Applies one settled handler record. Runs as a microtask on the owner
/// thread.
fn run_handler(handler: Handler, settlement: Settlement) {
    match handler {
        Handler::Then { on_fulfilled, on_rejected, target } => match settlement {
            Settlement::Fulfilled(value) => match on_fulfilled {
                Some(callback) => apply_handler(callback, value, &target),
                // Nil handler: the value propagates.
                None => {
                    let _won = target.settle(Settlement::Fulfilled(value));
                }
            },
            Settlement::Rejected(reason) => match on_rejected {
                Some(callback) => apply_handler(callback, reason, &target),
                // Nil handler: the reason propagates.
                None => {
                    let _won = target.settle(Settlement::Rejected(reason));
                }
            },
        },
        Handler::Subscribe(observer) => {
            if catch_unwind(AssertUnwindSafe(|| observer(settlement))).is_err() {
                tracing::error!("internal promise observer panicked");
            }
        }
    }
}

/// Invokes a user handler with panic capture and thenable adoption.
fn apply_handler(callback: HandlerFn, input: PromiseValue, target: &Promise) {
    match catch_unwind(AssertUnwindSafe(move || callback(input))) {
        Ok(HandlerOutput::Value(value)) => target.resolve_internal(value),
        Ok(HandlerOutput::Thenable(thenable)) => target.adopt(thenable),
        Err(payload) => {
            let reason = PanicReason::from_payload(payload.as_ref());
            target.reject_internal(promise_value(reason));
        }
    }
}

fn run_cleanup<F: FnOnce()>(slot: &Mutex<Option<F>>) {
    let cleanup = match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(cleanup) = cleanup {
        cleanup();
    }
}

/// Terminal sweep helper: rejects a still-pending promise with the canonical
/// termination reason. Called by the loop's finalizer for every live
/// registry entry.
pub(crate) fn reject_with_termination(inner: &Arc<PromiseInner>) {
    let promise = Promise { inner: Arc::clone(inner) };
    if promise.state() == PromiseState::Pending {
        // Suppress unhandled-rejection reporting: the loop is gone, there is
        // nobody left to handle anything.
        promise
            .inner
            .looph
            .rejections()
            .note_handler_attached(promise.id(), true);
        promise.settle(Settlement::Rejected(promise_value(TerminationReason)));
    }
}

fn lock_slots(inner: &PromiseInner) -> std::sync::MutexGuard<'_, Slots> {
    match inner.slots.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
