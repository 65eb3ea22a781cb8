// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue

//! The public loop handle and its shared inner state. See [`EventLoop`].

use std::{
    os::fd::RawFd,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use super::{
    BackPressure, FastPathCell, FastPathMode, LoopConfig, LoopHooks, LoopState,
    LoopStateCell, OverloadHook, TickHook, WakeSignal, tick,
};
use crate::{
    CancelToken, IoCallback, IoEventSet, LazyPoller, LoopError, MicrotaskRing,
    MonotonicId, PromiseRegistry, RejectionHook, RejectionTracker, Task, TaskQueue,
    TimerId, TimerService,
};

/// Process-wide allocator for loop identities (used by the owner-thread
/// binding).
static LOOP_IDS: MonotonicId = MonotonicId::new();

/// How `run()` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum RunOutcome {
    /// `shutdown()` (or a terminal poller failure) requested termination;
    /// the terminal drain completed.
    Drained,
    /// The cancel token fired; the terminal drain completed.
    Cancelled,
}

/// A single-threaded, cooperatively-scheduled event loop with JavaScript
/// host scheduling semantics.
///
/// `EventLoop` is a cheaply cloneable handle: every clone refers to the same
/// loop. Submissions are accepted from any thread; **callbacks run on
/// exactly one thread** — the one that calls [`run`] (the *owner thread*).
///
/// # Lifecycle
///
/// ```text
/// EventLoop::new() ──► configure (hooks, fast-path mode)
///       │
///       ▼
/// run(cancel_token)        ← exactly once, on the owner thread
///       │  ticks until shutdown() / cancel
///       ▼
/// Terminating ─► terminal drain (phases 1–6 once) ─► Terminated
/// ```
///
/// Work submitted after `Terminating` is refused with
/// [`LoopError::LoopTerminated`] — a submission is either executed or
/// refused, never silently dropped.
///
/// # Ordering guarantees
///
/// - Within a tick: next-tick → timers → external → internal → I/O →
///   microtasks (see the [module docs] for the full phase table).
/// - Microtasks scheduled by any callback in phases 1–5 run in phase 6 of
///   the *same* tick.
/// - Across ticks: FIFO per source queue; timers by
///   `(deadline, insertion id)`.
///
/// [`run`]: Self::run
/// [module docs]: super
#[derive(Debug, Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

/// State shared by every handle to one loop.
#[derive(Debug)]
pub(crate) struct LoopInner {
    /// Identity for the thread-local owner binding.
    pub(crate) loop_id: u64,
    pub(crate) config: LoopConfig,
    pub(crate) state: LoopStateCell,

    // Work sources, in tick-phase order. The three task buffers share one
    // chunked-queue structure; they differ only in drain phase and producer.
    pub(crate) next_tick: TaskQueue,
    pub(crate) timers: TimerService,
    pub(crate) ingress: TaskQueue,
    pub(crate) internal: TaskQueue,
    pub(crate) poller: LazyPoller,
    pub(crate) microtasks: MicrotaskRing,

    // Fast path + wake discipline.
    pub(crate) fd_count: AtomicUsize,
    pub(crate) fast_path: FastPathCell,
    pub(crate) wake_signal: WakeSignal,

    // Promise engine attachment.
    pub(crate) promise_ids: MonotonicId,
    pub(crate) promises: PromiseRegistry,
    pub(crate) rejections: RejectionTracker,

    // Lifecycle one-shots.
    pub(crate) run_claimed: AtomicBool,
    pub(crate) finalized: AtomicBool,
    pub(crate) overload_armed: AtomicBool,
    pub(crate) hooks: LoopHooks,
    terminated: Mutex<bool>,
    terminated_condvar: Condvar,
}

impl Default for EventLoop {
    fn default() -> Self { Self::new() }
}

impl EventLoop {
    /// Creates a loop with default [`LoopConfig`].
    #[must_use]
    pub fn new() -> Self { Self::with_config(LoopConfig::default()) }

    /// Creates a loop with explicit tunables.
    #[must_use]
    pub fn with_config(config: LoopConfig) -> Self {
        Self {
            inner: Arc::new(LoopInner {
                loop_id: LOOP_IDS.next(),
                config,
                state: LoopStateCell::new(),
                next_tick: TaskQueue::new(),
                timers: TimerService::new(),
                ingress: TaskQueue::new(),
                internal: TaskQueue::new(),
                poller: LazyPoller::new(),
                microtasks: MicrotaskRing::new(),
                fd_count: AtomicUsize::new(0),
                fast_path: FastPathCell::new(),
                wake_signal: WakeSignal::new(),
                promise_ids: MonotonicId::new(),
                promises: PromiseRegistry::new(),
                rejections: RejectionTracker::new(),
                run_claimed: AtomicBool::new(false),
                finalized: AtomicBool::new(false),
                overload_armed: AtomicBool::new(true),
                hooks: LoopHooks::new(),
                terminated: Mutex::new(false),
                terminated_condvar: Condvar::new(),
            }),
        }
    }

    // ========================================================================
    // Submission surface
    // ========================================================================

    /// Enqueues `task` for execution on the owner thread (external ingress,
    /// tick phase 3). Callable from any thread; wakes a sleeping loop.
    ///
    /// # Errors
    ///
    /// [`LoopError::LoopTerminated`] once shutdown has begun.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<(), LoopError> {
        self.check_accepts()?;
        let queue_len = self.inner.ingress.push(Task::new(task))?;
        self.signal_overload_if_crossed(queue_len);
        self.wake_if_sleeping();
        Ok(())
    }

    /// Enqueues `task` on the same-thread internal queue (tick phase 4).
    ///
    /// Called from the owner thread inside a callback, with the fast path
    /// eligible and both cross-thread queues empty, the task executes
    /// **inline** (a latency optimization that cannot reorder queued work,
    /// because there is none). Called from any other thread, this falls back
    /// to [`submit`].
    ///
    /// # Errors
    ///
    /// [`LoopError::LoopTerminated`] once shutdown has begun.
    ///
    /// [`submit`]: Self::submit
    pub fn submit_internal(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), LoopError> {
        if !tick::is_owner_thread(self.inner.loop_id) {
            return self.submit(task);
        }
        self.check_accepts()?;
        if tick::in_callback()
            && self.fast_path_eligible()
            && self.inner.ingress.is_empty()
        {
            tick::run_inline(task);
            return Ok(());
        }
        self.inner.internal.push(Task::new(task))?;
        Ok(())
    }

    /// Pushes a microtask (tick phase 6 of the current or next tick).
    /// Callable from any thread; wakes a sleeping loop.
    ///
    /// # Errors
    ///
    /// [`LoopError::LoopTerminated`] once shutdown has begun — except on the
    /// owner thread during the terminal drain, where microtasks generated by
    /// draining work are still accepted so the final phase 6 can run them.
    pub fn schedule_microtask(
        &self,
        microtask: impl FnOnce() + Send + 'static,
    ) -> Result<(), LoopError> {
        let state = self.inner.state.get();
        let terminal_drain_exception = state == LoopState::Terminating
            && tick::is_owner_thread(self.inner.loop_id);
        if !state.accepts_work() && !terminal_drain_exception {
            return Err(LoopError::LoopTerminated);
        }
        self.inner.microtasks.push(Box::new(microtask));
        self.wake_if_sleeping();
        Ok(())
    }

    /// Schedules `task` for phase 1 of the **next** tick — before that
    /// tick's timers, I/O, and microtasks.
    ///
    /// # Errors
    ///
    /// [`LoopError::LoopTerminated`] once shutdown has begun.
    pub fn schedule_next_tick(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), LoopError> {
        self.check_accepts()?;
        self.inner.next_tick.push(Task::new(task))?;
        self.wake_if_sleeping();
        Ok(())
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Schedules a one-shot timer. When called from inside a timer callback,
    /// the new timer inherits an incremented nesting depth and the HTML5
    /// ≥ 5-depth 4 ms clamp applies.
    ///
    /// # Errors
    ///
    /// [`LoopError::LoopTerminated`] once shutdown has begun.
    pub fn schedule_timer(
        &self,
        delay: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerId, LoopError> {
        self.schedule_timer_impl(delay, None, Box::new(callback))
    }

    /// Schedules a repeating timer: first fire after `delay`, then every
    /// `interval` until cancelled.
    ///
    /// # Errors
    ///
    /// [`LoopError::LoopTerminated`] once shutdown has begun.
    pub fn schedule_repeating_timer(
        &self,
        delay: Duration,
        interval: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerId, LoopError> {
        self.schedule_timer_impl(delay, Some(interval), Box::new(callback))
    }

    fn schedule_timer_impl(
        &self,
        delay: Duration,
        repeat: Option<Duration>,
        callback: crate::TimerCallback,
    ) -> Result<TimerId, LoopError> {
        self.check_accepts()?;
        let nesting = tick::current_nesting(self.inner.loop_id);

        if tick::is_owner_thread(self.inner.loop_id) {
            return Ok(self.inner.timers.schedule(delay, repeat, nesting, callback));
        }

        // Heap mutations belong to the owner thread: allocate the record
        // here (synchronous id, deadline anchored now), route the heap push.
        let (id, entry) = self.inner.timers.create(delay, repeat, nesting, callback);
        let router = self.clone();
        match self.submit(move || router.inner.timers.enqueue(entry)) {
            Ok(()) => Ok(id),
            Err(err) => {
                self.inner.timers.retire(id);
                Err(err)
            }
        }
    }

    /// Cancels a pending timer. Returns `true` if the id was live. Callable
    /// from any thread, in any loop state.
    pub fn cancel_timer(&self, id: TimerId) -> bool { self.inner.timers.cancel(id) }

    // ========================================================================
    // File descriptors
    // ========================================================================

    /// Registers `fd` for readiness callbacks (tick phase 5).
    ///
    /// The first registration lazily creates the OS poller. The fd count is
    /// incremented *before* the OS registration and rolled back on failure,
    /// which is what lets the forced-fast-path protocol observe concurrent
    /// registrations (see [`FastPathMode`]).
    ///
    /// # Errors
    ///
    /// [`LoopError::LoopTerminated`], [`LoopError::FastPathIncompatible`]
    /// (mode is `Forced`), [`LoopError::FdOutOfRange`],
    /// [`LoopError::FdAlreadyRegistered`], or [`LoopError::Io`].
    pub fn register_fd(
        &self,
        fd: RawFd,
        events: IoEventSet,
        callback: impl Fn(IoEventSet) + Send + Sync + 'static,
    ) -> Result<(), LoopError> {
        self.check_accepts()?;
        if self.inner.fast_path.get() == FastPathMode::Forced {
            return Err(LoopError::FastPathIncompatible);
        }

        self.inner.fd_count.fetch_add(1, Ordering::SeqCst);

        // Forced may have won between the check above and the increment; the
        // re-check (after the increment) closes that window — one side always
        // observes the other.
        if self.inner.fast_path.get() == FastPathMode::Forced {
            self.inner.fd_count.fetch_sub(1, Ordering::SeqCst);
            return Err(LoopError::FastPathIncompatible);
        }

        let callback: IoCallback = Arc::new(callback);
        let registered = self
            .inner
            .poller
            .get_or_init()
            .and_then(|poller| poller.register(fd, events, callback));
        match registered {
            Ok(()) => {
                // Eligibility changed: a loop blocked on the gate must move
                // to the poller.
                self.wake();
                Ok(())
            }
            Err(err) => {
                self.inner.fd_count.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Unregisters `fd` and drops its callback.
    ///
    /// # Errors
    ///
    /// [`LoopError::FdNotRegistered`] / [`LoopError::PollerClosed`].
    pub fn unregister_fd(&self, fd: RawFd) -> Result<(), LoopError> {
        let Some(poller) = self.inner.poller.get() else {
            return Err(LoopError::FdNotRegistered { fd });
        };
        poller.unregister(fd)?;
        self.inner.fd_count.fetch_sub(1, Ordering::SeqCst);
        // Last fd removed: wake so the fast path may re-engage.
        self.wake();
        Ok(())
    }

    /// Replaces the interest set of a registered fd.
    ///
    /// # Errors
    ///
    /// [`LoopError::FdNotRegistered`] / [`LoopError::PollerClosed`] /
    /// [`LoopError::Io`].
    pub fn modify_fd(&self, fd: RawFd, events: IoEventSet) -> Result<(), LoopError> {
        let Some(poller) = self.inner.poller.get() else {
            return Err(LoopError::FdNotRegistered { fd });
        };
        poller.modify(fd, events)
    }

    /// Number of currently registered fds.
    #[must_use]
    pub fn registered_fd_count(&self) -> usize {
        self.inner.fd_count.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Fast path
    // ========================================================================

    /// Switches the poller-bypass mode using the optimistic
    /// check / swap / re-check-with-rollback protocol described on
    /// [`FastPathMode`].
    ///
    /// # Errors
    ///
    /// [`LoopError::FastPathIncompatible`] when `Forced` conflicts with
    /// registered fds (the previous mode is restored).
    pub fn set_fast_path_mode(&self, mode: FastPathMode) -> Result<(), LoopError> {
        // (i) Fail fast.
        if mode == FastPathMode::Forced && self.registered_fd_count() > 0 {
            return Err(LoopError::FastPathIncompatible);
        }
        // (ii) Optimistic swap.
        let previous = self.inner.fast_path.swap(mode);
        // (iii) Re-check; roll back if a registration slipped in.
        if mode == FastPathMode::Forced && self.registered_fd_count() > 0 {
            self.inner.fast_path.rollback(FastPathMode::Forced, previous);
            return Err(LoopError::FastPathIncompatible);
        }
        // Sleep routing may have changed.
        self.wake();
        Ok(())
    }

    /// The current poller-bypass mode.
    #[must_use]
    pub fn fast_path_mode(&self) -> FastPathMode { self.inner.fast_path.get() }

    /// The full fast-path eligibility predicate: mode permits it, no fds, no
    /// pending timers, and both task queues empty.
    #[must_use]
    pub fn fast_path_eligible(&self) -> bool {
        self.inner.fast_path.get() != FastPathMode::Disabled
            && self.registered_fd_count() == 0
            && !self.inner.timers.has_pending()
            && self.inner.internal.is_empty()
            && self.inner.ingress.is_empty()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Runs the loop on the calling thread until shutdown or cancellation.
    /// The calling thread becomes the owner thread: every callback the loop
    /// ever invokes runs here.
    ///
    /// # Errors
    ///
    /// [`LoopError::AlreadyRunning`] on a second call;
    /// [`LoopError::Cancelled`] when the token fired before the first tick
    /// (the run is refused without claiming the loop — a fresh token may
    /// still run it).
    pub fn run(&self, cancel: CancelToken) -> Result<RunOutcome, LoopError> {
        if cancel.is_cancelled() {
            return Err(LoopError::Cancelled);
        }
        if self.inner.run_claimed.swap(true, Ordering::SeqCst) {
            return Err(LoopError::AlreadyRunning);
        }
        Ok(tick::run_main_loop(self, &cancel))
    }

    /// Requests graceful termination and waits up to `deadline` for the
    /// terminal drain to finish.
    ///
    /// Idempotent: a second call (even concurrent) waits for the same drain
    /// and returns ok once it completes. If `run` was never invoked, the
    /// calling thread performs the terminal drain itself so accepted work is
    /// still executed rather than dropped.
    ///
    /// Called from *inside a loop callback* (owner thread), the request is
    /// recorded and the call returns immediately without waiting — the drain
    /// cannot complete while the caller is still on the loop's stack.
    ///
    /// # Errors
    ///
    /// [`LoopError::DeadlineExceeded`] when the drain outlives `deadline`
    /// (the drain itself keeps going; only the wait gives up).
    pub fn shutdown(&self, deadline: Duration) -> Result<(), LoopError> {
        self.inner.state.request_termination();
        if self.inner.run_claimed.swap(true, Ordering::SeqCst) {
            // A run thread exists (or ran): wake it to start the drain.
            self.wake();
        } else {
            // run() was never invoked: drain here.
            tick::finalize(self);
        }
        if tick::is_owner_thread(self.inner.loop_id)
            && self.inner.state.get() != LoopState::Terminated
        {
            return Ok(());
        }
        if self.wait_terminated(deadline) {
            Ok(())
        } else {
            Err(LoopError::DeadlineExceeded { deadline })
        }
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LoopState { self.inner.state.get() }

    /// The loop's tunables.
    #[must_use]
    pub fn config(&self) -> &LoopConfig { &self.inner.config }

    // ========================================================================
    // Hooks
    // ========================================================================

    /// Installs (or clears, with `None`) the unhandled-rejection callback.
    pub fn set_unhandled_rejection_hook(&self, hook: Option<RejectionHook>) {
        self.inner.rejections.set_hook(hook);
    }

    /// Installs (or clears) the overload callback, fired when the external
    /// queue crosses the configured threshold.
    pub fn set_overload_hook(&self, hook: Option<OverloadHook>) {
        self.inner.hooks.set_on_overload(hook);
    }

    /// Installs (or clears) the tick-entry test hook.
    pub fn set_before_tick_hook(&self, hook: Option<TickHook>) {
        self.inner.hooks.set_before_tick(hook);
    }

    /// Installs (or clears) the tick-exit test hook.
    pub fn set_after_tick_hook(&self, hook: Option<TickHook>) {
        self.inner.hooks.set_after_tick(hook);
    }

    // ========================================================================
    // Crate-internal plumbing
    // ========================================================================

    pub(crate) fn inner(&self) -> &LoopInner { &self.inner }

    pub(crate) fn next_promise_id(&self) -> u64 { self.inner.promise_ids.next() }

    pub(crate) fn promises(&self) -> &PromiseRegistry { &self.inner.promises }

    pub(crate) fn rejections(&self) -> &RejectionTracker { &self.inner.rejections }

    /// Delivers a wake over both legs, if none is outstanding.
    pub(crate) fn wake(&self) {
        if self.inner.wake_signal.request() {
            self.inner.wake_signal.notify_gate();
            if let Some(poller) = self.inner.poller.get()
                && let Err(err) = poller.wake()
            {
                tracing::warn!(error = %err, "poller wake failed");
            }
        }
    }

    /// The producer side of the wake discipline: touch the wake channel only
    /// when the loop is observably sleeping. (The loop's own pre-block
    /// re-check covers the race where it is *about* to sleep.)
    pub(crate) fn wake_if_sleeping(&self) {
        if self.inner.state.get() == LoopState::Sleeping {
            self.wake();
        }
    }

    fn check_accepts(&self) -> Result<(), LoopError> {
        if self.inner.state.get().accepts_work() {
            Ok(())
        } else {
            Err(LoopError::LoopTerminated)
        }
    }

    fn signal_overload_if_crossed(&self, queue_len: usize) {
        let threshold = self.inner.config.overload_threshold;
        if queue_len <= threshold {
            return;
        }
        // Fire once per crossing; phase 3's drain re-arms.
        if !self.inner.overload_armed.swap(false, Ordering::SeqCst) {
            return;
        }
        let pressure = BackPressure { queue_len, threshold };
        match self.inner.hooks.on_overload() {
            Some(hook) => {
                // A panicking overload hook must not corrupt the submitter.
                if catch_unwind(AssertUnwindSafe(|| hook(&pressure))).is_err() {
                    tracing::error!(%pressure, "overload hook panicked");
                }
            }
            None => tracing::warn!(%pressure, "event loop overloaded"),
        }
    }

    pub(crate) fn mark_terminated(&self) {
        let mut terminated = lock_mutex(&self.inner.terminated);
        *terminated = true;
        drop(terminated);
        self.inner.terminated_condvar.notify_all();
    }

    fn wait_terminated(&self, deadline: Duration) -> bool {
        let end = Instant::now() + deadline;
        let mut terminated = lock_mutex(&self.inner.terminated);
        while !*terminated {
            let now = Instant::now();
            if now >= end {
                return false;
            }
            let (guard, _timeout) = match self
                .inner
                .terminated_condvar
                .wait_timeout(terminated, end - now)
            {
                Ok(pair) => pair,
                Err(poisoned) => poisoned.into_inner(),
            };
            terminated = guard;
        }
        true
    }
}

pub(crate) fn lock_mutex<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
