// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The tick algorithm and the run state machine. See [`run_main_loop`].
//!
//! # Phase order (one tick)
//!
//! | Phase | Work | Freshness |
//! | :---- | :--- | :-------- |
//! | 1 | next-tick callbacks | batch taken at phase entry |
//! | 2 | expired timers, `(deadline, insertion id)` order | due-set snapshot at phase entry |
//! | 3 | external (cross-thread) drain | wholesale move under lock, run unlocked |
//! | 4 | internal (same-thread) drain | snapshot at phase entry |
//! | 5 | I/O readiness dispatch | events surfaced by the last poll |
//! | 6 | microtask drain | to exhaustion or budget; budget-hit posts a wake |
//! | 7 | block decision | sleep in gate or poller, or loop |
//!
//! Work scheduled *during* a phase lands behind that phase's snapshot: a
//! timer scheduled by a timer callback waits for the next tick; a `submit`
//! from a timer callback is caught by phase 3 of the same tick (the external
//! snapshot is taken after phase 2 completes). Microtasks are the exception
//! by design: anything phases 1–5 enqueue runs in phase 6 of the same tick.

use std::{
    cell::Cell,
    panic::{AssertUnwindSafe, catch_unwind},
    time::{Duration, Instant},
};

use super::{EventLoop, FastPathMode, LoopState, RunOutcome, event_loop::lock_mutex};
use crate::{CancelToken, LoopError, Task, TimerEntry};

/// Promise-registry scavenge cadence, in ticks.
const SCAVENGE_TICK_INTERVAL: u64 = 61;

thread_local! {
    /// Which loop (if any) owns this thread, and the execution context inside
    /// it. `0` = no loop bound.
    static RUN_CONTEXT: RunContext = const {
        RunContext {
            active_loop: Cell::new(0),
            timer_nesting: Cell::new(0),
            in_callback: Cell::new(false),
        }
    };
}

struct RunContext {
    active_loop: Cell<u64>,
    timer_nesting: Cell<u32>,
    in_callback: Cell<bool>,
}

/// `true` when the calling thread is `loop_id`'s owner thread.
pub(crate) fn is_owner_thread(loop_id: u64) -> bool {
    RUN_CONTEXT.with(|ctx| ctx.active_loop.get() == loop_id)
}

/// The timer nesting depth a `schedule_timer` on this thread inherits:
/// parent depth + 1 inside a timer callback, 0 everywhere else.
pub(crate) fn current_nesting(loop_id: u64) -> u32 {
    RUN_CONTEXT.with(|ctx| {
        if ctx.active_loop.get() == loop_id {
            ctx.timer_nesting.get()
        } else {
            0
        }
    })
}

/// `true` while a user callback is on the stack of the owner thread.
pub(crate) fn in_callback() -> bool {
    RUN_CONTEXT.with(|ctx| ctx.in_callback.get())
}

/// Executes a task inline (the `submit_internal` fast path), with the same
/// panic isolation as a queued task.
pub(crate) fn run_inline(task: impl FnOnce()) {
    guarded("inline task", task);
}

/// Binds the calling thread as owner of `loop_id` for the guard's lifetime.
/// Restores the previous binding on drop (nested loops on one thread keep
/// working).
struct OwnerGuard {
    previous: u64,
}

impl OwnerGuard {
    fn bind(loop_id: u64) -> Self {
        RUN_CONTEXT.with(|ctx| {
            let previous = ctx.active_loop.get();
            ctx.active_loop.set(loop_id);
            Self { previous }
        })
    }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        RUN_CONTEXT.with(|ctx| ctx.active_loop.set(self.previous));
    }
}

/// Reusable drain buffers — queues are moved wholesale into these and
/// executed with no lock held; capacity survives across ticks.
#[derive(Default)]
struct TickScratch {
    tasks: Vec<Task>,
    timers: Vec<TimerEntry>,
}

/// The run state machine: ticks until termination, then performs the
/// terminal drain. Called by [`EventLoop::run`] exactly once.
pub(crate) fn run_main_loop(handle: &EventLoop, cancel: &CancelToken) -> RunOutcome {
    let inner = handle.inner();

    if !inner.state.transition(LoopState::Awake, LoopState::Running) {
        // shutdown() raced in before the first tick: drain and report.
        finalize(handle);
        return RunOutcome::Drained;
    }

    let _owner = OwnerGuard::bind(inner.loop_id);
    {
        let wake_handle = handle.clone();
        cancel.install_wake(Box::new(move || wake_handle.wake()));
    }

    let mut scratch = TickScratch::default();
    let mut tick_seq: u64 = 0;

    let outcome = loop {
        if cancel.is_cancelled() {
            break RunOutcome::Cancelled;
        }
        if inner.state.get().is_terminal() {
            break RunOutcome::Drained;
        }

        tick_seq += 1;
        tick(handle, &mut scratch, tick_seq, false);

        if tick_seq % SCAVENGE_TICK_INTERVAL == 0 {
            inner.promises.scavenge(inner.config.scavenge_batch);
        }

        // Phase 7: block decision.
        if has_immediate_work(handle) {
            continue;
        }
        if cancel.is_cancelled() || inner.state.get().is_terminal() {
            continue; // Loop top turns these into the terminal break.
        }

        let timeout = sleep_timeout(handle);
        if !inner.state.transition(LoopState::Running, LoopState::Sleeping) {
            continue; // Termination raced in.
        }
        // Re-check after declaring Sleeping: submitters enqueue first, read
        // the state second, so either they see Sleeping (and wake us) or we
        // see their work here. A consumed pending signal also means skip.
        if has_immediate_work(handle)
            || inner.wake_signal.take_pending()
            || cancel.is_cancelled()
            || inner.state.get().is_terminal()
        {
            inner.state.transition(LoopState::Sleeping, LoopState::Running);
            continue;
        }

        block(handle, timeout);

        inner.wake_signal.consume();
        inner.state.transition(LoopState::Sleeping, LoopState::Running);
    };

    cancel.clear_wake();
    finalize(handle);
    outcome
}

/// The terminal sequence: one final drain (phases 1–6), then `Terminated`,
/// poller close, and rejection of every still-pending promise.
///
/// Idempotent across threads — exactly one caller performs it; the rest
/// return immediately (the termination gate tells waiters when it is done).
pub(crate) fn finalize(handle: &EventLoop) {
    let inner = handle.inner();
    if inner.finalized.swap(true, std::sync::atomic::Ordering::SeqCst) {
        return;
    }
    inner.state.request_termination();

    // The finalizing thread acts as owner for the drain (it either is the
    // run thread, or run() was never invoked).
    let _owner = OwnerGuard::bind(inner.loop_id);
    let mut scratch = TickScratch::default();
    tick(handle, &mut scratch, u64::MAX, true);
    inner.timers.clear();

    inner.state.force(LoopState::Terminated);
    if let Some(poller) = inner.poller.get() {
        poller.close();
    }

    // Reject everything still pending with the canonical termination reason.
    // Observers' channels are signaled; handler microtasks can no longer run
    // and are dropped.
    for pending in inner.promises.live_promises() {
        crate::reject_with_termination(&pending);
    }

    handle.mark_terminated();
    tracing::debug!(loop_id = inner.loop_id, "event loop terminated");
}

/// One tick: phases 1–6. `terminal` switches phase 3 to the closing drain
/// and phase 6 to drain-to-exhaustion (no later tick will come).
fn tick(handle: &EventLoop, scratch: &mut TickScratch, tick_seq: u64, terminal: bool) {
    let inner = handle.inner();

    if let Some(hook) = inner.hooks.before_tick() {
        guarded("before-tick hook", || hook(tick_seq));
    }

    // Phase 1: next-tick callbacks scheduled on the prior iteration.
    {
        if terminal {
            inner.next_tick.close_and_drain_into(&mut scratch.tasks);
        } else {
            inner.next_tick.drain_into(&mut scratch.tasks);
        }
        for task in scratch.tasks.drain(..) {
            run_task(task);
        }
    }

    // Phase 2: expired timers. The due-set is snapshotted at phase entry, so
    // timers scheduled by these callbacks wait for the next tick.
    {
        let now = Instant::now();
        inner.timers.take_expired(now, &mut scratch.timers);
        for entry in scratch.timers.drain(..) {
            run_timer(handle, entry, now);
        }
    }

    // Phase 3: external ingress. Wholesale move under the lock, execution
    // unlocked. The terminal tick closes the queue in the same critical
    // section, so a racing submit is either in this batch or refused.
    {
        if terminal {
            inner.ingress.close_and_drain_into(&mut scratch.tasks);
        } else {
            inner.ingress.drain_into(&mut scratch.tasks);
        }
        inner
            .overload_armed
            .store(true, std::sync::atomic::Ordering::SeqCst);
        for task in scratch.tasks.drain(..) {
            run_task(task);
        }
    }

    // Phase 4: internal queue snapshot.
    {
        if terminal {
            inner.internal.close_and_drain_into(&mut scratch.tasks);
        } else {
            inner.internal.drain_into(&mut scratch.tasks);
        }
        for task in scratch.tasks.drain(..) {
            run_task(task);
        }
    }

    // Phase 5: I/O readiness callbacks surfaced by the last poll.
    if let Some(poller) = inner.poller.get()
        && !poller.is_closed()
    {
        poller.dispatch(usize::MAX);
    }

    // Phase 6: microtasks, to exhaustion or budget. Hitting the budget with
    // a non-empty ring posts a wake so phase 7 loops instead of blocking.
    {
        let budget = if terminal {
            usize::MAX
        } else {
            inner.config.microtask_budget
        };
        let mut drained = 0;
        while drained < budget {
            let Some(microtask) = inner.microtasks.pop() else { break };
            guarded("microtask", microtask);
            drained += 1;
        }
        if !inner.microtasks.is_empty() {
            handle.wake();
        }
    }

    if let Some(hook) = inner.hooks.after_tick() {
        guarded("after-tick hook", || hook(tick_seq));
    }
}

/// Runs one expired timer: skip if tombstoned, execute with the nesting
/// context bumped, then re-arm (repeating) or retire (one-shot).
fn run_timer(handle: &EventLoop, entry: TimerEntry, fired_at: Instant) {
    let inner = handle.inner();
    if entry.record.is_cancelled() {
        return;
    }
    let Some(mut callback) = take_timer_callback(&entry) else {
        return;
    };

    RUN_CONTEXT.with(|ctx| {
        let depth = entry
            .record
            .nesting_depth
            .load(std::sync::atomic::Ordering::SeqCst);
        ctx.timer_nesting.set(depth + 1);
    });
    guarded("timer callback", || callback());
    RUN_CONTEXT.with(|ctx| ctx.timer_nesting.set(0));

    if entry.record.repeat.is_some() && !entry.record.is_cancelled() {
        *lock_mutex(&entry.record.callback) = Some(callback);
        let record = std::sync::Arc::clone(&entry.record);
        inner.timers.re_arm(record, fired_at);
    } else {
        inner.timers.retire(entry.record.id);
    }
}

fn take_timer_callback(entry: &TimerEntry) -> Option<crate::TimerCallback> {
    lock_mutex(&entry.record.callback).take()
}

/// Executes a queued task with panic isolation and queue-latency tracing.
fn run_task(task: Task) {
    let latency = task.enqueued_at.elapsed();
    if latency > Duration::from_secs(1) {
        tracing::debug!(?latency, "task spent a long time queued");
    }
    guarded("queued task", task.run);
}

/// The phase-boundary panic barrier: a panicking user callback is logged and
/// swallowed; the task is considered complete and the loop continues.
fn guarded(label: &str, f: impl FnOnce()) {
    let entered = RUN_CONTEXT.with(|ctx| {
        let previous = ctx.in_callback.get();
        ctx.in_callback.set(true);
        previous
    });
    let outcome = catch_unwind(AssertUnwindSafe(f));
    RUN_CONTEXT.with(|ctx| ctx.in_callback.set(entered));
    if outcome.is_err() {
        tracing::error!(label, "user callback panicked; loop continues");
    }
}

/// Anything runnable right now? All four queue checks are lock-free length
/// reads.
fn has_immediate_work(handle: &EventLoop) -> bool {
    let inner = handle.inner();
    if !inner.microtasks.is_empty()
        || !inner.ingress.is_empty()
        || !inner.next_tick.is_empty()
        || !inner.internal.is_empty()
    {
        return true;
    }
    inner
        .timers
        .next_deadline()
        .is_some_and(|deadline| deadline <= Instant::now())
}

/// Sleep bound for phase 7: time to the earliest live deadline, or forever.
fn sleep_timeout(handle: &EventLoop) -> Option<Duration> {
    handle
        .inner()
        .timers
        .next_deadline()
        .map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

/// Blocks in the fast-path gate (zero fds, mode permitting) or the OS
/// poller. Terminal poller failures flip the loop into termination.
fn block(handle: &EventLoop, timeout: Option<Duration>) {
    let inner = handle.inner();
    let use_gate = inner.fast_path.get() != FastPathMode::Disabled
        && handle.registered_fd_count() == 0;

    if use_gate {
        inner.wake_signal.wait_gate(timeout);
        return;
    }

    match inner.poller.get_or_init() {
        Ok(poller) => match poller.poll(timeout) {
            // Readiness (dispatched next tick, phase 5), wake, or timeout.
            Ok(_surfaced) => {}
            Err(LoopError::PollerClosed) => {
                tracing::error!("poller closed under a running loop; terminating");
                inner.state.request_termination();
            }
            Err(err) => {
                tracing::error!(error = %err, "poller failed; terminating");
                inner.state.request_termination();
            }
        },
        Err(err) => {
            // Cannot create the OS poller (fd exhaustion). Degrade to the
            // gate so timers and submissions keep working.
            tracing::error!(error = %err, "poller init failed; using wake gate");
            inner.wake_signal.wait_gate(timeout);
        }
    }
}
