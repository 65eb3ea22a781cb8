// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Tick-ordering scenarios: the microtask-before-macrotask guarantee, phase
//! order within a tick, and FIFO per source.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    time::Duration,
};

use pretty_assertions::assert_eq;

use crate::{
    LoopConfig,
    test_fixtures::{LoopRunner, PATIENCE, wait_until},
};

type Log = Arc<Mutex<Vec<String>>>;

fn log_entry(log: &Log, entry: &str) {
    log.lock().unwrap().push(entry.to_string());
}

#[test]
fn microtasks_run_before_a_zero_delay_timer() {
    let runner = LoopRunner::start();
    let log: Log = Arc::default();

    let task_log = Arc::clone(&log);
    let looph = runner.looph.clone();
    runner
        .looph
        .submit(move || {
            let log_a = Arc::clone(&task_log);
            looph
                .schedule_microtask(move || log_entry(&log_a, "microtask_a"))
                .unwrap();

            let log_t = Arc::clone(&task_log);
            looph
                .schedule_timer(Duration::ZERO, move || log_entry(&log_t, "timer"))
                .unwrap();

            let log_b = Arc::clone(&task_log);
            looph
                .schedule_microtask(move || log_entry(&log_b, "microtask_b"))
                .unwrap();
        })
        .unwrap();

    assert!(wait_until(PATIENCE, || log.lock().unwrap().len() == 3));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["microtask_a", "microtask_b", "timer"]
    );
}

#[test]
fn microtasks_scheduled_in_a_tick_run_in_that_same_tick() {
    let runner = LoopRunner::start();
    let current_tick = Arc::new(AtomicU64::new(0));
    let tick_of_task = Arc::new(AtomicU64::new(0));
    let tick_of_microtask = Arc::new(AtomicU64::new(0));

    let hook_tick = Arc::clone(&current_tick);
    runner
        .looph
        .set_before_tick_hook(Some(Arc::new(move |seq| {
            hook_tick.store(seq, Ordering::SeqCst);
        })));

    let looph = runner.looph.clone();
    let seen_by_task = Arc::clone(&current_tick);
    let record_task = Arc::clone(&tick_of_task);
    let seen_by_microtask = Arc::clone(&current_tick);
    let record_microtask = Arc::clone(&tick_of_microtask);
    runner
        .looph
        .submit(move || {
            record_task.store(seen_by_task.load(Ordering::SeqCst), Ordering::SeqCst);
            looph
                .schedule_microtask(move || {
                    record_microtask.store(
                        seen_by_microtask.load(Ordering::SeqCst),
                        Ordering::SeqCst,
                    );
                })
                .unwrap();
        })
        .unwrap();

    assert!(wait_until(PATIENCE, || {
        tick_of_microtask.load(Ordering::SeqCst) != 0
    }));
    assert_eq!(
        tick_of_task.load(Ordering::SeqCst),
        tick_of_microtask.load(Ordering::SeqCst),
        "microtask must run in the tick that scheduled it"
    );
}

#[test]
fn next_tick_callbacks_run_before_that_ticks_timers() {
    let runner = LoopRunner::start();
    let log: Log = Arc::default();

    let looph = runner.looph.clone();
    let task_log = Arc::clone(&log);
    runner
        .looph
        .submit(move || {
            // The microtask runs this tick; the next-tick callback and the
            // zero-delay timer both run next tick, phase 1 before phase 2.
            let log_t = Arc::clone(&task_log);
            looph
                .schedule_timer(Duration::ZERO, move || log_entry(&log_t, "timer"))
                .unwrap();
            let log_n = Arc::clone(&task_log);
            looph
                .schedule_next_tick(move || log_entry(&log_n, "next_tick"))
                .unwrap();
            let log_m = Arc::clone(&task_log);
            looph
                .schedule_microtask(move || log_entry(&log_m, "microtask"))
                .unwrap();
        })
        .unwrap();

    assert!(wait_until(PATIENCE, || log.lock().unwrap().len() == 3));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["microtask", "next_tick", "timer"]
    );
}

#[test]
fn external_submissions_preserve_fifo() {
    let runner = LoopRunner::start();
    let log: Log = Arc::default();

    for n in 0..100 {
        let log = Arc::clone(&log);
        runner
            .looph
            .submit(move || log_entry(&log, &format!("task{n}")))
            .unwrap();
    }

    assert!(wait_until(PATIENCE, || log.lock().unwrap().len() == 100));
    let expected: Vec<String> = (0..100).map(|n| format!("task{n}")).collect();
    assert_eq!(*log.lock().unwrap(), expected);
}

#[test]
fn submit_from_a_timer_callback_drains_in_the_same_tick() {
    let runner = LoopRunner::start();
    let current_tick = Arc::new(AtomicU64::new(0));
    let hook_tick = Arc::clone(&current_tick);
    runner
        .looph
        .set_before_tick_hook(Some(Arc::new(move |seq| {
            hook_tick.store(seq, Ordering::SeqCst);
        })));

    let timer_tick = Arc::new(AtomicU64::new(0));
    let submitted_tick = Arc::new(AtomicU64::new(0));

    let looph = runner.looph.clone();
    let seen_by_timer = Arc::clone(&current_tick);
    let record_timer = Arc::clone(&timer_tick);
    let seen_by_submitted = Arc::clone(&current_tick);
    let record_submitted = Arc::clone(&submitted_tick);
    runner
        .looph
        .schedule_timer(Duration::ZERO, move || {
            record_timer.store(seen_by_timer.load(Ordering::SeqCst), Ordering::SeqCst);
            let seen = Arc::clone(&seen_by_submitted);
            let record = Arc::clone(&record_submitted);
            // Phase 3 snapshots after phase 2 completes, so this lands in
            // the current tick's external drain.
            looph
                .submit(move || {
                    record.store(seen.load(Ordering::SeqCst), Ordering::SeqCst);
                })
                .unwrap();
        })
        .unwrap();

    assert!(wait_until(PATIENCE, || {
        submitted_tick.load(Ordering::SeqCst) != 0
    }));
    assert_eq!(
        timer_tick.load(Ordering::SeqCst),
        submitted_tick.load(Ordering::SeqCst)
    );
}

#[test]
fn submit_internal_executes_inline_when_fast_path_is_eligible() {
    let runner = LoopRunner::start();
    let (tx, rx) = mpsc::channel();

    let looph = runner.looph.clone();
    runner
        .looph
        .submit(move || {
            let ran_inline = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&ran_inline);
            looph
                .submit_internal(move || flag.store(true, Ordering::SeqCst))
                .unwrap();
            // Inline execution means the flag is already observable here,
            // before this callback returns.
            tx.send(ran_inline.load(Ordering::SeqCst)).unwrap();
        })
        .unwrap();

    let ran_inline = rx.recv_timeout(PATIENCE).unwrap();
    assert!(ran_inline, "eligible submit_internal should run re-entrantly");
}

#[test]
fn microtask_budget_spills_to_the_next_tick_without_blocking() {
    let runner = LoopRunner::start_with(LoopConfig::new().microtask_budget(4));
    let current_tick = Arc::new(AtomicU64::new(0));
    let hook_tick = Arc::clone(&current_tick);
    runner
        .looph
        .set_before_tick_hook(Some(Arc::new(move |seq| {
            hook_tick.store(seq, Ordering::SeqCst);
        })));

    let ticks_seen: Arc<Mutex<Vec<u64>>> = Arc::default();
    let looph = runner.looph.clone();
    let task_ticks = Arc::clone(&ticks_seen);
    let task_current = Arc::clone(&current_tick);
    runner
        .looph
        .submit(move || {
            for _ in 0..10 {
                let ticks = Arc::clone(&task_ticks);
                let current = Arc::clone(&task_current);
                looph
                    .schedule_microtask(move || {
                        ticks.lock().unwrap().push(current.load(Ordering::SeqCst));
                    })
                    .unwrap();
            }
        })
        .unwrap();

    assert!(wait_until(PATIENCE, || ticks_seen.lock().unwrap().len() == 10));
    let ticks = ticks_seen.lock().unwrap();
    let distinct: std::collections::BTreeSet<u64> = ticks.iter().copied().collect();
    assert!(
        distinct.len() >= 2,
        "budget 4 must split 10 microtasks across ticks, saw {ticks:?}"
    );
    // FIFO survives the budget boundary: tick numbers are non-decreasing.
    assert!(ticks.windows(2).all(|w| w[0] <= w[1]));
}
