// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Timer scenarios: the nested-timeout clamp, repeat re-arm, and
//! cancellation from foreign threads.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    MIN_CLAMPED_DELAY,
    test_fixtures::{LoopRunner, PATIENCE, wait_until},
};

#[test]
fn recursive_zero_delay_timers_clamp_after_five_levels() {
    let runner = LoopRunner::start();
    let fire_times: Arc<Mutex<Vec<Instant>>> = Arc::default();

    fn chain(
        looph: &crate::EventLoop,
        fire_times: &Arc<Mutex<Vec<Instant>>>,
        remaining: u32,
    ) {
        if remaining == 0 {
            return;
        }
        let looph_inner = looph.clone();
        let fire_times = Arc::clone(fire_times);
        looph
            .schedule_timer(Duration::ZERO, move || {
                fire_times.lock().unwrap().push(Instant::now());
                chain(&looph_inner, &fire_times, remaining - 1);
            })
            .unwrap();
    }

    chain(&runner.looph, &fire_times, 7);
    assert!(wait_until(PATIENCE, || fire_times.lock().unwrap().len() == 7));

    let times = fire_times.lock().unwrap();
    let gaps: Vec<Duration> =
        times.windows(2).map(|pair| pair[1] - pair[0]).collect();

    // Chain depths: the first timer is depth 0, the seventh is depth 6. The
    // clamp engages at depth 5, i.e. the gaps before fires six and seven.
    assert!(
        gaps[4] >= MIN_CLAMPED_DELAY,
        "gap before sixth fire was {:?}",
        gaps[4]
    );
    assert!(
        gaps[5] >= MIN_CLAMPED_DELAY,
        "gap before seventh fire was {:?}",
        gaps[5]
    );
    // The unclamped prefix fires nearly back-to-back.
    for (n, gap) in gaps[..4].iter().enumerate() {
        assert!(
            *gap < MIN_CLAMPED_DELAY,
            "gap before fire {} unexpectedly clamped: {gap:?}",
            n + 2
        );
    }
}

#[test]
fn repeating_timer_fires_until_cancelled() {
    let runner = LoopRunner::start();
    let fires = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&fires);
    let id = runner
        .looph
        .schedule_repeating_timer(
            Duration::from_millis(1),
            Duration::from_millis(1),
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

    assert!(wait_until(PATIENCE, || fires.load(Ordering::SeqCst) >= 3));
    assert!(runner.looph.cancel_timer(id));

    let at_cancel = fires.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(20));
    let after = fires.load(Ordering::SeqCst);
    // At most one in-flight fire can land after cancel.
    assert!(after <= at_cancel + 1, "kept firing after cancel: {after}");
}

#[test]
fn cancel_from_a_foreign_thread_prevents_the_fire() {
    let runner = LoopRunner::start();
    let fired = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&fired);
    let id = runner
        .looph
        .schedule_timer(Duration::from_millis(50), move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let looph = runner.looph.clone();
    let canceller = std::thread::spawn(move || looph.cancel_timer(id));
    assert!(canceller.join().unwrap());

    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    // The id is gone: a second cancel reports not-live.
    assert!(!runner.looph.cancel_timer(id));
}

#[test]
fn timers_scheduled_from_a_foreign_thread_fire_in_schedule_order() {
    let runner = LoopRunner::start();
    let log: Arc<Mutex<Vec<u32>>> = Arc::default();

    // Same delay from a non-owner thread: insertion order must break ties.
    let looph = runner.looph.clone();
    let thread_log = Arc::clone(&log);
    std::thread::spawn(move || {
        for n in 0..5_u32 {
            let log = Arc::clone(&thread_log);
            looph
                .schedule_timer(Duration::from_millis(5), move || {
                    log.lock().unwrap().push(n);
                })
                .unwrap();
        }
    })
    .join()
    .unwrap();

    assert!(wait_until(PATIENCE, || log.lock().unwrap().len() == 5));
    assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn nested_depth_counter_resets_between_top_level_timers() {
    let runner = LoopRunner::start();
    let observed_depth = Arc::new(AtomicU32::new(u32::MAX));

    // A timer scheduled from a *task* (not a timer) must be depth 0: fires
    // with no clamp even after a deep chain ran earlier.
    let looph = runner.looph.clone();
    let depth_probe = Arc::clone(&observed_depth);
    runner
        .looph
        .submit(move || {
            let start = Instant::now();
            let probe = Arc::clone(&depth_probe);
            looph
                .schedule_timer(Duration::ZERO, move || {
                    let elapsed = start.elapsed();
                    // Encode "was it clamped" as 1/0.
                    probe.store(
                        u32::from(elapsed >= MIN_CLAMPED_DELAY),
                        Ordering::SeqCst,
                    );
                })
                .unwrap();
        })
        .unwrap();

    assert!(wait_until(PATIENCE, || {
        observed_depth.load(Ordering::SeqCst) != u32::MAX
    }));
    assert_eq!(observed_depth.load(Ordering::SeqCst), 0, "top-level timer clamped");
}

#[test]
fn timer_panic_is_swallowed_and_the_loop_continues() {
    let runner = LoopRunner::start();
    let survived = Arc::new(AtomicUsize::new(0));

    runner
        .looph
        .schedule_timer(Duration::ZERO, || panic!("timer panic"))
        .unwrap();

    let count = Arc::clone(&survived);
    runner
        .looph
        .schedule_timer(Duration::from_millis(5), move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert!(wait_until(PATIENCE, || survived.load(Ordering::SeqCst) == 1));
}
