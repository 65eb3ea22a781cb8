// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Shared fixtures for the scenario test suites: a background-thread loop
//! runner and small wait helpers.

use std::{
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{CancelToken, EventLoop, LoopConfig, LoopError, RunOutcome};

/// Runs an [`EventLoop`] on a dedicated thread for the duration of a test.
///
/// Dropping the runner shuts the loop down and joins the thread, so a failed
/// assertion cannot leak a live loop into later tests.
pub struct LoopRunner {
    pub looph: EventLoop,
    pub cancel: CancelToken,
    thread: Option<JoinHandle<Result<RunOutcome, LoopError>>>,
}

impl LoopRunner {
    /// Starts a loop with default config.
    pub fn start() -> Self { Self::start_with(LoopConfig::default()) }

    /// Starts a loop with explicit config.
    pub fn start_with(config: LoopConfig) -> Self {
        let looph = EventLoop::with_config(config);
        let cancel = CancelToken::new();
        let run_handle = looph.clone();
        let run_cancel = cancel.clone();
        let thread = std::thread::Builder::new()
            .name("test-event-loop".into())
            .spawn(move || run_handle.run(run_cancel))
            .expect("spawn loop thread");
        Self { looph, cancel, thread: Some(thread) }
    }

    /// Requests shutdown and returns the run outcome.
    pub fn shutdown_and_join(mut self) -> Result<RunOutcome, LoopError> {
        self.looph
            .shutdown(Duration::from_secs(5))
            .expect("shutdown within deadline");
        self.thread
            .take()
            .expect("thread not yet joined")
            .join()
            .expect("loop thread panicked")
    }
}

impl Drop for LoopRunner {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _shutdown = self.looph.shutdown(Duration::from_secs(5));
            let _outcome = thread.join();
        }
    }
}

/// Polls `predicate` (1 ms cadence) until it holds or `timeout` elapses.
/// Returns whether it held.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    predicate()
}

/// Default patience for cross-thread assertions.
pub const PATIENCE: Duration = Duration::from_secs(5);
