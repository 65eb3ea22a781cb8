// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EINTR eventfd

//! The error taxonomy for the event loop, poller, and timer surfaces. See
//! [`LoopError`].

use std::time::Duration;

/// Everything that can go wrong at the public API boundary.
///
/// Each variant carries a dedicated [diagnostic code] and, where the failure is
/// actionable, help text. Infrastructure errors are returned to the submitter;
/// callback-thrown errors never surface here — they are reified as promise
/// rejection reasons instead (see [`PanicReason`]); loop-internal transients
/// (`EINTR`, spurious wakes) are retried and never escape.
///
/// [`PanicReason`]: crate::PanicReason
/// [diagnostic code]: miette::Diagnostic::code
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum LoopError {
    /// A submission arrived after the loop began terminating.
    ///
    /// Work handed to `submit*`/`schedule_*` after this point was **refused**,
    /// not silently dropped — the caller knows it never ran.
    #[error("Event loop is terminating or terminated; submission refused")]
    #[diagnostic(
        code(r3bl_eventloop::terminated),
        help(
            "The loop no longer accepts work once shutdown() has been called \
             or the cancel token has fired. Check the loop lifecycle in the \
             caller."
        )
    )]
    LoopTerminated,

    /// `run()` was invoked more than once, or on a loop that already
    /// terminated.
    #[error("Event loop run() may only be invoked once")]
    #[diagnostic(code(r3bl_eventloop::already_running))]
    AlreadyRunning,

    /// A strict cancellation named a timer id that is not pending.
    #[error("Timer {id} is not pending (already fired, cancelled, or unknown)")]
    #[diagnostic(code(r3bl_eventloop::timer_not_found))]
    TimerNotFound {
        /// The id that failed to resolve.
        id: u64,
    },

    /// The file descriptor is negative or beyond the platform ceiling.
    #[error("File descriptor {fd} is out of range (ceiling {ceiling})")]
    #[diagnostic(
        code(r3bl_eventloop::fd_out_of_range),
        help("Check that the fd is open and below the per-process limit (`ulimit -n`).")
    )]
    FdOutOfRange {
        /// The offending descriptor.
        fd: i32,
        /// The highest descriptor the poller accepts.
        ceiling: i32,
    },

    /// An operation named a file descriptor that is not registered.
    #[error("File descriptor {fd} is not registered with the poller")]
    #[diagnostic(code(r3bl_eventloop::fd_not_registered))]
    FdNotRegistered {
        /// The offending descriptor.
        fd: i32,
    },

    /// `register_fd` was called twice for the same descriptor.
    #[error("File descriptor {fd} is already registered with the poller")]
    #[diagnostic(
        code(r3bl_eventloop::fd_already_registered),
        help("Use modify_fd() to change the interest set of a registered fd.")
    )]
    FdAlreadyRegistered {
        /// The offending descriptor.
        fd: i32,
    },

    /// The poller was used after `close()`.
    #[error("Readiness poller has been closed")]
    #[diagnostic(code(r3bl_eventloop::poller_closed))]
    PollerClosed,

    /// Forced poller-bypass mode conflicts with registered file descriptors.
    ///
    /// Either `set_fast_path_mode(Forced)` found descriptors registered, or
    /// `register_fd` ran while the mode was `Forced`. See the mode-switch
    /// rollback protocol on [`FastPathMode`].
    ///
    /// [`FastPathMode`]: crate::FastPathMode
    #[error("Forced fast-path mode is incompatible with registered file descriptors")]
    #[diagnostic(
        code(r3bl_eventloop::fast_path_incompatible),
        help(
            "Unregister all fds before forcing the fast path, or leave the \
             mode on Auto and let eligibility be computed per tick."
        )
    )]
    FastPathIncompatible,

    /// The cancel token passed to `run()` fired.
    #[error("Event loop run was cancelled")]
    #[diagnostic(code(r3bl_eventloop::cancelled))]
    Cancelled,

    /// A deadline elapsed before the awaited condition held.
    #[error("Deadline of {deadline:?} elapsed before the loop finished draining")]
    #[diagnostic(
        code(r3bl_eventloop::deadline_exceeded),
        help(
            "The loop is still draining in-flight work. A longer deadline, or \
             a second shutdown() call, will wait for the same terminal drain."
        )
    )]
    DeadlineExceeded {
        /// The deadline that elapsed.
        deadline: Duration,
    },

    /// The OS refused a poller operation (registration, wake-channel
    /// creation).
    #[error("Poller OS operation failed")]
    #[diagnostic(
        code(r3bl_eventloop::poller_io),
        help("Check OS resource limits - use `ulimit -n` for file descriptors.")
    )]
    Io(#[source] std::io::Error),
}
