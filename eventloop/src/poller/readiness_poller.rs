// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EINTR eventfd

//! The mio-backed readiness poller. See [`ReadinessPoller`] and
//! [`LazyPoller`].

use std::{
    collections::HashMap,
    os::fd::RawFd,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, OnceLock, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use mio::{Events, Poll, Token, Waker, unix::SourceFd};

use super::IoEventSet;
use crate::LoopError;

/// A readiness callback. Receives the surfaced [`IoEventSet`] bitmask. May
/// re-enter the loop, including unregistering its own fd.
pub type IoCallback = Arc<dyn Fn(IoEventSet) + Send + Sync + 'static>;

/// Highest accepted file descriptor. Registrations beyond this are refused
/// with [`LoopError::FdOutOfRange`] so the token space stays well clear of
/// [`WAKE_TOKEN`].
pub const FD_CEILING: RawFd = 1 << 20;

/// Token reserved for the wake channel.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Capacity of the per-poll event buffer.
const EVENTS_CAPACITY: usize = 1024;

/// The cross-platform readiness poller.
///
/// # Structure
///
/// ```text
/// mio::Poll (epoll fd / kqueue) ──owns──► Registry ──creates──► Waker
///        │                                    │
///        ▼                                    ▼
///   poll-driver mutex                  cloned registry
///   (owner thread only)             (register from any thread)
/// ```
///
/// - The **driver** (`Poll` + its event buffer) is locked only by the owner
///   thread for the duration of a blocking [`poll`].
/// - The **registry clone** serves `register`/`unregister`/`modify` from any
///   thread without touching the driver.
/// - The **waker** interrupts a blocked poll ([`wake`]); it is bound to this
///   `Poll` instance, which is why the two are created together.
/// - The **fd table** maps fd → interest + callback behind an [`RwLock`] that
///   is *never* held across a user callback ([`dispatch`] takes the `Arc`
///   out, drops the guard, then invokes).
///
/// # Contract notes
///
/// - `EINTR` is retried transparently inside [`poll`].
/// - [`close`] is idempotent; every operation after it returns
///   [`LoopError::PollerClosed`].
/// - Duplicate registration is an error; `modify` is the way to change an
///   interest set.
///
/// [`close`]: Self::close
/// [`dispatch`]: Self::dispatch
/// [`poll`]: Self::poll
/// [`wake`]: Self::wake
pub struct ReadinessPoller {
    driver: Mutex<PollDriver>,
    registry: mio::Registry,
    waker: Waker,
    fd_table: RwLock<HashMap<RawFd, FdEntry>>,
    /// Events surfaced by the last [`poll`] call, awaiting [`dispatch`].
    ///
    /// [`dispatch`]: Self::dispatch
    /// [`poll`]: Self::poll
    ready: Mutex<Vec<(RawFd, IoEventSet)>>,
    closed: AtomicBool,
}

struct PollDriver {
    poll: Poll,
    events: Events,
}

struct FdEntry {
    interest: IoEventSet,
    callback: IoCallback,
}

impl std::fmt::Debug for ReadinessPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessPoller")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ReadinessPoller {
    /// Creates the OS demultiplexer and its coupled wake channel.
    ///
    /// # Errors
    ///
    /// [`LoopError::Io`] when the OS refuses the epoll/kqueue fd, the
    /// registry clone, or the waker (eventfd / pipe).
    pub fn new() -> Result<Self, LoopError> {
        let poll = Poll::new().map_err(LoopError::Io)?;
        let registry = poll.registry().try_clone().map_err(LoopError::Io)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(LoopError::Io)?;
        Ok(Self {
            driver: Mutex::new(PollDriver {
                poll,
                events: Events::with_capacity(EVENTS_CAPACITY),
            }),
            registry,
            waker,
            fd_table: RwLock::new(HashMap::new()),
            ready: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Registers `fd` with the given interest set and callback.
    ///
    /// # Errors
    ///
    /// - [`LoopError::PollerClosed`] after [`close`].
    /// - [`LoopError::FdOutOfRange`] for negative fds or fds ≥ [`FD_CEILING`].
    /// - [`LoopError::FdAlreadyRegistered`] on duplicate registration.
    /// - [`LoopError::Io`] when the interest set has neither `READ` nor
    ///   `WRITE`, or the OS refuses the registration (entry rolled back).
    ///
    /// [`close`]: Self::close
    pub fn register(
        &self,
        fd: RawFd,
        interest: IoEventSet,
        callback: IoCallback,
    ) -> Result<(), LoopError> {
        self.check_open()?;
        check_fd_range(fd)?;
        let mio_interest = interest.to_mio_interest().ok_or_else(|| {
            LoopError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "interest set must contain READ or WRITE",
            ))
        })?;

        {
            let mut table = write_lock(&self.fd_table);
            if table.contains_key(&fd) {
                return Err(LoopError::FdAlreadyRegistered { fd });
            }
            table.insert(fd, FdEntry { interest, callback });
        }

        // Table first, OS second; roll the entry back if the OS refuses.
        let registered = self.registry.register(
            &mut SourceFd(&fd),
            Token(usize::try_from(fd).unwrap_or_default()),
            mio_interest,
        );
        if let Err(os_err) = registered {
            write_lock(&self.fd_table).remove(&fd);
            return Err(LoopError::Io(os_err));
        }
        Ok(())
    }

    /// Removes `fd` from the poller and drops its callback.
    ///
    /// Pending (surfaced, undispatched) events for the fd are discarded so a
    /// callback is never invoked after its unregistration returns.
    ///
    /// # Errors
    ///
    /// [`LoopError::PollerClosed`] / [`LoopError::FdNotRegistered`].
    pub fn unregister(&self, fd: RawFd) -> Result<(), LoopError> {
        self.check_open()?;
        let removed = write_lock(&self.fd_table).remove(&fd);
        if removed.is_none() {
            return Err(LoopError::FdNotRegistered { fd });
        }
        // The OS may have dropped the registration already (fd closed).
        if let Err(os_err) = self.registry.deregister(&mut SourceFd(&fd)) {
            tracing::debug!(fd, error = %os_err, "deregister after fd close");
        }
        lock_mutex(&self.ready).retain(|(ready_fd, _)| *ready_fd != fd);
        Ok(())
    }

    /// Replaces the interest set of a registered fd.
    ///
    /// # Errors
    ///
    /// [`LoopError::PollerClosed`] / [`LoopError::FdNotRegistered`] /
    /// [`LoopError::Io`].
    pub fn modify(&self, fd: RawFd, interest: IoEventSet) -> Result<(), LoopError> {
        self.check_open()?;
        let mio_interest = interest.to_mio_interest().ok_or_else(|| {
            LoopError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "interest set must contain READ or WRITE",
            ))
        })?;

        let mut table = write_lock(&self.fd_table);
        let Some(entry) = table.get_mut(&fd) else {
            return Err(LoopError::FdNotRegistered { fd });
        };
        self.registry
            .reregister(
                &mut SourceFd(&fd),
                Token(usize::try_from(fd).unwrap_or_default()),
                mio_interest,
            )
            .map_err(LoopError::Io)?;
        entry.interest = interest;
        Ok(())
    }

    /// Blocks until readiness, wake, or timeout (`None` = forever).
    ///
    /// Returns the number of fd events surfaced (0 on timeout or
    /// wake-channel-only wakeups). Surfaced events wait in the ready list for
    /// [`dispatch`]. `EINTR` is retried transparently.
    ///
    /// # Errors
    ///
    /// [`LoopError::PollerClosed`] after [`close`]; [`LoopError::Io`] on a
    /// non-transient OS failure.
    ///
    /// [`close`]: Self::close
    /// [`dispatch`]: Self::dispatch
    pub fn poll(&self, timeout: Option<Duration>) -> Result<usize, LoopError> {
        self.check_open()?;
        let mut guard = lock_mutex(&self.driver);
        let driver = &mut *guard;
        loop {
            match driver.poll.poll(&mut driver.events, timeout) {
                Ok(()) => break,
                // EINTR: retry transparently.
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(LoopError::Io(err)),
            }
        }

        let mut surfaced = 0;
        let mut ready = lock_mutex(&self.ready);
        for event in driver.events.iter() {
            if event.token() == WAKE_TOKEN {
                // Wake channel readiness: consumed here, not surfaced.
                continue;
            }
            let fd = i32::try_from(event.token().0).unwrap_or(-1);
            let set = IoEventSet::from_mio_event(event);
            if !set.is_empty() {
                ready.push((fd, set));
                surfaced += 1;
            }
        }
        Ok(surfaced)
    }

    /// Invokes stored callbacks for up to `n` events surfaced by the last
    /// [`poll`], in surfacing order.
    ///
    /// No poller lock is held while a callback runs, so callbacks may
    /// re-enter (`unregister` of their own fd included). A panicking callback
    /// is caught, logged, and counted as dispatched.
    ///
    /// Returns the number of events dispatched.
    ///
    /// [`poll`]: Self::poll
    pub fn dispatch(&self, n: usize) -> usize {
        let mut dispatched = 0;
        while dispatched < n {
            let Some((fd, set)) = ({
                let mut ready = lock_mutex(&self.ready);
                if ready.is_empty() { None } else { Some(ready.remove(0)) }
            }) else {
                break;
            };

            // Unregistered between surfacing and dispatch: skip silently.
            let callback = {
                let table = read_lock(&self.fd_table);
                table.get(&fd).map(|entry| Arc::clone(&entry.callback))
            };
            if let Some(callback) = callback {
                let outcome = catch_unwind(AssertUnwindSafe(|| callback(set)));
                if outcome.is_err() {
                    tracing::error!(fd, ?set, "I/O readiness callback panicked");
                }
            }
            dispatched += 1;
        }
        dispatched
    }

    /// Interrupts a blocked [`poll`].
    ///
    /// Idempotent and safe from any thread; calling it on a closed poller is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// [`LoopError::Io`] if the OS refuses the wake write.
    ///
    /// [`poll`]: Self::poll
    pub fn wake(&self) -> Result<(), LoopError> {
        if self.is_closed() {
            return Ok(());
        }
        self.waker.wake().map_err(LoopError::Io)
    }

    /// Closes the poller. Idempotent: the second call is a no-op returning
    /// ok. The epoll/kqueue fd itself is released when the poller drops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        write_lock(&self.fd_table).clear();
        lock_mutex(&self.ready).clear();
    }

    /// `true` once [`close`] has run.
    ///
    /// [`close`]: Self::close
    #[must_use]
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::SeqCst) }

    /// Number of currently registered fds.
    #[must_use]
    pub fn registered_count(&self) -> usize { read_lock(&self.fd_table).len() }

    /// The interest set a registered fd was last armed with.
    #[must_use]
    pub fn registered_interest(&self, fd: RawFd) -> Option<IoEventSet> {
        read_lock(&self.fd_table).get(&fd).map(|entry| entry.interest)
    }

    fn check_open(&self) -> Result<(), LoopError> {
        if self.is_closed() {
            return Err(LoopError::PollerClosed);
        }
        Ok(())
    }
}

fn check_fd_range(fd: RawFd) -> Result<(), LoopError> {
    if fd < 0 || fd >= FD_CEILING {
        return Err(LoopError::FdOutOfRange { fd, ceiling: FD_CEILING });
    }
    Ok(())
}

/// Lazy, single-fire poller initialization.
///
/// A loop with zero registered fds must never create the OS demultiplexer;
/// the first `register_fd` (or a `Disabled` fast-path mode reaching its first
/// sleep) initializes it exactly once, even under concurrent attempts: the
/// init mutex serializes creators, the [`OnceLock`] publishes the winner.
#[derive(Debug, Default)]
pub struct LazyPoller {
    cell: OnceLock<Arc<ReadinessPoller>>,
    init: Mutex<()>,
}

impl LazyPoller {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// The poller, if it has been initialized.
    #[must_use]
    pub fn get(&self) -> Option<&Arc<ReadinessPoller>> { self.cell.get() }

    /// The poller, initializing it on first call.
    ///
    /// # Errors
    ///
    /// [`LoopError::Io`] if OS resource creation fails (nothing is published;
    /// a later call may retry).
    pub fn get_or_init(&self) -> Result<Arc<ReadinessPoller>, LoopError> {
        if let Some(poller) = self.cell.get() {
            return Ok(Arc::clone(poller));
        }
        let _guard = lock_mutex(&self.init);
        // Double-check: another thread may have won while we waited.
        if let Some(poller) = self.cell.get() {
            return Ok(Arc::clone(poller));
        }
        let poller = Arc::new(ReadinessPoller::new()?);
        // Cannot fail: we hold the init lock and just re-checked.
        let _unused = self.cell.set(Arc::clone(&poller));
        Ok(poller)
    }

    /// `true` once the OS demultiplexer exists.
    #[must_use]
    pub fn is_initialized(&self) -> bool { self.cell.get().is_some() }
}

fn lock_mutex<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        os::{fd::AsRawFd, unix::net::UnixStream},
        sync::atomic::AtomicUsize,
    };

    fn nonblocking_pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn register_poll_dispatch_round_trip() {
        let poller = ReadinessPoller::new().unwrap();
        let (mut a, b) = nonblocking_pair();
        let fd = b.as_raw_fd();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        poller
            .register(
                fd,
                IoEventSet::READ,
                Arc::new(move |set| seen_clone.lock().unwrap().push(set)),
            )
            .unwrap();
        assert_eq!(poller.registered_count(), 1);

        a.write_all(b"x").unwrap();
        let surfaced = poller.poll(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(surfaced, 1);
        assert_eq!(poller.dispatch(usize::MAX), 1);

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains(IoEventSet::READ));

        let mut buf = [0u8; 1];
        b.try_clone().unwrap().read_exact(&mut buf).unwrap();

        poller.unregister(fd).unwrap();
        assert_eq!(poller.registered_count(), 0);
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let poller = ReadinessPoller::new().unwrap();
        let (_a, b) = nonblocking_pair();
        let fd = b.as_raw_fd();
        let noop: IoCallback = Arc::new(|_| {});

        poller.register(fd, IoEventSet::READ, Arc::clone(&noop)).unwrap();
        let second = poller.register(fd, IoEventSet::READ, noop);
        assert!(matches!(second, Err(LoopError::FdAlreadyRegistered { .. })));
    }

    #[test]
    fn modify_replaces_the_interest_set() {
        let poller = ReadinessPoller::new().unwrap();
        let (_a, b) = nonblocking_pair();
        let fd = b.as_raw_fd();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        // Start read-only: the idle socket surfaces nothing.
        poller
            .register(
                fd,
                IoEventSet::READ,
                Arc::new(move |set| seen_clone.lock().unwrap().push(set)),
            )
            .unwrap();
        poller.poll(Some(Duration::from_millis(20))).unwrap();
        poller.dispatch(usize::MAX);
        assert!(seen.lock().unwrap().is_empty());

        // Writable interest: an empty socket buffer is immediately ready.
        poller.modify(fd, IoEventSet::WRITE).unwrap();
        assert_eq!(poller.registered_interest(fd), Some(IoEventSet::WRITE));
        poller.poll(Some(Duration::from_secs(1))).unwrap();
        assert!(poller.dispatch(usize::MAX) >= 1);
        assert!(
            seen.lock()
                .unwrap()
                .iter()
                .any(|set| set.contains(IoEventSet::WRITE))
        );

        // Unknown fd is refused.
        assert!(matches!(
            poller.modify(fd + 1000, IoEventSet::READ),
            Err(LoopError::FdNotRegistered { .. })
        ));
    }

    #[test]
    fn unregister_twice_reports_not_registered() {
        let poller = ReadinessPoller::new().unwrap();
        let (_a, b) = nonblocking_pair();
        let fd = b.as_raw_fd();

        poller.register(fd, IoEventSet::READ, Arc::new(|_| {})).unwrap();
        poller.unregister(fd).unwrap();
        assert!(matches!(
            poller.unregister(fd),
            Err(LoopError::FdNotRegistered { .. })
        ));
    }

    #[test]
    fn out_of_range_fds_are_refused() {
        let poller = ReadinessPoller::new().unwrap();
        let err = poller.register(-1, IoEventSet::READ, Arc::new(|_| {}));
        assert!(matches!(err, Err(LoopError::FdOutOfRange { .. })));

        let err = poller.register(FD_CEILING, IoEventSet::READ, Arc::new(|_| {}));
        assert!(matches!(err, Err(LoopError::FdOutOfRange { .. })));
    }

    #[test]
    fn registration_without_read_or_write_is_refused() {
        let poller = ReadinessPoller::new().unwrap();
        let (_a, b) = nonblocking_pair();
        let err = poller.register(b.as_raw_fd(), IoEventSet::ERROR, Arc::new(|_| {}));
        assert!(matches!(err, Err(LoopError::Io(_))));
    }

    #[test]
    fn wake_interrupts_a_blocked_poll() {
        let poller = Arc::new(ReadinessPoller::new().unwrap());
        let poller_clone = Arc::clone(&poller);
        let waker_thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            poller_clone.wake().unwrap();
        });

        // No fds registered: only the wake can end this poll early.
        let surfaced = poller.poll(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(surfaced, 0);
        waker_thread.join().unwrap();
    }

    #[test]
    fn close_is_idempotent_and_fences_operations() {
        let poller = ReadinessPoller::new().unwrap();
        poller.close();
        poller.close();
        assert!(poller.is_closed());

        assert!(matches!(
            poller.poll(Some(Duration::ZERO)),
            Err(LoopError::PollerClosed)
        ));
        let (_a, b) = nonblocking_pair();
        assert!(matches!(
            poller.register(b.as_raw_fd(), IoEventSet::READ, Arc::new(|_| {})),
            Err(LoopError::PollerClosed)
        ));
        // wake() on a closed poller is a harmless no-op.
        poller.wake().unwrap();
    }

    #[test]
    fn callback_may_unregister_its_own_fd() {
        let poller = Arc::new(ReadinessPoller::new().unwrap());
        let (mut a, b) = nonblocking_pair();
        let fd = b.as_raw_fd();

        let poller_clone = Arc::clone(&poller);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        poller
            .register(
                fd,
                IoEventSet::READ,
                Arc::new(move |_| {
                    hits_clone.fetch_add(1, Ordering::SeqCst);
                    poller_clone.unregister(fd).unwrap();
                }),
            )
            .unwrap();

        a.write_all(b"x").unwrap();
        poller.poll(Some(Duration::from_secs(1))).unwrap();
        poller.dispatch(usize::MAX);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(poller.registered_count(), 0);
    }

    #[test]
    fn lazy_poller_initializes_once() {
        let lazy = Arc::new(LazyPoller::new());
        assert!(!lazy.is_initialized());
        assert!(lazy.get().is_none());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lazy = Arc::clone(&lazy);
            handles.push(std::thread::spawn(move || {
                Arc::as_ptr(&lazy.get_or_init().unwrap()) as usize
            }));
        }
        let addrs: Vec<usize> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
        assert!(lazy.is_initialized());
    }
}
