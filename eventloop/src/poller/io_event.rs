// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EPOLLERR EPOLLHUP

//! The abstract readiness bitmask. See [`IoEventSet`].

use bitflags::bitflags;

bitflags! {
    /// Readiness bits delivered to I/O callbacks, and (for `READ`/`WRITE`)
    /// requested at registration.
    ///
    /// `ERROR` and `HANGUP` are delivery-only: the OS reports them whether or
    /// not they were requested (the same way `EPOLLERR`/`EPOLLHUP` behave),
    /// so a registration's interest set must contain at least one of `READ`
    /// or `WRITE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IoEventSet: u8 {
        /// The fd is readable.
        const READ = 0b0001;
        /// The fd is writable.
        const WRITE = 0b0010;
        /// The fd is in an error state.
        const ERROR = 0b0100;
        /// The peer closed its end (read or write half).
        const HANGUP = 0b1000;
    }
}

impl IoEventSet {
    /// Translates the registerable bits to the platform interest set.
    ///
    /// Returns `None` when neither `READ` nor `WRITE` is present (nothing to
    /// register).
    #[must_use]
    pub(crate) fn to_mio_interest(self) -> Option<mio::Interest> {
        let mut interest: Option<mio::Interest> = None;
        if self.contains(Self::READ) {
            interest = Some(mio::Interest::READABLE);
        }
        if self.contains(Self::WRITE) {
            interest = Some(match interest {
                Some(it) => it | mio::Interest::WRITABLE,
                None => mio::Interest::WRITABLE,
            });
        }
        interest
    }

    /// Folds a surfaced platform event into the abstract bitmask. This is the
    /// only place platform readiness bits are interpreted.
    #[must_use]
    pub(crate) fn from_mio_event(event: &mio::event::Event) -> Self {
        let mut set = Self::empty();
        if event.is_readable() {
            set |= Self::READ;
        }
        if event.is_writable() {
            set |= Self::WRITE;
        }
        if event.is_error() {
            set |= Self::ERROR;
        }
        if event.is_read_closed() || event.is_write_closed() {
            set |= Self::HANGUP;
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_requires_read_or_write() {
        assert!(IoEventSet::empty().to_mio_interest().is_none());
        assert!(IoEventSet::ERROR.to_mio_interest().is_none());
        assert!((IoEventSet::ERROR | IoEventSet::HANGUP).to_mio_interest().is_none());

        assert_eq!(
            IoEventSet::READ.to_mio_interest(),
            Some(mio::Interest::READABLE)
        );
        assert_eq!(
            IoEventSet::WRITE.to_mio_interest(),
            Some(mio::Interest::WRITABLE)
        );
        assert_eq!(
            (IoEventSet::READ | IoEventSet::WRITE).to_mio_interest(),
            Some(mio::Interest::READABLE | mio::Interest::WRITABLE)
        );
        // Delivery-only bits are ignored at registration time.
        assert_eq!(
            (IoEventSet::READ | IoEventSet::ERROR).to_mio_interest(),
            Some(mio::Interest::READABLE)
        );
    }
}
