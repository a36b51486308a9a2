use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{cmp, ptr};

use crate::Token;

// Type of the `nchanges` and `nevents` parameters in the `kevent` function.
#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

// Type of the `flags` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Flags = libc::c_ushort;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Flags = u16;
#[cfg(target_os = "netbsd")]
type Flags = u32;

// Type of the `udata` field in the `kevent` structure.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $data: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags as Flags,
            fflags: 0,
            data: 0,
            udata: $data as UData,
        }
    };
}

#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        // SAFETY: `kqueue(2)` ensures the fd is valid.
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };
        syscall!(fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    /// The `EVFILT_USER` waker holds its own handle to the queue.
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos"
    ))]
    pub(crate) fn try_clone(&self) -> io::Result<Selector> {
        self.kq.try_clone().map(|kq| Selector { kq })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            // `Duration::subsec_nanos` is guaranteed to be less than one
            // billion, making the cast to i32 safe. The cast itself is
            // needed for platforms where C's long is only 32 bits.
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timeout = timeout
            .as_ref()
            .map(|s| s as *const _)
            .unwrap_or(ptr::null());

        events.clear();
        syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            events.as_mut_ptr(),
            events.capacity() as Count,
            timeout,
        ))
        .map(|n_events| {
            // SAFETY: `kevent` ensures that `n_events` are assigned.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    /// Registers a stream fd, edge-triggered, for both directions.
    pub(crate) fn register(&self, fd: RawFd, token: Token) -> io::Result<()> {
        let flags = libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT;
        let mut changes = [
            kevent!(fd, libc::EVFILT_READ, flags, token.0),
            kevent!(fd, libc::EVFILT_WRITE, flags, token.0),
        ];
        self.kevent_register(&mut changes)
    }

    /// Registers the waker fd, edge-triggered, read side only.
    #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
    pub(crate) fn register_waker(&self, fd: RawFd, token: Token) -> io::Result<()> {
        let flags = libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT;
        let mut changes = [kevent!(fd, libc::EVFILT_READ, flags, token.0)];
        self.kevent_register(&mut changes)
    }

    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos"
    ))]
    pub(crate) fn register_user_event(&self, token: Token) -> io::Result<()> {
        let flags = libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT;
        let mut changes = [kevent!(0, libc::EVFILT_USER, flags, token.0)];
        self.kevent_register(&mut changes)
    }

    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos"
    ))]
    pub(crate) fn trigger_user_event(&self, token: Token) -> io::Result<()> {
        let flags = libc::EV_ADD | libc::EV_RECEIPT;
        let mut changes = [kevent!(0, libc::EVFILT_USER, flags, token.0)];
        changes[0].fflags = libc::NOTE_TRIGGER;
        self.kevent_register(&mut changes)
    }

    fn kevent_register(&self, changes: &mut [libc::kevent]) -> io::Result<()> {
        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as Count,
            changes.as_mut_ptr(),
            changes.len() as Count,
            ptr::null(),
        ))
        .map(|_| ())?;

        for change in changes.iter() {
            // With `EV_RECEIPT` every change is echoed back with `EV_ERROR`
            // set and the failure, if any, in `data`.
            if (change.flags & libc::EV_ERROR) != 0 && change.data != 0 {
                return Err(io::Error::from_raw_os_error(change.data as i32));
            }
        }
        Ok(())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq.as_raw_fd()
    }
}

pub(crate) type Event = libc::kevent;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::Filter;
    use crate::sys::Event;
    use crate::Token;

    pub(crate) fn token(event: &Event) -> Token {
        Token(event.udata as usize)
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        event.filter == libc::EVFILT_READ as Filter || is_user(event)
    }

    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos"
    ))]
    fn is_user(event: &Event) -> bool {
        event.filter == libc::EVFILT_USER as Filter
    }

    #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
    fn is_user(_: &Event) -> bool {
        false
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        event.filter == libc::EVFILT_WRITE as Filter
    }

    pub(crate) fn is_error(event: &Event) -> bool {
        (event.flags & libc::EV_ERROR as super::Flags) != 0
    }
}
