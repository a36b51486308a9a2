//! Cross-thread wakeup of the blocked selector.
//!
//! Linux and Android use an `eventfd`, the kqueue platforms that support it
//! use an `EVFILT_USER` event, NetBSD and OpenBSD fall back to a pipe whose
//! read end is registered with the selector. In every case concurrent wakes
//! coalesce into a single readiness edge.

use crate::sys::Selector;
use crate::Token;

/// Waker backed by `eventfd`.
///
/// `eventfd` is effectively an 64 bit counter. All writes must be of 8
/// bytes (64 bits) and are converted (native endian) into an 64 bit
/// unsigned integer and added to the count. Reads must also be 8 bytes and
/// reset the count to 0, returning the count.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug)]
pub(crate) struct Waker {
    fd: std::fs::File,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Waker {
    pub(crate) fn new(selector: &Selector, token: Token) -> std::io::Result<Waker> {
        use std::os::fd::{AsRawFd, FromRawFd};

        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` ensures the fd is valid.
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        selector.register_waker(file.as_raw_fd(), token)?;
        Ok(Waker { fd: file })
    }

    #[allow(clippy::unused_io_amount)] // Don't care about partial writes.
    pub(crate) fn wake(&self) -> std::io::Result<()> {
        use std::io::Write;

        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter is going to overflow.
                // So we'll reset the counter to 0 and wake it again.
                self.ack();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Resets the counter so the next `wake` edges again.
    pub(crate) fn ack(&self) {
        use std::io::Read;

        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        // If no wake arrived since the last ack this returns `WouldBlock`,
        // which is fine.
        let _ = (&self.fd).read(&mut buf);
    }
}

/// Waker backed by kqueue's user event filter.
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos"
))]
#[derive(Debug)]
pub(crate) struct Waker {
    selector: Selector,
    token: Token,
}

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos"
))]
impl Waker {
    pub(crate) fn new(selector: &Selector, token: Token) -> std::io::Result<Waker> {
        let selector = selector.try_clone()?;
        selector.register_user_event(token)?;
        Ok(Waker { selector, token })
    }

    pub(crate) fn wake(&self) -> std::io::Result<()> {
        self.selector.trigger_user_event(self.token)
    }

    /// `EV_CLEAR` resets the user event on delivery.
    pub(crate) fn ack(&self) {}
}

/// Waker backed by a pipe; the read end is registered with the selector.
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
#[derive(Debug)]
pub(crate) struct Waker {
    sender: std::fs::File,
    receiver: std::fs::File,
}

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
impl Waker {
    pub(crate) fn new(selector: &Selector, token: Token) -> std::io::Result<Waker> {
        use std::os::fd::{AsRawFd, FromRawFd};

        let mut fds = [-1; 2];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
        // SAFETY: `pipe2(2)` ensures both fds are valid.
        let receiver = unsafe { std::fs::File::from_raw_fd(fds[0]) };
        let sender = unsafe { std::fs::File::from_raw_fd(fds[1]) };
        selector.register_waker(receiver.as_raw_fd(), token)?;
        Ok(Waker { sender, receiver })
    }

    #[allow(clippy::unused_io_amount)] // Don't care about partial writes.
    pub(crate) fn wake(&self) -> std::io::Result<()> {
        use std::io::Write;

        match (&self.sender).write(&[1]) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                // The reading end is full so we'll empty the buffer and then
                // write again.
                self.ack();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Empties the pipe so the next `wake` edges again.
    pub(crate) fn ack(&self) {
        use std::io::Read;

        let mut buf = [0u8; 4096];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}
