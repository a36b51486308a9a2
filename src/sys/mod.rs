//! OS specific readiness notifier implementations.
//!
//! The rest of the crate consumes a small contract from this module:
//! register an fd, block for a batch of `(token, readable?, writable?)`
//! events, and wake the blocked wait from another thread. Closed fds are
//! forgotten by the kernel on their own; there is no deregister call.

#[cfg(unix)]
pub(crate) mod unix;

#[cfg(unix)]
pub(crate) use self::unix::{event, Event, Events, Selector, Waker};
