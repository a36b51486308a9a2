//! Caller-side stream handles and their reclamation hook.

use std::fmt;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::watcher::Inner;

/// Stable identity of a live [`Handle`].
///
/// Identities come from a process-wide counter and are never reused, so a
/// reclamation notice can never be misread as referring to a younger handle.
/// The kernel fd number is deliberately not used as a key; fd numbers are
/// recycled.
pub(crate) type HandleId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A connected byte stream, registered lazily with a watcher.
///
/// `Handle::new` consumes the stream object; the first submission against
/// the handle moves the underlying fd into the watcher, which works on a
/// duplicate from then on. Clones are cheap and share the identity.
///
/// Dropping the last clone notifies the watcher, which releases the fd and
/// drops any requests still queued against it — the same effect as
/// [`free`], just asynchronous. The watcher itself keeps no strong
/// reference to a handle, so abandoning one is always detected.
///
/// [`free`]: crate::Watcher::free
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    id: HandleId,
    fd: Mutex<Option<OwnedFd>>,
    hook: OnceLock<Weak<Inner>>,
}

impl Handle {
    /// Wraps a connected stream, for example a `std::net::TcpStream` or
    /// `UnixStream`.
    ///
    /// The stream object is consumed. Its fd stays open until the handle is
    /// first submitted to a watcher; the watcher then duplicates it, closes
    /// the original, and performs all I/O on the duplicate.
    pub fn new<S: IntoRawFd>(stream: S) -> Handle {
        // SAFETY: `into_raw_fd` transfers ownership of a valid open fd.
        let fd = unsafe { OwnedFd::from_raw_fd(stream.into_raw_fd()) };
        Handle {
            shared: Arc::new(Shared {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                fd: Mutex::new(Some(fd)),
                hook: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn id(&self) -> HandleId {
        self.shared.id
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Handle {
        Handle { shared }
    }

    /// Points the drop notification at `inner`; only the first submission
    /// decides, later watchers are ignored.
    pub(crate) fn install_hook(&self, inner: &Arc<Inner>) {
        self.shared.hook.get_or_init(|| Arc::downgrade(inner));
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Handle) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Handle {}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("id", &self.shared.id).finish()
    }
}

impl Shared {
    /// Moves the caller's fd out; the loop takes it exactly once, at first
    /// sight.
    pub(crate) fn take_fd(&self) -> Option<OwnedFd> {
        self.fd.lock().unwrap().take()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.get() {
            if let Some(inner) = hook.upgrade() {
                inner.reclaim(self.id);
            }
        }
        // An fd the loop never took closes here through its `OwnedFd`.
    }
}
