//! The watcher: submission surface, completion handoff, shutdown.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use log::trace;

use crate::completion::{Completion, Completions};
use crate::handle::{Handle, HandleId};
use crate::reactor::Reactor;
use crate::request::{Kind, Request};
use crate::sys;
use crate::Token;

/// Token the waker fd hides behind; stream fds are keyed by their own
/// number, which can never be `usize::MAX`.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Default capacity of each internal swap slab.
pub const DEFAULT_SWAP_CAPACITY: usize = 64 * 1024;

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "watcher is closed")
}

/// An I/O watcher: submissions go in, batches of completions come out.
///
/// The watcher runs a dedicated event-loop thread. Submission methods may be
/// called from any thread and never block on the loop; [`wait`] blocks until
/// at least one completion is available. Requests against the same handle
/// and direction complete in submission order; across handles there is no
/// ordering.
///
/// Dropping the watcher closes it and joins the loop thread.
///
/// [`wait`]: Watcher::wait
pub struct Watcher {
    inner: Arc<Inner>,
    thread: Option<thread::JoinHandle<()>>,
}

pub(crate) struct Inner {
    pub(crate) selector: sys::Selector,
    pub(crate) waker: sys::Waker,
    closed: AtomicBool,
    intake: Mutex<Intake>,
    results: Mutex<Results>,
    avail: Condvar,
    reclaimed: Mutex<Vec<HandleId>>,
}

struct Intake {
    queue: Vec<Request>,
    closed: bool,
}

struct Results {
    filling: Vec<Completion>,
    hangups: Vec<Sender<()>>,
    closed: bool,
}

impl Watcher {
    /// Creates a watcher with [`DEFAULT_SWAP_CAPACITY`] internal slabs.
    pub fn new() -> io::Result<Watcher> {
        Watcher::with_capacity(DEFAULT_SWAP_CAPACITY)
    }

    /// Creates a watcher whose two internal swap slabs hold `capacity`
    /// bytes each. Reads submitted without a buffer land in these slabs,
    /// and a single such read is capped at `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> io::Result<Watcher> {
        assert!(capacity > 0, "swap buffer capacity must be nonzero");

        let selector = sys::Selector::new()?;
        let waker = sys::Waker::new(&selector, WAKE_TOKEN)?;
        let inner = Arc::new(Inner {
            selector,
            waker,
            closed: AtomicBool::new(false),
            intake: Mutex::new(Intake {
                queue: Vec::new(),
                closed: false,
            }),
            results: Mutex::new(Results {
                filling: Vec::new(),
                hangups: Vec::new(),
                closed: false,
            }),
            avail: Condvar::new(),
            reclaimed: Mutex::new(Vec::new()),
        });

        let reactor = Reactor::new(inner.clone(), capacity);
        let thread = thread::Builder::new()
            .name("batchio-watcher".to_owned())
            .spawn(move || reactor.run())?;

        Ok(Watcher {
            inner,
            thread: Some(thread),
        })
    }

    /// Submits a read into the watcher's internal buffer.
    ///
    /// The completion borrows its bytes from the batch that delivers it;
    /// consume them before the next [`wait`] on the same batch.
    ///
    /// [`wait`]: Watcher::wait
    pub fn read(&self, token: Token, handle: &Handle) -> io::Result<()> {
        self.submit_io(Kind::Read, token, handle, Vec::new(), None, false)
    }

    /// [`read`](Watcher::read) with a deadline.
    pub fn read_deadline(&self, token: Token, handle: &Handle, deadline: Instant) -> io::Result<()> {
        self.submit_io(Kind::Read, token, handle, Vec::new(), Some(deadline), false)
    }

    /// Submits a read into `buf`, completing on the first bytes that
    /// arrive. An empty `buf` reads into the internal buffer instead, like
    /// [`read`](Watcher::read).
    pub fn read_into(&self, token: Token, handle: &Handle, buf: Vec<u8>) -> io::Result<()> {
        self.submit_io(Kind::Read, token, handle, buf, None, false)
    }

    /// [`read_into`](Watcher::read_into) with a deadline.
    pub fn read_into_deadline(
        &self,
        token: Token,
        handle: &Handle,
        buf: Vec<u8>,
        deadline: Instant,
    ) -> io::Result<()> {
        self.submit_io(Kind::Read, token, handle, buf, Some(deadline), false)
    }

    /// Submits a read that completes only once `buf` is full (or on error,
    /// end of stream, or deadline). `buf` must not be empty.
    pub fn read_full(&self, token: Token, handle: &Handle, buf: Vec<u8>) -> io::Result<()> {
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read_full requires a non-empty buffer",
            ));
        }
        self.submit_io(Kind::Read, token, handle, buf, None, true)
    }

    /// [`read_full`](Watcher::read_full) with a deadline. A deadline that
    /// fires mid-fill delivers the partial prefix together with the
    /// [`TimedOut`](io::ErrorKind::TimedOut) error.
    pub fn read_full_deadline(
        &self,
        token: Token,
        handle: &Handle,
        buf: Vec<u8>,
        deadline: Instant,
    ) -> io::Result<()> {
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read_full requires a non-empty buffer",
            ));
        }
        self.submit_io(Kind::Read, token, handle, buf, Some(deadline), true)
    }

    /// Submits a write of all of `buf`. `buf` must not be empty.
    pub fn write(&self, token: Token, handle: &Handle, buf: Vec<u8>) -> io::Result<()> {
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write requires a non-empty buffer",
            ));
        }
        self.submit_io(Kind::Write, token, handle, buf, None, false)
    }

    /// [`write`](Watcher::write) with a deadline.
    pub fn write_deadline(
        &self,
        token: Token,
        handle: &Handle,
        buf: Vec<u8>,
        deadline: Instant,
    ) -> io::Result<()> {
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write requires a non-empty buffer",
            ));
        }
        self.submit_io(Kind::Write, token, handle, buf, Some(deadline), false)
    }

    /// Releases the handle's fd as soon as the loop picks this up.
    ///
    /// Requests still queued against the handle are dropped without a
    /// completion, so only free a handle once its completions have been
    /// drained. Dropping every clone of a handle has the same effect.
    pub fn free(&self, handle: &Handle) -> io::Result<()> {
        self.submit(Request::new(
            Kind::Free,
            Token(0),
            handle,
            Vec::new(),
            None,
            false,
        ))
    }

    /// Blocks until at least one completion is available and fills
    /// `completions` with the accumulated batch.
    ///
    /// The batch is cleared first, which releases any internal-buffer
    /// storage the previous batch was pinning.
    ///
    /// # Errors
    ///
    /// [`NotConnected`](io::ErrorKind::NotConnected) once the watcher is
    /// closed.
    pub fn wait(&self, completions: &mut Completions) -> io::Result<()> {
        completions.clear();

        let hangups = {
            let mut results = self.inner.results.lock().unwrap();
            loop {
                if results.closed {
                    return Err(closed());
                }
                if !results.filling.is_empty() {
                    mem::swap(&mut results.filling, completions.vec_mut());
                    break mem::take(&mut results.hangups);
                }
                results = self.inner.avail.wait(results).unwrap();
            }
        };
        // Closing the hangups resumes the delivery path; the rotation batch
        // is in the caller's hands now.
        drop(hangups);
        trace!("handed off {} completions", completions.len());
        Ok(())
    }

    /// Shuts the watcher down: every registered fd is released, queued
    /// requests are dropped, blocked waiters and later submissions see
    /// [`NotConnected`](io::ErrorKind::NotConnected). Idempotent.
    pub fn close(&self) {
        if self.inner.is_closed() {
            return;
        }
        self.inner.mark_closed();
        let _ = self.inner.waker.wake();
    }

    fn submit_io(
        &self,
        kind: Kind,
        token: Token,
        handle: &Handle,
        buf: Vec<u8>,
        deadline: Option<Instant>,
        fill: bool,
    ) -> io::Result<()> {
        handle.install_hook(&self.inner);
        self.submit(Request::new(kind, token, handle, buf, deadline, fill))
    }

    fn submit(&self, req: Request) -> io::Result<()> {
        {
            let mut intake = self.inner.intake.lock().unwrap();
            if intake.closed {
                return Err(closed());
            }
            intake.queue.push(req);
        }
        self.inner.waker.wake()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Inner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn closed_flag(&self) -> &AtomicBool {
        &self.closed
    }

    /// Called from `Handle` drops, on whatever thread dropped last.
    pub(crate) fn reclaim(&self, id: HandleId) {
        self.reclaimed.lock().unwrap().push(id);
        let _ = self.waker.wake();
    }

    /// Swaps the intake buffer with the loop's (empty) processing buffer.
    pub(crate) fn take_intake(&self, into: &mut Vec<Request>) {
        let mut intake = self.intake.lock().unwrap();
        mem::swap(&mut intake.queue, into);
    }

    pub(crate) fn take_reclaimed(&self, into: &mut Vec<HandleId>) {
        let mut reclaimed = self.reclaimed.lock().unwrap();
        mem::swap(&mut *reclaimed, into);
    }

    /// Appends to the filling vector and signals the waiter. When `release`
    /// is set the call does not return until the waiter has taken the batch
    /// (or the watcher closed): the outgoing swap slab must not be filled
    /// over before its consumers have seen it.
    pub(crate) fn push_completion(&self, completion: Completion, release: bool) {
        let hangup = {
            let mut results = self.results.lock().unwrap();
            if results.closed {
                // Completions racing with close are dropped; waiters
                // already observe the closed error.
                return;
            }
            results.filling.push(completion);
            let hangup = if release {
                let (tx, rx) = mpsc::channel();
                results.hangups.push(tx);
                Some(rx)
            } else {
                None
            };
            self.avail.notify_one();
            hangup
        };

        if let Some(rx) = hangup {
            trace!("suspending delivery until the rotation batch is taken");
            // Err means the sender was dropped, which is exactly the
            // handoff (or close) we are waiting for.
            let _ = rx.recv();
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        {
            let mut intake = self.intake.lock().unwrap();
            intake.closed = true;
            // Whatever raced in past the closed check is dropped.
            intake.queue.clear();
        }
        let mut results = self.results.lock().unwrap();
        results.closed = true;
        results.filling.clear();
        results.hangups.clear();
        self.avail.notify_all();
    }
}
