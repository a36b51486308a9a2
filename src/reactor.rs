//! The event loop.
//!
//! Everything here runs on the watcher's loop thread. The descriptor
//! table, the waitlists, the timeout heap and the swap buffers are touched
//! by no other thread; the shared pieces (intake, results, reclamation
//! queue) hand their contents over by vector swap under short locks.
//!
//! The selector's blocking wait is the loop's only select point. Pending
//! submissions and reclamation notices arrive as readiness of the waker fd,
//! deadlines as the wait timeout, so one `select` demultiplexes all four
//! signal sources.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use log::{error, trace};

use crate::completion::{Buf, Completion, Op};
use crate::handle::HandleId;
use crate::pool::Pool;
use crate::request::{Kind, Request};
use crate::swap::SwapBuffers;
use crate::sys;
use crate::timeout::TimeoutHeap;
use crate::watcher::{Inner, WAKE_TOKEN};
use crate::Token;

/// Per-fd state: the owning handle's identity and the two waitlists.
///
/// The waitlists hold pool keys in FIFO order; the head is the only request
/// making progress in its direction.
struct FdEntry {
    id: HandleId,
    fd: OwnedFd,
    reads: VecDeque<usize>,
    writes: VecDeque<usize>,
}

enum Attempt {
    /// Finished; deliver with the carried error, if any.
    Complete(Option<io::Error>),
    /// No progress possible until the next readiness edge.
    WouldBlock,
}

enum Resolution {
    Fd(RawFd),
    /// The handle was reclaimed before the loop saw the request.
    Dropped,
    Failed(io::Error),
}

pub(crate) struct Reactor {
    inner: Arc<Inner>,
    events: sys::Events,
    requests: Pool<Request>,
    fds: HashMap<RawFd, FdEntry>,
    by_id: HashMap<HandleId, RawFd>,
    timeouts: TimeoutHeap,
    swap: SwapBuffers,
    incoming: Vec<Request>,
    reclaimed: Vec<HandleId>,
}

impl Reactor {
    pub(crate) fn new(inner: Arc<Inner>, swap_capacity: usize) -> Reactor {
        Reactor {
            inner,
            events: sys::Events::with_capacity(256),
            requests: Pool::with_capacity(256),
            fds: HashMap::new(),
            by_id: HashMap::new(),
            timeouts: TimeoutHeap::new(),
            swap: SwapBuffers::new(swap_capacity),
            incoming: Vec::new(),
            reclaimed: Vec::new(),
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            let timeout = self
                .timeouts
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));

            if let Err(err) = self.inner.selector.select(&mut self.events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("selector failed, shutting the watcher down: {}", err);
                break;
            }

            if self.inner.is_closed() {
                break;
            }

            // Ack the waker before draining, so a wake posted after the
            // drains below edges again instead of being swallowed.
            for event in self.events.iter() {
                if sys::event::token(event) == WAKE_TOKEN {
                    self.inner.waker.ack();
                }
            }

            self.drain_intake();
            self.drain_reclaimed();

            let events = mem::take(&mut self.events);
            for event in events.iter() {
                let token = sys::event::token(event);
                if token == WAKE_TOKEN {
                    continue;
                }
                let fd = token.0 as RawFd;
                // An error condition drains both directions; the syscalls
                // surface whatever went wrong.
                let failed = sys::event::is_error(event);
                if sys::event::is_readable(event) || failed {
                    self.progress_reads(fd);
                }
                if sys::event::is_writable(event) || failed {
                    self.progress_writes(fd);
                }
            }
            self.events = events;

            self.expire_deadlines();
        }
        self.shutdown();
    }

    fn drain_intake(&mut self) {
        self.inner.take_intake(&mut self.incoming);
        if self.incoming.is_empty() {
            return;
        }
        trace!("draining {} submissions", self.incoming.len());
        let mut batch = mem::take(&mut self.incoming);
        for req in batch.drain(..) {
            self.process(req);
        }
        self.incoming = batch;
    }

    fn drain_reclaimed(&mut self) {
        self.inner.take_reclaimed(&mut self.reclaimed);
        if self.reclaimed.is_empty() {
            return;
        }
        let mut batch = mem::take(&mut self.reclaimed);
        for id in batch.drain(..) {
            trace!("handle {} reclaimed by its owner", id);
            self.release(id);
        }
        self.reclaimed = batch;
    }

    fn process(&mut self, mut req: Request) {
        match req.kind {
            Kind::Free => {
                // Freed before the first submission registered it: the
                // caller's fd is still parked in the handle, close it now.
                if let Some(shared) = req.handle.upgrade() {
                    drop(shared.take_fd());
                }
                self.release(req.id);
            }
            Kind::Read | Kind::Write => match self.resolve(&req) {
                Resolution::Fd(fd) => {
                    req.fd = fd;
                    self.attempt_fresh(req);
                }
                Resolution::Dropped => {}
                Resolution::Failed(err) => self.deliver(req, Some(err)),
            },
        }
    }

    /// Maps the request's handle to its registered fd, registering it on
    /// first sight.
    fn resolve(&mut self, req: &Request) -> Resolution {
        if let Some(&fd) = self.by_id.get(&req.id) {
            return Resolution::Fd(fd);
        }

        let shared = match req.handle.upgrade() {
            Some(shared) => shared,
            None => {
                // The reclamation notice is already queued; this request is
                // forfeited along with the handle.
                trace!("request against reclaimed handle {}", req.id);
                return Resolution::Dropped;
            }
        };

        let orig = match shared.take_fd() {
            Some(fd) => fd,
            // Freed earlier; the fd is gone for good.
            None => return Resolution::Failed(io::Error::from_raw_os_error(libc::EBADF)),
        };

        match self.register(&orig) {
            Ok(dup) => {
                let fd = dup.as_raw_fd();
                trace!("handle {} registered as fd {}", req.id, fd);
                self.fds.insert(
                    fd,
                    FdEntry {
                        id: req.id,
                        fd: dup,
                        reads: VecDeque::new(),
                        writes: VecDeque::new(),
                    },
                );
                self.by_id.insert(req.id, fd);
                // `orig` closes here. From now on the loop works on the
                // duplicate, so the caller-visible fd number can be
                // recycled without ever aliasing our syscalls.
                Resolution::Fd(fd)
            }
            Err(err) => Resolution::Failed(err),
        }
    }

    /// Duplicates the caller's fd, makes the duplicate nonblocking and
    /// registers it, edge-triggered, with the selector.
    fn register(&mut self, orig: &OwnedFd) -> io::Result<OwnedFd> {
        let fd = syscall!(fcntl(orig.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0))?;
        // SAFETY: `F_DUPFD_CLOEXEC` returned a fresh valid fd.
        let dup = unsafe { OwnedFd::from_raw_fd(fd) };
        let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
        syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        self.inner.selector.register(fd, Token(fd as usize))?;
        Ok(dup)
    }

    /// First attempt for a fresh submission. The selector is edge-triggered
    /// and will not replay an edge from before registration, so skipping
    /// this attempt could strand the request forever.
    fn attempt_fresh(&mut self, mut req: Request) {
        let queue_empty = match self.fds.get(&req.fd) {
            Some(entry) => match req.kind {
                Kind::Read => entry.reads.is_empty(),
                _ => entry.writes.is_empty(),
            },
            None => return,
        };

        if queue_empty {
            let attempt = match req.kind {
                Kind::Read => Self::try_read(&self.inner, &mut self.swap, &mut req),
                _ => Self::try_write(&mut req),
            };
            if let Attempt::Complete(err) = attempt {
                self.deliver(req, err);
                return;
            }
        }
        // Behind other requests, or not ready yet: take a queue slot.
        self.enqueue(req);
    }

    fn enqueue(&mut self, req: Request) {
        let fd = req.fd;
        let kind = req.kind;
        let deadline = req.deadline;
        let key = self.requests.insert(req);
        if let Some(deadline) = deadline {
            self.timeouts.push(&mut self.requests, key, deadline);
        }
        if let Some(entry) = self.fds.get_mut(&fd) {
            match kind {
                Kind::Read => entry.reads.push_back(key),
                _ => entry.writes.push_back(key),
            }
        }
        trace!("request {} queued for {:?} on fd {}", key, kind, fd);
    }

    /// Drains the fd's read waitlist head-first until a request would
    /// block, preserving FIFO completion order.
    fn progress_reads(&mut self, fd: RawFd) {
        loop {
            let key = match self.fds.get(&fd).and_then(|entry| entry.reads.front()) {
                Some(&key) => key,
                None => return,
            };
            let attempt = match self.requests.get_mut(key) {
                Some(req) => Self::try_read(&self.inner, &mut self.swap, req),
                None => return,
            };
            match attempt {
                Attempt::WouldBlock => return,
                Attempt::Complete(err) => {
                    self.unlink(fd, key);
                    let req = self.requests.remove(key);
                    self.deliver(req, err);
                }
            }
        }
    }

    fn progress_writes(&mut self, fd: RawFd) {
        loop {
            let key = match self.fds.get(&fd).and_then(|entry| entry.writes.front()) {
                Some(&key) => key,
                None => return,
            };
            let attempt = match self.requests.get_mut(key) {
                Some(req) => Self::try_write(req),
                None => return,
            };
            match attempt {
                Attempt::WouldBlock => return,
                Attempt::Complete(err) => {
                    self.unlink(fd, key);
                    let req = self.requests.remove(key);
                    self.deliver(req, err);
                }
            }
        }
    }

    /// Unlinks a queued request from the timeout heap and its waitlist.
    fn unlink(&mut self, fd: RawFd, key: usize) {
        self.timeouts.remove(&mut self.requests, key);
        if let Some(entry) = self.fds.get_mut(&fd) {
            entry.reads.retain(|&k| k != key);
            entry.writes.retain(|&k| k != key);
        }
    }

    /// One read attempt. Interrupts retry, would-block yields, anything
    /// else completes the request.
    fn try_read(inner: &Inner, swap: &mut SwapBuffers, req: &mut Request) -> Attempt {
        let internal = req.uses_swap_buffer();
        loop {
            if internal && swap.is_exhausted() {
                // The read that finds the slab spent performs the rotation
                // and is tagged: its batch must be consumed before the
                // outgoing slab is filled over.
                if !swap.rotate(inner.closed_flag()) {
                    return Attempt::WouldBlock;
                }
                req.release = true;
            }

            let res = {
                let dst = if internal {
                    swap.tail()
                } else {
                    &mut req.buf[req.size..]
                };
                if dst.is_empty() {
                    return Attempt::Complete(None);
                }
                syscall!(read(
                    req.fd,
                    dst.as_mut_ptr() as *mut libc::c_void,
                    dst.len()
                ))
            };

            match res {
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Attempt::WouldBlock
                }
                Err(err) => return Attempt::Complete(Some(err)),
                Ok(0) => {
                    return Attempt::Complete(Some(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "end of stream",
                    )))
                }
                Ok(n) => {
                    let n = n as usize;
                    if internal {
                        req.slab = Some(swap.consume(n));
                        req.size = n;
                        return Attempt::Complete(None);
                    }
                    req.size += n;
                    // A plain read takes whatever arrived; only a full read
                    // keeps going.
                    if req.size == req.buf.len() || !req.fill {
                        return Attempt::Complete(None);
                    }
                }
            }
        }
    }

    /// One write attempt at the request's write point.
    fn try_write(req: &mut Request) -> Attempt {
        loop {
            let src = &req.buf[req.size..];
            if src.is_empty() {
                return Attempt::Complete(None);
            }
            let res = syscall!(write(
                req.fd,
                src.as_ptr() as *const libc::c_void,
                src.len()
            ));
            match res {
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Attempt::WouldBlock
                }
                Err(err) => return Attempt::Complete(Some(err)),
                Ok(n) => {
                    req.size += n as usize;
                    if req.size == req.buf.len() {
                        return Attempt::Complete(None);
                    }
                }
            }
        }
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        while let Some(key) = self.timeouts.pop_expired(&mut self.requests, now) {
            let fd = match self.requests.get_mut(key) {
                Some(req) => req.fd,
                None => continue,
            };
            if let Some(entry) = self.fds.get_mut(&fd) {
                entry.reads.retain(|&k| k != key);
                entry.writes.retain(|&k| k != key);
            }
            let req = self.requests.remove(key);
            trace!("request {} timed out after {} bytes", key, req.size);
            self.deliver(
                req,
                Some(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")),
            );
        }
    }

    /// Releases an fd: closes the duplicate and forfeits whatever was
    /// still queued against it.
    fn release(&mut self, id: HandleId) {
        let fd = match self.by_id.remove(&id) {
            Some(fd) => fd,
            None => return,
        };
        if let Some(entry) = self.fds.remove(&fd) {
            let FdEntry { reads, writes, .. } = entry;
            for key in reads.into_iter().chain(writes.into_iter()) {
                self.timeouts.remove(&mut self.requests, key);
                drop(self.requests.remove(key));
            }
            // The duplicate closed when `entry.fd` dropped just above; the
            // selector forgets closed fds on its own.
        }
        trace!("released fd {} of handle {}", fd, id);
    }

    fn deliver(&mut self, mut req: Request, error: Option<io::Error>) {
        let op = match req.kind {
            Kind::Read => Op::Read,
            Kind::Write => Op::Write,
            Kind::Free => return,
        };
        let release = req.release;
        let buf = match req.slab.take() {
            Some(slice) => Buf::Slab(slice),
            None if req.buf.is_empty() => Buf::None,
            None => Buf::Owned(mem::take(&mut req.buf)),
        };
        trace!(
            "completing {:?} token {:?}: {} bytes, err {:?}",
            op,
            req.token,
            req.size,
            error
        );
        let completion = Completion::new(op, req.token, req.handle, req.size, error, buf, release);
        self.inner.push_completion(completion, release);
    }

    fn shutdown(&mut self) {
        trace!("loop shutting down; {} fds registered", self.fds.len());
        let ids: Vec<HandleId> = self.fds.values().map(|entry| entry.id).collect();
        for id in ids {
            self.release(id);
        }
        self.timeouts.clear();
        // Waiters and submitters see the closed error from here on.
        self.inner.mark_closed();
    }
}
