//! Completion records and the reusable batch buffer.

use std::fmt;
use std::io;
use std::sync::Weak;

use crate::handle::{self, Handle};
use crate::swap::SlabSlice;
use crate::Token;

/// The direction of a completed operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

pub(crate) enum Buf {
    None,
    Owned(Vec<u8>),
    Slab(SlabSlice),
}

/// One finished request, as returned by [`Watcher::wait`].
///
/// [`Watcher::wait`]: crate::Watcher::wait
pub struct Completion {
    op: Op,
    token: Token,
    handle: Weak<handle::Shared>,
    size: usize,
    error: Option<io::Error>,
    buf: Buf,
    release: bool,
}

impl Completion {
    pub(crate) fn new(
        op: Op,
        token: Token,
        handle: Weak<handle::Shared>,
        size: usize,
        error: Option<io::Error>,
        buf: Buf,
        release: bool,
    ) -> Completion {
        Completion {
            op,
            token,
            handle,
            size,
            error,
            buf,
            release,
        }
    }

    pub fn op(&self) -> Op {
        self.op
    }

    /// The token given at submission, unchanged.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The handle the operation ran against, if the caller still holds it.
    pub fn handle(&self) -> Option<Handle> {
        self.handle.upgrade().map(Handle::from_shared)
    }

    /// Bytes transferred before the request finished. Nonzero even when
    /// [`error`] is set, for example on a deadline that caught a partial
    /// fill.
    ///
    /// [`error`]: Completion::error
    pub fn bytes_transferred(&self) -> usize {
        self.size
    }

    /// The error that ended the request, if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }

    /// The transferred prefix of the operation's buffer.
    ///
    /// For reads that used the internal buffer this borrows from the batch;
    /// the bytes stay valid until the batch is cleared, reused by another
    /// wait, or dropped.
    pub fn buffer(&self) -> &[u8] {
        match &self.buf {
            Buf::None => &[],
            Buf::Owned(buf) => &buf[..self.size],
            Buf::Slab(slice) => slice.bytes(),
        }
    }

    /// Recovers a caller-supplied buffer. Returns `None` for reads that
    /// used the internal buffer, or if the buffer was already taken.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        match std::mem::replace(&mut self.buf, Buf::None) {
            Buf::Owned(buf) => Some(buf),
            other => {
                self.buf = other;
                None
            }
        }
    }

    /// Whether this read borrowed the watcher's internal buffer.
    pub fn used_internal_buffer(&self) -> bool {
        matches!(self.buf, Buf::Slab(_))
    }

    /// Whether this completion is the point at which the internal buffer
    /// wrapped around. The watcher will not reuse the exhausted half until
    /// the batch carrying this record has been consumed.
    pub fn releases_internal_buffer(&self) -> bool {
        self.release
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("op", &self.op)
            .field("token", &self.token)
            .field("bytes_transferred", &self.size)
            .field("error", &self.error)
            .finish()
    }
}

/// A reusable batch of completions, filled by [`Watcher::wait`].
///
/// The batch owns every record in it; records referencing the watcher's
/// internal buffer pin the underlying storage until the batch is cleared,
/// refilled or dropped.
///
/// [`Watcher::wait`]: crate::Watcher::wait
pub struct Completions {
    batch: Vec<Completion>,
}

impl Completions {
    /// An empty batch that can grow to any size; `capacity` only presizes
    /// the allocation.
    pub fn with_capacity(capacity: usize) -> Completions {
        Completions {
            batch: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter(self.batch.iter())
    }

    pub fn iter_mut(&mut self) -> IterMut<'_> {
        IterMut(self.batch.iter_mut())
    }

    /// Drops every record, releasing any pinned internal buffer storage.
    pub fn clear(&mut self) {
        self.batch.clear();
    }

    pub(crate) fn vec_mut(&mut self) -> &mut Vec<Completion> {
        &mut self.batch
    }
}

impl fmt::Debug for Completions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a Completions {
    type Item = &'a Completion;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a> IntoIterator for &'a mut Completions {
    type Item = &'a mut Completion;
    type IntoIter = IterMut<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

#[derive(Debug)]
pub struct Iter<'a>(std::slice::Iter<'a, Completion>);

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Completion;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

#[derive(Debug)]
pub struct IterMut<'a>(std::slice::IterMut<'a, Completion>);

impl<'a> Iterator for IterMut<'a> {
    type Item = &'a mut Completion;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}
