//! The request control block.

use std::os::fd::RawFd;
use std::sync::Weak;
use std::time::Instant;

use crate::handle::{self, Handle, HandleId};
use crate::swap::SlabSlice;
use crate::timeout::NO_SLOT;
use crate::Token;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    Read,
    Write,
    Free,
}

pub(crate) struct Request {
    pub(crate) kind: Kind,
    pub(crate) token: Token,
    pub(crate) id: HandleId,
    pub(crate) handle: Weak<handle::Shared>,
    /// Caller buffer; empty on a read means "use the swap buffer".
    pub(crate) buf: Vec<u8>,
    /// Bytes transferred so far; the write point for both directions.
    pub(crate) size: usize,
    pub(crate) deadline: Option<Instant>,
    /// Complete a read only once `buf` is full.
    pub(crate) fill: bool,
    /// Slice of the swap slab the read landed in.
    pub(crate) slab: Option<SlabSlice>,
    /// This request found the current slab exhausted and rotated; its batch
    /// must be consumed before the loop proceeds.
    pub(crate) release: bool,
    /// The fd this request is queued under, once resolved.
    pub(crate) fd: RawFd,
    /// Slot in the timeout heap, `NO_SLOT` while not queued there.
    pub(crate) heap_slot: usize,
}

impl Request {
    pub(crate) fn new(
        kind: Kind,
        token: Token,
        handle: &Handle,
        buf: Vec<u8>,
        deadline: Option<Instant>,
        fill: bool,
    ) -> Request {
        Request {
            kind,
            token,
            id: handle.id(),
            handle: handle.downgrade(),
            buf,
            size: 0,
            deadline,
            fill,
            slab: None,
            release: false,
            fd: -1,
            heap_slot: NO_SLOT,
        }
    }

    /// A read that did not bring its own buffer reads into the swap buffer.
    pub(crate) fn uses_swap_buffer(&self) -> bool {
        self.kind == Kind::Read && self.buf.is_empty()
    }
}
