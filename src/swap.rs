//! The two-slab scratch buffer backing reads that bring no buffer.
//!
//! One slab is current and fills front to back; completed reads hand out
//! views of its filled prefix. A read that finds the current slab exhausted
//! swaps the slabs and starts over at offset zero. The outgoing slab is not
//! rewritten until every delivered view of it has been dropped, which the
//! waiter does by clearing (or dropping) the batch that carried them.

use std::cell::UnsafeCell;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use log::trace;

/// One scratch slab.
///
/// The bytes live behind an `UnsafeCell` because completed reads hold shared
/// views of the filled prefix while the loop keeps appending at the offset.
/// Two rules make this sound: the loop only writes at or past the current
/// offset, and the offset is only reset once the loop holds the sole strong
/// reference to the slab.
pub(crate) struct Slab {
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: the rules above keep reads of delivered prefixes and the loop's
// appends on disjoint ranges.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    fn new(capacity: usize) -> Arc<Slab> {
        Arc::new(Slab {
            data: UnsafeCell::new(vec![0; capacity].into_boxed_slice()),
        })
    }

    fn capacity(&self) -> usize {
        // SAFETY: the box itself (pointer and length) is never replaced.
        unsafe { (&*self.data.get()).len() }
    }

    fn ptr(&self) -> *mut u8 {
        // SAFETY: as above; the contents are only touched through the raw
        // pointer, never through overlapping references.
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    fn range(&self, start: usize, len: usize) -> &[u8] {
        debug_assert!(start + len <= self.capacity());
        // SAFETY: delivered ranges sit below the write offset, and the
        // offset is not reset while a view can still observe them.
        unsafe { slice::from_raw_parts(self.ptr().add(start), len) }
    }

    /// # Safety
    ///
    /// Only the loop may call this, with `offset` at or past the end of
    /// every delivered range of this slab.
    unsafe fn tail(&self, offset: usize) -> &mut [u8] {
        slice::from_raw_parts_mut(self.ptr().add(offset), self.capacity() - offset)
    }
}

/// A delivered view into a slab; dropping it signals the loop.
pub(crate) struct SlabSlice {
    slab: Option<Arc<Slab>>,
    start: usize,
    len: usize,
    release: Sender<()>,
}

impl SlabSlice {
    pub(crate) fn bytes(&self) -> &[u8] {
        match &self.slab {
            Some(slab) => slab.range(self.start, self.len),
            None => &[],
        }
    }
}

impl Drop for SlabSlice {
    fn drop(&mut self) {
        // Give the slab reference back before signaling, so the loop's
        // exclusivity check observes the drop when the signal lands.
        self.slab = None;
        let _ = self.release.send(());
    }
}

pub(crate) struct SwapBuffers {
    current: Arc<Slab>,
    other: Arc<Slab>,
    offset: usize,
    release_tx: Sender<()>,
    release_rx: Receiver<()>,
}

impl SwapBuffers {
    pub(crate) fn new(capacity: usize) -> SwapBuffers {
        let (release_tx, release_rx) = mpsc::channel();
        SwapBuffers {
            current: Slab::new(capacity),
            other: Slab::new(capacity),
            offset: 0,
            release_tx,
            release_rx,
        }
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.offset == self.current.capacity()
    }

    /// Swaps the slabs and blocks until the incoming slab is no longer
    /// referenced by delivered results.
    ///
    /// Returns `false` if the watcher closed while waiting; the caller must
    /// then leave the slab untouched.
    pub(crate) fn rotate(&mut self, closed: &AtomicBool) -> bool {
        std::mem::swap(&mut self.current, &mut self.other);
        self.offset = 0;
        trace!("rotated swap slabs");
        // Flush stale signals from views dropped since the last rotation,
        // so the channel does not grow without bound.
        while self.release_rx.try_recv().is_ok() {}
        while Arc::strong_count(&self.current) > 1 {
            if closed.load(Ordering::Acquire) {
                return false;
            }
            // Woken by release signals from dropped views; the timeout
            // covers a signal racing ahead of the reference count decrement
            // and the watcher closing underneath us.
            let _ = self.release_rx.recv_timeout(Duration::from_millis(10));
        }
        true
    }

    /// Append tail of the current slab.
    pub(crate) fn tail(&mut self) -> &mut [u8] {
        // SAFETY: `offset` is past every delivered range of this slab, and
        // only the loop holds `&mut SwapBuffers`.
        unsafe { self.current.tail(self.offset) }
    }

    /// Takes the `len` bytes just read into the tail as a delivered view.
    pub(crate) fn consume(&mut self, len: usize) -> SlabSlice {
        debug_assert!(self.offset + len <= self.current.capacity());
        let slice = SlabSlice {
            slab: Some(self.current.clone()),
            start: self.offset,
            len,
            release: self.release_tx.clone(),
        };
        self.offset += len;
        slice
    }
}
