//! Deadline bookkeeping for queued requests.

use std::time::Instant;

use crate::pool::Pool;
use crate::request::Request;

/// Heap slot of a request that is not queued with a deadline.
pub(crate) const NO_SLOT: usize = usize::MAX;

/// Binary min-heap of queued requests keyed by deadline.
///
/// Every entry writes its slot back into the request it refers to, so a
/// request completing ahead of its deadline is removed in O(log n) without
/// scanning the heap. The loop arms a single timer, the select timeout, for
/// whatever [`next_deadline`] reports.
///
/// [`next_deadline`]: TimeoutHeap::next_deadline
pub(crate) struct TimeoutHeap {
    entries: Vec<(Instant, usize)>,
}

impl TimeoutHeap {
    pub(crate) fn new() -> TimeoutHeap {
        TimeoutHeap {
            entries: Vec::new(),
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|&(deadline, _)| deadline)
    }

    pub(crate) fn push(&mut self, pool: &mut Pool<Request>, key: usize, deadline: Instant) {
        let slot = self.entries.len();
        self.entries.push((deadline, key));
        set_slot(pool, key, slot);
        self.sift_up(pool, slot);
    }

    /// Unlinks `key` if it is queued; requests without a deadline, or already
    /// popped, are left alone.
    pub(crate) fn remove(&mut self, pool: &mut Pool<Request>, key: usize) {
        let slot = match pool.get_mut(key) {
            Some(req) if req.heap_slot != NO_SLOT => {
                let slot = req.heap_slot;
                req.heap_slot = NO_SLOT;
                slot
            }
            _ => return,
        };
        self.remove_at(pool, slot);
    }

    /// Pops the head if its deadline has passed.
    pub(crate) fn pop_expired(&mut self, pool: &mut Pool<Request>, now: Instant) -> Option<usize> {
        let key = match self.entries.first() {
            Some(&(deadline, key)) if deadline <= now => key,
            _ => return None,
        };
        set_slot(pool, key, NO_SLOT);
        self.remove_at(pool, 0);
        Some(key)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    fn remove_at(&mut self, pool: &mut Pool<Request>, slot: usize) {
        self.entries.swap_remove(slot);
        if slot < self.entries.len() {
            // A tail entry moved into `slot`; restore heap order around it.
            let settled = self.sift_up(pool, slot);
            if settled == slot {
                self.sift_down(pool, slot);
            }
        }
    }

    fn sift_up(&mut self, pool: &mut Pool<Request>, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.entries[parent].0 <= self.entries[slot].0 {
                break;
            }
            self.entries.swap(parent, slot);
            set_slot(pool, self.entries[slot].1, slot);
            slot = parent;
        }
        set_slot(pool, self.entries[slot].1, slot);
        slot
    }

    fn sift_down(&mut self, pool: &mut Pool<Request>, mut slot: usize) {
        loop {
            let mut child = 2 * slot + 1;
            if child >= self.entries.len() {
                break;
            }
            if child + 1 < self.entries.len() && self.entries[child + 1].0 < self.entries[child].0 {
                child += 1;
            }
            if self.entries[slot].0 <= self.entries[child].0 {
                break;
            }
            self.entries.swap(slot, child);
            set_slot(pool, self.entries[slot].1, slot);
            slot = child;
        }
        set_slot(pool, self.entries[slot].1, slot);
    }
}

fn set_slot(pool: &mut Pool<Request>, key: usize, slot: usize) {
    if let Some(req) = pool.get_mut(key) {
        req.heap_slot = slot;
    }
}
