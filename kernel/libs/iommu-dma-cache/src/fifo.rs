// SPDX-License-Identifier: MPL-2.0

//! The two-half, lock-free FIFO the evictor drains from.
//!
//! `add_half` and `del_half` are independent [Treiber stacks][treiber],
//! each an `AtomicPtr<Entry>` head linked through `Entry::fifo_link`.
//! Insertion always pushes onto `add_half`; the evictor always pops from
//! `del_half`, splicing the whole of `add_half` into `del_half` whenever
//! the latter runs dry. Splicing via a single pointer exchange reverses
//! the relative order of the spliced batch; this crate accepts that as
//! the cost of an *approximate* FIFO rather than a strict one.
//!
//! [treiber]: https://en.wikipedia.org/wiki/Treiber_stack
//!
//! ## The sentinel, reconsidered
//!
//! A single sentinel entry that is simultaneously a member of both FIFO
//! halves through one `fifo_link` field is structurally impossible, so
//! this crate gives each half its own independent sentinel. In fact,
//! because this implementation represents an empty half as a null head
//! rather than as a distinguished placeholder node, neither half needs a
//! sentinel to stay structurally valid in the first place. The two
//! pinned, non-claimable sentinel entries are still allocated at
//! [`Fifo::new`] and freed at [`Fifo::destroy`] so a driver relying on
//! "the FIFO always owns at least the sentinels" for diagnostics still
//! finds a concrete object, but they are never linked onto `fifo_link`
//! and the evictor never walks them.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::entry::Entry;

fn fifo_next(entry: NonNull<Entry>) -> Option<NonNull<Entry>> {
    // Safety: an entry reachable from a FIFO half is never deallocated.
    let raw = unsafe { entry.as_ref() }.fifo_link.load(Ordering::Acquire);
    NonNull::new(raw)
}

fn set_fifo_next(entry: NonNull<Entry>, next: Option<NonNull<Entry>>) {
    let raw = next.map_or(core::ptr::null_mut(), |p| p.as_ptr());
    // Safety: see `fifo_next`.
    unsafe { entry.as_ref() }
        .fifo_link
        .store(raw, Ordering::Release);
}

struct Half {
    head: AtomicPtr<Entry>,
}

impl Half {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    fn push(&self, entry: NonNull<Entry>) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            set_fifo_next(entry, NonNull::new(head));
            match self.head.compare_exchange_weak(
                head,
                entry.as_ptr(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Detaches this half's entire list in one atomic exchange.
    fn take_all(&self) -> Option<NonNull<Entry>> {
        NonNull::new(self.head.swap(core::ptr::null_mut(), Ordering::AcqRel))
    }

    /// Publishes `list` as this half's content, merging with whatever is
    /// already there (rather than clobbering it) should a concurrent
    /// evictor pass be racing this one. Concurrent evictors may duplicate
    /// work but must never corrupt state; merging instead of overwriting
    /// is what keeps that guarantee here.
    fn put_back(&self, list: Option<NonNull<Entry>>) {
        let Some(list) = list else { return };
        let prior = self.head.swap(list.as_ptr(), Ordering::AcqRel);
        if let Some(prior) = NonNull::new(prior) {
            let mut tail = list;
            while let Some(next) = fifo_next(tail) {
                tail = next;
            }
            set_fifo_next(tail, Some(prior));
        }
    }
}

/// The cache's two-half eviction FIFO.
pub(crate) struct Fifo {
    add_half: Half,
    del_half: Half,
    sentinel_add: NonNull<Entry>,
    sentinel_del: NonNull<Entry>,
}

// Safety: the two sentinel pointers are never dereferenced outside of
// `Fifo` itself, and the entries they point to are never shared elsewhere.
unsafe impl Send for Fifo {}
unsafe impl Sync for Fifo {}

impl Fifo {
    pub(crate) fn new() -> Self {
        Self {
            add_half: Half::new(),
            del_half: Half::new(),
            sentinel_add: Entry::new_sentinel(),
            sentinel_del: Entry::new_sentinel(),
        }
    }

    /// Appends a freshly published entry to the `add`-half.
    pub(crate) fn push_add(&self, entry: NonNull<Entry>) {
        self.add_half.push(entry);
    }

    /// Re-queues an entry the evictor failed to claim.
    pub(crate) fn requeue(&self, entry: NonNull<Entry>) {
        self.add_half.push(entry);
    }

    /// Detaches a batch for the evictor to walk: `del_half`'s contents if
    /// non-empty, otherwise `add_half`'s, spliced in (which reverses their
    /// relative order -- see the module documentation).
    pub(crate) fn take_batch(&self) -> Option<NonNull<Entry>> {
        if let Some(batch) = self.del_half.take_all() {
            return Some(batch);
        }
        self.add_half.take_all()
    }

    /// Re-attaches whatever the evictor didn't get to this pass.
    pub(crate) fn return_remainder(&self, remainder: Option<NonNull<Entry>>) {
        self.del_half.put_back(remainder);
    }

    /// Tears down the FIFO. The caller must have already drained every
    /// real entry through the evictor; only the two sentinels remain.
    ///
    /// # Safety
    ///
    /// Must be called at most once, with no concurrent cache operation in
    /// flight.
    pub(crate) unsafe fn destroy(&mut self) {
        debug_assert!(self.add_half.head.load(Ordering::Relaxed).is_null());
        debug_assert!(self.del_half.head.load(Ordering::Relaxed).is_null());
        // Safety: sentinels are never shared, and this runs at most once.
        unsafe {
            Entry::reclaim(self.sentinel_add);
            Entry::reclaim(self.sentinel_del);
        }
    }
}
