// SPDX-License-Identifier: MPL-2.0

//! The cached entry type and its lock-free reference-count protocol.
//!
//! `count` encodes three logical regimes:
//!
//! - **Live, `n` holders** (`count == n`, `n >= 1`): reachable through the
//!   indices, may be acquired again.
//! - **Live, idle** (`count == 0`): reachable, freeable by the evictor on
//!   its next pass.
//! - **Claimed for removal** (`count == -REMOVING_BIAS`): the evictor has
//!   exclusive ownership of the entry; acquisition must fail.

use alloc::boxed::Box;
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicIsize, AtomicPtr, Ordering},
};

use crate::{direction::DmaDirection, Pfn};

/// A single cached DMA mapping: one IOMMU-visible page mapped from one host
/// page under one [`DmaDirection`].
///
/// An `Entry` is allocated once by [`crate::Cache::add`] and reclaimed
/// exactly once, by whichever caller wins [`Entry::try_claim`]. Ownership is
/// singular and is *not* tracked by reference counting in the Rust sense:
/// every field but `count` and the two link pointers is immutable after
/// construction, and both indices and the FIFO only ever hold a raw, shared
/// pointer to it. The indices and FIFO do not own the entry; the winner of
/// `try_claim` does.
pub struct Entry {
    pub(crate) dma_page: Pfn,
    pub(crate) host_page: Pfn,
    pub(crate) direction: DmaDirection,
    count: AtomicIsize,
    /// Next pointer used by the FIFO half this entry currently belongs to.
    pub(crate) fifo_link: AtomicPtr<Entry>,
    /// Next pointer used to chain entries that share `host_page`.
    pub(crate) chain_link: AtomicPtr<Entry>,
}

impl Entry {
    /// Allocates a new, live entry with one holder (the caller of `add`).
    pub(crate) fn new(host_page: Pfn, dma_page: Pfn, direction: DmaDirection) -> NonNull<Entry> {
        let boxed = Box::new(Entry {
            dma_page,
            host_page,
            direction,
            count: AtomicIsize::new(1),
            fifo_link: AtomicPtr::new(core::ptr::null_mut()),
            chain_link: AtomicPtr::new(core::ptr::null_mut()),
        });
        // Safety: `Box::into_raw` never returns a null pointer.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }

    /// Allocates a pinned sentinel entry: a placeholder that is never
    /// published into either index, is never acquirable and is never
    /// claimable, used purely to anchor a FIFO half. See the module
    /// documentation of `crate::fifo` for why this crate uses two
    /// independent sentinels rather than the single, dual-linked sentinel
    /// the original design describes.
    pub(crate) fn new_sentinel() -> NonNull<Entry> {
        let boxed = Box::new(Entry {
            dma_page: 0,
            host_page: 0,
            direction: DmaDirection::None,
            count: AtomicIsize::new(1),
            fifo_link: AtomicPtr::new(core::ptr::null_mut()),
            chain_link: AtomicPtr::new(core::ptr::null_mut()),
        });
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }

    /// Reclaims an entry that was removed from both indices and won by
    /// `try_claim`.
    ///
    /// # Safety
    ///
    /// `ptr` must not be reachable from any index or FIFO half, and must
    /// not be freed more than once.
    pub(crate) unsafe fn reclaim(ptr: NonNull<Entry>) {
        // Safety: caller guarantees single ownership at this point.
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }

    pub(crate) fn dma_page(&self) -> Pfn {
        self.dma_page
    }

    pub(crate) fn host_page(&self) -> Pfn {
        self.host_page
    }

    pub(crate) fn direction(&self) -> DmaDirection {
        self.direction
    }

    /// Attempts to acquire one more reference on this entry.
    ///
    /// Fails iff the entry has already been claimed for removal
    /// (`count == -removing_bias`). On success, `count` is incremented by
    /// one; callers that observe a failure must not dereference the entry
    /// any further, since a concurrent evictor may free it at any time.
    pub(crate) fn try_acquire(&self, removing_bias: isize) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current == -removing_bias {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Releases one reference acquired by `try_acquire` (or the implicit
    /// reference installed by `add`).
    pub(crate) fn release(&self) {
        self.count.fetch_sub(1, Ordering::Release);
    }

    /// Attempts to claim this entry for removal by the evictor.
    ///
    /// Succeeds iff the entry was idle (`count == 0`), atomically
    /// transitioning it to the claimed state. On failure, the entry was in
    /// use; the caller must undo with [`Entry::unclaim`].
    pub(crate) fn try_claim(&self, removing_bias: isize) -> bool {
        self.count.fetch_sub(removing_bias, Ordering::AcqRel) == 0
    }

    /// Undoes a failed `try_claim`, restoring the entry to its prior,
    /// in-use state.
    pub(crate) fn unclaim(&self, removing_bias: isize) {
        self.count.fetch_add(removing_bias, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> isize {
        self.count.load(Ordering::Relaxed)
    }
}
