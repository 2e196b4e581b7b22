// SPDX-License-Identifier: MPL-2.0

//! The two sparse indices, and the chain-head republish protocol that
//! keeps the host-page index consistent under concurrent `add`/removal.
//!
//! Each index is a `hashbrown::HashMap` guarded by a dedicated
//! [`spin::Mutex`], the same pattern this workspace already uses for its
//! `DMA_MAPPING_SET` (a `SpinLock<BTreeSet<Paddr>>`, see
//! `vm::dma::check_and_insert_dma_mapping`). A single index operation
//! (`load`/`insert`/`erase`/`replace`) is therefore atomic by construction;
//! what is *not* atomic is a multi-step sequence across two such
//! operations, which is exactly the race the republish protocol below
//! exists to close.

use core::{
    ptr::NonNull,
    sync::atomic::Ordering,
};

use hashbrown::HashMap;
use log::{debug, warn};
use spin::Mutex;

use crate::{entry::Entry, Pfn};

/// Maps a DMA page number to the single entry that owns it. Enforces
/// uniqueness: a DMA page may be published at most once.
pub(crate) struct DmaPageIndex {
    map: Mutex<HashMap<Pfn, NonNull<Entry>>>,
}

// Safety: access to the raw pointers stored in `map` is always mediated by
// the mutex, and the pointee `Entry` is itself safe to share across
// threads (its only mutable state is atomic).
unsafe impl Send for DmaPageIndex {}
unsafe impl Sync for DmaPageIndex {}

impl DmaPageIndex {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn load(&self, dma_page: Pfn) -> Option<NonNull<Entry>> {
        self.map.lock().get(&dma_page).copied()
    }

    /// Inserts `entry` at `dma_page`. Fails without modifying the index if
    /// the key is already occupied.
    pub(crate) fn insert_unique(&self, dma_page: Pfn, entry: NonNull<Entry>) -> bool {
        match self.map.lock().entry(dma_page) {
            hashbrown::hash_map::Entry::Occupied(_) => false,
            hashbrown::hash_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub(crate) fn erase(&self, dma_page: Pfn) -> Option<NonNull<Entry>> {
        self.map.lock().remove(&dma_page)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }
}

/// Maps a host page number to the head of the chain of entries mapped from
/// it.
pub(crate) struct HostPageIndex {
    map: Mutex<HashMap<Pfn, NonNull<Entry>>>,
}

unsafe impl Send for HostPageIndex {}
unsafe impl Sync for HostPageIndex {}

impl HostPageIndex {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn load(&self, host_page: Pfn) -> Option<NonNull<Entry>> {
        self.map.lock().get(&host_page).copied()
    }

    /// Atomically stores `new_head` at `host_page` and returns whatever was
    /// there before. Used by `add`, where nothing can be lost: the prior
    /// value, if any, becomes the new entry's `chain_link` successor in
    /// the same step.
    pub(crate) fn replace(&self, host_page: Pfn, new_head: NonNull<Entry>) -> Option<NonNull<Entry>> {
        self.map.lock().insert(host_page, new_head)
    }

    /// Publishes `new_head` only if `host_page` is currently unoccupied.
    /// Returns `false`, without modifying the index, if something is
    /// already there -- the caller must retrieve it with `erase` and merge
    /// it in before retrying. This is the conditional half of the
    /// republish protocol; unlike `replace`, it must never silently
    /// overwrite a chain that a concurrent `add` installed.
    fn try_publish_vacant(&self, host_page: Pfn, new_head: NonNull<Entry>) -> bool {
        match self.map.lock().entry(host_page) {
            hashbrown::hash_map::Entry::Occupied(_) => false,
            hashbrown::hash_map::Entry::Vacant(slot) => {
                slot.insert(new_head);
                true
            }
        }
    }

    fn erase(&self, host_page: Pfn) -> Option<NonNull<Entry>> {
        self.map.lock().remove(&host_page)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }
}

pub(crate) fn chain_next(entry: NonNull<Entry>) -> Option<NonNull<Entry>> {
    // Safety: entries are never deallocated while reachable from an index.
    let raw = unsafe { entry.as_ref() }.chain_link.load(Ordering::Acquire);
    NonNull::new(raw)
}

pub(crate) fn set_chain_next(entry: NonNull<Entry>, next: Option<NonNull<Entry>>) {
    let raw = next.map_or(core::ptr::null_mut(), |p| p.as_ptr());
    // Safety: see `chain_next`.
    unsafe { entry.as_ref() }
        .chain_link
        .store(raw, Ordering::Release);
}

/// Publishes `new_head` (which may be `None`, meaning "leave the slot
/// empty") as the chain head at `host_page`, merging in any chain a
/// concurrent `add` may have published in the window between the caller's
/// preceding `erase` and this call.
///
/// This is the atomic-replace republish protocol: each retry strictly
/// reduces the number of un-merged chains, so the loop terminates.
pub(crate) fn republish_chain_head(
    index: &HostPageIndex,
    host_page: Pfn,
    new_head: Option<NonNull<Entry>>,
) {
    let Some(candidate) = new_head else {
        // Nothing to republish; an erase already emptied the slot, and we
        // have no chain of our own to merge in if an interloper shows up
        // later -- that interloper's own `add` will simply see an empty
        // slot and become the sole head, which is correct.
        return;
    };
    loop {
        if index.try_publish_vacant(host_page, candidate) {
            return;
        }
        debug!(
            "iommu-dma-cache: chain-head republish raced with a concurrent add at host_page={host_page}; merging"
        );
        // Someone else touched the slot while we were between our `erase`
        // and this publish attempt. Two separate mutex acquisitions (the
        // failed `try_publish_vacant` and this `erase`) are not one atomic
        // step, so by the time we get here the slot may have been emptied
        // again by a second, concurrent removal racing with this one --
        // concurrent evictors are permitted and this is exactly the kind of
        // duplicated work that permits, not a corruption. If there is an
        // interloper, pull its chain back out and append it to the tail of
        // ours before retrying; if the slot is empty, there is nothing to
        // merge and the next `try_publish_vacant` will simply succeed.
        if let Some(interloper) = index.erase(host_page) {
            let mut tail = candidate;
            while let Some(next) = chain_next(tail) {
                tail = next;
            }
            set_chain_next(tail, Some(interloper));
        }
    }
}

/// Removes `target` from both indices.
///
/// The head-of-chain case is handled separately from the rest of the
/// walk so the two can never be confused: a match at `head` always goes
/// through [`republish_chain_head`], while a match further down the
/// chain is spliced past its tracked predecessor directly.
pub(crate) fn remove_entry(
    dma_index: &DmaPageIndex,
    host_index: &HostPageIndex,
    target: NonNull<Entry>,
) {
    let target_ref = unsafe { target.as_ref() };
    dma_index.erase(target_ref.dma_page());

    let host_page = target_ref.host_page();
    let Some(head) = host_index.erase(host_page) else {
        warn!(
            "iommu-dma-cache: removing entry at host_page={host_page} found no chain; leaving as-is"
        );
        return;
    };

    if head == target {
        republish_chain_head(host_index, host_page, chain_next(target));
        return;
    }

    // Walk the detached chain looking for `target`, tracking the
    // predecessor explicitly so the `None` case (head match) and the
    // "somewhere in the middle/tail" case can never be confused.
    let mut predecessor = head;
    let mut cursor = chain_next(head);
    loop {
        match cursor {
            None => {
                warn!(
                    "iommu-dma-cache: target entry not found in chain at host_page={host_page}"
                );
                republish_chain_head(host_index, host_page, Some(head));
                return;
            }
            Some(node) if node == target => {
                set_chain_next(predecessor, chain_next(target));
                republish_chain_head(host_index, host_page, Some(head));
                return;
            }
            Some(node) => {
                predecessor = node;
                cursor = chain_next(node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direction::DmaDirection;

    fn entry(host: Pfn, dma: Pfn) -> NonNull<Entry> {
        Entry::new(host, dma, DmaDirection::Bidirectional)
    }

    #[test]
    fn dma_index_rejects_duplicate() {
        let index = DmaPageIndex::new();
        let e1 = entry(1, 10);
        let e2 = entry(1, 10);
        assert!(index.insert_unique(10, e1));
        assert!(!index.insert_unique(10, e2));
        unsafe {
            Entry::reclaim(e1);
            Entry::reclaim(e2);
        }
    }

    #[test]
    fn remove_head_with_successor_republishes_successor() {
        let host_index = HostPageIndex::new();
        let dma_index = DmaPageIndex::new();
        let head = entry(1, 10);
        let second = entry(1, 11);
        set_chain_next(head, Some(second));
        host_index.replace(1, head);
        dma_index.insert_unique(10, head);
        dma_index.insert_unique(11, second);

        remove_entry(&dma_index, &host_index, head);

        assert_eq!(host_index.load(1), Some(second));
        assert_eq!(dma_index.load(10), None);
        assert_eq!(dma_index.load(11), Some(second));

        unsafe {
            Entry::reclaim(head);
            Entry::reclaim(second);
        }
    }

    #[test]
    fn remove_middle_of_chain_splices_predecessor() {
        let host_index = HostPageIndex::new();
        let dma_index = DmaPageIndex::new();
        let head = entry(1, 10);
        let middle = entry(1, 11);
        let tail = entry(1, 12);
        set_chain_next(head, Some(middle));
        set_chain_next(middle, Some(tail));
        host_index.replace(1, head);
        dma_index.insert_unique(10, head);
        dma_index.insert_unique(11, middle);
        dma_index.insert_unique(12, tail);

        remove_entry(&dma_index, &host_index, middle);

        assert_eq!(host_index.load(1), Some(head));
        assert_eq!(chain_next(head), Some(tail));
        assert_eq!(dma_index.load(11), None);

        unsafe {
            Entry::reclaim(head);
            Entry::reclaim(middle);
            Entry::reclaim(tail);
        }
    }

    #[test]
    fn republish_merges_interloper() {
        let host_index = HostPageIndex::new();
        let ours = entry(1, 10);
        let interloper = entry(1, 11);
        // Simulate a concurrent `add` landing while we were "between"
        // erase and republish.
        host_index.replace(1, interloper);

        republish_chain_head(&host_index, 1, Some(ours));

        assert_eq!(host_index.load(1), Some(ours));
        assert_eq!(chain_next(ours), Some(interloper));

        unsafe {
            Entry::reclaim(ours);
            Entry::reclaim(interloper);
        }
    }
}
