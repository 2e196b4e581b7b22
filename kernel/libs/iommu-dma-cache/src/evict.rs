// SPDX-License-Identifier: MPL-2.0

//! The FIFO evictor: reclaims idle entries once the cache exceeds its
//! configured budget, batching their DMA pages into coalesced runs before
//! handing them to the external unmap primitive.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use log::{debug, trace};

use crate::{cache::Cache, index, iommu::IommuUnmap, Pfn};

#[cfg(feature = "event-log")]
use crate::observer::CacheEvent;

/// A coalesced `(dma_base, length)` run describing a contiguous DMA page
/// range; this is the contract between the evictor and
/// [`IommuUnmap::iommu_unmap`].
pub(crate) struct RunBuffer {
    runs: Vec<(Pfn, u64)>,
}

impl RunBuffer {
    /// Attempts to preallocate capacity for `requested` runs (the worst
    /// case, one run per page). Returns `None` on reservation failure
    /// rather than silently continuing with a buffer that would just
    /// reallocate on demand, so each call site can apply its own
    /// documented degrade policy for a batch-buffer allocation failure.
    pub(crate) fn try_new(requested: usize) -> Option<Self> {
        let mut runs = Vec::new();
        if runs.try_reserve(requested).is_err() {
            debug!(
                "iommu-dma-cache: batch buffer reservation failed for {requested} run(s)"
            );
            return None;
        }
        Some(Self { runs })
    }

    /// Appends `page` to the most recent run if it extends it, scanning
    /// the other recent runs as a fallback (the most recent is almost
    /// always the match), otherwise starts a new run.
    pub(crate) fn push_page(&mut self, page: Pfn) {
        if let Some(last) = self.runs.last_mut() {
            if last.0 + last.1 == page {
                last.1 += 1;
                return;
            }
        }
        for run in self.runs.iter_mut().rev().skip(1) {
            if run.0 + run.1 == page {
                run.1 += 1;
                return;
            }
        }
        self.runs.push((page, 1));
    }

    fn total_pages(&self) -> u64 {
        self.runs.iter().map(|(_, len)| *len).sum()
    }

    /// Consumes the buffer, yielding its coalesced runs for the caller to
    /// flush through the external unmap primitive.
    pub(crate) fn into_runs(self) -> Vec<(Pfn, u64)> {
        self.runs
    }
}

/// Runs one eviction pass, attempting to reclaim at least `requested`
/// pages: detach a batch, walk it claiming idle entries and requeuing
/// live ones, coalesce the claimed pages into runs, and hand those runs
/// to the external unmap primitive.
pub(crate) fn run_eviction<U: IommuUnmap>(cache: &Cache<U>, requested: usize) {
    let Some(head) = cache.fifo.take_batch() else {
        trace!("iommu-dma-cache: eviction requested but both FIFO halves are empty");
        return;
    };

    // Per the documented allocation-failure policy for eviction: re-attach
    // the detached batch unchanged and return. The evictor is re-entrant;
    // the next `free` that requests eviction will retry.
    let Some(mut batch) = RunBuffer::try_new(requested) else {
        debug!("iommu-dma-cache: eviction batch buffer allocation failed; re-attaching batch untouched");
        cache.fifo.return_remainder(Some(head));
        return;
    };

    let mut cursor = Some(head);
    let mut removed: usize = 0;

    while let Some(victim) = cursor {
        // Safety: `victim` is reachable only from the detached list we
        // just took ownership of; no other thread mutates its `fifo_link`
        // while we walk.
        let next = {
            let entry = unsafe { victim.as_ref() };
            let raw = entry.fifo_link.load(Ordering::Acquire);
            core::ptr::NonNull::new(raw)
        };

        let entry_ref = unsafe { victim.as_ref() };
        if entry_ref.try_claim(cache.config.removing_bias) {
            index::remove_entry(&cache.dma_index, &cache.host_index, victim);
            batch.push_page(entry_ref.dma_page());
            #[cfg(feature = "event-log")]
            cache.notify(CacheEvent::Evicted {
                dma_page: entry_ref.dma_page(),
            });
            // Safety: we just won `try_claim` and removed `victim` from
            // both indices, so we are its sole owner.
            unsafe { crate::entry::Entry::reclaim(victim) };
            removed += 1;
        } else {
            entry_ref.unclaim(cache.config.removing_bias);
            cache.fifo.requeue(victim);
        }

        cursor = next;
        if removed >= requested {
            break;
        }
    }

    cache.fifo.return_remainder(cursor);

    let freed = batch.total_pages();
    if freed > 0 {
        cache.cache_size.fetch_sub(freed as usize, Ordering::Release);
    }
    debug!("iommu-dma-cache: evicted {removed} entries across {} run(s), freeing {freed} pages", batch.runs.len());
    for (dma_base, length) in batch.runs {
        cache.unmapper.iommu_unmap(dma_base, length);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_contiguous_pages() {
        let mut buf = RunBuffer::try_new(4).unwrap();
        buf.push_page(10);
        buf.push_page(11);
        buf.push_page(12);
        buf.push_page(20);
        assert_eq!(buf.runs, alloc::vec![(10, 3), (20, 1)]);
        assert_eq!(buf.total_pages(), 4);
    }

    #[test]
    fn out_of_order_pages_still_coalesce_via_scan() {
        let mut buf = RunBuffer::try_new(4).unwrap();
        buf.push_page(10);
        buf.push_page(20);
        // 11 extends the first run, not the most recent one.
        buf.push_page(11);
        assert_eq!(buf.runs, alloc::vec![(10, 2), (20, 1)]);
    }
}
