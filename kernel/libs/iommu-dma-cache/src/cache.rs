// SPDX-License-Identifier: MPL-2.0

//! The public `Cache` type: `init`/`destroy`/`add`/`use_mapping`/`free`.
//!
//! Field names here are load-bearing: `crate::evict::run_eviction` reaches
//! into `fifo`, `dma_index`, `host_index`, `cache_size`, `config` and
//! `unmapper` directly rather than through accessor methods, the same way
//! this workspace's tightly-coupled internal modules (e.g. `vm::dma` and
//! its owning `VmIo` impls) share fields across a `pub(crate)` boundary
//! instead of duplicating a getter per field.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use alloc::vec::Vec;
use log::warn;

use crate::{
    direction::{DefaultDirectionPolicy, DirectionPolicy, DmaDirection},
    entry::Entry,
    error::CacheError,
    evict,
    fifo::Fifo,
    index::{self, DmaPageIndex, HostPageIndex},
    iommu::IommuUnmap,
    CacheConfig, Pfn,
};

#[cfg(feature = "event-log")]
use crate::observer::{CacheEvent, CacheObserver};

/// A concurrent page cache for IOMMU DMA mappings, parameterised over the
/// collaborator that actually tears down IOMMU translations.
///
/// `U` need only satisfy [`IommuUnmap`]: the cache never allocates a DMA
/// mapping itself (see `crate::iommu`'s module documentation), only tears
/// existing ones down.
pub struct Cache<U: IommuUnmap> {
    page_shift: u32,
    pub(crate) host_index: HostPageIndex,
    pub(crate) dma_index: DmaPageIndex,
    pub(crate) fifo: Fifo,
    pub(crate) cache_size: AtomicUsize,
    max_cache_size: usize,
    pub(crate) config: CacheConfig,
    pub(crate) unmapper: U,
    #[cfg(feature = "event-log")]
    observer: Option<&'static dyn CacheObserver>,
}

impl<U: IommuUnmap> Cache<U> {
    /// Installs a cache sized at `config.max_percent` of `total_pages`,
    /// covering host/DMA addresses whose page number is `addr >>
    /// page_shift`.
    pub fn with_config(page_shift: u32, total_pages: u64, config: CacheConfig, unmapper: U) -> Self {
        let max_cache_size = (config.max_percent as u64 * total_pages / 100) as usize;
        Self {
            page_shift,
            host_index: HostPageIndex::new(),
            dma_index: DmaPageIndex::new(),
            fifo: Fifo::new(),
            cache_size: AtomicUsize::new(0),
            max_cache_size,
            config,
            unmapper,
            #[cfg(feature = "event-log")]
            observer: None,
        }
    }

    /// `with_config` with [`CacheConfig::default`].
    pub fn init(page_shift: u32, total_pages: u64, unmapper: U) -> Self {
        Self::with_config(page_shift, total_pages, CacheConfig::default(), unmapper)
    }

    /// Installs the observer that the `event-log` feature notifies of
    /// reference-lifecycle events. No-op until one is set.
    #[cfg(feature = "event-log")]
    pub fn set_observer(&mut self, observer: &'static dyn CacheObserver) {
        self.observer = Some(observer);
    }

    #[cfg(feature = "event-log")]
    pub(crate) fn notify(&self, event: CacheEvent) {
        if let Some(observer) = self.observer {
            observer.record(event);
        }
    }

    /// `max_cache_size == 0` is the runtime passthrough sentinel:
    /// `add`/`use_mapping` become no-ops and `free` forwards straight to
    /// the external unmap, independent of the `dma-cache` build-time
    /// feature.
    fn disabled(&self) -> bool {
        self.max_cache_size == 0
    }

    /// Publishes up to `npages` entries mapping `[host_addr, host_addr +
    /// npages << page_shift)` to `[dma_addr, dma_addr + npages <<
    /// page_shift)` under `direction`. Returns the count actually
    /// published; this may be less than `npages` on a duplicate DMA page,
    /// and the cache is left in a consistent state covering the published
    /// prefix either way.
    pub fn add(&self, host_addr: u64, npages: u64, dma_addr: u64, direction: DmaDirection) -> usize {
        if npages == 0 || self.disabled() {
            return 0;
        }
        let host_page = host_addr >> self.page_shift;
        let dma_page = dma_addr >> self.page_shift;

        // Pre-increment before attempting insertion: a saturated cache
        // that keeps failing to insert still consumes budget and
        // eventually triggers eviction.
        self.cache_size.fetch_add(npages as usize, Ordering::Relaxed);

        let mut inserted: u64 = 0;
        for i in 0..npages {
            let entry = Entry::new(host_page + i, dma_page + i, direction);
            if !self.dma_index.insert_unique(dma_page + i, entry) {
                warn!(
                    "iommu-dma-cache: add: dma_page={} already present; stopping at {inserted}/{npages}",
                    dma_page + i
                );
                // Safety: `entry` was never published anywhere.
                unsafe { Entry::reclaim(entry) };
                break;
            }

            let prior_head = self.host_index.replace(host_page + i, entry);
            if let Some(prior) = prior_head {
                index::set_chain_next(entry, Some(prior));
            }

            self.fifo.push_add(entry);
            inserted += 1;

            #[cfg(feature = "event-log")]
            self.notify(CacheEvent::Added {
                host_page: host_page + i,
                dma_page: dma_page + i,
                direction,
            });
        }
        inserted as usize
    }

    /// Looks up a cached, direction-compatible range of `npages` pages
    /// starting at `host_addr`, acquiring a reference on each page found.
    /// Returns the DMA base address of the range, or
    /// [`CacheError::NotFound`], with direction compatibility decided by a
    /// caller supplied [`DirectionPolicy`].
    pub fn use_mapping<P: DirectionPolicy>(
        &self,
        host_addr: u64,
        npages: u64,
        direction: DmaDirection,
    ) -> Result<u64, CacheError> {
        if npages == 0 || self.disabled() {
            return Err(CacheError::NotFound);
        }
        let host_page = host_addr >> self.page_shift;
        let Some(head) = self.host_index.load(host_page) else {
            return Err(CacheError::NotFound);
        };

        let mut cursor = Some(head);
        while let Some(candidate) = cursor {
            // Safety: entries reachable from the host-page index are never
            // deallocated while we hold no reference yet, because removal
            // only claims entries with `count == 0` and this walk does not
            // mutate `count` until a successful `try_acquire` below.
            let candidate_ref = unsafe { candidate.as_ref() };
            if candidate_ref.host_page() == host_page
                && P::compatible(candidate_ref.direction(), direction)
            {
                if let Some(dma_page) = self.try_acquire_range::<P>(candidate, npages, direction) {
                    #[cfg(feature = "event-log")]
                    self.notify(CacheEvent::Acquired { dma_page });
                    return Ok(dma_page << self.page_shift);
                }
            }
            cursor = index::chain_next(candidate);
        }
        Err(CacheError::NotFound)
    }

    /// [`Cache::use_mapping`] with [`DefaultDirectionPolicy`].
    pub fn use_mapping_default(
        &self,
        host_addr: u64,
        npages: u64,
        direction: DmaDirection,
    ) -> Result<u64, CacheError> {
        self.use_mapping::<DefaultDirectionPolicy>(host_addr, npages, direction)
    }

    /// Attempts to acquire `npages` starting at `e0`, walking offsets from
    /// the highest down to 1 so a missing tail fails fast. Undoes every
    /// successful acquisition on failure.
    fn try_acquire_range<P: DirectionPolicy>(
        &self,
        e0: NonNull<Entry>,
        npages: u64,
        direction: DmaDirection,
    ) -> Option<Pfn> {
        let e0_ref = unsafe { e0.as_ref() };
        if !e0_ref.try_acquire(self.config.removing_bias) {
            return None;
        }

        let mut acquired = Vec::with_capacity(npages as usize);
        acquired.push(e0);

        for i in (1..npages).rev() {
            let target_dma = e0_ref.dma_page() + i;
            let Some(candidate) = self.dma_index.load(target_dma) else {
                self.rollback(&acquired);
                return None;
            };
            // Safety: `candidate` came from a live index lookup; it cannot
            // be freed while we have not yet decided whether to acquire it,
            // because freeing requires `try_claim`, which only succeeds at
            // `count == 0` and we are about to observe/mutate `count` here.
            let candidate_ref = unsafe { candidate.as_ref() };
            if candidate_ref.host_page() != e0_ref.host_page() + i
                || !P::compatible(candidate_ref.direction(), direction)
            {
                self.rollback(&acquired);
                return None;
            }
            if !candidate_ref.try_acquire(self.config.removing_bias) {
                self.rollback(&acquired);
                return None;
            }
            acquired.push(candidate);
        }

        Some(e0_ref.dma_page())
    }

    fn rollback(&self, acquired: &[NonNull<Entry>]) {
        for e in acquired {
            // Safety: each pointer in `acquired` was just successfully
            // acquired by us above and is still reachable.
            unsafe { e.as_ref() }.release();
        }
    }

    /// Releases one cached reference on `dma_page`, notifying the observer
    /// if one is installed. Returns `false` if `dma_page` was never cached,
    /// in which case the caller must unmap it directly.
    fn release_cached_page(&self, dma_page: Pfn) -> bool {
        let Some(e) = self.dma_index.load(dma_page) else {
            return false;
        };
        // Safety: `e` is reachable from a live index entry.
        unsafe { e.as_ref() }.release();
        #[cfg(feature = "event-log")]
        self.notify(CacheEvent::Released { dma_page });
        true
    }

    /// Decrements the reference count of every cached page in
    /// `[dma_addr, dma_addr + npages << page_shift)`, unmapping directly
    /// any page that was never cached, then triggers eviction if the
    /// cache is over budget.
    pub fn free(&self, dma_addr: u64, npages: u64) {
        if npages == 0 {
            return;
        }
        let dma_page = dma_addr >> self.page_shift;

        if self.disabled() {
            self.unmapper.iommu_unmap(dma_page, npages);
            return;
        }

        // Per the documented allocation-failure policy for `free`: fall
        // back to a per-page unmap path rather than coalescing.
        match evict::RunBuffer::try_new(npages as usize) {
            Some(mut immediate) => {
                for i in 0..npages {
                    if !self.release_cached_page(dma_page + i) {
                        immediate.push_page(dma_page + i);
                    }
                }
                for (base, length) in immediate.into_runs() {
                    self.unmapper.iommu_unmap(base, length);
                }
            }
            None => {
                warn!(
                    "iommu-dma-cache: free: batch buffer allocation failed; falling back to per-page unmap"
                );
                for i in 0..npages {
                    if !self.release_cached_page(dma_page + i) {
                        self.unmapper.iommu_unmap(dma_page + i, 1);
                    }
                }
            }
        }

        let size = self.cache_size.load(Ordering::Acquire);
        if size > self.max_cache_size {
            let exceeding = size - self.max_cache_size;
            evict::run_eviction(self, exceeding + self.config.threshold);
        }
    }

    /// Drains every cached entry through the evictor and tears down the
    /// indices. The caller must ensure no other cache operation is in
    /// flight.
    pub fn destroy(mut self) {
        loop {
            let remaining = self.cache_size.load(Ordering::Acquire);
            if remaining == 0 {
                break;
            }
            evict::run_eviction(&self, remaining);
            if self.cache_size.load(Ordering::Acquire) == remaining {
                // No entry was claimable. Under the no-concurrent-callers
                // precondition this cannot happen; break rather than spin
                // forever if it somehow does.
                warn!("iommu-dma-cache: destroy made no progress with {remaining} pages still cached");
                break;
            }
        }
        // Safety: the loop above only exits once `cache_size` is zero (or
        // after logging an impossible-under-precondition stall), and
        // `destroy` consumes `self`, so no concurrent operation can be
        // touching the FIFO.
        unsafe { self.fifo.destroy() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicU64;

    struct RecordingUnmapper {
        calls: AtomicU64,
        pages: AtomicU64,
    }

    impl RecordingUnmapper {
        fn new() -> Self {
            Self {
                calls: AtomicU64::new(0),
                pages: AtomicU64::new(0),
            }
        }
    }

    impl IommuUnmap for RecordingUnmapper {
        fn iommu_unmap(&self, _dma_base: Pfn, length: u64) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.pages.fetch_add(length, Ordering::Relaxed);
        }
    }

    fn cache(total_pages: u64) -> Cache<RecordingUnmapper> {
        Cache::init(12, total_pages, RecordingUnmapper::new())
    }

    #[test]
    fn add_then_use_returns_dma_base() {
        let c = cache(100);
        assert_eq!(c.add(0x1000, 4, 0xD000, DmaDirection::ToDevice), 4);
        let dma = c
            .use_mapping_default(0x1000, 4, DmaDirection::ToDevice)
            .unwrap();
        assert_eq!(dma, 0xD000);
    }

    #[test]
    fn partial_range_at_tail_offset_still_resolves() {
        let c = cache(100);
        c.add(0x1000, 4, 0xD000, DmaDirection::ToDevice);
        assert_eq!(
            c.use_mapping_default(0x1000, 2, DmaDirection::ToDevice)
                .unwrap(),
            0xD000
        );
        assert_eq!(
            c.use_mapping_default(0x2000, 3, DmaDirection::ToDevice)
                .unwrap(),
            0xE000
        );
    }

    #[test]
    fn direction_mismatch_is_not_found_then_matches() {
        let c = cache(100);
        c.add(0x1000, 4, 0xD000, DmaDirection::FromDevice);
        assert_eq!(
            c.use_mapping_default(0x1000, 4, DmaDirection::ToDevice),
            Err(CacheError::NotFound)
        );
        assert_eq!(
            c.use_mapping_default(0x1000, 4, DmaDirection::FromDevice)
                .unwrap(),
            0xD000
        );
    }

    #[test]
    fn missing_tail_page_rejects_without_leaking_head_reference() {
        let c = cache(100);
        // Install only the first of what would be a 2-page range.
        c.add(0x1000, 1, 0xD000, DmaDirection::ToDevice);
        assert_eq!(
            c.use_mapping_default(0x1000, 2, DmaDirection::ToDevice),
            Err(CacheError::NotFound)
        );
        // The head page must still be acquirable on its own afterwards.
        assert_eq!(
            c.use_mapping_default(0x1000, 1, DmaDirection::ToDevice)
                .unwrap(),
            0xD000
        );
    }

    #[test]
    fn free_of_uncached_page_forwards_to_unmap_once() {
        let c = cache(100);
        c.add(0x1000, 1, 0xD000, DmaDirection::ToDevice);
        let before = c.cache_size.load(Ordering::Relaxed);
        c.free(0xF000, 1);
        assert_eq!(c.cache_size.load(Ordering::Relaxed), before);
        assert_eq!(c.unmapper.calls.load(Ordering::Relaxed), 1);
        assert_eq!(c.unmapper.pages.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn exceeding_budget_triggers_eviction_on_free() {
        // max_cache_size = 75% of 10 -> 7; install 8 single-page mappings.
        let config = CacheConfig {
            threshold: 0,
            ..CacheConfig::default()
        };
        let c = Cache::with_config(12, 10, config, RecordingUnmapper::new());
        for i in 0..8u64 {
            c.add(0x1000 + (i << 12), 1, 0xD000 + (i << 12), DmaDirection::ToDevice);
        }
        assert_eq!(c.cache_size.load(Ordering::Relaxed), 8);
        for i in 0..8u64 {
            c.free(0xD000 + (i << 12), 1);
        }
        assert!(c.cache_size.load(Ordering::Relaxed) <= 7);
        assert!(c.unmapper.calls.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn concurrent_use_returns_the_same_entry_to_every_caller() {
        use std::thread;

        let c = Arc::new(cache(100));
        c.add(0x1000, 1, 0xD000, DmaDirection::ToDevice);

        let c1 = Arc::clone(&c);
        let t1 = thread::spawn(move || {
            c1.use_mapping_default(0x1000, 1, DmaDirection::ToDevice)
        });
        let c2 = Arc::clone(&c);
        let t2 = thread::spawn(move || {
            c2.use_mapping_default(0x1000, 1, DmaDirection::ToDevice)
        });

        let r1 = t1.join().unwrap().unwrap();
        let r2 = t2.join().unwrap().unwrap();
        assert_eq!(r1, 0xD000);
        assert_eq!(r2, 0xD000);

        // Three holders total: the implicit one from `add` plus the two
        // `use_mapping` calls above. Releasing all three only makes the
        // entry idle (count == 0), not gone -- it stays acquirable until
        // an evictor pass actually claims it.
        c.free(0xD000, 1);
        c.free(0xD000, 1);
        c.free(0xD000, 1);
        assert_eq!(
            c.use_mapping_default(0x1000, 1, DmaDirection::ToDevice)
                .unwrap(),
            0xD000
        );
    }

    #[test]
    fn npages_zero_is_a_no_op_for_every_operation() {
        let c = cache(100);
        assert_eq!(c.add(0x1000, 0, 0xD000, DmaDirection::ToDevice), 0);
        assert_eq!(
            c.use_mapping_default(0x1000, 0, DmaDirection::ToDevice),
            Err(CacheError::NotFound)
        );
        assert_eq!(c.cache_size.load(Ordering::Relaxed), 0);
        c.free(0xD000, 0);
        assert_eq!(c.unmapper.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn at_budget_no_eviction_one_over_triggers_it() {
        // max_cache_size = 75% of 10 -> 7.
        let config = CacheConfig {
            threshold: 0,
            ..CacheConfig::default()
        };
        let c = Cache::with_config(12, 10, config, RecordingUnmapper::new());
        for i in 0..7u64 {
            c.add(i << 12, 1, i << 12, DmaDirection::ToDevice);
        }
        assert_eq!(c.cache_size.load(Ordering::Relaxed), 7);
        // Exactly at budget: freeing without exceeding it must not evict.
        c.free(0, 1);
        assert_eq!(c.unmapper.calls.load(Ordering::Relaxed), 0);
        assert_eq!(c.cache_size.load(Ordering::Relaxed), 7);

        // One more push past budget does trigger an eviction pass.
        c.add(7 << 12, 1, 7 << 12, DmaDirection::ToDevice);
        assert_eq!(c.cache_size.load(Ordering::Relaxed), 8);
        c.free(7 << 12, 1);
        assert!(c.unmapper.calls.load(Ordering::Relaxed) >= 1);
        assert!(c.cache_size.load(Ordering::Relaxed) <= 7);
    }

    #[test]
    fn installing_past_budget_then_freeing_all_bounds_cache_size_and_unmap_count() {
        // max_cache_size = 75% of 10 -> 7; install 12 single-page mappings,
        // well past budget, then free every one of them.
        let config = CacheConfig {
            threshold: 1,
            ..CacheConfig::default()
        };
        let c = Cache::with_config(12, 10, config, RecordingUnmapper::new());
        for i in 0..12u64 {
            c.add(i << 12, 1, i << 12, DmaDirection::ToDevice);
        }
        assert_eq!(c.cache_size.load(Ordering::Relaxed), 12);

        for i in 0..12u64 {
            c.free(i << 12, 1);
        }

        assert!(c.cache_size.load(Ordering::Relaxed) <= 7);
        let installed = 12u64;
        let remaining = c.cache_size.load(Ordering::Relaxed) as u64;
        assert_eq!(c.unmapper.pages.load(Ordering::Relaxed), installed - remaining);
    }

    #[test]
    fn free_never_added_page_unmaps_once_and_leaves_cache_size_untouched() {
        let c = cache(100);
        c.add(0x1000, 1, 0xD000, DmaDirection::ToDevice);
        let before = c.cache_size.load(Ordering::Relaxed);
        c.free(0xFFFF_000, 1);
        assert_eq!(c.cache_size.load(Ordering::Relaxed), before);
        assert_eq!(c.unmapper.calls.load(Ordering::Relaxed), 1);
        assert_eq!(c.unmapper.pages.load(Ordering::Relaxed), 1);
    }

    #[derive(Clone)]
    struct SharedCountingUnmapper(Arc<AtomicU64>);

    impl IommuUnmap for SharedCountingUnmapper {
        fn iommu_unmap(&self, _dma_base: Pfn, length: u64) {
            self.0.fetch_add(length, Ordering::Relaxed);
        }
    }

    #[test]
    fn destroy_drains_every_entry_through_the_evictor() {
        let unmapped = Arc::new(AtomicU64::new(0));
        let c = Cache::init(12, 100, SharedCountingUnmapper(Arc::clone(&unmapped)));
        for i in 0..5u64 {
            c.add(i << 12, 1, i << 12, DmaDirection::ToDevice);
            c.free(i << 12, 1);
        }
        c.destroy();
        assert_eq!(unmapped.load(Ordering::Relaxed), 5);
    }
}
