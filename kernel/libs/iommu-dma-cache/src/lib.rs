// SPDX-License-Identifier: MPL-2.0

//! A concurrent page cache for IOMMU DMA mappings.
//!
//! When a driver repeatedly maps the same host page(s) for DMA, obtaining a
//! fresh IOMMU translation each time is expensive. This crate memoises
//! previously-installed mappings and reuses them as long as the requested
//! [`DmaDirection`] is compatible with the installed one, deferring the
//! teardown of unused mappings until the cache grows past a configured
//! budget.
//!
//! The crate owns no device, no interrupt table and no page-table walker:
//! it is linked into a driver that supplies the actual IOMMU unmap
//! primitive (the [`iommu`] module's traits) and feeds it cache misses
//! filled by its own allocator. See [`Cache`] for the five public
//! operations.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod direction;
pub mod error;
pub mod iommu;
#[cfg(feature = "event-log")]
pub mod observer;

cfg_if::cfg_if! {
    if #[cfg(feature = "dma-cache")] {
        mod entry;
        mod evict;
        mod fifo;
        mod index;
        mod cache;
        pub use cache::Cache;
    } else {
        mod cache_stub;
        pub use cache_stub::Cache;
    }
}

pub use direction::{DefaultDirectionPolicy, DirectionPolicy, DmaDirection};
pub use error::CacheError;
pub use iommu::{IommuPageAllocator, IommuUnmap};
#[cfg(feature = "event-log")]
pub use observer::{CacheEvent, CacheObserver};

/// A host or DMA page number.
pub type Pfn = u64;

/// The bias subtracted from an entry's reference count to mark it as
/// claimed by the evictor. Must exceed any plausible number of live
/// references; this is the same magic value the original cache uses.
pub const DEFAULT_REMOVING_BIAS: isize = 0x0DEAD_BEE;

/// Tunable constants governing a [`Cache`]'s behaviour. The defaults match
/// the concrete choices called out by the original design.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// The cache's budget, as a percentage of the total page count passed
    /// to [`Cache::init`]/[`Cache::with_config`].
    pub max_percent: u8,
    /// Pages requested from the evictor beyond the amount strictly needed
    /// to get back under budget, amortising eviction cost by draining
    /// slightly below the high-water mark.
    pub threshold: usize,
    /// The bias applied to an entry's reference count while it is claimed
    /// for removal.
    pub removing_bias: isize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_percent: 75,
            threshold: 128,
            removing_bias: DEFAULT_REMOVING_BIAS,
        }
    }
}
