// SPDX-License-Identifier: MPL-2.0

//! The collaborator surface this crate consumes: the underlying IOMMU page
//! allocator and unmap primitive.
//!
//! Performing the underlying IOMMU page allocation is out of scope for
//! this crate; these traits exist only to describe the interface the
//! core consumes (`IommuUnmap`) and, for completeness, the interface a
//! driver uses around the cache (`IommuPageAllocator`). The cache itself
//! never calls `iommu_alloc` — a driver calls it to fill a cache miss
//! and then publishes the result with [`crate::Cache::add`].

use core::ops::Range;

use crate::{direction::DmaDirection, error::CacheError, Pfn};

/// The external unmap primitive invoked by the evictor and by
/// [`crate::Cache::free`].
///
/// A single call describes one contiguous run of DMA pages
/// `[dma_base, dma_base + length)`. The evictor coalesces adjacent pages
/// into runs before calling this, so a caller backed by, say, an IOMMU
/// second-stage page table can tear down a run with one page-table walk
/// instead of one per page.
pub trait IommuUnmap: Send + Sync {
    /// Tears down the IOMMU translation for `length` consecutive DMA pages
    /// starting at `dma_base`. Must not fail: by the time this is called,
    /// the cache has already committed to the removal (decremented
    /// `cache_size`, erased the indices), so there is nothing meaningful a
    /// caller could do with an error here beyond logging it.
    fn iommu_unmap(&self, dma_base: Pfn, length: u64);
}

/// The full collaborator surface: allocation plus unmap.
///
/// This is the interface a driver implements around its IOMMU; the cache
/// only ever uses the [`IommuUnmap`] half.
pub trait IommuPageAllocator: IommuUnmap {
    /// Allocates a fresh, contiguous run of DMA pages for the given host
    /// page range and direction. Used by a driver to fill a cache miss,
    /// never called by this crate's own code.
    fn iommu_alloc(&self, host_pages: Range<Pfn>, direction: DmaDirection) -> Result<Pfn, CacheError>;
}
