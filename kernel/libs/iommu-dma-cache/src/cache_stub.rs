// SPDX-License-Identifier: MPL-2.0

//! The `dma-cache`-disabled build: a zero-sized stand-in with the same
//! public surface as `crate::cache::Cache`, for kernel configurations that
//! want the IOMMU driver wired up without ever caching DMA mappings.
//! Caching on or off is a build-time configuration choice, not a runtime
//! API: `add`/`use_mapping` are no-ops and `free` forwards straight
//! through.

use crate::{
    direction::{DirectionPolicy, DmaDirection},
    error::CacheError,
    iommu::IommuUnmap,
    CacheConfig,
};

pub struct Cache<U: IommuUnmap> {
    page_shift: u32,
    unmapper: U,
}

impl<U: IommuUnmap> Cache<U> {
    pub fn with_config(page_shift: u32, _total_pages: u64, _config: CacheConfig, unmapper: U) -> Self {
        Self { page_shift, unmapper }
    }

    pub fn init(page_shift: u32, total_pages: u64, unmapper: U) -> Self {
        Self::with_config(page_shift, total_pages, CacheConfig::default(), unmapper)
    }

    pub fn add(&self, _host_addr: u64, _npages: u64, _dma_addr: u64, _direction: DmaDirection) -> usize {
        0
    }

    pub fn use_mapping<P: DirectionPolicy>(
        &self,
        _host_addr: u64,
        _npages: u64,
        _direction: DmaDirection,
    ) -> Result<u64, CacheError> {
        Err(CacheError::NotFound)
    }

    pub fn use_mapping_default(
        &self,
        host_addr: u64,
        npages: u64,
        direction: DmaDirection,
    ) -> Result<u64, CacheError> {
        self.use_mapping::<crate::direction::DefaultDirectionPolicy>(host_addr, npages, direction)
    }

    pub fn free(&self, dma_addr: u64, npages: u64) {
        if npages == 0 {
            return;
        }
        self.unmapper.iommu_unmap(dma_addr >> self.page_shift, npages);
    }

    pub fn destroy(self) {}
}
