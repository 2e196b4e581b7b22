// SPDX-License-Identifier: MPL-2.0

//! Error kinds.
//!
//! Nothing in this crate is fatal: every error degrades to "treat this as
//! an uncached, directly-installed mapping", which is slower but correct.
//! Matching the rest of this workspace's `no_std` crates (e.g.
//! `vm::dma::DmaError`), this is a plain enum with no `std::error::Error`
//! implementation.

/// An error reported by a cache operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// `add` was asked to publish a DMA page that is already present in
    /// the DMA-page index. This is a programming error by the caller (the
    /// same DMA page was mapped twice); the insertion loop stops and the
    /// cache is left holding the prefix that was successfully published.
    DuplicateDmaPage,
    /// `use_mapping` could not find a compatible cached range.
    NotFound,
}
