// SPDX-License-Identifier: MPL-2.0

//! Optional per-entry reference-event instrumentation.
//!
//! An append-only per-entry event log is useful for debugging but not
//! part of the core contract, so it lives behind an independent observer
//! interface rather than a compiled-in log. This module is that
//! interface; it only exists when the crate is built with the
//! `event-log` feature, and the default [`Cache`](crate::Cache)
//! construction path costs nothing when it is disabled.

use crate::{direction::DmaDirection, Pfn};

/// A reference-lifecycle event a [`CacheObserver`] may be notified of.
#[derive(Debug, Clone, Copy)]
pub enum CacheEvent {
    Added {
        host_page: Pfn,
        dma_page: Pfn,
        direction: DmaDirection,
    },
    Acquired {
        dma_page: Pfn,
    },
    Released {
        dma_page: Pfn,
    },
    Evicted {
        dma_page: Pfn,
    },
}

/// An independent observer of cache reference events, for diagnostics
/// only. Never consulted for correctness.
pub trait CacheObserver: Send + Sync {
    fn record(&self, event: CacheEvent);
}
