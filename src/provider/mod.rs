//! Pinned-memory provider contract
//!
//! The allocator never maps memory itself; it draws fixed-size extents from
//! a [`PinnedMemoryProvider`] and hands them back at shutdown. A provider
//! promises three things about every region it returns:
//!
//! - the virtual base is page-aligned (slab headers must sit at page starts
//!   for signature probing to work),
//! - the pages are locked in RAM and safe for hardware DMA,
//! - the physical base is stable for the lifetime of the region token.
//!
//! Two implementations ship in-tree: [`locked::LockedMemory`] (anonymous
//! `mmap` + `mlock`) and [`mock::MockProvider`] for tests. A production
//! deployment backs the same trait with its kernel DMA driver.

use std::ptr::NonNull;
use thiserror::Error;

pub mod locked;
pub mod mock;

pub use locked::LockedMemory;
pub use mock::MockProvider;

/// Bytes per virtual-memory page.
pub const PAGE_BYTES: usize = 4096;

/// NUMA placement hint forwarded to the provider. Providers may ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NumaNode(pub u32);

/// Opaque handle identifying a region to its provider, used for release and
/// remap bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionToken(pub u64);

/// A pinned, page-aligned extent of memory.
#[derive(Debug, Clone, Copy)]
pub struct PinnedRegion {
    /// Virtual base address; page-aligned.
    pub virt: NonNull<u8>,
    /// Physical (bus) base address reported by the provider.
    pub phys: u64,
    /// Length in bytes.
    pub len: usize,
    /// Provider handle for this region.
    pub token: RegionToken,
}

// A region handle is a bookkeeping record; the bytes it references are only
// touched under the allocator lock, which owns every live region.
unsafe impl Send for PinnedRegion {}
unsafe impl Sync for PinnedRegion {}

impl PinnedRegion {
    pub fn base_addr(&self) -> usize {
        self.virt.as_ptr() as usize
    }

    /// Whether `addr` falls inside this region.
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base_addr();
        addr >= base && addr < base + self.len
    }
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("region acquisition failed: {0}")]
    Acquire(String),

    #[error("region release failed: {0}")]
    Release(String),

    #[error("region remap failed: {0}")]
    Remap(String),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Source of pinned, DMA-capable memory extents.
pub trait PinnedMemoryProvider: Send + Sync {
    /// Acquire a pinned, page-aligned, zero-filled region of exactly `len`
    /// bytes. `len` must be a positive multiple of [`PAGE_BYTES`].
    fn acquire(&self, len: usize, numa: Option<NumaNode>) -> ProviderResult<PinnedRegion>;

    /// Return a region to the provider. Its virtual range becomes invalid.
    fn release(&self, region: PinnedRegion) -> ProviderResult<()>;

    /// Rebind `region`'s backing pages onto the fixed virtual range starting
    /// at `target`, which must be a previously released range of the same
    /// length. The returned region keeps its token and physical base but is
    /// addressed at `target`. This is the fork-safety primitive.
    fn remap_at(&self, region: PinnedRegion, target: NonNull<u8>) -> ProviderResult<PinnedRegion>;
}
