//! Allocator facade
//!
//! The public alloc/free/reallocate/size-query/physical-address surface,
//! backed by a single global lock. Coarse-grained on purpose: the dominant
//! cost around this allocator is hardware I/O latency, not lock contention,
//! and one lock means no ordering hazards anywhere.
//!
//! Slabs are created lazily, on the first request against an empty pool,
//! and published into the append-only registry only once fully carved.

use crate::alloc::pool::{Pool, PoolStats};
use crate::alloc::size_class::{ClassTable, SizeClass, CLASS_COUNT};
use crate::alloc::slab::{Slab, SlabHeader, SLAB_SIGNATURE};
use crate::alloc::slot::{
    AllocSite, BlockRef, SlotHeader, SlotState, SLOT_ALLOC_SIG, SLOT_FREE_SIG,
};
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::provider::{LockedMemory, NumaNode, PinnedMemoryProvider, PAGE_BYTES};
use parking_lot::Mutex;
use serde::Serialize;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, error, info};

pub(crate) struct AllocatorState {
    /// Append-only slab registry; a slab is pushed only once fully carved,
    /// so a traversal never observes a partially built slab.
    pub(crate) slabs: Vec<Slab>,
    pub(crate) pools: [Pool; CLASS_COUNT],
    pub(crate) shut_down: bool,
}

/// Slab-based allocator for pinned, DMA-capable memory.
///
/// All methods take `&self`; every pool and slab mutation is serialized by
/// one internal lock, so the allocator can be shared freely across threads.
pub struct PinnedAllocator {
    pub(crate) config: AllocatorConfig,
    pub(crate) classes: ClassTable,
    pub(crate) provider: Arc<dyn PinnedMemoryProvider>,
    pub(crate) state: Mutex<AllocatorState>,
}

lazy_static::lazy_static! {
    /// Process-wide allocator over [`LockedMemory`], initialized on first
    /// use.
    static ref GLOBAL: PinnedAllocator = PinnedAllocator::with_defaults(
        Arc::new(LockedMemory::new()),
    ).expect("default allocator configuration is valid");
}

impl PinnedAllocator {
    pub fn new(config: AllocatorConfig, provider: Arc<dyn PinnedMemoryProvider>) -> Result<Self> {
        let classes = ClassTable::new(&config)?;
        let pools = SizeClass::ALL.map(Pool::new);
        info!(
            slab_bytes = config.slab_bytes,
            alignment = config.alignment,
            "pinned allocator initialized"
        );
        Ok(Self {
            config,
            classes,
            provider,
            state: Mutex::new(AllocatorState {
                slabs: Vec::new(),
                pools,
                shut_down: false,
            }),
        })
    }

    /// Create with the default configuration.
    pub fn with_defaults(provider: Arc<dyn PinnedMemoryProvider>) -> Result<Self> {
        Self::new(AllocatorConfig::default(), provider)
    }

    /// The process-wide allocator instance.
    pub fn global() -> &'static PinnedAllocator {
        &GLOBAL
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    /// Allocate `size` bytes of pinned memory, aligned to the configured
    /// boundary. The caller's source location is recorded as the block's
    /// diagnostic.
    #[track_caller]
    pub fn allocate(&self, size: usize, numa: Option<NumaNode>) -> Result<NonNull<u8>> {
        self.allocate_traced(size, numa, Some(AllocSite::here()))
    }

    /// Allocate with an explicit diagnostic site, or none at all.
    pub fn allocate_traced(
        &self,
        size: usize,
        numa: Option<NumaNode>,
        site: Option<AllocSite>,
    ) -> Result<NonNull<u8>> {
        let class = self.classes.class_for(size)?;
        let mut state = self.state.lock();

        if state.pools[class.index()].is_empty() {
            self.create_slab(&mut state, class, numa)?;
        }

        let (block, user) = Self::pop_free(&mut state, class, site)?;
        debug!(
            size,
            class = class.index(),
            slab = block.slab,
            slot = block.slot,
            "allocated pinned block"
        );
        Ok(user)
    }

    /// Release a block back to its pool. Null pointers are a no-op.
    pub fn free(&self, ptr: *mut u8) -> Result<()> {
        let user = match NonNull::new(ptr) {
            Some(p) => p,
            None => return Ok(()),
        };
        let mut state = self.state.lock();
        match Self::release_slot(&mut state, user) {
            Ok(block) => {
                debug!(slab = block.slab, slot = block.slot, "freed pinned block");
                Ok(())
            }
            Err(err) => {
                drop(state);
                self.report_corruption(err)
            }
        }
    }

    /// Resize a block. The new block is secured before the old one is
    /// touched: on failure the old block stays intact and the error
    /// propagates. A null `ptr` behaves as a plain allocation.
    #[track_caller]
    pub fn reallocate(
        &self,
        ptr: *mut u8,
        new_size: usize,
        numa: Option<NumaNode>,
    ) -> Result<NonNull<u8>> {
        let site = Some(AllocSite::here());
        let old = match NonNull::new(ptr) {
            Some(p) => p,
            None => return self.allocate_traced(new_size, numa, site),
        };

        let old_usable = self.usable_size(old.as_ptr())?;
        let new = self.allocate_traced(new_size, numa, site)?;

        // Both blocks belong to this caller; the copy needs no lock.
        let copy = old_usable.min(new_size);
        unsafe {
            std::ptr::copy_nonoverlapping(old.as_ptr() as *const u8, new.as_ptr(), copy);
        }
        self.free(old.as_ptr())?;
        Ok(new)
    }

    /// Usable capacity of a live block: its size class's slot capacity, not
    /// the exact requested size.
    pub fn usable_size(&self, ptr: *const u8) -> Result<usize> {
        let user = match NonNull::new(ptr as *mut u8) {
            Some(p) => p,
            None => return Err(Error::Unmanaged),
        };
        let addr = ptr as usize;
        let state = self.state.lock();

        let slab = state
            .slabs
            .iter()
            .find(|s| s.contains(addr))
            .ok_or(Error::Unmanaged)?;
        let slot = slab.slot_of_user_addr(addr).ok_or(Error::Unmanaged)?;
        if slab.slots[slot as usize].state != SlotState::Alloc {
            return Err(Error::Unmanaged);
        }

        let raw = unsafe { SlotHeader::read_before(user) };
        if raw.signature != SLOT_ALLOC_SIG {
            return Err(Error::Corruption(format!(
                "live slot at {:#x} carries signature {:#010x}",
                addr, raw.signature
            )));
        }
        Ok(self.classes.usable_bytes(slab.class))
    }

    /// Resolve the physical (bus) address backing `ptr`.
    ///
    /// Starting from the page containing `ptr`, walk backward one page at a
    /// time probing for the slab-header signature, up to `page_walk_limit`
    /// pages. Probes are checked against the registry first so the walk
    /// never touches foreign memory.
    pub fn physical_address(&self, ptr: *const u8) -> Result<u64> {
        if ptr.is_null() {
            return Err(Error::Unmanaged);
        }
        let addr = ptr as usize;
        let state = self.state.lock();

        let mut page = addr & !(PAGE_BYTES - 1);
        for _ in 0..=self.config.page_walk_limit {
            if let Some(slab) = state.slabs.iter().find(|s| s.contains(page)) {
                if page == slab.base_addr() {
                    let header = unsafe { SlabHeader::read_from(slab.region.virt) };
                    if header.signature != SLAB_SIGNATURE {
                        return Err(Error::Corruption(format!(
                            "slab header at {:#x} lost its signature",
                            page
                        )));
                    }
                    return Ok(header.physical_base + (addr - page) as u64);
                }
            }
            page = match page.checked_sub(PAGE_BYTES) {
                Some(prev) => prev,
                None => break,
            };
        }
        Err(Error::Unmanaged)
    }

    /// Snapshot of slab and pool occupancy.
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        let pools = SizeClass::ALL
            .iter()
            .map(|&class| {
                let mut total = 0;
                let mut free = 0;
                for slab in state.slabs.iter().filter(|s| s.class == class) {
                    total += slab.slots.len();
                    free += slab
                        .slots
                        .iter()
                        .filter(|r| r.state == SlotState::Free)
                        .count();
                }
                PoolStats {
                    class: class.index(),
                    slot_bytes: self.classes.slot_bytes(class),
                    usable_bytes: self.classes.usable_bytes(class),
                    total_slots: total,
                    free_slots: free,
                    live_slots: total - free,
                }
            })
            .collect();
        AllocatorStats {
            slab_count: state.slabs.len(),
            pools,
        }
    }

    fn create_slab(
        &self,
        state: &mut AllocatorState,
        class: SizeClass,
        numa: Option<NumaNode>,
    ) -> Result<()> {
        debug_assert!(state.pools[class.index()].is_empty());

        // Steady-state provider failure degrades to an allocation failure.
        let region = self
            .provider
            .acquire(self.config.slab_bytes, numa)
            .map_err(|e| Error::OutOfMemory(e.to_string()))?;

        if region.base_addr() % PAGE_BYTES != 0 {
            // A misaligned extent would break signature probing; refuse it.
            let _ = self.provider.release(region);
            return Err(Error::Provider(format!(
                "provider returned a non-page-aligned region at {:#x}",
                region.base_addr()
            )));
        }

        let slab_id = state.slabs.len() as u32;
        let (slab, head) = Slab::carve(slab_id, class, region, &self.classes);
        let slots = slab.slots.len();

        // Publishing is the last step of construction.
        state.slabs.push(slab);
        state.pools[class.index()].free_head = head;
        info!(slab = slab_id, class = class.index(), slots, "created slab");
        Ok(())
    }

    fn pop_free(
        state: &mut AllocatorState,
        class: SizeClass,
        site: Option<AllocSite>,
    ) -> Result<(BlockRef, NonNull<u8>)> {
        let AllocatorState { slabs, pools, .. } = state;
        let pool = &mut pools[class.index()];
        let block = pool
            .free_head
            .ok_or_else(|| Error::OutOfMemory("free list empty after slab creation".to_string()))?;

        let slab = slabs.get_mut(block.slab as usize).ok_or_else(|| {
            Error::Corruption(format!("free list names unknown slab {}", block.slab))
        })?;
        let base = slab.region.virt;
        let record = slab.slots.get_mut(block.slot as usize).ok_or_else(|| {
            Error::Corruption(format!(
                "free list names unknown slot {}/{}",
                block.slab, block.slot
            ))
        })?;

        if record.state != SlotState::Free {
            return Err(Error::Corruption(format!(
                "free-list head {}/{} is not FREE",
                block.slab, block.slot
            )));
        }
        let user = unsafe { NonNull::new_unchecked(base.as_ptr().add(record.user_offset)) };
        let raw = unsafe { SlotHeader::read_before(user) };
        if raw.signature != SLOT_FREE_SIG {
            return Err(Error::Corruption(format!(
                "slot {}/{} carries signature {:#010x} instead of the free signature",
                block.slab, block.slot, raw.signature
            )));
        }

        pool.free_head = record.next_free.take();
        record.state = SlotState::Alloc;
        record.site = site;
        unsafe {
            SlotHeader {
                signature: SLOT_ALLOC_SIG,
                ..raw
            }
            .write_before(user);
        }
        Ok((block, user))
    }

    fn release_slot(state: &mut AllocatorState, user: NonNull<u8>) -> Result<BlockRef> {
        let AllocatorState { slabs, pools, .. } = state;
        let addr = user.as_ptr() as usize;

        let slab_index = slabs
            .iter()
            .position(|s| s.contains(addr))
            .ok_or_else(|| Error::Corruption(format!("free of unmanaged address {:#x}", addr)))?;
        let slab = &mut slabs[slab_index];
        let slot = slab
            .slot_of_user_addr(addr)
            .ok_or_else(|| Error::Corruption(format!("free of interior address {:#x}", addr)))?;

        let raw = unsafe { SlotHeader::read_before(user) };
        if raw.signature == SLOT_FREE_SIG {
            return Err(Error::Corruption(format!("double free of {:#x}", addr)));
        }
        if raw.signature != SLOT_ALLOC_SIG {
            return Err(Error::Corruption(format!(
                "slot header at {:#x} carries signature {:#010x}",
                addr, raw.signature
            )));
        }
        if raw.slab as usize != slab_index || raw.slot != slot {
            return Err(Error::Corruption(format!(
                "slot header at {:#x} names {}/{} but the registry resolves {}/{}",
                addr, raw.slab, raw.slot, slab_index, slot
            )));
        }

        let class = slab.class;
        let block = BlockRef {
            slab: slab_index as u32,
            slot,
        };
        let record = &mut slab.slots[slot as usize];
        if record.state != SlotState::Alloc {
            return Err(Error::Corruption(format!(
                "record for {:#x} is not ALLOC",
                addr
            )));
        }

        // Diagnostic ownership ends with the ALLOC state, atomically.
        record.site = None;
        record.state = SlotState::Free;
        record.next_free = pools[class.index()].free_head.replace(block);
        unsafe {
            SlotHeader {
                signature: SLOT_FREE_SIG,
                ..raw
            }
            .write_before(user);
        }
        Ok(block)
    }

    fn report_corruption<T>(&self, err: Error) -> Result<T> {
        error!(error = %err, "corruption detected on free path");
        if self.config.strict_corruption {
            // Continuing over inconsistent bookkeeping is worse than dying.
            std::process::abort();
        }
        Err(err)
    }
}

/// Snapshot of allocator occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct AllocatorStats {
    pub slab_count: usize,
    pub pools: Vec<PoolStats>,
}
