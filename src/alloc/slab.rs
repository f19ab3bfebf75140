//! Slab creation and raw extent layout
//!
//! A slab is one pinned extent carved into consecutive slots of a single
//! size class. The first [`SLAB_HEADER_BYTES`] of the extent hold a
//! [`SlabHeader`] whose signature and physical base drive the backward
//! page walk of physical-address resolution; slabs therefore always start
//! on a page boundary.
//!
//! Slabs never shrink, merge, or get destroyed individually. Their backing
//! storage can be swapped at fork time, but the virtual range — and every
//! outstanding pointer into it — stays put.

use crate::alloc::size_class::{ClassTable, SizeClass};
use crate::alloc::slot::{BlockRef, SlotHeader, SlotRecord, SlotState, SLOT_FREE_SIG, SLOT_HEADER_BYTES};
use crate::provider::PinnedRegion;
use std::ptr::NonNull;
use tracing::debug;

/// Magic stamped at every slab base ("PINSLAB!"), probed at page starts by
/// the physical-address walk.
pub const SLAB_SIGNATURE: u64 = 0x5049_4E53_4C41_4221;

/// Bytes reserved at the start of every extent. The header struct must fit;
/// the remainder is padding so the first slot starts on a fixed boundary.
pub const SLAB_HEADER_BYTES: usize = 64;

/// Raw header at the base of every slab extent.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SlabHeader {
    pub signature: u64,
    pub slab_id: u32,
    pub class: u32,
    pub physical_base: u64,
    pub region_len: u64,
}

const _: () = assert!(std::mem::size_of::<SlabHeader>() <= SLAB_HEADER_BYTES);

impl SlabHeader {
    /// Read the header at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the page-aligned start of a mapped region at least
    /// [`SLAB_HEADER_BYTES`] long.
    pub unsafe fn read_from(base: NonNull<u8>) -> SlabHeader {
        (base.as_ptr() as *const SlabHeader).read()
    }

    /// Stamp this header at `base`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`SlabHeader::read_from`], plus writability.
    pub unsafe fn write_to(self, base: NonNull<u8>) {
        (base.as_ptr() as *mut SlabHeader).write(self);
    }
}

/// One pinned extent plus the records for every slot carved from it.
#[derive(Debug)]
pub struct Slab {
    pub id: u32,
    pub class: SizeClass,
    /// Slot stride in bytes, cached from the class table at carve time.
    pub slot_bytes: usize,
    pub region: PinnedRegion,
    pub slots: Vec<SlotRecord>,
}

impl Slab {
    /// Carve `region` into slots of `class`: stamp the raw slot headers,
    /// build the records, and chain them LIFO through their `next_free`
    /// links. Returns the slab and the head of its local free chain. The
    /// slab is not yet published; pushing it into the registry is the
    /// caller's last step.
    pub fn carve(
        id: u32,
        class: SizeClass,
        region: PinnedRegion,
        table: &ClassTable,
    ) -> (Slab, Option<BlockRef>) {
        let slot_bytes = table.slot_bytes(class);
        let alignment = table.alignment();
        let mut slots = Vec::with_capacity(table.slots_per_slab(class));
        let mut head: Option<BlockRef> = None;

        let mut cursor = SLAB_HEADER_BYTES;
        while cursor + slot_bytes <= region.len {
            // Pad so the user pointer, not the slot start, lands on the
            // alignment boundary. The extent base is page-aligned, so
            // offsets and absolute addresses agree.
            let user_offset = align_up(cursor + SLOT_HEADER_BYTES, alignment);
            let index = slots.len() as u32;

            let header = SlotHeader {
                signature: SLOT_FREE_SIG,
                class: class.index() as u32,
                slab: id,
                slot: index,
            };
            unsafe {
                let user_ptr = NonNull::new_unchecked(region.virt.as_ptr().add(user_offset));
                header.write_before(user_ptr);
            }

            slots.push(SlotRecord {
                user_offset,
                state: SlotState::Free,
                site: None,
                next_free: head,
            });
            head = Some(BlockRef { slab: id, slot: index });
            cursor += slot_bytes;
        }

        let slab = Slab {
            id,
            class,
            slot_bytes,
            region,
            slots,
        };
        slab.stamp_header();
        debug!(slab = id, class = class.index(), slots = slab.slots.len(), "carved slab");
        (slab, head)
    }

    /// Write the slab header from current region facts. Called once at
    /// creation and again after a fork-time rebind changes the physical
    /// base.
    pub fn stamp_header(&self) {
        let header = SlabHeader {
            signature: SLAB_SIGNATURE,
            slab_id: self.id,
            class: self.class.index() as u32,
            physical_base: self.region.phys,
            region_len: self.region.len as u64,
        };
        unsafe { header.write_to(self.region.virt) };
    }

    pub fn base_addr(&self) -> usize {
        self.region.base_addr()
    }

    /// Whether `addr` lies anywhere inside this slab's extent.
    pub fn contains(&self, addr: usize) -> bool {
        self.region.contains(addr)
    }

    /// User pointer for slot `index`.
    pub fn user_ptr(&self, index: u32) -> NonNull<u8> {
        let offset = self.slots[index as usize].user_offset;
        unsafe { NonNull::new_unchecked(self.region.virt.as_ptr().add(offset)) }
    }

    /// Recover the slot whose user pointer is exactly `addr`, if any.
    pub fn slot_of_user_addr(&self, addr: usize) -> Option<u32> {
        let offset = addr.checked_sub(self.base_addr())?;
        if offset < SLAB_HEADER_BYTES {
            return None;
        }
        let index = (offset - SLAB_HEADER_BYTES) / self.slot_bytes;
        let record = self.slots.get(index)?;
        (record.user_offset == offset).then_some(index as u32)
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
