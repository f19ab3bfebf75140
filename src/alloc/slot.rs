//! Slot headers and per-allocation bookkeeping
//!
//! Every user-visible pointer is immediately preceded by a [`SlotHeader`]
//! stamped into the pinned extent itself. The signature word distinguishes
//! live slots from free ones (and trips on double frees); the {slab, slot}
//! pair recovers the owning records without pointer chasing. Mutable state
//! lives in [`SlotRecord`]s owned by the slab, with free-list links stored
//! as indices rather than raw pointers.

use serde::Serialize;
use std::fmt;
use std::panic::Location;
use std::ptr::NonNull;

/// Signature of a slot sitting on a free list.
pub const SLOT_FREE_SIG: u32 = 0xF1F2_F3F4;

/// Signature of a live slot.
pub const SLOT_ALLOC_SIG: u32 = 0xA1A2_A3A4;

/// Raw header preceding every user pointer inside a slab extent.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHeader {
    pub signature: u32,
    pub class: u32,
    pub slab: u32,
    pub slot: u32,
}

/// Bytes reserved for the raw header in front of each user pointer.
pub const SLOT_HEADER_BYTES: usize = std::mem::size_of::<SlotHeader>();

impl SlotHeader {
    /// Read the header preceding `user_ptr`.
    ///
    /// # Safety
    ///
    /// `user_ptr` must point at least [`SLOT_HEADER_BYTES`] past the start
    /// of a mapped region; callers range-check against the slab registry
    /// first.
    pub unsafe fn read_before(user_ptr: NonNull<u8>) -> SlotHeader {
        (user_ptr.as_ptr().sub(SLOT_HEADER_BYTES) as *const SlotHeader).read_unaligned()
    }

    /// Stamp this header into the bytes preceding `user_ptr`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`SlotHeader::read_before`], plus the region
    /// must be writable.
    pub unsafe fn write_before(self, user_ptr: NonNull<u8>) {
        (user_ptr.as_ptr().sub(SLOT_HEADER_BYTES) as *mut SlotHeader).write_unaligned(self);
    }
}

/// Call site that requested an allocation, kept for leak reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocSite {
    pub file: &'static str,
    pub line: u32,
}

impl AllocSite {
    /// Capture the caller's source location.
    #[track_caller]
    pub fn here() -> AllocSite {
        let location = Location::caller();
        AllocSite {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl fmt::Display for AllocSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Location of a slot inside the registry: indices, not pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockRef {
    pub slab: u32,
    pub slot: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Alloc,
}

/// Bookkeeping for one slot; lives in its slab's record arena.
///
/// A slot is `Alloc` iff it was popped from a free list and not yet pushed
/// back; `site` is owned 1:1 with that state and cleared with the free
/// transition.
#[derive(Debug)]
pub struct SlotRecord {
    /// Offset of the user pointer from the slab base.
    pub user_offset: usize,
    pub state: SlotState,
    /// Diagnostic call site; present only while `Alloc`.
    pub site: Option<AllocSite>,
    /// Next slot in the class free list; meaningful only while `Free`.
    pub next_free: Option<BlockRef>,
}
