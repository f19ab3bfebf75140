//! Pinned-memory slab allocator
//!
//! Carves provider-backed extents into fixed-size slots and hands out
//! aligned, individually trackable blocks.
//!
//! # Architecture
//!
//! ```text
//! PinnedAllocator (one global lock)
//!   ├─→ Pool(256B)   → free list: slab0/slot3 → slab0/slot7 → ...
//!   ├─→ Pool(1KiB)   → free list: slab1/slot0 → ...
//!   ├─→ Pool(4KiB) ... Pool(32KiB)
//!   └─→ Pool(max)    → one whole-slab slot per slab
//!
//! Slab registry (append-only)
//!   └─→ Slab { pinned region, slot records }
//!         [ SlabHeader │ pad SlotHeader user₀ ... │ pad SlotHeader user₁ ... ]
//! ```
//!
//! Every user pointer is aligned to the configured boundary and immediately
//! preceded by a slot header carrying a state signature and the owning
//! {slab, slot} descriptor. Slab headers sit at page-aligned extent starts,
//! so a bounded backward page walk can recover the physical base of any
//! managed address.

pub mod allocator;
pub mod lifecycle;
pub mod pool;
pub mod size_class;
pub mod slab;
pub mod slot;

pub use allocator::{AllocatorStats, PinnedAllocator};
pub use lifecycle::{install_fork_handler, LeakRecord, ShutdownReport};
pub use pool::{Pool, PoolStats};
pub use size_class::{ClassTable, SizeClass, CLASS_COUNT, FIXED_CLASS_COUNT, SLOT_SIZES};
pub use slot::{AllocSite, BlockRef, SlotState};
