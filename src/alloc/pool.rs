//! Per-class free lists
//!
//! One pool per size class, holding just the head of an intrusive free
//! list; the links themselves live in the slot records. All mutation
//! happens in the allocator under the global lock.

use crate::alloc::size_class::SizeClass;
use crate::alloc::slot::BlockRef;
use serde::Serialize;

/// Free-list head for one size class.
#[derive(Debug)]
pub struct Pool {
    pub class: SizeClass,
    pub free_head: Option<BlockRef>,
}

impl Pool {
    pub fn new(class: SizeClass) -> Pool {
        Pool {
            class,
            free_head: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.free_head.is_none()
    }
}

/// Point-in-time view of one pool, for [`crate::alloc::AllocatorStats`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub class: usize,
    pub slot_bytes: usize,
    pub usable_bytes: usize,
    pub total_slots: usize,
    pub free_slots: usize,
    pub live_slots: usize,
}
