//! Size-class partitioning
//!
//! Six fixed slot sizes — 256 B through 32 KiB — plus one "maximum" class
//! whose single slot spans a whole slab, for oversized-but-still-supported
//! requests. Classes are strictly increasing and statically indexed; a
//! request is assigned the smallest class whose slot covers it after
//! header and alignment overhead.

use crate::alloc::slab::SLAB_HEADER_BYTES;
use crate::alloc::slot::SLOT_HEADER_BYTES;
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;

/// Fixed slot sizes in bytes, strictly increasing.
pub const SLOT_SIZES: [usize; FIXED_CLASS_COUNT] = [256, 1024, 4096, 8192, 16384, 32768];

/// Number of fixed classes.
pub const FIXED_CLASS_COUNT: usize = 6;

/// Fixed classes plus the maximum (whole-slab) class.
pub const CLASS_COUNT: usize = FIXED_CLASS_COUNT + 1;

/// One of the supported allocation granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SizeClass(usize);

impl SizeClass {
    /// The whole-slab overflow class.
    pub const MAX: SizeClass = SizeClass(FIXED_CLASS_COUNT);

    /// Every class, in increasing slot-size order.
    pub const ALL: [SizeClass; CLASS_COUNT] = {
        let mut all = [SizeClass(0); CLASS_COUNT];
        let mut i = 0;
        while i < CLASS_COUNT {
            all[i] = SizeClass(i);
            i += 1;
        }
        all
    };

    pub fn from_index(index: usize) -> Option<SizeClass> {
        (index < CLASS_COUNT).then_some(SizeClass(index))
    }

    pub fn index(self) -> usize {
        self.0
    }

    pub fn is_max(self) -> bool {
        self.0 == FIXED_CLASS_COUNT
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            write!(f, "max")
        } else {
            write!(f, "{}B", SLOT_SIZES[self.0])
        }
    }
}

/// Slot geometry shared by every slab, derived once from configuration.
#[derive(Debug, Clone)]
pub struct ClassTable {
    slab_bytes: usize,
    alignment: usize,
    slot_bytes: [usize; CLASS_COUNT],
}

impl ClassTable {
    pub fn new(config: &AllocatorConfig) -> Result<Self> {
        config.validate()?;

        let largest_fixed = SLOT_SIZES[FIXED_CLASS_COUNT - 1];
        if config.slab_bytes < SLAB_HEADER_BYTES + largest_fixed {
            return Err(Error::Config(format!(
                "slab_bytes {} cannot hold a {}-byte slot plus the {}-byte slab header",
                config.slab_bytes, largest_fixed, SLAB_HEADER_BYTES
            )));
        }
        if SLOT_SIZES[0] <= SLOT_HEADER_BYTES + config.alignment {
            return Err(Error::Config(format!(
                "alignment {} leaves no usable space in a {}-byte slot",
                config.alignment, SLOT_SIZES[0]
            )));
        }

        let mut slot_bytes = [0usize; CLASS_COUNT];
        slot_bytes[..FIXED_CLASS_COUNT].copy_from_slice(&SLOT_SIZES);
        slot_bytes[FIXED_CLASS_COUNT] = config.slab_bytes - SLAB_HEADER_BYTES;

        Ok(Self {
            slab_bytes: config.slab_bytes,
            alignment: config.alignment,
            slot_bytes,
        })
    }

    pub fn slab_bytes(&self) -> usize {
        self.slab_bytes
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Full slot stride for `class`, headers and padding included.
    pub fn slot_bytes(&self, class: SizeClass) -> usize {
        self.slot_bytes[class.index()]
    }

    /// Bytes of a slot actually available to the caller.
    pub fn usable_bytes(&self, class: SizeClass) -> usize {
        self.slot_bytes(class) - SLOT_HEADER_BYTES - self.alignment
    }

    /// Largest request the allocator accepts at all.
    pub fn max_usable(&self) -> usize {
        self.usable_bytes(SizeClass::MAX)
    }

    /// Slots carved from one slab of `class`; any remainder is padding.
    pub fn slots_per_slab(&self, class: SizeClass) -> usize {
        (self.slab_bytes - SLAB_HEADER_BYTES) / self.slot_bytes(class)
    }

    /// Pick the smallest class whose slot covers `size` payload bytes plus
    /// per-slot overhead; fall back to the maximum class, else reject.
    pub fn class_for(&self, size: usize) -> Result<SizeClass> {
        let too_large = || Error::SizeTooLarge {
            requested: size,
            limit: self.max_usable(),
        };
        let adjusted = size
            .checked_add(SLOT_HEADER_BYTES + self.alignment)
            .ok_or_else(too_large)?;

        for (index, &bytes) in SLOT_SIZES.iter().enumerate() {
            if adjusted <= bytes {
                return Ok(SizeClass(index));
            }
        }
        if adjusted <= self.slot_bytes(SizeClass::MAX) {
            Ok(SizeClass::MAX)
        } else {
            Err(too_large())
        }
    }
}
