//! mmap + mlock backed provider
//!
//! Pinned regions without a kernel DMA driver: anonymous mappings locked
//! into RAM. Physical base addresses are synthesized from a monotonic
//! counter — stable for the lifetime of each region, which is all the
//! allocator's offset arithmetic needs. A production deployment implements
//! [`PinnedMemoryProvider`] against its driver and reports real bus
//! addresses through the same contract.

use super::{
    NumaNode, PinnedMemoryProvider, PinnedRegion, ProviderError, ProviderResult, RegionToken,
    PAGE_BYTES,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Base of the synthetic bus-address space, far away from anything a caller
/// could mistake for a virtual address.
const PHYS_BASE: u64 = 0x8_0000_0000;

/// Provider backed by anonymous locked mappings.
pub struct LockedMemory {
    next_token: AtomicU64,
    next_phys: AtomicU64,
    /// token -> (virtual base, length) of live mappings.
    live: Mutex<HashMap<u64, (usize, usize)>>,
}

impl LockedMemory {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            next_phys: AtomicU64::new(PHYS_BASE),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Number of regions currently mapped.
    pub fn live_regions(&self) -> usize {
        self.live.lock().len()
    }
}

impl Default for LockedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl PinnedMemoryProvider for LockedMemory {
    fn acquire(&self, len: usize, _numa: Option<NumaNode>) -> ProviderResult<PinnedRegion> {
        if len == 0 || len % PAGE_BYTES != 0 {
            return Err(ProviderError::Acquire(format!(
                "length {} is not a positive multiple of the {}-byte page",
                len, PAGE_BYTES
            )));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ProviderError::Acquire(format!(
                "mmap of {} bytes failed: {}",
                len,
                std::io::Error::last_os_error()
            )));
        }

        // Lock the pages so they cannot be swapped out. Environments without
        // CAP_IPC_LOCK (or with a small RLIMIT_MEMLOCK) refuse; the mapping
        // still works for development, so carry on with a warning.
        if unsafe { libc::mlock(ptr, len) } != 0 {
            warn!(
                len,
                error = %std::io::Error::last_os_error(),
                "mlock failed; region is not pinned"
            );
        }

        let virt = match NonNull::new(ptr as *mut u8) {
            Some(p) => p,
            None => return Err(ProviderError::Acquire("mmap returned null".to_string())),
        };
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let phys = self.next_phys.fetch_add(len as u64, Ordering::Relaxed);
        self.live.lock().insert(token, (ptr as usize, len));

        debug!(token, len, addr = ptr as usize, "acquired locked region");
        Ok(PinnedRegion {
            virt,
            phys,
            len,
            token: RegionToken(token),
        })
    }

    fn release(&self, region: PinnedRegion) -> ProviderResult<()> {
        match self.live.lock().remove(&region.token.0) {
            Some((addr, len)) if addr == region.base_addr() && len == region.len => {}
            Some(_) => {
                return Err(ProviderError::Release(format!(
                    "region token {} does not match its mapping",
                    region.token.0
                )))
            }
            None => {
                return Err(ProviderError::Release(format!(
                    "unknown region token {}",
                    region.token.0
                )))
            }
        }
        if unsafe { libc::munmap(region.virt.as_ptr() as *mut c_void, region.len) } != 0 {
            return Err(ProviderError::Release(format!(
                "munmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        debug!(token = region.token.0, len = region.len, "released locked region");
        Ok(())
    }

    fn remap_at(&self, region: PinnedRegion, target: NonNull<u8>) -> ProviderResult<PinnedRegion> {
        let mut live = self.live.lock();
        match live.get(&region.token.0) {
            Some(&(addr, len)) if addr == region.base_addr() && len == region.len => {}
            _ => {
                return Err(ProviderError::Remap(format!(
                    "region token {} is not live",
                    region.token.0
                )))
            }
        }

        let moved = unsafe {
            libc::mremap(
                region.virt.as_ptr() as *mut c_void,
                region.len,
                region.len,
                libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
                target.as_ptr() as *mut c_void,
            )
        };
        if moved == libc::MAP_FAILED || moved != target.as_ptr() as *mut c_void {
            return Err(ProviderError::Remap(format!(
                "mremap onto {:#x} failed: {}",
                target.as_ptr() as usize,
                std::io::Error::last_os_error()
            )));
        }

        live.insert(region.token.0, (target.as_ptr() as usize, region.len));
        debug!(
            token = region.token.0,
            target = target.as_ptr() as usize,
            "rebound locked region"
        );
        Ok(PinnedRegion {
            virt: target,
            ..region
        })
    }
}

impl Drop for LockedMemory {
    fn drop(&mut self) {
        for (_, (addr, len)) in self.live.lock().drain() {
            unsafe {
                libc::munmap(addr as *mut c_void, len);
            }
        }
    }
}
