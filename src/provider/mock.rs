//! Deterministic provider for tests
//!
//! Page-aligned heap regions with failure injection and accounting, so
//! allocator tests can run without mlock privileges or a DMA driver.
//! Released regions are parked rather than freed immediately: `remap_at`
//! can then rebind onto a parked range exactly the way `mremap(MREMAP_FIXED)`
//! rebinds onto an unmapped one, which is what the fork path needs.

use super::{
    NumaNode, PinnedMemoryProvider, PinnedRegion, ProviderError, ProviderResult, RegionToken,
    PAGE_BYTES,
};
use parking_lot::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;

struct MockState {
    /// token -> (virtual base, length) of live regions.
    live: HashMap<u64, (usize, usize)>,
    /// virtual base -> (token, length) of released-but-parked buffers.
    parked: HashMap<usize, (u64, usize)>,
    next_token: u64,
    next_phys: u64,
    /// Remaining successful acquires; `None` means unlimited.
    acquire_budget: Option<usize>,
    acquired: u64,
    released: u64,
}

/// In-memory stand-in for a pinned-memory driver.
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                live: HashMap::new(),
                parked: HashMap::new(),
                next_token: 1,
                next_phys: 0x10_0000,
                acquire_budget: None,
                acquired: 0,
                released: 0,
            }),
        }
    }

    /// Allow only `budget` more successful acquires; `None` lifts the limit.
    pub fn set_acquire_budget(&self, budget: Option<usize>) {
        self.state.lock().acquire_budget = budget;
    }

    /// Regions acquired and not yet released.
    pub fn outstanding(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn acquired(&self) -> u64 {
        self.state.lock().acquired
    }

    pub fn released(&self) -> u64 {
        self.state.lock().released
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn region_layout(len: usize) -> ProviderResult<Layout> {
    Layout::from_size_align(len, PAGE_BYTES)
        .map_err(|e| ProviderError::Acquire(format!("bad region layout: {}", e)))
}

impl PinnedMemoryProvider for MockProvider {
    fn acquire(&self, len: usize, _numa: Option<NumaNode>) -> ProviderResult<PinnedRegion> {
        if len == 0 || len % PAGE_BYTES != 0 {
            return Err(ProviderError::Acquire(format!(
                "length {} is not a positive multiple of the {}-byte page",
                len, PAGE_BYTES
            )));
        }
        let mut state = self.state.lock();
        match state.acquire_budget {
            Some(0) => {
                return Err(ProviderError::Acquire(
                    "acquire budget exhausted".to_string(),
                ))
            }
            Some(ref mut n) => *n -= 1,
            None => {}
        }

        let layout = region_layout(len)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let virt = match NonNull::new(ptr) {
            Some(p) => p,
            None => return Err(ProviderError::Acquire("host allocation failed".to_string())),
        };

        let token = state.next_token;
        state.next_token += 1;
        let phys = state.next_phys;
        state.next_phys += len as u64;
        state.live.insert(token, (ptr as usize, len));
        state.acquired += 1;

        Ok(PinnedRegion {
            virt,
            phys,
            len,
            token: RegionToken(token),
        })
    }

    fn release(&self, region: PinnedRegion) -> ProviderResult<()> {
        let mut state = self.state.lock();
        match state.live.remove(&region.token.0) {
            Some((addr, len)) if addr == region.base_addr() && len == region.len => {
                // Park instead of freeing: remap_at may reclaim the range,
                // and stale pointers in tests read parked bytes instead of
                // faulting nondeterministically.
                state.parked.insert(addr, (region.token.0, len));
                state.released += 1;
                Ok(())
            }
            Some(entry) => {
                state.live.insert(region.token.0, entry);
                Err(ProviderError::Release(format!(
                    "region token {} does not match its buffer",
                    region.token.0
                )))
            }
            None => Err(ProviderError::Release(format!(
                "unknown region token {}",
                region.token.0
            ))),
        }
    }

    fn remap_at(&self, region: PinnedRegion, target: NonNull<u8>) -> ProviderResult<PinnedRegion> {
        let mut state = self.state.lock();
        match state.live.get(&region.token.0) {
            Some(&(addr, len)) if addr == region.base_addr() && len == region.len => {}
            _ => {
                return Err(ProviderError::Remap(format!(
                    "region token {} is not live",
                    region.token.0
                )))
            }
        }

        let target_addr = target.as_ptr() as usize;
        match state.parked.remove(&target_addr) {
            Some((_, parked_len)) if parked_len == region.len => {}
            Some(entry) => {
                state.parked.insert(target_addr, entry);
                return Err(ProviderError::Remap(format!(
                    "parked range at {:#x} has a different length",
                    target_addr
                )));
            }
            None => {
                return Err(ProviderError::Remap(format!(
                    "target {:#x} is not a released range",
                    target_addr
                )))
            }
        }

        // Move the bytes onto the reclaimed range and drop the source
        // buffer, mirroring what MREMAP_FIXED does to page tables.
        unsafe {
            std::ptr::copy_nonoverlapping(region.virt.as_ptr(), target.as_ptr(), region.len);
            dealloc(region.virt.as_ptr(), region_layout(region.len)?);
        }
        state.live.insert(region.token.0, (target_addr, region.len));

        Ok(PinnedRegion {
            virt: target,
            ..region
        })
    }
}

impl Drop for MockProvider {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let live: Vec<(usize, usize)> = state.live.drain().map(|(_, v)| v).collect();
        let parked: Vec<(usize, usize)> = state
            .parked
            .drain()
            .map(|(addr, (_, len))| (addr, len))
            .collect();
        for (addr, len) in live.into_iter().chain(parked) {
            if let Ok(layout) = Layout::from_size_align(len, PAGE_BYTES) {
                unsafe { dealloc(addr as *mut u8, layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_accounting() -> ProviderResult<()> {
        let provider = MockProvider::new();
        let a = provider.acquire(PAGE_BYTES, None)?;
        let b = provider.acquire(2 * PAGE_BYTES, None)?;
        assert_eq!(provider.outstanding(), 2);
        assert_eq!(a.base_addr() % PAGE_BYTES, 0);
        assert_ne!(a.phys, b.phys);

        provider.release(a)?;
        provider.release(b)?;
        assert_eq!(provider.outstanding(), 0);
        assert_eq!(provider.acquired(), 2);
        assert_eq!(provider.released(), 2);
        Ok(())
    }

    #[test]
    fn test_acquire_budget_exhaustion() {
        let provider = MockProvider::new();
        provider.set_acquire_budget(Some(1));
        let first = provider.acquire(PAGE_BYTES, None);
        assert!(first.is_ok());
        assert!(provider.acquire(PAGE_BYTES, None).is_err());

        provider.set_acquire_budget(None);
        assert!(provider.acquire(PAGE_BYTES, None).is_ok());
    }

    #[test]
    fn test_double_release_fails() -> ProviderResult<()> {
        let provider = MockProvider::new();
        let region = provider.acquire(PAGE_BYTES, None)?;
        provider.release(region)?;
        assert!(provider.release(region).is_err());
        Ok(())
    }

    #[test]
    fn test_remap_reclaims_parked_range() -> ProviderResult<()> {
        let provider = MockProvider::new();
        let old = provider.acquire(PAGE_BYTES, None)?;
        let fresh = provider.acquire(PAGE_BYTES, None)?;
        let target = old.virt;

        unsafe { std::ptr::write_bytes(fresh.virt.as_ptr(), 0x5A, fresh.len) };

        provider.release(old)?;
        let rebound = provider.remap_at(fresh, target)?;
        assert_eq!(rebound.virt, target);
        assert_eq!(rebound.phys, fresh.phys);

        let bytes = unsafe { std::slice::from_raw_parts(rebound.virt.as_ptr(), rebound.len) };
        assert!(bytes.iter().all(|&b| b == 0x5A));

        provider.release(rebound)?;
        Ok(())
    }

    #[test]
    fn test_remap_requires_released_target() -> ProviderResult<()> {
        let provider = MockProvider::new();
        let a = provider.acquire(PAGE_BYTES, None)?;
        let b = provider.acquire(PAGE_BYTES, None)?;
        // b's range was never released
        assert!(provider.remap_at(a, b.virt).is_err());
        provider.release(a)?;
        provider.release(b)?;
        Ok(())
    }
}
