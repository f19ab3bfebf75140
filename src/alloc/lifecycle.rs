//! Fork safety and shutdown
//!
//! A fork duplicates only the calling thread, and pinned pages are not
//! inherited in any usable way: the child must rebind every slab onto fresh
//! pinned storage while keeping the virtual ranges — and therefore every
//! outstanding pointer — exactly where they were. Shutdown walks all slots
//! once, reports leaks, and returns every extent to the provider.

use crate::alloc::allocator::PinnedAllocator;
use crate::alloc::slab::SLAB_HEADER_BYTES;
use crate::alloc::slot::SlotState;
use crate::error::{Error, Result};
use serde::Serialize;
use tracing::{error, info, warn};

impl PinnedAllocator {
    /// Rebind every slab's backing storage after a process fork.
    ///
    /// For each slab: acquire a fresh pinned region, copy the payload,
    /// release the old mapping, and remap the fresh region onto the slab's
    /// original virtual range. Only the backing storage changes; virtual
    /// identity is preserved.
    ///
    /// Any provider failure mid-sequence is fatal — once some slabs are
    /// remapped and others are not, no consistent state can be restored.
    /// The caller must guarantee that no other thread was inside the
    /// allocator when the process forked.
    pub fn on_fork(&self) -> Result<()> {
        let mut state = self.state.lock();
        let slab_count = state.slabs.len();

        for slab in state.slabs.iter_mut() {
            let old = slab.region;
            let fresh = self
                .provider
                .acquire(old.len, None)
                .map_err(|e| Error::Fatal(format!("fork rebind: acquire failed: {}", e)))?;

            // Copy the payload only; the header is re-stamped from the
            // fresh region's physical base once the remap lands.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    old.virt.as_ptr().add(SLAB_HEADER_BYTES) as *const u8,
                    fresh.virt.as_ptr().add(SLAB_HEADER_BYTES),
                    old.len - SLAB_HEADER_BYTES,
                );
            }

            self.provider
                .release(old)
                .map_err(|e| Error::Fatal(format!("fork rebind: release failed: {}", e)))?;
            let rebound = self
                .provider
                .remap_at(fresh, old.virt)
                .map_err(|e| Error::Fatal(format!("fork rebind: remap failed: {}", e)))?;
            if rebound.virt != old.virt {
                return Err(Error::Fatal(format!(
                    "fork rebind landed at {:#x} instead of {:#x}",
                    rebound.base_addr(),
                    old.base_addr(),
                )));
            }

            slab.region = rebound;
            slab.stamp_header();
        }

        info!(slabs = slab_count, "rebound slab backing after fork");
        Ok(())
    }

    /// Report leaks and release every slab back to the provider.
    ///
    /// Meant to run once at process exit; calling it again returns an empty
    /// report. Slots still marked ALLOC with a diagnostic attached are
    /// reported without touching the data they reference.
    pub fn on_shutdown(&self) -> ShutdownReport {
        let mut state = self.state.lock();
        if state.shut_down {
            return ShutdownReport::default();
        }
        state.shut_down = true;

        let mut leaks = Vec::new();
        for slab in &state.slabs {
            for record in &slab.slots {
                if record.state != SlotState::Alloc {
                    continue;
                }
                if let Some(site) = record.site {
                    let address = slab.base_addr() + record.user_offset;
                    warn!(
                        address,
                        file = site.file,
                        line = site.line,
                        class = slab.class.index(),
                        "leaked pinned allocation"
                    );
                    leaks.push(LeakRecord {
                        address,
                        class: slab.class.index(),
                        file: site.file.to_string(),
                        line: site.line,
                    });
                }
            }
        }

        for slab in state.slabs.drain(..) {
            if let Err(e) = self.provider.release(slab.region) {
                // No consistent state exists past a failed release.
                error!(error = %e, slab = slab.id, "provider release failed during shutdown");
                std::process::abort();
            }
        }
        for pool in state.pools.iter_mut() {
            pool.free_head = None;
        }

        info!(leaks = leaks.len(), "pinned allocator shut down");
        ShutdownReport { leaks }
    }
}

/// One still-allocated slot observed at shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct LeakRecord {
    pub address: usize,
    pub class: usize,
    pub file: String,
    pub line: u32,
}

/// Outcome of [`PinnedAllocator::on_shutdown`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub leaks: Vec<LeakRecord>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty()
    }

    /// Machine-readable form of the report, for exit-hook tooling.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("failed to serialize report: {}", e)))
    }
}

/// Register the process-wide allocator's fork handler.
///
/// The child-side hook rebinds all slab backing storage immediately after
/// `fork()`; a failure there aborts the child, since its pinned mappings
/// are unusable. Call this once during process startup, before any thread
/// may fork.
pub fn install_fork_handler() -> Result<()> {
    unsafe extern "C" fn child_after_fork() {
        if let Err(e) = PinnedAllocator::global().on_fork() {
            // The tracing stack may be mid-write in the parent; keep the
            // child's failure path to plain stderr.
            eprintln!("pinslab: fork rebind failed: {}", e);
            std::process::abort();
        }
    }

    let rc = unsafe { libc::pthread_atfork(None, None, Some(child_after_fork)) };
    if rc != 0 {
        return Err(Error::Internal(format!("pthread_atfork failed: {}", rc)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use std::sync::Arc;

    fn allocator() -> (PinnedAllocator, Arc<MockProvider>) {
        let provider = Arc::new(MockProvider::new());
        let allocator = PinnedAllocator::with_defaults(provider.clone())
            .expect("default configuration is valid");
        (allocator, provider)
    }

    #[test]
    fn test_fork_preserves_pointers_and_contents() -> Result<()> {
        let (allocator, _provider) = allocator();
        let ptr = allocator.allocate(100, None)?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x9C, 100) };
        let phys_before = allocator.physical_address(ptr.as_ptr())?;

        allocator.on_fork()?;

        // Same virtual address, same bytes, fresh backing storage
        unsafe {
            for i in 0..100 {
                assert_eq!(*ptr.as_ptr().add(i), 0x9C);
            }
        }
        let phys_after = allocator.physical_address(ptr.as_ptr())?;
        assert_ne!(phys_before, phys_after);

        // The allocator keeps working across the rebind
        allocator.free(ptr.as_ptr())?;
        let again = allocator.allocate(100, None)?;
        allocator.free(again.as_ptr())?;
        Ok(())
    }

    #[test]
    fn test_fork_rebinds_every_slab() -> Result<()> {
        let (allocator, provider) = allocator();
        let small = allocator.allocate(100, None)?;
        let large = allocator.allocate(20_000, None)?;
        unsafe { std::ptr::write_bytes(large.as_ptr(), 0x31, 20_000) };

        let acquired_before = provider.acquired();
        allocator.on_fork()?;
        // One fresh region per slab
        assert_eq!(provider.acquired(), acquired_before + 2);
        assert_eq!(provider.outstanding(), 2);

        unsafe { assert_eq!(*large.as_ptr().add(19_999), 0x31) };
        allocator.free(small.as_ptr())?;
        allocator.free(large.as_ptr())?;
        Ok(())
    }

    #[test]
    fn test_fork_offset_consistency_survives_rebind() -> Result<()> {
        let (allocator, _provider) = allocator();
        let a = allocator.allocate(100, None)?;
        let b = allocator.allocate(100, None)?;
        allocator.on_fork()?;

        let delta_virt = (b.as_ptr() as usize).abs_diff(a.as_ptr() as usize) as u64;
        let delta_phys = allocator
            .physical_address(b.as_ptr())?
            .abs_diff(allocator.physical_address(a.as_ptr())?);
        assert_eq!(delta_virt, delta_phys);
        Ok(())
    }

    #[test]
    fn test_fork_provider_failure_is_fatal() -> Result<()> {
        let (allocator, provider) = allocator();
        let _ptr = allocator.allocate(100, None)?;

        provider.set_acquire_budget(Some(0));
        let err = allocator.on_fork().unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        Ok(())
    }

    #[test]
    fn test_shutdown_reports_leaks_and_releases_everything() -> Result<()> {
        let (allocator, provider) = allocator();
        let kept = allocator.allocate(100, None)?;
        let freed = allocator.allocate(2000, None)?;
        allocator.free(freed.as_ptr())?;

        let report = allocator.on_shutdown();
        assert_eq!(report.leaks.len(), 1);
        assert_eq!(report.leaks[0].address, kept.as_ptr() as usize);
        assert_eq!(report.leaks[0].class, 0);
        assert!(report.leaks[0].file.ends_with("lifecycle.rs"));
        assert!(!report.is_clean());

        assert_eq!(provider.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn test_shutdown_is_idempotent() -> Result<()> {
        let (allocator, _provider) = allocator();
        let _leak = allocator.allocate(64, None)?;

        assert_eq!(allocator.on_shutdown().leaks.len(), 1);
        assert!(allocator.on_shutdown().is_clean());
        Ok(())
    }

    #[test]
    fn test_untraced_allocations_are_not_reported() -> Result<()> {
        let (allocator, provider) = allocator();
        let _silent = allocator.allocate_traced(100, None, None)?;

        let report = allocator.on_shutdown();
        assert!(report.is_clean());
        assert_eq!(provider.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn test_clean_shutdown_report_serializes() -> Result<()> {
        let (allocator, _provider) = allocator();
        let ptr = allocator.allocate(100, None)?;
        allocator.free(ptr.as_ptr())?;

        let report = allocator.on_shutdown();
        assert!(report.is_clean());
        let json = report.to_json()?;
        assert!(json.contains("leaks"));
        Ok(())
    }
}
