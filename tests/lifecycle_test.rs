//! Fork and shutdown lifecycle over the mock provider

use pinslab::error::{Error, Result};
use pinslab::provider::MockProvider;
use pinslab::PinnedAllocator;
use std::sync::Arc;

fn allocator() -> (PinnedAllocator, Arc<MockProvider>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let provider = Arc::new(MockProvider::new());
    let allocator =
        PinnedAllocator::with_defaults(provider.clone()).expect("default configuration is valid");
    (allocator, provider)
}

#[test]
fn test_fork_handler_installs_once() {
    assert!(pinslab::install_fork_handler().is_ok());
}

#[test]
fn test_fork_rebind_keeps_every_pointer_valid() -> Result<()> {
    let (allocator, provider) = allocator();

    // Populate three classes so the rebind walks several slabs
    let mut blocks = Vec::new();
    for (size, fill) in [(100usize, 0x11u8), (2000, 0x22), (20_000, 0x33)] {
        let ptr = allocator.allocate(size, None)?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), fill, size) };
        blocks.push((ptr, size, fill));
    }
    let slabs = allocator.stats().slab_count;
    assert_eq!(slabs, 3);

    let phys_before: Vec<u64> = blocks
        .iter()
        .map(|(ptr, _, _)| allocator.physical_address(ptr.as_ptr()))
        .collect::<Result<_>>()?;

    allocator.on_fork()?;

    // Virtual addresses and contents are untouched; physical bases moved
    for (index, (ptr, size, fill)) in blocks.iter().enumerate() {
        unsafe {
            assert_eq!(*ptr.as_ptr(), *fill);
            assert_eq!(*ptr.as_ptr().add(size - 1), *fill);
        }
        let phys = allocator.physical_address(ptr.as_ptr())?;
        assert_ne!(phys, phys_before[index]);
    }
    assert_eq!(provider.outstanding(), slabs);

    // Steady-state operation continues after the rebind
    for (ptr, _, _) in &blocks {
        allocator.free(ptr.as_ptr())?;
    }
    let fresh = allocator.allocate(100, None)?;
    allocator.free(fresh.as_ptr())?;
    Ok(())
}

#[test]
fn test_fork_with_no_slabs_is_trivial() -> Result<()> {
    let (allocator, provider) = allocator();
    allocator.on_fork()?;
    assert_eq!(provider.acquired(), 0);
    Ok(())
}

#[test]
fn test_fork_acquire_failure_is_fatal() -> Result<()> {
    let (allocator, provider) = allocator();
    let _block = allocator.allocate(100, None)?;

    provider.set_acquire_budget(Some(0));
    assert!(matches!(allocator.on_fork(), Err(Error::Fatal(_))));
    Ok(())
}

#[test]
fn test_shutdown_reports_only_diagnosed_live_blocks() -> Result<()> {
    let (allocator, provider) = allocator();

    let leaked_a = allocator.allocate(100, None)?;
    let leaked_b = allocator.allocate(2000, None)?;
    let released = allocator.allocate(100, None)?;
    let silent = allocator.allocate_traced(100, None, None)?;
    allocator.free(released.as_ptr())?;
    let _ = silent;

    let report = allocator.on_shutdown();
    assert_eq!(report.leaks.len(), 2);

    let addresses: Vec<usize> = report.leaks.iter().map(|l| l.address).collect();
    assert!(addresses.contains(&(leaked_a.as_ptr() as usize)));
    assert!(addresses.contains(&(leaked_b.as_ptr() as usize)));
    for leak in &report.leaks {
        assert!(leak.file.ends_with("lifecycle_test.rs"));
        assert!(leak.line > 0);
    }

    // Every slab went back to the provider regardless of the leaks
    assert_eq!(provider.outstanding(), 0);
    Ok(())
}

#[test]
fn test_shutdown_report_round_trips_as_json() -> Result<()> {
    let (allocator, _provider) = allocator();
    let _leak = allocator.allocate(64, None)?;

    let report = allocator.on_shutdown();
    let json = report.to_json()?;
    assert!(json.contains("\"leaks\""));
    assert!(json.contains("lifecycle_test.rs"));
    Ok(())
}

#[test]
fn test_second_shutdown_is_a_clean_noop() -> Result<()> {
    let (allocator, provider) = allocator();
    let _leak = allocator.allocate(100, None)?;

    assert_eq!(allocator.on_shutdown().leaks.len(), 1);
    let again = allocator.on_shutdown();
    assert!(again.is_clean());
    assert_eq!(provider.outstanding(), 0);
    Ok(())
}
