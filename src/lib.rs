// pinslab - Pinned-memory slab allocator
// Fixed-alignment, DMA-capable blocks carved from provider-backed slabs

#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod config;
pub mod provider;

// Re-exports for convenience
pub use alloc::lifecycle::{install_fork_handler, LeakRecord, ShutdownReport};
pub use alloc::{AllocatorStats, PinnedAllocator};
pub use config::AllocatorConfig;
pub use provider::{NumaNode, PinnedMemoryProvider, PinnedRegion};

/// Allocator error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        /// The provider could not supply a new slab; the request fails, the
        /// process carries on.
        #[error("Out of pinned memory: {0}")]
        OutOfMemory(String),

        /// The request exceeds the capacity of the largest supported slot.
        #[error("Allocation too large: {requested} bytes exceeds the {limit}-byte maximum slot")]
        SizeTooLarge { requested: usize, limit: usize },

        /// A signature or state assertion failed: double free, invalid
        /// pointer, or a trampled header.
        #[error("Corruption: {0}")]
        Corruption(String),

        /// The address does not resolve to any managed slab.
        #[error("Address not managed by the pinned allocator")]
        Unmanaged,

        /// Provider failure outside the steady-state allocation path.
        #[error("Provider failure: {0}")]
        Provider(String),

        /// Unrecoverable lifecycle failure (fork remap, shutdown release).
        #[error("Fatal: {0}")]
        Fatal(String),

        #[error("Invalid configuration: {0}")]
        Config(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        // VERSION is a static string, always valid
        let _version: &str = VERSION;
    }
}
