//! Allocator configuration
//!
//! Geometry and policy knobs for the allocator. Everything defaults to the
//! values the hardware path was tuned for: 128 KiB slabs, 64-byte aligned
//! user pointers, and a physical-address walk bounded by one slab's worth of
//! pages. Values can be overridden programmatically or loaded from a TOML
//! file.

use crate::error::{Error, Result};
use crate::provider::PAGE_BYTES;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default byte length of every pinned extent requested from the provider.
pub const DEFAULT_SLAB_BYTES: usize = 128 * 1024;

/// Default alignment of every user-visible pointer, matching the DMA
/// engine's preferred access boundary.
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Allocator-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Total bytes of each pinned extent. Must be a positive multiple of the
    /// page size; all slabs share this length for their entire lifetime.
    pub slab_bytes: usize,

    /// Byte alignment of every pointer handed to callers. Must be a power of
    /// two.
    pub alignment: usize,

    /// Upper bound, in pages, on the backward signature walk used by
    /// physical-address resolution. Defaults to one slab's worth of pages.
    pub page_walk_limit: usize,

    /// Abort the process when corruption is detected on the free path
    /// instead of returning the error. Double frees and trampled headers
    /// mean the bookkeeping can no longer be trusted.
    pub strict_corruption: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            slab_bytes: DEFAULT_SLAB_BYTES,
            alignment: DEFAULT_ALIGNMENT,
            page_walk_limit: DEFAULT_SLAB_BYTES / PAGE_BYTES,
            strict_corruption: false,
        }
    }
}

impl AllocatorConfig {
    /// Check the shape of the configuration values themselves. Class
    /// geometry checks (does the largest slot fit a slab, ...) happen when
    /// the class table is built.
    pub fn validate(&self) -> Result<()> {
        if !self.alignment.is_power_of_two() {
            return Err(Error::Config(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        if self.slab_bytes == 0 || self.slab_bytes % PAGE_BYTES != 0 {
            return Err(Error::Config(format!(
                "slab_bytes {} is not a positive multiple of the {}-byte page",
                self.slab_bytes, PAGE_BYTES
            )));
        }
        if self.page_walk_limit == 0 {
            return Err(Error::Config(
                "page_walk_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a configuration from TOML text. Missing keys take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AllocatorConfig = toml::from_str(text)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AllocatorConfig::default();
        config.validate().expect("defaults must validate");
        assert_eq!(config.slab_bytes, 128 * 1024);
        assert_eq!(config.alignment, 64);
        assert_eq!(config.page_walk_limit, 32);
        assert!(!config.strict_corruption);
    }

    #[test]
    fn test_rejects_non_power_of_two_alignment() {
        let config = AllocatorConfig {
            alignment: 48,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unpaged_slab_length() {
        let config = AllocatorConfig {
            slab_bytes: 100_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AllocatorConfig {
            slab_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_walk_limit() {
        let config = AllocatorConfig {
            page_walk_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_overrides_and_defaults() -> Result<()> {
        let config = AllocatorConfig::from_toml_str(
            "slab_bytes = 262144\nstrict_corruption = true\n",
        )?;
        assert_eq!(config.slab_bytes, 256 * 1024);
        assert!(config.strict_corruption);
        // Untouched keys keep their defaults
        assert_eq!(config.alignment, DEFAULT_ALIGNMENT);
        Ok(())
    }

    #[test]
    fn test_from_toml_rejects_invalid_values() {
        assert!(AllocatorConfig::from_toml_str("alignment = 7\n").is_err());
        assert!(AllocatorConfig::from_toml_str("not valid toml [").is_err());
    }

    #[test]
    fn test_from_toml_file_round_trip() -> Result<()> {
        let path = std::env::temp_dir().join(format!("pinslab_config_{}.toml", std::process::id()));
        std::fs::write(&path, "page_walk_limit = 64\n")
            .map_err(|e| Error::Config(e.to_string()))?;

        let config = AllocatorConfig::from_toml_file(&path)?;
        assert_eq!(config.page_walk_limit, 64);
        assert_eq!(config.slab_bytes, DEFAULT_SLAB_BYTES);

        // Cleanup
        std::fs::remove_file(path).ok();
        Ok(())
    }

    #[test]
    fn test_from_toml_file_missing_path_fails() {
        assert!(AllocatorConfig::from_toml_file("/nonexistent/pinslab.toml").is_err());
    }
}
