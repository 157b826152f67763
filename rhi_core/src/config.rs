use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(io::Error),
    #[error(transparent)]
    Toml(toml::de::Error),
}

/// Options controlling how a [`Device`] is created and behaves.
///
/// [`Device`]: crate::Device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    /// Collect barriers of consecutive accesses into a single driver call.
    ///
    /// Defaults to `true`.
    pub batch_resource_barriers: bool,
    /// Use a dedicated transfer queue for uploads if the adapter has one.
    ///
    /// Defaults to `true`.
    pub use_transfer_queue: bool,
    /// Use a dedicated compute queue if the adapter has one.
    ///
    /// Defaults to `true`.
    pub use_async_compute: bool,
    /// Enable backend validation layers.
    pub validation: bool,
    pub staging: StagingConfig,
    pub descriptors: DescriptorConfig,
    pub memory: MemoryConfig,
}

impl DeviceConfig {
    pub fn from_file<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        let mut file = File::open(path).map_err(ConfigError::Io)?;

        let mut buf = String::new();
        file.read_to_string(&mut buf).map_err(ConfigError::Io)?;

        Self::from_toml(&buf)
    }

    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(ConfigError::Toml)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Null,
            batch_resource_barriers: true,
            use_transfer_queue: true,
            use_async_compute: true,
            validation: false,
            staging: StagingConfig::default(),
            descriptors: DescriptorConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Software backend that executes nothing. Used for tests and headless tools.
    Null,
    Vulkan,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StagingConfig {
    /// Size of a newly created staging block in bytes.
    pub block_size: u64,
    /// Alignment of every staging sub-allocation in bytes. Must be a power of two.
    pub alignment: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            alignment: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DescriptorConfig {
    /// Number of slots in a buffer/texture descriptor heap.
    pub resource_heap_capacity: u32,
    /// Number of slots in a sampler descriptor heap.
    pub sampler_heap_capacity: u32,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            resource_heap_capacity: 1024,
            sampler_heap_capacity: 128,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MemoryConfig {
    /// Size of the first page of every page pool in bytes. Must be a power of two.
    pub min_page_size: u64,
    /// Allocations of at least this size get their own memory block.
    pub dedicated_threshold: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            min_page_size: 1 << 20,
            dedicated_threshold: 16 << 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BackendKind, ConfigError, DeviceConfig};

    #[test]
    fn empty_config_is_default() {
        let config = DeviceConfig::from_toml("").unwrap();
        assert_eq!(config, DeviceConfig::default());
        assert_eq!(config.staging.block_size, 64 * 1024);
        assert_eq!(config.staging.alignment, 256);
    }

    #[test]
    fn partial_config() {
        let config = DeviceConfig::from_toml(
            r#"
            backend = "vulkan"
            batch_resource_barriers = false

            [descriptors]
            sampler_heap_capacity = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::Vulkan);
        assert!(!config.batch_resource_barriers);
        assert_eq!(config.descriptors.sampler_heap_capacity, 16);
        assert_eq!(config.descriptors.resource_heap_capacity, 1024);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = DeviceConfig::from_toml("frobnicate = true").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn missing_file() {
        let err = DeviceConfig::from_file("/this/path/does/not/exist.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
