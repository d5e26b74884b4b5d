//! Device configuration

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bo::CachePolicy;
use crate::error::{Error, Result};

/// Default minimum size of one command-stream chunk: 16 KiB
pub const DEFAULT_CS_MIN_BO_SIZE: u64 = 16 * 1024;

/// Tunables applied when a [`crate::Device`] is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Emit a 4-word NOP at the start of every recording so command
    /// buffers are never empty
    pub emit_begin_nop: bool,
    /// Minimum size of a command-stream chunk in bytes
    pub cs_min_bo_size: u64,
    /// Stop doubling chunk sizes; every chunk is
    /// `max(cs_min_bo_size, 4 * reserved_words)`
    pub cs_fixed_bo_size: bool,
    /// Retention policy of the BO cache
    pub bo_cache: CachePolicy,
    /// Priority of queues created without an explicit one
    pub queue_priority: u32,
    /// Budget of the default host allocator; `None` for physical memory
    pub host_memory_limit: Option<usize>,
    /// Log the device parameters at `info` level on creation
    pub debug_startup: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            emit_begin_nop: true,
            cs_min_bo_size: DEFAULT_CS_MIN_BO_SIZE,
            cs_fixed_bo_size: false,
            bo_cache: CachePolicy::Unbounded,
            queue_priority: 1,
            host_memory_limit: None,
            debug_startup: false,
        }
    }
}

impl DeviceConfig {
    /// Small fixed-size chunks and a bounded BO cache
    pub fn low_memory() -> Self {
        Self {
            cs_fixed_bo_size: true,
            bo_cache: CachePolicy::HighWaterMark {
                max_bytes: 8 * 1024 * 1024,
            },
            ..Self::default()
        }
    }

    /// No BO reuse and verbose startup, for chasing lifetime bugs
    pub fn debug() -> Self {
        Self {
            bo_cache: CachePolicy::Disabled,
            debug_startup: true,
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON document from `path`
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Reject values the command stream cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.cs_min_bo_size == 0 || self.cs_min_bo_size % 4 != 0 {
            return Err(Error::InvalidConfig(format!(
                "cs_min_bo_size must be a non-zero multiple of 4, got {}",
                self.cs_min_bo_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DeviceConfig::default();
        assert!(config.emit_begin_nop);
        assert_eq!(config.cs_min_bo_size, 16384);
        assert_eq!(config.bo_cache, CachePolicy::Unbounded);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        assert!(DeviceConfig::low_memory().cs_fixed_bo_size);
        assert!(matches!(
            DeviceConfig::low_memory().bo_cache,
            CachePolicy::HighWaterMark { .. }
        ));
        assert_eq!(DeviceConfig::debug().bo_cache, CachePolicy::Disabled);
        assert!(DeviceConfig::debug().debug_startup);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = DeviceConfig::from_json_str(r#"{"emit_begin_nop": false, "bo_cache": "disabled"}"#).unwrap();
        assert!(!config.emit_begin_nop);
        assert_eq!(config.bo_cache, CachePolicy::Disabled);
        assert_eq!(config.cs_min_bo_size, DEFAULT_CS_MIN_BO_SIZE);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            DeviceConfig::from_json_str("{not json"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            DeviceConfig::from_json_str(r#"{"cs_min_bo_size": 6}"#),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"queue_priority": 2, "host_memory_limit": 65536}}"#).unwrap();
        let config = DeviceConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.queue_priority, 2);
        assert_eq!(config.host_memory_limit, Some(65536));

        let missing = DeviceConfig::from_json_file("/nonexistent/gpucs.json");
        assert!(matches!(missing, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_json_round_trip() {
        let config = DeviceConfig::low_memory();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(DeviceConfig::from_json_str(&json).unwrap(), config);
    }
}
