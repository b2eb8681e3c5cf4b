//! Volume configuration
//!
//! Tunables for the object-id allocator and the two background daemons.
//! Values are plain serde structs so they can be loaded from a JSON file
//! at mount time.

use crate::{R4Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Largest representable object id, doubling as the "exhausted" marker.
pub const ABSOLUTE_MAX_OID: u64 = u64::MAX;

/// Object ids reserved for internal use below the sentinel.
pub const OIDS_RESERVED: u64 = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OidConfig {
    /// Sentinel value returned once the id space is used up
    pub max_oid: u64,
    /// Ids subtracted from the free count for statistics
    pub reserved_oids: u64,
}

impl Default for OidConfig {
    fn default() -> Self {
        Self {
            max_oid: ABSOLUTE_MAX_OID,
            reserved_oids: OIDS_RESERVED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntdConfig {
    /// Requests beyond the synchronous count accepted without blocking
    pub async_requests_limit: u64,
    /// Daemon passes a queued request may see before it is forced through
    pub max_iters: u32,
    /// Pages asked for in each flush pass
    pub nr_to_write: i64,
}

impl Default for EntdConfig {
    fn default() -> Self {
        Self {
            async_requests_limit: 32,
            max_iters: 10,
            nr_to_write: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnmgrdConfig {
    /// Interval between unprompted commit scans, in milliseconds
    pub timeout_ms: u64,
}

impl Default for TxnmgrdConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

impl TxnmgrdConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub oid: OidConfig,
    pub entd: EntdConfig,
    pub ktxnmgrd: TxnmgrdConfig,
}

impl VolumeConfig {
    /// Load and validate a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: VolumeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!("Loaded volume configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.oid.reserved_oids > self.oid.max_oid {
            return Err(R4Error::Configuration(format!(
                "reserved_oids ({}) exceeds max_oid ({})",
                self.oid.reserved_oids, self.oid.max_oid
            )));
        }
        if self.entd.max_iters == 0 {
            return Err(R4Error::Configuration(
                "entd.max_iters must be at least 1".to_string(),
            ));
        }
        if self.entd.nr_to_write <= 0 {
            return Err(R4Error::Configuration(
                "entd.nr_to_write must be positive".to_string(),
            ));
        }
        if self.ktxnmgrd.timeout_ms == 0 {
            return Err(R4Error::Configuration(
                "ktxnmgrd.timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Values handed over by the disk-format layer when a volume is mounted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountOptions {
    /// Volume name, used in thread names and log lines
    pub name: String,
    pub config: VolumeConfig,
    /// Recovered count of object ids in use
    pub recovered_oids_used: u64,
    /// Recovered next object id to hand out
    pub recovered_next_oid: u64,
    /// Free blocks available for grabbing
    pub free_blocks: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            name: "r4".to_string(),
            config: VolumeConfig::default(),
            recovered_oids_used: 0,
            recovered_next_oid: 0,
            free_blocks: 1 << 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = VolumeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.entd.async_requests_limit, 32);
        assert_eq!(config.entd.max_iters, 10);
        assert_eq!(config.ktxnmgrd.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: VolumeConfig =
            serde_json::from_str(r#"{ "entd": { "max_iters": 3 } }"#).unwrap();
        assert_eq!(config.entd.max_iters, 3);
        assert_eq!(config.entd.async_requests_limit, 32);
        assert_eq!(config.oid, OidConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = VolumeConfig::default();
        config.ktxnmgrd.timeout_ms = 0;
        assert!(matches!(config.validate(), Err(R4Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_reserve() {
        let mut config = VolumeConfig::default();
        config.oid.max_oid = 10;
        config.oid.reserved_oids = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "ktxnmgrd": {{ "timeout_ms": 250 }}, "oid": {{ "max_oid": 1000, "reserved_oids": 0 }} }}"#
        )
        .unwrap();

        let config = VolumeConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.ktxnmgrd.timeout_ms, 250);
        assert_eq!(config.oid.max_oid, 1000);
    }

    #[test]
    fn test_from_json_file_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "entd": {{ "max_iters": 0 }} }}"#).unwrap();
        assert!(matches!(
            VolumeConfig::from_json_file(file.path()),
            Err(R4Error::Configuration(_))
        ));
    }
}
