//! Runtime-overridable tunables.
//!
//! The original driver hard-codes `MAX_DEVICES`, the hook slab size, and the
//! default read-ahead as file-scope constants (see [`crate::param`]).
//! Embedders of this crate may instead want to size those pools from a
//! config file shipped alongside the rest of their service configuration, so
//! `Config` is a plain serde-derived struct that can be deserialized from
//! TOML as well as built programmatically.

use serde::{Deserialize, Serialize};

use crate::{error::DmError, param};

/// Tunables for one [`crate::DmCore`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of minor-number slots in the device registry.
    pub max_devices: usize,
    /// Number of I/O hooks the pool preallocates.
    pub hook_pool_capacity: usize,
    /// Default read-ahead advertised for newly activated devices, in sectors.
    pub default_read_ahead: u32,
    /// Hardware sector size assumed when a mapping table doesn't advertise
    /// its own.
    pub default_hardsect_size: u32,
    /// Fan-out of the mapping table's lookup tree.
    pub table_fanout: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_devices: param::MAX_DEVICES,
            hook_pool_capacity: param::DEFAULT_HOOK_POOL_CAPACITY,
            default_read_ahead: param::DEFAULT_READ_AHEAD,
            default_hardsect_size: param::DEFAULT_HARDSECT_SIZE,
            table_fanout: param::DEFAULT_TABLE_FANOUT,
        }
    }
}

impl Config {
    /// Parses a `Config` from a TOML document, filling in defaults for any
    /// field the document omits.
    pub fn from_toml(document: &str) -> Result<Self, DmError> {
        toml::from_str(document).map_err(|e| DmError::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_params() {
        let config = Config::default();
        assert_eq!(config.max_devices, param::MAX_DEVICES);
        assert_eq!(config.hook_pool_capacity, param::DEFAULT_HOOK_POOL_CAPACITY);
    }

    #[test]
    fn toml_overrides_partial_fields() {
        let config = Config::from_toml("max_devices = 8\n").unwrap();
        assert_eq!(config.max_devices, 8);
        assert_eq!(config.hook_pool_capacity, param::DEFAULT_HOOK_POOL_CAPACITY);
    }

    #[test]
    fn toml_rejects_garbage() {
        assert!(Config::from_toml("not valid toml =====").is_err());
    }
}
