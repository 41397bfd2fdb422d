//! Compile-time defaults, mirrored from the original driver's constants.
//!
//! These are the values [`Config::default`](crate::config::Config::default)
//! resolves to; embedders that need different limits construct a `Config`
//! explicitly or load one from TOML instead of editing this file.

/// Historical default device count (`MAX_DEVICES` in the original driver).
pub const MAX_DEVICES: usize = 64;

/// Historical default read-ahead, in sectors.
pub const DEFAULT_READ_AHEAD: u32 = 64;

/// Default hook pool capacity. Unrelated to `MAX_DEVICES`: many hooks can be
/// in flight per device, but the pool is shared across the whole core.
pub const DEFAULT_HOOK_POOL_CAPACITY: usize = 256;

/// Default hardware sector size in bytes, used when a mapping table does not
/// advertise its own.
pub const DEFAULT_HARDSECT_SIZE: u32 = 512;

/// Fan-out (keys per node) of the mapping table's search tree, matching the
/// original `KEYS_PER_NODE`.
pub const DEFAULT_TABLE_FANOUT: usize = 32;

/// Synthesized geometry: heads per synthesized disk.
pub const GEOMETRY_HEADS: u64 = 64;

/// Synthesized geometry: sectors per track.
pub const GEOMETRY_SECTORS_PER_TRACK: u64 = 32;
