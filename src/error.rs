//! Crate-wide error type.

/// Every control-plane and data-path failure the core can report.
///
/// Data-path failures (`OutOfMemory`, `Unsupported`) never propagate past a
/// single request's completion; they are delivered to that request's own
/// completion callback with `uptodate = false` rather than returned here.
#[derive(Debug, thiserror::Error)]
pub enum DmError {
    #[error("no such device")]
    NoSuchDevice,
    #[error("device is busy")]
    Busy,
    #[error("no free device slots")]
    SlotExhausted,
    #[error("requested minor is already in use")]
    MinorInUse,
    #[error("out of memory")]
    OutOfMemory,
    #[error("mapping table has no targets")]
    EmptyTable,
    #[error("target does not support this operation")]
    Unsupported,
    #[error("unknown target type: {0}")]
    UnknownTarget(String),
    #[error("target type {0:?} is already registered")]
    DuplicateTarget(String),
    #[error("target type {0:?} has live instances")]
    TargetInUse(String),
    #[error("I/O error")]
    IoError,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = core::result::Result<T, DmError>;
