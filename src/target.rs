//! The plugin interface mapping targets implement.
//!
//! A target turns one sector range of a virtual device into zero or more
//! real requests. This crate ships no targets of its own (see spec
//! Non-goals); `linear` and `striped` live in example/test code only.

use std::{any::Any, sync::Arc};

use bitflags::bitflags;

use crate::{
    error::DmError,
    request::{Direction, Request},
};

bitflags! {
    /// Capabilities a target type advertises at registration time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TargetFeatures: u32 {
        /// Target's [`TargetType::map`] may be called from a bmap query
        /// (spec §4.9) in addition to real I/O dispatch.
        const SUPPORTS_BMAP = 1 << 0;
        /// Target's devices may be safely read from during suspend.
        const SUPPORTS_SUSPENDED_READ = 1 << 1;
    }
}

/// Outcome of mapping a single request.
#[derive(Debug)]
pub enum MapResult {
    /// The request was rewritten in place (sector/device fields on the
    /// shared `Request` have been updated) and should be forwarded to the
    /// underlying device as-is.
    Remapped,
    /// The target has taken ownership of completing the request itself
    /// (e.g. it split it into several sub-requests) and the dispatcher must
    /// not forward or complete it further.
    DeferredByTarget,
    /// The target could not map the request at all. The dispatcher frees
    /// the hook and fails the request with `uptodate = false`; unlike
    /// [`ErrAction`] (which governs a request that already completed and is
    /// now retrying), there is no retry path for a mapping failure itself.
    Error,
}

/// What the dispatcher should do after [`TargetType::err`] inspects a
/// request that completed with `uptodate = false` (spec §4.8 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrAction {
    /// The request has been handed to a retry path owned by the target;
    /// the trampoline must not fire the original completion now.
    Retry,
    /// Give up: let the trampoline finish normally, completing the
    /// request with `uptodate = false`.
    GiveUp,
}

/// Result of a bmap (physical block translation) query (spec §4.9):
/// resolved by running a stub [`Request`] through the same
/// [`TargetType::map`] real I/O uses and reading the fields it rewrote
/// back off the stub, rather than through a separate entrypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BmapResult {
    /// Underlying device the sector resolves to. Distinct from `sector`
    /// (see `DESIGN.md`: the original driver wrote both into one field).
    pub device: u64,
    /// Sector on that underlying device.
    pub sector: u64,
}

/// A registered, instantiable mapping target.
///
/// Implementors are constructed once per [`crate::table::TargetInstance`]
/// via [`TargetType::create`], then asked to map every request whose sector
/// falls in that instance's range.
pub trait TargetType: Send + Sync {
    /// The name targets of this type are registered and looked up under.
    fn name(&self) -> &str;

    fn features(&self) -> TargetFeatures {
        TargetFeatures::empty()
    }

    /// Parses a table line's argument string into an opaque per-instance
    /// context, which the dispatcher passes back to `map`/`status`.
    fn create(&self, args: &str) -> Result<Arc<dyn Any + Send + Sync>, DmError>;

    /// Rewrites `request` (sector, and/or minor if spanning devices) for the
    /// offset within this instance's range, or defers/fails it.
    ///
    /// Takes `request` by unique reference: the dispatcher owns the request
    /// up to this point and hands out shared access (for completion) only
    /// after mapping decides the request's final shape. Also the sole
    /// entrypoint a bmap query (spec §4.9) resolves through, against a
    /// stub request that is never actually submitted for I/O — targets
    /// need not implement any separate translation method.
    fn map(
        &self,
        ctx: &(dyn Any + Send + Sync),
        offset: u64,
        request: &mut Request,
    ) -> MapResult;

    /// Called by the completion trampoline when a request completes with
    /// `uptodate = false`, before the hook is freed. Targets that don't
    /// need custom retry behavior simply don't override this; the
    /// trampoline treats `None` the same as the target having no `err`
    /// hook at all (spec §4.8 step 1).
    fn err(
        &self,
        _ctx: &(dyn Any + Send + Sync),
        _direction: Direction,
        _request: &Request,
    ) -> Option<ErrAction> {
        None
    }

    /// Human-readable status line, used for table dumps.
    fn status(&self, _ctx: &(dyn Any + Send + Sync)) -> String {
        String::new()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A target whose every request is remapped onto a fixed device/offset,
    /// used across the table/dispatch/lifecycle test suites.
    pub struct LinearTarget;

    pub struct LinearCtx {
        pub dest_minor: u32,
        pub dest_start: u64,
    }

    impl TargetType for LinearTarget {
        fn name(&self) -> &str {
            "linear"
        }

        fn features(&self) -> TargetFeatures {
            TargetFeatures::SUPPORTS_BMAP
        }

        fn create(&self, args: &str) -> Result<Arc<dyn Any + Send + Sync>, DmError> {
            let mut parts = args.split_whitespace();
            let dest_minor: u32 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| DmError::InvalidConfig("linear: missing dest minor".into()))?;
            let dest_start: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| DmError::InvalidConfig("linear: missing dest start".into()))?;
            Ok(Arc::new(LinearCtx {
                dest_minor,
                dest_start,
            }))
        }

        fn map(
            &self,
            ctx: &(dyn Any + Send + Sync),
            offset: u64,
            request: &mut Request,
        ) -> MapResult {
            let ctx = ctx.downcast_ref::<LinearCtx>().unwrap();
            request.minor = ctx.dest_minor;
            request.sector = ctx.dest_start + offset;
            MapResult::Remapped
        }
    }

    /// A target that remaps identically to `LinearTarget` but asks the
    /// trampoline to retry the first failed completion it sees, then
    /// gives up on the next one. Exercises the `ErrAction::Retry` path.
    #[derive(Default)]
    pub struct RetryOnceTarget {
        retried: AtomicBool,
    }

    impl TargetType for RetryOnceTarget {
        fn name(&self) -> &str {
            "retry_once"
        }

        fn create(&self, _args: &str) -> Result<Arc<dyn Any + Send + Sync>, DmError> {
            Ok(Arc::new(()))
        }

        fn map(
            &self,
            _ctx: &(dyn Any + Send + Sync),
            offset: u64,
            request: &mut Request,
        ) -> MapResult {
            request.sector = offset;
            MapResult::Remapped
        }

        fn err(
            &self,
            _ctx: &(dyn Any + Send + Sync),
            _direction: Direction,
            _request: &Request,
        ) -> Option<ErrAction> {
            if self.retried.swap(true, Ordering::SeqCst) {
                Some(ErrAction::GiveUp)
            } else {
                Some(ErrAction::Retry)
            }
        }
    }
}
