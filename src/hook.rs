//! The I/O hook pool: per-in-flight-request completion context, allocated
//! on the hot dispatch path.
//!
//! Modeled as a fixed-capacity free-list pool (spec §4.3) rather than an
//! `Arc`-per-request allocation, so exhaustion is an explicit, observable
//! condition (`alloc` returning `None`) instead of relying on the global
//! allocator's own OOM behavior. The free list is LIFO to keep recently
//! freed hooks warm in cache, matching the original driver's slab reuse.

use std::sync::Mutex;

use crate::{
    request::{Completion, Direction},
    table::MappingTable,
    target::TargetType,
};
use std::sync::Arc;

/// Saved context restored by the completion trampoline.
///
/// Holds an owning reference to the table so the trampoline can decrement
/// its in-flight counter even if the device has since been suspended or
/// torn down from under the in-flight request.
pub struct Hook {
    pub table: Arc<MappingTable>,
    pub target_type: Arc<dyn TargetType>,
    pub target_ctx: Arc<dyn std::any::Any + Send + Sync>,
    pub direction: Direction,
    pub original: Option<Completion>,
}

/// A fixed-capacity pool of [`Hook`] slots.
///
/// `alloc` never blocks and never grows the pool; under exhaustion it
/// returns `None` and the caller reports `DmError::OutOfMemory` (surfaced
/// to the submitter as an I/O error, per spec §4.3/§7).
pub struct HookPool {
    capacity: usize,
    free: Mutex<Vec<Hook>>,
    outstanding: std::sync::atomic::AtomicUsize,
}

impl HookPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(Vec::new()),
            outstanding: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Allocates a hook, reusing a freed slot if one exists, else minting
    /// a new one as long as the pool hasn't reached capacity.
    ///
    /// `original` is left `None`; the caller sets it only once allocation
    /// has actually succeeded, so a request's completion is never taken
    /// out of its slot on the exhaustion path (nothing to restore then —
    /// the request is simply failed with its completion untouched).
    pub fn alloc(
        &self,
        table: Arc<MappingTable>,
        target_type: Arc<dyn TargetType>,
        target_ctx: Arc<dyn std::any::Any + Send + Sync>,
        direction: Direction,
    ) -> Option<Hook> {
        let mut free = self.free.lock().unwrap();
        if let Some(mut hook) = free.pop() {
            hook.table = table;
            hook.target_type = target_type;
            hook.target_ctx = target_ctx;
            hook.direction = direction;
            hook.original = None;
            self.outstanding.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            return Some(hook);
        }
        if self.outstanding.load(std::sync::atomic::Ordering::SeqCst) >= self.capacity {
            return None;
        }
        self.outstanding.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Some(Hook {
            table,
            target_type,
            target_ctx,
            direction,
            original: None,
        })
    }

    /// Returns a hook to the free list. Called exactly once per
    /// successful `alloc` (spec invariant 4: no leaks, no double-free).
    pub fn free(&self, hook: Hook) {
        self.outstanding.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        self.free.lock().unwrap().push(hook);
    }

    /// Refuses to report clean teardown while hooks remain outstanding;
    /// callers that care about leak diagnostics (spec §4.3) can check
    /// this before dropping the pool.
    pub fn is_quiescent(&self) -> bool {
        self.outstanding() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{request::Direction, target::test_support::LinearTarget};

    fn dummy_table() -> Arc<MappingTable> {
        let mut registry = crate::registry::TargetRegistry::new();
        registry.register(Arc::new(LinearTarget)).unwrap();
        let mut builder = crate::table::TableBuilder::new(512, 32);
        builder.add_target("linear", "0 0", 0, 10);
        Arc::new(builder.finalize(&mut registry).unwrap())
    }

    #[test]
    fn alloc_up_to_capacity_then_exhausts() {
        let pool = HookPool::new(1);
        let table = dummy_table();
        let target = Arc::new(LinearTarget);
        let ctx = target.create("0 0").unwrap();
        let hook = pool
            .alloc(Arc::clone(&table), target.clone(), ctx.clone(), Direction::Read)
            .expect("first alloc succeeds");
        assert!(pool
            .alloc(Arc::clone(&table), target, ctx, Direction::Read)
            .is_none());
        pool.free(hook);
        assert!(pool.is_quiescent());
    }

    #[test]
    fn freed_slot_is_reused() {
        let pool = HookPool::new(1);
        let table = dummy_table();
        let target = Arc::new(LinearTarget);
        let ctx = target.create("0 0").unwrap();
        let hook = pool
            .alloc(Arc::clone(&table), target.clone(), ctx.clone(), Direction::Read)
            .unwrap();
        pool.free(hook);
        assert!(pool
            .alloc(table, target, ctx, Direction::Write)
            .is_some());
    }
}
