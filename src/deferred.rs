//! Per-device deferred-I/O queue: requests that arrive while a device is
//! suspended, parked until the next `activate` replays them.
//!
//! The original driver links deferred entries through a hand-built
//! singly-linked list allocated per-entry on the heap (spec §9); a `Vec`
//! used purely as a LIFO stack gives the same O(1) push and O(1)
//! detach-all with none of the manual pointer bookkeeping.

use crate::request::{Direction, Request};

/// One parked request awaiting replay.
pub struct DeferredEntry {
    pub request: Request,
    pub direction: Direction,
}

/// A device's deferred queue.
///
/// Callers must hold the device registry's write lock across both `push`
/// and `drain_all` for the atomicity spec §4.4 requires (detach-all must
/// be atomic with respect to further pushes); this type itself performs
/// no locking of its own.
#[derive(Default)]
pub struct DeferredQueue {
    entries: Vec<DeferredEntry>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: Request, direction: Direction) {
        self.entries.push(DeferredEntry { request, direction });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Detaches the entire queue in one step, returning entries in
    /// reverse-arrival order (LIFO) per spec §4.4: targets must tolerate
    /// replay reordering, since the suspended window is expected to be
    /// short and dominated by control-plane quiescence rather than queue
    /// discipline.
    pub fn drain_all(&mut self) -> Vec<DeferredEntry> {
        let mut entries = std::mem::take(&mut self.entries);
        entries.reverse();
        entries
    }
}
