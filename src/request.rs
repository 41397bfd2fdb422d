//! The request/completion interface the core plugs into.
//!
//! The host block layer is out of scope for this crate (see spec §1), so
//! [`Request`] stands in for whatever the real submission queue hands the
//! core: a sector range, a direction, and a completion callback. Its
//! completion slot is shared (`Arc<Mutex<_>>`) rather than owned outright,
//! because the core must be able to rewrite *which* callback fires — install
//! its trampoline, then later restore the caller's original — while the
//! backend that actually services the request keeps its own handle to fire
//! it asynchronously. This mirrors the original driver swapping
//! `bh->b_end_io` on a buffer head the caller still holds a pointer to.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

/// Which way the bytes are moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// A single block-layer completion callback.
///
/// Fires exactly once (enforced by consuming `self`); see invariant 5 in the
/// spec's testable properties.
pub struct Completion(Box<dyn FnOnce(bool) + Send>);

impl Completion {
    pub fn new(f: impl FnOnce(bool) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub(crate) fn fire(self, uptodate: bool) {
        (self.0)(uptodate);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion(..)")
    }
}

type Slot = Arc<Mutex<Option<Completion>>>;

/// One block-layer I/O unit.
///
/// Cheap to clone: every clone shares the same completion slot, so any
/// holder can fire or replace the completion and all holders observe it.
#[derive(Clone)]
pub struct Request {
    pub minor: u32,
    pub sector: u64,
    pub len_sectors: u32,
    pub direction: Direction,
    completion: Slot,
}

impl Request {
    pub fn new(
        minor: u32,
        sector: u64,
        len_sectors: u32,
        direction: Direction,
        completion: Completion,
    ) -> Self {
        Self {
            minor,
            sector,
            len_sectors,
            direction,
            completion: Arc::new(Mutex::new(Some(completion))),
        }
    }

    /// Fires the currently installed completion, if any, consuming it.
    ///
    /// A request whose completion has already fired (or been taken and not
    /// replaced) silently does nothing; callers that need to know whether a
    /// completion actually ran should track that themselves via the closure.
    pub fn signal_completion(&self, uptodate: bool) {
        let completion = self.completion.lock().unwrap().take();
        if let Some(completion) = completion {
            completion.fire(uptodate);
        }
    }

    pub(crate) fn take_completion(&self) -> Option<Completion> {
        self.completion.lock().unwrap().take()
    }

    pub(crate) fn set_completion(&self, new: Completion) {
        *self.completion.lock().unwrap() = Some(new);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("minor", &self.minor)
            .field("sector", &self.sector)
            .field("len_sectors", &self.len_sectors)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn fires_exactly_once() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let req = Request::new(
            0,
            0,
            1,
            Direction::Read,
            Completion::new(move |ok| {
                assert!(ok);
                fired2.store(true, Ordering::SeqCst);
            }),
        );
        req.signal_completion(true);
        assert!(fired.load(Ordering::SeqCst));

        // Second fire is a no-op: the slot is already empty.
        req.signal_completion(true);
    }

    #[test]
    fn clones_share_the_same_slot() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let req = Request::new(
            0,
            0,
            1,
            Direction::Write,
            Completion::new(move |_| fired2.store(true, Ordering::SeqCst)),
        );
        let backend_handle = req.clone();
        drop(req);
        backend_handle.signal_completion(false);
        assert!(fired.load(Ordering::SeqCst));
    }
}
