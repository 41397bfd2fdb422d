//! A counter-based wait queue used to drain in-flight requests.
//!
//! Modeled directly on the kernel's condvar-over-spinlock pattern: a waiter
//! samples a generation counter, releases the lock, and sleeps until the
//! counter changes, then re-checks its actual condition rather than trusting
//! the wakeup alone. That re-check is what makes the pattern safe against
//! lost wakeups: a notify that lands between the sample and the sleep still
//! bumps the counter, so the waiter never blocks past the point the
//! condition became true.

use std::sync::{Condvar, Mutex};

/// A single-counter wait/notify primitive.
///
/// Used by the mapping table to let suspend/remove block until the table's
/// in-flight count reaches zero, without the table needing its own condvar.
pub struct DrainWaitQueue {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl DrainWaitQueue {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Wakes every current waiter. Called whenever the drained condition
    /// (e.g. in-flight count) might have changed.
    pub fn notify_all(&self) {
        *self.generation.lock().unwrap() += 1;
        self.condvar.notify_all();
    }

    /// Blocks until `done` returns true, re-checking after every wakeup.
    ///
    /// `done` is called with no lock held, so it may itself lock other
    /// structures (e.g. to read an `AtomicUsize` in-flight count).
    pub fn wait_until(&self, mut done: impl FnMut() -> bool) {
        if done() {
            return;
        }
        let mut generation = self.generation.lock().unwrap();
        loop {
            let seen = *generation;
            // Drop the lock while evaluating `done` so a concurrent
            // `notify_all` isn't blocked behind our own check.
            drop(generation);
            if done() {
                return;
            }
            generation = self.generation.lock().unwrap();
            while *generation == seen {
                generation = self.condvar.wait(generation).unwrap();
            }
        }
    }
}

impl Default for DrainWaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    #[test]
    fn wait_returns_immediately_when_already_done() {
        let queue = DrainWaitQueue::new();
        queue.wait_until(|| true);
    }

    #[test]
    fn waiter_wakes_after_notify() {
        let queue = Arc::new(DrainWaitQueue::new());
        let inflight = Arc::new(AtomicUsize::new(1));

        let waiter_queue = Arc::clone(&queue);
        let waiter_inflight = Arc::clone(&inflight);
        let waiter = thread::spawn(move || {
            waiter_queue.wait_until(|| waiter_inflight.load(Ordering::SeqCst) == 0);
        });

        thread::sleep(Duration::from_millis(20));
        inflight.store(0, Ordering::SeqCst);
        queue.notify_all();

        waiter.join().unwrap();
    }
}
