//! Admission control for job dispatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts jobs that have been dispatched but not yet resolved.
///
/// A slot is taken before a claim is attempted and released when the
/// returned [`ActiveJobGuard`] is dropped, so `active()` never exceeds
/// `max()` and every exit path of a dispatched task gives its slot back,
/// including a panic.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    active: AtomicUsize,
    max: usize,
}

impl ConcurrencyLimiter {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max,
        })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn spare_capacity(&self) -> usize {
        self.max.saturating_sub(self.active())
    }

    /// Reserve one slot, or `None` when at capacity.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ActiveJobGuard> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()
            .map(|_| ActiveJobGuard {
                limiter: Arc::clone(self),
            })
    }
}

/// One reserved slot; released on drop.
#[must_use = "dropping the guard releases the slot immediately"]
#[derive(Debug)]
pub struct ActiveJobGuard {
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        self.limiter.active.fetch_sub(1, Ordering::AcqRel);
    }
}
