//! Round-robin slot selection

use parking_lot::Mutex;

/// Rotates an active slot index over a fixed number of slots.
///
/// The index moves onto the next slot unless that slot is restarting, in
/// which case it stays where it is. Landing on a slot without a usable
/// worker is how that slot gets retried, so only a restart in progress
/// holds the rotation back.
#[derive(Debug)]
pub struct Balancer {
    active: Mutex<usize>,
    size: usize,
}

impl Balancer {
    pub fn new(size: usize) -> Self {
        // Start one before slot 0 so the first pick lands on it
        Self {
            active: Mutex::new(size.saturating_sub(1)),
            size,
        }
    }

    /// Advance to the next slot unless `is_restarting` reports it busy, and
    /// return the active index
    pub fn next(&self, is_restarting: impl Fn(usize) -> bool) -> usize {
        let mut active = self.active.lock();
        if self.size == 0 {
            return 0;
        }
        let candidate = (*active + 1) % self.size;
        if !is_restarting(candidate) {
            *active = candidate;
        }
        *active
    }

    pub fn current(&self) -> usize {
        *self.active.lock()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}
