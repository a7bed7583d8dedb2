//! Generation stamps for pooled objects.
//!
//! Every pooled slot embeds one or more [`Generation`] counters and every handle
//! that refers to a slot carries a snapshot of the counter taken when the handle
//! was issued. A handle is valid exactly while `snapshot == current()`, so a
//! handle that outlives its lifecycle fails validation instead of observing the
//! next tenant of the slot.
//!
//! Counters are 64-bit and advance with a wrapping increment. Exhausting one
//! would take 2^64 lifecycles of a single slot, so wraparound is accepted
//! without any further check.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically advancing stamp.
///
/// Reads are lock-free. Writers hold the lock of the object that owns the
/// counter, so `advance` never races another `advance` on the same slot.
#[derive(Debug)]
pub(crate) struct Generation(AtomicU64);

impl Generation {
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    #[inline]
    pub(crate) fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn matches(&self, snapshot: u64) -> bool {
        self.current() == snapshot
    }

    /// Invalidates every outstanding snapshot and returns the new value.
    #[inline]
    pub(crate) fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns a process-unique id for a newly constructed physical slot.
///
/// Nodes record the id of the source slot they were linked into so that a
/// registration can never be confused with a node that was repooled and
/// handed to a different source.
pub(crate) fn next_instance_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
