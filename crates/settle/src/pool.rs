//! Process-wide free lists for pooled objects.
//!
//! Each pooled type owns exactly one `static` [`Pool`], named through the
//! [`Poolable`] trait. This is global mutable state with the following
//! contract:
//!
//! - Slots are allocated on demand and are **never freed**. A pool only grows.
//!   Because a slot's memory lives for the rest of the process, a stale handle
//!   can always dereference its slot and compare generations; it can never
//!   observe freed memory.
//! - The free list is guarded by its own lock, independent of any slot's lock.
//!   Callers may push while holding a slot lock (lock order is slot → pool),
//!   never the reverse.
//! - Only a slot that no live lifecycle references may be passed to
//!   [`Pool::repool`]. Generation stamps make the remaining stale handles
//!   harmless.
//!
//! ```rust
//! use settle::pool::{Pool, Poolable};
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! #[derive(Default)]
//! struct Scratch {
//!     hits: AtomicU32,
//! }
//!
//! impl Poolable for Scratch {
//!     fn pool() -> &'static Pool<Self> {
//!         static POOL: Pool<Scratch> = Pool::new();
//!         &POOL
//!     }
//! }
//!
//! let scratch = Scratch::pool().acquire();
//! scratch.hits.fetch_add(1, Ordering::Relaxed);
//! scratch.hits.store(0, Ordering::Relaxed);
//! Scratch::pool().repool(scratch);
//!
//! // The cleared slot is handed out again.
//! assert!(std::ptr::eq(Scratch::pool().acquire(), scratch));
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// A type with a process-wide pool.
pub trait Poolable: Default + Send + Sync + 'static {
    /// The pool that owns every slot of this type.
    fn pool() -> &'static Pool<Self>;
}

/// A never-shrinking free list of `&'static` slots.
#[derive(Debug)]
pub struct Pool<T: 'static> {
    free: Mutex<Vec<&'static T>>,
    created: AtomicUsize,
}

/// Counters describing a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots ever constructed by this pool.
    pub created: usize,
    /// Slots currently on the free list.
    pub available: usize,
}

impl PoolStats {
    /// Slots currently handed out.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.created.saturating_sub(self.available)
    }
}

impl<T: Poolable> Pool<T> {
    /// An empty pool. `const` so it can initialize a `static`.
    pub const fn new() -> Self {
        Self {
            free: parking_lot::const_mutex(Vec::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Pops a free slot, if one is available.
    #[inline]
    pub fn try_take(&self) -> Option<&'static T> {
        self.free.lock().pop()
    }

    /// Pops a free slot or constructs a new one.
    pub fn acquire(&self) -> &'static T {
        if let Some(slot) = self.try_take() {
            return slot;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(ty = std::any::type_name::<T>(), "pool grew");
        Box::leak(Box::default())
    }

    /// Returns a cleared, unreferenced slot to the free list.
    pub fn repool(&self, slot: &'static T) {
        let mut free = self.free.lock();
        debug_assert!(
            !free.iter().any(|s| std::ptr::eq(*s, slot)),
            "slot repooled twice"
        );
        free.push(slot);
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            available: self.free.lock().len(),
        }
    }
}

/// Counters for the pool of `T`.
pub fn stats<T: Poolable>() -> PoolStats {
    T::pool().stats()
}
