//! Pooled, retain-counted completion values.
//!
//! A [`Container`] carries the outcome of one asynchronous computation to
//! every consumer that observes it. The producer creates it with one retain
//! per consumer; each consumer releases its retain once it has read the
//! value. The last release clears the slot and returns it to the pool.
//!
//! Completions without a payload use shared singletons
//! ([`Container::void_resolved`], [`Container::void_canceled`]) that need no
//! slot at all; retaining and releasing them does nothing.
//!
//! A rejection that reaches zero retains without anyone calling
//! [`mark_handled`](Container::mark_handled) is reported as
//! [`Diagnostic::UnhandledRejection`]. Its text is only rendered at that
//! point, never on the happy path.
//!
//! ```rust
//! use settle::{Completion, Container};
//!
//! let shared = Container::resolved(String::from("done"), 2);
//!
//! // Consumer one.
//! assert_eq!(shared.kind(), Some(Completion::Resolved));
//! assert_eq!(shared.with_value(|s: &String| s.len()), Some(4));
//! shared.release().unwrap();
//!
//! // Consumer two.
//! assert_eq!(shared.value_cloned::<String>().as_deref(), Some("done"));
//! shared.release().unwrap();
//!
//! // Recycled: the handle is inert now.
//! assert!(!shared.is_valid());
//! assert!(shared.release().is_err());
//! ```

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;

use parking_lot::Mutex;

use crate::Error;
use crate::diagnostics::{self, Diagnostic};
use crate::generation::Generation;
use crate::pool::{self, Pool, PoolStats, Poolable};
use crate::retain::RetainCount;

/// How a computation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Completion {
    /// Finished with a value.
    Resolved,
    /// Failed with a reason.
    Rejected,
    /// Canceled, optionally with a reason.
    Canceled,
}

type Payload = Box<dyn Any + Send + Sync>;
type Describe = fn(&(dyn Any + Send + Sync)) -> String;

#[derive(Default)]
struct ContainerSlot {
    id: Generation,
    inner: Mutex<ContainerInner>,
}

#[derive(Default)]
struct ContainerInner {
    kind: Option<Completion>,
    value: Option<Payload>,
    retains: RetainCount,
    handled: bool,
    describe: Option<Describe>,
    trace: Option<Backtrace>,
}

impl Poolable for ContainerSlot {
    fn pool() -> &'static Pool<Self> {
        static POOL: Pool<ContainerSlot> = Pool::new();
        &POOL
    }
}

fn describe<E: fmt::Debug + 'static>(value: &(dyn Any + Send + Sync)) -> String {
    match value.downcast_ref::<E>() {
        Some(value) => format!("{value:?}"),
        None => String::from("<unknown rejection>"),
    }
}

#[cfg(feature = "causal-trace")]
fn capture_trace() -> Option<Backtrace> {
    use crate::config::{self, CausalityTrace};

    match config::get().causality_trace {
        CausalityTrace::Rejections => Some(Backtrace::force_capture()),
        CausalityTrace::Off => None,
    }
}

#[cfg(not(feature = "causal-trace"))]
fn capture_trace() -> Option<Backtrace> {
    None
}

/// A handle to a completion value.
///
/// `Copy`: the handle itself owns nothing. Ownership is expressed through
/// explicit [`retain`](Self::retain) and [`release`](Self::release) calls,
/// and a handle whose container was recycled fails validation instead of
/// observing the next value.
#[derive(Clone, Copy)]
pub struct Container {
    repr: Repr,
}

#[derive(Clone, Copy)]
enum Repr {
    VoidResolved,
    VoidCanceled,
    Slot {
        slot: &'static ContainerSlot,
        id: u64,
    },
}

impl Container {
    fn new(
        kind: Completion,
        value: Payload,
        retains: u32,
        describe: Option<Describe>,
        trace: Option<Backtrace>,
    ) -> Self {
        let slot = ContainerSlot::pool().acquire();
        let mut inner = slot.inner.lock();
        inner.kind = Some(kind);
        inner.value = Some(value);
        inner.retains = RetainCount::new(retains.max(1));
        inner.handled = false;
        inner.describe = describe;
        inner.trace = trace;
        let id = slot.id.current();
        drop(inner);
        let container = Self {
            repr: Repr::Slot { slot, id },
        };
        if retains == 0 {
            // Nobody will read it: recycle now, reporting an unhandled rejection.
            let _ = container.release();
        }
        container
    }

    /// A resolved value shared by `retains` consumers.
    ///
    /// With `retains == 0` the value is dropped right away and the returned
    /// handle is already stale.
    pub fn resolved<T>(value: T, retains: u32) -> Self
    where
        T: Any + Send + Sync,
    {
        Self::new(Completion::Resolved, Box::new(value), retains, None, None)
    }

    /// A rejection shared by `retains` consumers.
    ///
    /// Captures a causal trace when configured to.
    pub fn rejected<E>(reason: E, retains: u32) -> Self
    where
        E: Any + fmt::Debug + Send + Sync,
    {
        Self::new(
            Completion::Rejected,
            Box::new(reason),
            retains,
            Some(describe::<E>),
            capture_trace(),
        )
    }

    /// A cancellation carrying a reason, shared by `retains` consumers.
    pub fn canceled_with<R>(reason: R, retains: u32) -> Self
    where
        R: Any + Send + Sync,
    {
        Self::new(Completion::Canceled, Box::new(reason), retains, None, None)
    }

    /// The shared resolved-without-value singleton.
    #[inline]
    pub const fn void_resolved() -> Self {
        Self {
            repr: Repr::VoidResolved,
        }
    }

    /// The shared canceled-without-reason singleton.
    #[inline]
    pub const fn void_canceled() -> Self {
        Self {
            repr: Repr::VoidCanceled,
        }
    }

    /// Add a consumer.
    pub fn retain(&self) -> Result<(), Error> {
        let Repr::Slot { slot, id } = self.repr else {
            return Ok(());
        };
        let mut inner = slot.inner.lock();
        if !slot.id.matches(id) {
            return Err(Error::InvalidOperation("container is stale"));
        }
        inner.retains.retain("container retain count")
    }

    /// Drop a consumer. The last release recycles the container.
    pub fn release(&self) -> Result<(), Error> {
        let Repr::Slot { slot, id } = self.repr else {
            return Ok(());
        };
        let mut inner = slot.inner.lock();
        if !slot.id.matches(id) {
            return Err(Error::InvalidOperation("container is stale"));
        }
        if !inner.retains.release("container released more often than retained")? {
            return Ok(());
        }
        slot.id.advance();
        let cleared = std::mem::take(&mut *inner);
        drop(inner);

        let unhandled = match (cleared.kind, cleared.handled, cleared.describe) {
            (Some(Completion::Rejected), false, Some(describe)) => {
                let description = cleared
                    .value
                    .as_deref()
                    .map_or_else(|| String::from("<empty>"), describe);
                Some(Diagnostic::UnhandledRejection {
                    description,
                    trace: cleared.trace.as_ref().map(ToString::to_string),
                })
            }
            _ => None,
        };
        drop(cleared);
        if let Some(unhandled) = unhandled {
            diagnostics::report(unhandled);
        }
        ContainerSlot::pool().repool(slot);
        Ok(())
    }

    /// Mark a rejection as observed so its final release stays quiet.
    ///
    /// Returns `false` if the handle is stale.
    pub fn mark_handled(&self) -> bool {
        match self.repr {
            Repr::VoidResolved | Repr::VoidCanceled => true,
            Repr::Slot { slot, id } => {
                let mut inner = slot.inner.lock();
                if !slot.id.matches(id) {
                    return false;
                }
                inner.handled = true;
                true
            }
        }
    }

    /// How the computation finished; `None` for a stale handle.
    pub fn kind(&self) -> Option<Completion> {
        match self.repr {
            Repr::VoidResolved => Some(Completion::Resolved),
            Repr::VoidCanceled => Some(Completion::Canceled),
            Repr::Slot { slot, id } => {
                let inner = slot.inner.lock();
                if slot.id.matches(id) { inner.kind } else { None }
            }
        }
    }

    /// Borrow the payload as a `T`.
    ///
    /// `f` runs while the container is locked and must not use this
    /// container. Returns `None` for a void container, a stale handle, or a
    /// payload of another type.
    pub fn with_value<T, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R>
    where
        T: Any,
    {
        let Repr::Slot { slot, id } = self.repr else {
            return None;
        };
        let inner = slot.inner.lock();
        if !slot.id.matches(id) {
            return None;
        }
        inner.value.as_deref()?.downcast_ref::<T>().map(f)
    }

    /// Clone the payload out as a `T`.
    pub fn value_cloned<T>(&self) -> Option<T>
    where
        T: Any + Clone,
    {
        self.with_value(T::clone)
    }

    /// The handle still refers to its value.
    pub fn is_valid(&self) -> bool {
        match self.repr {
            Repr::VoidResolved | Repr::VoidCanceled => true,
            Repr::Slot { slot, id } => slot.id.matches(id),
        }
    }

    /// Counters for the process-wide container pool.
    pub fn pool_stats() -> PoolStats {
        pool::stats::<ContainerSlot>()
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("kind", &self.kind())
            .finish()
    }
}
