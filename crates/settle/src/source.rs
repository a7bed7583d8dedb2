//! Cancel source - owns one pooled cancellation lifecycle.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::container::Container;
use crate::diagnostics::{self, Diagnostic};
use crate::generation::{Generation, next_instance_id};
use crate::pool::{self, Pool, PoolStats, Poolable};
use crate::registry::{Callback, CallbackNode, Registry};
use crate::retain::RetainCounts;
use crate::{AggregateFailure, CancelGuard, CancelRegistration, Error, Token};

/// Lifecycle state of a cancel source.
///
/// `Canceled`, `CanceledComplete` and `Disposed` are terminal for the
/// lifecycle; a slot only becomes `Pending` again after it was repooled and
/// handed out with a new token generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CancelState {
    /// Not canceled yet. Callbacks may be registered.
    Pending = 0,
    /// A cancel pass is invoking callbacks.
    Canceled = 1,
    /// Every callback registered before the cancel has run.
    CanceledComplete = 2,
    /// Disposed without being canceled.
    Disposed = 3,
}

impl CancelState {
    #[inline]
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Canceled,
            2 => Self::CanceledComplete,
            _ => Self::Disposed,
        }
    }

    /// Cancellation was requested in this lifecycle.
    #[inline]
    pub fn is_canceled(self) -> bool {
        matches!(self, Self::Canceled | Self::CanceledComplete)
    }

    #[inline]
    fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Canceled)
    }
}

/// A pooled source slot. Lives for the rest of the process.
pub(crate) struct SourceSlot {
    /// Physical identity; nodes linked into this slot record it.
    pub(crate) instance: u64,
    /// Bumped on every dispose.
    pub(crate) source_id: Generation,
    /// Bumped on repool and on reset.
    pub(crate) token_id: Generation,
    /// Lock-free mirror of `SourceInner::state`.
    state: AtomicU8,
    inner: Mutex<SourceInner>,
}

pub(crate) struct SourceInner {
    pub(crate) state: CancelState,
    pub(crate) retains: RetainCounts,
    pub(crate) registry: Registry,
    /// Registrations on upstream tokens of a linked source.
    links: SmallVec<[CancelRegistration; 2]>,
    pub(crate) reason: Option<Container>,
    /// Lazily exported foreign sources, at most one per foreign type; see
    /// `bridge::export`.
    pub(crate) bridges: SmallVec<[Box<dyn Any + Send + Sync>; 1]>,
    pub(crate) canceling_thread: Option<ThreadId>,
}

impl Default for SourceSlot {
    fn default() -> Self {
        let instance = next_instance_id();
        Self {
            instance,
            source_id: Generation::new(),
            token_id: Generation::new(),
            state: AtomicU8::new(CancelState::Disposed as u8),
            inner: Mutex::new(SourceInner {
                state: CancelState::Disposed,
                retains: RetainCounts::default(),
                registry: Registry::new(instance),
                links: SmallVec::new(),
                reason: None,
                bridges: SmallVec::new(),
                canceling_thread: None,
            }),
        }
    }
}

impl Poolable for SourceSlot {
    fn pool() -> &'static Pool<Self> {
        static POOL: Pool<SourceSlot> = Pool::new();
        &POOL
    }
}

/// What a repooling release moves out of the slot. Dropped after the slot
/// lock is released.
struct Leftovers {
    slot: &'static SourceSlot,
    reason: Option<Container>,
    bridges: SmallVec<[Box<dyn Any + Send + Sync>; 1]>,
}

impl Leftovers {
    fn finish(self) {
        if let Some(reason) = self.reason {
            // The slot held exactly one retain on its reason.
            let _ = reason.release();
        }
        drop(self.bridges);
        tracing::trace!(instance = self.slot.instance, "cancel source repooled");
        SourceSlot::pool().repool(self.slot);
    }
}

impl SourceSlot {
    /// Draws a slot and starts a `Pending` lifecycle owned by the caller.
    fn acquire() -> SourceHandle {
        let slot = Self::pool().acquire();
        let mut inner = slot.inner.lock();
        debug_assert!(inner.registry.is_empty());
        inner.state = CancelState::Pending;
        inner.retains = RetainCounts::owned();
        slot.publish(CancelState::Pending);
        let source_id = slot.source_id.current();
        drop(inner);
        tracing::trace!(instance = slot.instance, source_id, "cancel source acquired");
        SourceHandle { slot, source_id }
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, SourceInner> {
        self.inner.lock()
    }

    #[inline]
    fn publish(&self, state: CancelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn state(&self) -> CancelState {
        CancelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Lock-free check that `token_id` is current and cancellation was
    /// requested. The token id is read on both sides of the state read so a
    /// repool in between is never mistaken for the new tenant's state.
    #[inline]
    pub(crate) fn is_canceled_for(&self, token_id: u64) -> bool {
        self.token_id.matches(token_id)
            && self.state().is_canceled()
            && self.token_id.matches(token_id)
    }

    /// Same as [`is_canceled_for`](Self::is_canceled_for), keyed by source id.
    #[inline]
    fn is_canceled_by_owner(&self, source_id: u64) -> bool {
        self.source_id.matches(source_id)
            && self.state().is_canceled()
            && self.source_id.matches(source_id)
    }

    /// Token validity under the lock.
    #[inline]
    pub(crate) fn token_is_live(&self, inner: &SourceInner, token_id: u64) -> bool {
        self.token_id.matches(token_id) && inner.state != CancelState::Disposed
    }

    /// Appends a callback, or runs it right away if cancellation was already
    /// requested. Returns `None` (dropping `callback`) for a stale or disposed
    /// token.
    pub(crate) fn register(
        &'static self,
        token_id: u64,
        callback: Callback,
    ) -> Option<CancelRegistration> {
        let mut inner = self.inner.lock();
        if !self.token_is_live(&inner, token_id) {
            return None;
        }
        if inner.state == CancelState::Pending {
            let (node, node_id) = inner.registry.push(callback);
            return Some(CancelRegistration::linked(self, node, node_id, token_id));
        }
        drop(inner);
        callback();
        Some(CancelRegistration::default())
    }

    /// Takes a user retain for a live token.
    pub(crate) fn retain_user(&self, token_id: u64) -> Result<bool, Error> {
        let mut inner = self.inner.lock();
        if !self.token_is_live(&inner, token_id) {
            return Ok(false);
        }
        inner.retains.user.retain("token retain count")?;
        Ok(true)
    }

    /// Drops a user retain. The token may be disposed by now; a retain keeps
    /// its generation alive until this release.
    pub(crate) fn release_user(&'static self, token_id: u64) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if !self.token_id.matches(token_id) {
            return Err(Error::InvalidOperation("token is stale"));
        }
        inner.retains.user.release("token released more often than retained")?;
        let leftovers = self.take_if_released(&mut inner);
        drop(inner);
        if let Some(leftovers) = leftovers {
            leftovers.finish();
        }
        Ok(())
    }

    /// Clears the slot once nothing references the lifecycle any more.
    /// Must be called with the lock held, right after a release.
    fn take_if_released(&'static self, inner: &mut SourceInner) -> Option<Leftovers> {
        if !(inner.retains.is_released() && inner.state.is_terminal()) {
            return None;
        }
        debug_assert!(inner.registry.is_empty(), "repooling with live callbacks");
        debug_assert!(inner.links.is_empty());
        self.token_id.advance();
        inner.state = CancelState::Disposed;
        self.publish(CancelState::Disposed);
        inner.canceling_thread = None;
        Some(Leftovers {
            slot: self,
            reason: inner.reason.take(),
            bridges: std::mem::take(&mut inner.bridges),
        })
    }
}

/// Drops discarded callbacks and repools their nodes. Called with no lock held.
fn discard(drained: Vec<(&'static CallbackNode, Option<Callback>)>) {
    for (node, callback) in drained {
        drop(callback);
        node.release_to_pool();
    }
}

fn detach(links: SmallVec<[CancelRegistration; 2]>) {
    for link in links {
        link.try_unregister();
    }
}

/// An owner-side reference to a lifecycle: a slot plus the `source_id` it
/// was issued for. `Copy`, so callbacks can capture it without keeping
/// anything alive; every operation re-validates the snapshot.
#[derive(Clone, Copy)]
pub(crate) struct SourceHandle {
    slot: &'static SourceSlot,
    source_id: u64,
}

impl SourceHandle {
    #[inline]
    pub(crate) fn is_valid(&self) -> bool {
        self.slot.source_id.matches(self.source_id)
    }

    fn token(&self) -> Token {
        let inner = self.slot.lock();
        if !self.is_valid() {
            return Token::none();
        }
        let token_id = self.slot.token_id.current();
        drop(inner);
        Token::live(self.slot, token_id)
    }

    fn state(&self) -> CancelState {
        let state = self.slot.state();
        if self.is_valid() {
            state
        } else {
            CancelState::Disposed
        }
    }

    /// Runs one cancel pass. `Ok(false)` when the handle is stale or the
    /// lifecycle already left `Pending`.
    pub(crate) fn try_cancel(&self, reason: Option<Container>) -> Result<bool, Error> {
        let slot = self.slot;
        let mut inner = slot.lock();
        if !self.is_valid() || inner.state != CancelState::Pending {
            drop(inner);
            if let Some(reason) = reason {
                let _ = reason.release();
            }
            return Ok(false);
        }
        inner.state = CancelState::Canceled;
        slot.publish(CancelState::Canceled);
        inner.retains.retain_internal();
        inner.canceling_thread = Some(thread::current().id());
        inner.reason = reason;
        let links = std::mem::take(&mut inner.links);
        let pending = inner.registry.len();
        drop(inner);

        tracing::trace!(instance = slot.instance, pending, "cancel started");
        detach(links);

        let mut failures = AggregateFailure::default();
        loop {
            let mut inner = slot.lock();
            let Some(node) = inner.registry.pop_newest() else {
                inner.state = CancelState::CanceledComplete;
                slot.publish(CancelState::CanceledComplete);
                inner.canceling_thread = None;
                inner.retains.release_internal();
                let leftovers = slot.take_if_released(&mut inner);
                drop(inner);
                if let Some(leftovers) = leftovers {
                    leftovers.finish();
                }
                break;
            };
            drop(inner);

            if let Some(callback) = node.take_callback() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                    failures.push_payload(payload);
                }
            }
            node.retire();
        }

        tracing::trace!(
            instance = slot.instance,
            failures = failures.len(),
            "cancel complete"
        );
        failures.into_result()?;
        Ok(true)
    }

    /// Cancels on behalf of an upstream callback. A failed pass is re-raised
    /// so the upstream pass folds it into its own aggregate.
    pub(crate) fn cancel_from_upstream(&self) {
        if let Err(Error::Aggregate(failures)) = self.try_cancel(None) {
            panic::resume_unwind(Box::new(failures));
        }
    }

    /// Ends the owner's part in the lifecycle. Discards callbacks without
    /// invoking them if still `Pending`.
    pub(crate) fn try_dispose(&self) -> bool {
        let slot = self.slot;
        let mut inner = slot.lock();
        if !self.is_valid() {
            return false;
        }
        slot.source_id.advance();

        let mut drained = Vec::new();
        let mut links = SmallVec::new();
        if inner.state == CancelState::Pending {
            inner.state = CancelState::Disposed;
            slot.publish(CancelState::Disposed);
            drained = inner.registry.drain();
            links = std::mem::take(&mut inner.links);
        }
        inner.retains.release_internal();
        let leftovers = slot.take_if_released(&mut inner);
        drop(inner);

        tracing::trace!(
            instance = slot.instance,
            discarded = drained.len(),
            "cancel source disposed"
        );
        discard(drained);
        detach(links);
        if let Some(leftovers) = leftovers {
            leftovers.finish();
        }
        true
    }

    fn try_reset(&self) -> bool {
        let slot = self.slot;
        let mut inner = slot.lock();
        if !self.is_valid()
            || inner.state != CancelState::Pending
            || !inner.retains.user.is_zero()
        {
            return false;
        }
        slot.token_id.advance();
        let drained = inner.registry.drain();
        let bridges = std::mem::take(&mut inner.bridges);
        drop(inner);

        discard(drained);
        drop(bridges);
        true
    }

    /// Callbacks still waiting, for a lifecycle nobody canceled.
    fn pending_registrations(&self) -> Option<usize> {
        let inner = self.slot.lock();
        (self.is_valid() && inner.state == CancelState::Pending).then(|| inner.registry.len())
    }

    /// Stores upstream registrations, unless a cancel got there first.
    fn attach_links(&self, links: SmallVec<[CancelRegistration; 2]>) {
        let mut inner = self.slot.lock();
        if self.is_valid() && inner.state == CancelState::Pending {
            inner.links.extend(links);
            return;
        }
        drop(inner);
        detach(links);
    }
}

/// Owns a pooled cancellation lifecycle and issues [`Token`]s for it.
///
/// A `CancelSource` is the only handle that can cancel or dispose its
/// lifecycle. It is not `Clone`; dropping it disposes the lifecycle, which
/// discards callbacks that never ran. Tokens stay cheap `Copy` values that
/// become inert once the lifecycle is gone.
///
/// # Example
///
/// ```rust
/// use settle::{CancelSource, CancelState};
/// use std::sync::{Arc, Mutex};
///
/// let source = CancelSource::new();
/// let token = source.token();
///
/// let order = Arc::new(Mutex::new(Vec::new()));
/// for name in ["a", "b"] {
///     let order = Arc::clone(&order);
///     token.register(move || order.lock().unwrap().push(name));
/// }
///
/// source.cancel().unwrap();
///
/// // Newest registration first.
/// assert_eq!(*order.lock().unwrap(), ["b", "a"]);
/// assert_eq!(source.state(), CancelState::CanceledComplete);
/// assert!(token.is_cancelation_requested());
/// ```
pub struct CancelSource {
    handle: SourceHandle,
}

impl CancelSource {
    /// Create a new cancel source, reusing a pooled slot when one is free.
    pub fn new() -> Self {
        Self {
            handle: SourceSlot::acquire(),
        }
    }

    /// Create a source that is also canceled when any of `upstream` is.
    ///
    /// Each upstream token gets a callback that cancels this source. Those
    /// registrations are removed again when this source is canceled or
    /// disposed, so a later upstream cancel never reaches a recycled slot.
    /// An upstream that is already canceled cancels the new source before
    /// this returns.
    ///
    /// ```rust
    /// use settle::CancelSource;
    ///
    /// let parent = CancelSource::new();
    /// let child = CancelSource::new_linked(&[parent.token()]);
    ///
    /// parent.cancel().unwrap();
    /// assert!(child.is_cancelation_requested());
    /// ```
    pub fn new_linked(upstream: &[Token]) -> Self {
        let source = Self::new();
        let handle = source.handle;
        let mut links = SmallVec::new();
        for token in upstream {
            if source.is_cancelation_requested() {
                break;
            }
            if let Some(registration) = token.register(move || handle.cancel_from_upstream()) {
                if registration.is_registered() {
                    links.push(registration);
                }
            }
        }
        handle.attach_links(links);
        source
    }

    #[inline]
    pub(crate) fn handle(&self) -> SourceHandle {
        self.handle
    }

    /// Get a token for the current lifecycle.
    ///
    /// After the source was disposed this returns [`Token::none()`].
    #[inline]
    pub fn token(&self) -> Token {
        self.handle.token()
    }

    /// This handle still refers to its lifecycle (it was not disposed).
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// Cancellation was requested.
    #[inline]
    pub fn is_cancelation_requested(&self) -> bool {
        self.handle.slot.is_canceled_by_owner(self.handle.source_id)
    }

    /// Current state. A disposed handle always reports [`CancelState::Disposed`].
    #[inline]
    pub fn state(&self) -> CancelState {
        self.handle.state()
    }

    /// Request cancellation.
    ///
    /// Invokes every registered callback on this thread, newest first, and
    /// returns once all of them ran. Returns `Ok(false)` if the source was
    /// already canceled or disposed. If any callback panicked the remaining
    /// ones still run and the panics come back as one [`Error::Aggregate`].
    pub fn try_cancel(&self) -> Result<bool, Error> {
        self.handle.try_cancel(None)
    }

    /// Request cancellation with a reason observers can read back through
    /// [`Token::reason`].
    pub fn try_cancel_with<R>(&self, reason: R) -> Result<bool, Error>
    where
        R: Any + Send + Sync,
    {
        self.handle.try_cancel(Some(Container::canceled_with(reason, 1)))
    }

    /// Like [`try_cancel`](Self::try_cancel), but a source that can no longer
    /// be canceled is an [`Error::InvalidOperation`].
    pub fn cancel(&self) -> Result<(), Error> {
        if self.try_cancel()? {
            Ok(())
        } else {
            Err(Error::InvalidOperation("source was already canceled or disposed"))
        }
    }

    /// Dispose the lifecycle without consuming the handle.
    ///
    /// Callbacks that never ran are dropped without being invoked. Returns
    /// `false` if the source was already disposed.
    pub fn try_dispose(&self) -> bool {
        self.handle.try_dispose()
    }

    /// Dispose the lifecycle.
    pub fn dispose(self) -> Result<(), Error> {
        let handle = self.handle;
        std::mem::forget(self);
        if handle.try_dispose() {
            Ok(())
        } else {
            Err(Error::InvalidOperation("source was already disposed"))
        }
    }

    /// Start a fresh lifecycle in place.
    ///
    /// Succeeds only while the source is `Pending` and no token is retained.
    /// Registered callbacks are discarded without running and previously
    /// issued tokens and registrations turn stale.
    pub fn try_reset(&self) -> bool {
        self.handle.try_reset()
    }

    /// Get a guard that cancels this source when dropped, unless disarmed.
    #[inline]
    pub fn cancel_on_drop(&self) -> CancelGuard<'_> {
        CancelGuard::new(self)
    }

    /// Counters for the process-wide source pool.
    pub fn pool_stats() -> PoolStats {
        pool::stats::<SourceSlot>()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancelSource {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            if let Some(registrations @ 1..) = self.handle.pending_registrations() {
                diagnostics::report(Diagnostic::UnreleasedResource { registrations });
            }
        }
        self.handle.try_dispose();
    }
}

impl std::fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSource")
            .field("state", &self.state())
            .finish()
    }
}
