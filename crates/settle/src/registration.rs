//! Registrations - handles for removing one callback again.

use std::fmt;
use std::future::Future;
use std::hint;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread;

use crate::Token;
use crate::registry::{CallbackNode, NodeStatus};
use crate::source::SourceSlot;

/// Spins before falling back to `yield_now` while waiting on a callback.
const SPIN_LIMIT: u32 = 64;

/// Identifies one callback registered through [`Token::register`].
///
/// A registration is a `Copy` snapshot; it never keeps the callback or the
/// source alive. The empty registration (also [`Default`]) is what a
/// callback that ran immediately returns; it was never registered.
#[derive(Clone, Copy, Default)]
pub struct CancelRegistration {
    inner: Option<RegistrationRef>,
}

#[derive(Clone, Copy)]
struct RegistrationRef {
    slot: &'static SourceSlot,
    node: &'static CallbackNode,
    node_id: u64,
    token_id: u64,
}

/// Outcome of one attempt to unregister.
enum Attempt {
    Removed,
    Gone,
    /// Running on another thread right now.
    InFlight,
    /// Running on this thread; waiting would deadlock.
    Reentrant,
}

impl RegistrationRef {
    fn attempt(&self) -> Attempt {
        let mut inner = self.slot.lock();
        if !self.slot.token_id.matches(self.token_id) {
            return Attempt::Gone;
        }
        match self.node.status(self.slot.instance, self.node_id) {
            NodeStatus::Stale => Attempt::Gone,
            NodeStatus::Linked => {
                inner.registry.unlink(self.node);
                self.node.id.advance();
                let callback = self.node.take_callback();
                drop(inner);
                drop(callback);
                self.node.release_to_pool();
                Attempt::Removed
            }
            NodeStatus::Invoking => {
                if inner.canceling_thread == Some(thread::current().id()) {
                    Attempt::Reentrant
                } else {
                    Attempt::InFlight
                }
            }
        }
    }

    /// The callback finished (or the node moved on).
    #[inline]
    fn settled(&self) -> bool {
        !self.node.id.matches(self.node_id)
    }
}

impl CancelRegistration {
    pub(crate) fn linked(
        slot: &'static SourceSlot,
        node: &'static CallbackNode,
        node_id: u64,
        token_id: u64,
    ) -> Self {
        Self {
            inner: Some(RegistrationRef {
                slot,
                node,
                node_id,
                token_id,
            }),
        }
    }

    /// Remove the callback so it never runs.
    ///
    /// Returns `false` if it already ran, is running, was removed before,
    /// or its source was disposed. None of these is an error.
    pub fn try_unregister(&self) -> bool {
        match &self.inner {
            Some(inner) => matches!(inner.attempt(), Attempt::Removed),
            None => false,
        }
    }

    /// Remove the callback, or wait until it has finished running.
    ///
    /// If a cancel on another thread is invoking the callback right now, this
    /// blocks (spinning, then yielding) until it returns. Called from inside
    /// the cancel pass that is running it, this returns immediately instead.
    /// Returns `true` only if the callback was removed before it ran.
    ///
    /// After this returns the callback is not running on any other thread
    /// and never will, so state it captures may be torn down.
    pub fn unregister_or_wait(&self) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        match inner.attempt() {
            Attempt::Removed => true,
            Attempt::Gone | Attempt::Reentrant => false,
            Attempt::InFlight => {
                let mut spins = 0u32;
                while !inner.settled() {
                    if spins < SPIN_LIMIT {
                        spins += 1;
                        hint::spin_loop();
                    } else {
                        thread::yield_now();
                    }
                }
                false
            }
        }
    }

    /// Non-blocking form of [`unregister_or_wait`](Self::unregister_or_wait).
    ///
    /// The returned future polls the callback's progress cooperatively and
    /// resolves to the same value.
    pub fn unregister_or_wait_async(&self) -> UnregisterWait {
        UnregisterWait {
            inner: self.inner,
            waiting: false,
        }
    }

    /// The callback is still stored and has not started running.
    pub fn is_registered(&self) -> bool {
        self.inner.is_some_and(|inner| {
            let _guard = inner.slot.lock();
            inner.slot.token_id.matches(inner.token_id)
                && inner.node.status(inner.slot.instance, inner.node_id) == NodeStatus::Linked
        })
    }

    /// The token this callback was registered on; [`Token::none()`] for an
    /// empty registration.
    pub fn token(&self) -> Token {
        match self.inner {
            Some(inner) => Token::live(inner.slot, inner.token_id),
            None => Token::none(),
        }
    }
}

impl fmt::Debug for CancelRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelRegistration")
            .field("registered", &self.is_registered())
            .finish()
    }
}

/// Future returned by [`CancelRegistration::unregister_or_wait_async`].
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct UnregisterWait {
    inner: Option<RegistrationRef>,
    waiting: bool,
}

impl fmt::Debug for RegistrationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationRef")
            .field("node_id", &self.node_id)
            .field("token_id", &self.token_id)
            .finish()
    }
}

impl Future for UnregisterWait {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let Some(inner) = self.inner else {
            return Poll::Ready(false);
        };
        if !self.waiting {
            match inner.attempt() {
                Attempt::Removed => return Poll::Ready(true),
                Attempt::Gone | Attempt::Reentrant => return Poll::Ready(false),
                Attempt::InFlight => self.waiting = true,
            }
        }
        if inner.settled() {
            Poll::Ready(false)
        } else {
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
