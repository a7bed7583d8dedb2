//! Cancel token - lightweight, `Copy` observer handle.

use std::any::Any;
use std::fmt;

use crate::source::{CancelState, SourceSlot};
use crate::{CancelRegistration, Canceled, Error};

/// A lightweight, `Copy` handle for observing cancellation.
///
/// Tokens come from a [`CancelSource`](crate::CancelSource), or are one of
/// two allocation-free forms: [`Token::none()`] never cancels and
/// [`Token::canceled()`] is canceled from the start.
///
/// A token issued by a source stays valid while that source's lifecycle is
/// neither disposed nor recycled. Using a stale token is always safe: it
/// simply stops reporting cancellation and refuses new registrations. Take a
/// [`try_retain()`](Self::try_retain) to keep the lifecycle readable after the
/// source is dropped.
///
/// # Example
///
/// ```rust
/// use settle::{CancelSource, Token};
///
/// fn work(token: Token) -> Result<u32, settle::Canceled> {
///     let mut total = 0;
///     for i in 0..100 {
///         if i % 10 == 0 {
///             token.check()?;
///         }
///         total += i;
///     }
///     Ok(total)
/// }
///
/// let source = CancelSource::new();
/// assert_eq!(work(source.token()), Ok(4950));
///
/// source.cancel().unwrap();
/// assert!(work(source.token()).is_err());
/// assert!(work(Token::none()).is_ok());
/// ```
#[derive(Clone, Copy, Default)]
pub struct Token {
    repr: Repr,
}

#[derive(Clone, Copy, Default)]
enum Repr {
    #[default]
    None,
    Canceled,
    Live {
        slot: &'static SourceSlot,
        token_id: u64,
    },
}

impl Token {
    /// A token that can never be canceled.
    #[inline]
    pub const fn none() -> Self {
        Self { repr: Repr::None }
    }

    /// A token that is already canceled. No source is involved.
    #[inline]
    pub const fn canceled() -> Self {
        Self {
            repr: Repr::Canceled,
        }
    }

    #[inline]
    pub(crate) fn live(slot: &'static SourceSlot, token_id: u64) -> Self {
        Self {
            repr: Repr::Live { slot, token_id },
        }
    }

    /// The slot and generation behind a live token.
    #[inline]
    pub(crate) fn as_live(&self) -> Option<(&'static SourceSlot, u64)> {
        match self.repr {
            Repr::Live { slot, token_id } => Some((slot, token_id)),
            _ => None,
        }
    }

    /// Register a callback to run when cancellation is requested.
    ///
    /// - Pending source: the callback is stored and a registration that can
    ///   remove it is returned.
    /// - Already canceled: the callback runs right here, exactly once, and an
    ///   empty registration is returned.
    /// - [`Token::none()`], a disposed source, or a stale token: returns
    ///   `None` and the callback is dropped without running.
    ///
    /// A panic from a callback run synchronously here reaches the caller.
    pub fn register<F>(&self, callback: F) -> Option<CancelRegistration>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.repr {
            Repr::None => None,
            Repr::Canceled => {
                callback();
                Some(CancelRegistration::default())
            }
            Repr::Live { slot, token_id } => slot.register(token_id, Box::new(callback)),
        }
    }

    /// Cancellation was requested. Lock-free.
    #[inline]
    pub fn is_cancelation_requested(&self) -> bool {
        match self.repr {
            Repr::None => false,
            Repr::Canceled => true,
            Repr::Live { slot, token_id } => slot.is_canceled_for(token_id),
        }
    }

    /// This token may still observe a cancellation, or already did.
    pub fn can_be_canceled(&self) -> bool {
        match self.repr {
            Repr::None => false,
            Repr::Canceled => true,
            Repr::Live { slot, token_id } => {
                slot.token_id.matches(token_id) && slot.state() != CancelState::Disposed
            }
        }
    }

    /// Returns `Err(Canceled)` once cancellation was requested.
    #[inline]
    pub fn check(&self) -> Result<(), Canceled> {
        if self.is_cancelation_requested() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }

    /// Keep the lifecycle behind this token from being recycled.
    ///
    /// Returns `Ok(false)` for a stale or disposed token and for
    /// [`Token::none()`]. A canceled token needs no retain and returns
    /// `Ok(true)`. Every successful retain needs a matching
    /// [`release()`](Self::release).
    pub fn try_retain(&self) -> Result<bool, Error> {
        match self.repr {
            Repr::None => Ok(false),
            Repr::Canceled => Ok(true),
            Repr::Live { slot, token_id } => slot.retain_user(token_id),
        }
    }

    /// Release a retain taken with [`try_retain()`](Self::try_retain).
    ///
    /// Releasing without a matching retain is [`Error::InvalidOperation`].
    pub fn release(&self) -> Result<(), Error> {
        match self.repr {
            Repr::None => Err(Error::InvalidOperation("a none token cannot be retained")),
            Repr::Canceled => Ok(()),
            Repr::Live { slot, token_id } => slot.release_user(token_id),
        }
    }

    /// The reason passed to
    /// [`CancelSource::try_cancel_with`](crate::CancelSource::try_cancel_with),
    /// if there is one of type `R`.
    ///
    /// `R::clone` runs without this token's source locked, so it may use the
    /// token.
    pub fn reason<R>(&self) -> Option<R>
    where
        R: Any + Clone,
    {
        let (slot, token_id) = self.as_live()?;
        let inner = slot.lock();
        if !slot.token_id.matches(token_id) {
            return None;
        }
        let reason = inner.reason?;
        drop(inner);
        // Recycled since: the container handle has gone stale and reads None.
        reason.value_cloned::<R>()
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        match (self.repr, other.repr) {
            (Repr::None, Repr::None) | (Repr::Canceled, Repr::Canceled) => true,
            (
                Repr::Live { slot: a, token_id: x },
                Repr::Live { slot: b, token_id: y },
            ) => std::ptr::eq(a, b) && x == y,
            _ => false,
        }
    }
}

impl Eq for Token {}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repr {
            Repr::None => f.write_str("Token::None"),
            Repr::Canceled => f.write_str("Token::Canceled"),
            Repr::Live { .. } => f
                .debug_struct("Token")
                .field("cancelation_requested", &self.is_cancelation_requested())
                .field("can_be_canceled", &self.can_be_canceled())
                .finish(),
        }
    }
}
