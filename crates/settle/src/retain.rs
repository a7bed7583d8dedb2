//! Dual retain counting.
//!
//! A pooled object may be kept alive by two independent parties: the engine's
//! own completion contract (*internal*: the owning handle, an in-flight cancel
//! pass) and explicit external holders (*user*: `Token::try_retain`). Each side
//! keeps its own books; the object may be repooled only when both reach zero.
//!
//! Internal retains are bounded by construction (at most one owner plus one
//! cancel pass), so they are infallible. User and container retains are driven
//! by callers and report overflow or underflow as an [`Error`].

use crate::Error;

/// A single caller-driven retain count.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetainCount(u32);

impl RetainCount {
    pub(crate) const fn new(initial: u32) -> Self {
        Self(initial)
    }

    #[cfg(test)]
    pub(crate) fn get(&self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub(crate) fn retain(&mut self, what: &'static str) -> Result<(), Error> {
        self.0 = self.0.checked_add(1).ok_or(Error::Overflow(what))?;
        Ok(())
    }

    /// Returns `true` when this release dropped the count to zero.
    pub(crate) fn release(&mut self, what: &'static str) -> Result<bool, Error> {
        self.0 = self.0.checked_sub(1).ok_or(Error::InvalidOperation(what))?;
        Ok(self.0 == 0)
    }
}

/// Internal and user retains of one source lifecycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetainCounts {
    internal: u32,
    pub(crate) user: RetainCount,
}

impl RetainCounts {
    /// Counts for a fresh lifecycle: one internal retain held by the owner.
    pub(crate) const fn owned() -> Self {
        Self {
            internal: 1,
            user: RetainCount::new(0),
        }
    }

    #[inline]
    pub(crate) fn retain_internal(&mut self) {
        debug_assert!(self.internal < u32::MAX);
        self.internal += 1;
    }

    #[inline]
    pub(crate) fn release_internal(&mut self) {
        debug_assert!(self.internal > 0, "internal release without retain");
        self.internal = self.internal.saturating_sub(1);
    }

    #[cfg(test)]
    pub(crate) fn internal(&self) -> u32 {
        self.internal
    }

    /// Both sides have let go.
    #[inline]
    pub(crate) fn is_released(&self) -> bool {
        self.internal == 0 && self.user.is_zero()
    }
}
