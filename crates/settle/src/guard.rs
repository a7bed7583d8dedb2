//! RAII guard for automatic cancellation on drop.
//!
//! [`CancelGuard`] cancels a source when dropped unless explicitly disarmed.
//! This makes sure observers hear about an abandoned operation on error paths
//! and panics.
//!
//! # Example
//!
//! ```rust
//! use settle::CancelSource;
//!
//! fn process(source: &CancelSource) -> Result<(), &'static str> {
//!     // Guard will cancel on drop unless disarmed
//!     let guard = source.cancel_on_drop();
//!
//!     do_risky_work()?;
//!
//!     guard.disarm();
//!     Ok(())
//! }
//!
//! fn do_risky_work() -> Result<(), &'static str> {
//!     Err("disk full")
//! }
//!
//! let source = CancelSource::new();
//! assert!(process(&source).is_err());
//! assert!(source.is_cancelation_requested());
//! ```

use crate::diagnostics::{self, Diagnostic};
use crate::{CancelSource, Error};

/// Cancels a [`CancelSource`] when dropped, unless disarmed.
///
/// Create one with [`CancelSource::cancel_on_drop()`]. Callback panics from
/// the cancel on drop have no caller to go to and are reported as
/// [`Diagnostic::UnobservedCancelFailure`].
#[derive(Debug)]
#[must_use = "dropping the guard right away cancels the source"]
pub struct CancelGuard<'a> {
    source: Option<&'a CancelSource>,
}

impl<'a> CancelGuard<'a> {
    #[inline]
    pub(crate) fn new(source: &'a CancelSource) -> Self {
        Self {
            source: Some(source),
        }
    }

    /// Disarm the guard, preventing cancellation on drop.
    #[inline]
    pub fn disarm(mut self) {
        self.source = None;
    }

    /// Check if this guard is still armed (will cancel on drop).
    #[inline]
    pub fn is_armed(&self) -> bool {
        self.source.is_some()
    }

    /// Get the guarded source, if still armed.
    #[inline]
    pub fn source(&self) -> Option<&'a CancelSource> {
        self.source
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            if let Err(Error::Aggregate(failures)) = source.try_cancel() {
                diagnostics::report(Diagnostic::UnobservedCancelFailure(failures));
            }
        }
    }
}
