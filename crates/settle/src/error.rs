//! Error types.
//!
//! Expected races (a stale handle, a callback that already fired, a source that
//! was already disposed) are reported as `false` / `None` by the `try_` family of
//! operations. [`Error`] is reserved for the strict variants and for callback
//! panics collected during a cancel pass.

use std::any::Any;
use std::fmt;

/// Errors returned by strict handle operations and by cancellation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The handle no longer refers to a live lifecycle, or the operation is not
    /// valid in the lifecycle's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// A retain count would exceed its representable range.
    ///
    /// This always indicates a retain without a matching release.
    #[error("retain count overflow: {0}")]
    Overflow(&'static str),

    /// One or more callbacks panicked during a single cancel pass.
    #[error(transparent)]
    Aggregate(#[from] AggregateFailure),
}

impl Error {
    /// Returns the aggregated callback failures, if this is [`Error::Aggregate`].
    pub fn as_aggregate(&self) -> Option<&AggregateFailure> {
        match self {
            Self::Aggregate(failures) => Some(failures),
            _ => None,
        }
    }
}

/// A single panic caught while invoking a cancellation callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackPanic {
    message: String,
}

impl CallbackPanic {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<&'static str>() {
            Ok(msg) => (*msg).to_owned(),
            Err(payload) => match payload.downcast::<String>() {
                Ok(msg) => *msg,
                Err(_) => "<non-string panic payload>".to_owned(),
            },
        };
        Self { message }
    }

    /// The panic message, or a placeholder for non-string payloads.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CallbackPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Every callback panic from one cancel pass, in invocation order.
///
/// A cancel pass never stops early: all remaining callbacks still run after
/// one of them panics, and the caller receives exactly one `AggregateFailure`.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{} cancellation callback(s) panicked", .failures.len())]
pub struct AggregateFailure {
    failures: Vec<CallbackPanic>,
}

impl AggregateFailure {
    /// Number of callbacks that panicked.
    #[inline]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Returns `true` if no callback panicked.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// The individual failures, in invocation order.
    #[inline]
    pub fn failures(&self) -> &[CallbackPanic] {
        &self.failures
    }

    /// Records a caught panic payload.
    ///
    /// A payload that is itself an `AggregateFailure` (raised by a linked
    /// source cancelled from inside this pass) is flattened.
    pub(crate) fn push_payload(&mut self, payload: Box<dyn Any + Send>) {
        match payload.downcast::<AggregateFailure>() {
            Ok(nested) => self.failures.extend(nested.failures),
            Err(payload) => self.failures.push(CallbackPanic::from_payload(payload)),
        }
    }

    pub(crate) fn into_result(self) -> Result<(), AggregateFailure> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

/// Returned by [`Token::check()`](crate::Token::check) once cancellation was requested.
///
/// Implement `From<Canceled>` for your error type to use `?` naturally:
///
/// ```rust
/// use settle::{Canceled, Token};
///
/// #[derive(Debug)]
/// enum JobError {
///     Canceled,
///     Io(std::io::Error),
/// }
///
/// impl From<Canceled> for JobError {
///     fn from(_: Canceled) -> Self { JobError::Canceled }
/// }
///
/// fn step(token: Token) -> Result<(), JobError> {
///     token.check()?;
///     Ok(())
/// }
///
/// assert!(step(Token::none()).is_ok());
/// assert!(matches!(step(Token::canceled()), Err(JobError::Canceled)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("operation canceled")]
pub struct Canceled;
