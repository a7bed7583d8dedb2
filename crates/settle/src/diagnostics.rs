//! Reports for problems nobody is positioned to observe.
//!
//! Some failures have no caller to return to: a rejection dropped without
//! anyone handling it, a cancel pass started by a foreign token whose
//! callbacks panicked, a source dropped while observers still waited on it.
//! These are sent to a process-wide sink. The default sink logs them with
//! `tracing::warn!`; [`set_sink`] replaces it.
//!
//! Nothing here affects control flow.
//!
//! ```rust
//! use settle::diagnostics::{self, Diagnostic};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! static SEEN: AtomicUsize = AtomicUsize::new(0);
//!
//! diagnostics::set_sink(|diagnostic: &Diagnostic| {
//!     if matches!(diagnostic, Diagnostic::UnhandledRejection { .. }) {
//!         SEEN.fetch_add(1, Ordering::Relaxed);
//!     }
//! });
//! # diagnostics::clear_sink();
//! ```

use std::sync::Arc;

use parking_lot::RwLock;

use crate::AggregateFailure;

/// Something went wrong where no caller could be told.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Diagnostic {
    /// A rejected value was released for the last time without being marked
    /// handled.
    UnhandledRejection {
        /// `Debug` rendering of the rejection reason.
        description: String,
        /// Where the rejection was created, when causality tracing is on.
        trace: Option<String>,
    },
    /// Callbacks panicked during a cancel pass that no caller started.
    UnobservedCancelFailure(AggregateFailure),
    /// A source was dropped without being canceled or disposed while
    /// callbacks were still registered on it. Those callbacks will never run.
    UnreleasedResource {
        /// Callbacks that were discarded.
        registrations: usize,
    },
}

type Sink = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

static SINK: RwLock<Option<Sink>> = parking_lot::const_rwlock(None);

/// Install a process-wide sink, replacing the previous one.
pub fn set_sink<F>(sink: F)
where
    F: Fn(&Diagnostic) + Send + Sync + 'static,
{
    *SINK.write() = Some(Arc::new(sink));
}

/// Go back to the default sink.
pub fn clear_sink() {
    *SINK.write() = None;
}

pub(crate) fn report(diagnostic: Diagnostic) {
    // Cloned out so a sink may call set_sink.
    let sink = SINK.read().clone();
    match sink {
        Some(sink) => sink(&diagnostic),
        None => log(&diagnostic),
    }
}

fn log(diagnostic: &Diagnostic) {
    match diagnostic {
        Diagnostic::UnhandledRejection { description, trace } => {
            tracing::warn!(%description, trace = trace.as_deref(), "unhandled rejection");
        }
        Diagnostic::UnobservedCancelFailure(failures) => {
            for failure in failures.failures() {
                tracing::warn!(message = failure.message(), "cancellation callback panicked");
            }
        }
        Diagnostic::UnreleasedResource { registrations } => {
            tracing::warn!(
                registrations,
                "cancel source dropped with callbacks still registered"
            );
        }
    }
}
