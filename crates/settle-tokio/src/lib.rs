//! # settle-tokio
//!
//! Bridge tokio-util's [`CancellationToken`] and settle's [`Token`] in both
//! directions.
//!
//! ## When to Use
//!
//! Use this crate when you have:
//! - Tokio code holding a `CancellationToken` that must stop work driven by
//!   settle sources and callbacks
//! - Settle-based code that hands cancellation to tokio tasks or `select!`
//!
//! ## Complete Example
//!
//! ```rust,no_run
//! use settle::CancelSource;
//! use settle_tokio::{CancellationTokenExt, TokenTokioExt};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     // tokio -> settle
//!     let shutdown = CancellationToken::new();
//!     let imported = shutdown.to_settle();
//!     imported.token().register(|| println!("shutting down"));
//!
//!     // settle -> tokio
//!     let source = CancelSource::new();
//!     let token = source.token();
//!     let task = tokio::spawn(async move {
//!         tokio::select! {
//!             _ = token.cancelled() => "cancelled",
//!             _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => "timeout",
//!         }
//!     });
//!
//!     source.cancel().unwrap();
//!     shutdown.cancel();
//!     println!("{}", task.await.unwrap());
//! }
//! ```
//!
//! ## Quick Reference
//!
//! ```rust,no_run
//! # use settle::CancelSource;
//! # use settle_tokio::{CancellationTokenExt, TokenTokioExt};
//! # use tokio_util::sync::CancellationToken;
//! let tokio_token = CancellationToken::new();
//! let imported = tokio_token.to_settle();   // ImportedToken, keep it alive
//! let token = imported.token();             // settle Token
//!
//! let source = CancelSource::new();
//! let exported = source.token().to_tokio(); // CancellationToken
//! // source.token().cancelled().await;      // Wait for cancellation (async)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Wake, Waker};

use parking_lot::Mutex;
use settle::Token;
use settle::bridge::{self, ForeignDisposed, ForeignSource, ForeignToken, ImportedToken};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// A tokio [`CancellationToken`] seen as a [`ForeignToken`].
///
/// Tokio tokens carry no identity, so every import creates its own bridged
/// source.
#[derive(Clone, Debug)]
pub struct TokioToken(CancellationToken);

impl TokioToken {
    /// Wrap a tokio token.
    #[inline]
    pub fn new(token: CancellationToken) -> Self {
        Self(token)
    }

    /// Get the underlying CancellationToken.
    #[inline]
    pub fn token(&self) -> &CancellationToken {
        &self.0
    }
}

impl ForeignToken for TokioToken {
    type Hook = TokioHook;

    #[inline]
    fn is_cancellation_requested(&self) -> bool {
        self.0.is_cancelled()
    }

    #[inline]
    fn can_be_canceled(&self) -> bool {
        true
    }

    fn hook(&self, on_cancel: Box<dyn FnOnce() + Send>) -> TokioHook {
        let state = Arc::new(HookState {
            waiting: Mutex::new(Some(Box::pin(self.0.clone().cancelled_owned()))),
            on_cancel: Mutex::new(Some(on_cancel)),
        });
        // Registers the waker, or fires right away if already cancelled.
        state.poll_once();
        TokioHook { state }
    }
}

/// Waits for a tokio token without a runtime.
///
/// The waker is the state itself: tokio's `cancel()` wakes it, the wake polls
/// the future to completion and runs the callback on the cancelling thread.
struct HookState {
    waiting: Mutex<Option<Pin<Box<WaitForCancellationFutureOwned>>>>,
    on_cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl HookState {
    fn poll_once(self: &Arc<Self>) {
        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        let finished = {
            let mut waiting = self.waiting.lock();
            let ready = waiting
                .as_mut()
                .is_some_and(|future| future.as_mut().poll(&mut cx).is_ready());
            if ready { waiting.take() } else { None }
        };
        if finished.is_some() {
            drop(finished);
            let on_cancel = self.on_cancel.lock().take();
            if let Some(on_cancel) = on_cancel {
                tracing::trace!("tokio token cancelled");
                on_cancel();
            }
        }
    }
}

impl Wake for HookState {
    fn wake(self: Arc<Self>) {
        self.poll_once();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.poll_once();
    }
}

/// Keeps an import hooked to its tokio token. Dropping it detaches.
pub struct TokioHook {
    state: Arc<HookState>,
}

impl Drop for TokioHook {
    fn drop(&mut self) {
        // The pending future holds our waker; dropping it breaks the cycle.
        let waiting = self.state.waiting.lock().take();
        drop(waiting);
        let on_cancel = self.state.on_cancel.lock().take();
        drop(on_cancel);
    }
}

impl std::fmt::Debug for TokioHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioHook")
            .field("armed", &self.state.on_cancel.lock().is_some())
            .finish()
    }
}

/// A tokio [`CancellationToken`] used as a [`ForeignSource`] for exports.
///
/// Every export gets its own child token, so a consumer that cancels its
/// copy does not cancel anyone else's.
#[derive(Debug)]
pub struct TokioSource(CancellationToken);

impl ForeignSource for TokioSource {
    type Token = CancellationToken;

    fn create() -> Self {
        Self(CancellationToken::new())
    }

    fn token(&self) -> Result<CancellationToken, ForeignDisposed> {
        Ok(self.0.child_token())
    }

    fn cancel(&self) -> Result<(), ForeignDisposed> {
        self.0.cancel();
        Ok(())
    }

    fn uncancelable_token() -> CancellationToken {
        // Nobody else holds it, so nobody can cancel it.
        CancellationToken::new()
    }

    fn canceled_token() -> CancellationToken {
        let token = CancellationToken::new();
        token.cancel();
        token
    }
}

/// Extension trait for CancellationToken to convert to a settle token.
///
/// Named to avoid colliding with anything `tokio_util` might add.
pub trait CancellationTokenExt {
    /// Import into settle. The returned value owns the bridged source; its
    /// [`token()`](ImportedToken::token) is valid while it is alive.
    fn to_settle(&self) -> ImportedToken;
}

impl CancellationTokenExt for CancellationToken {
    fn to_settle(&self) -> ImportedToken {
        bridge::import(&TokioToken::new(self.clone()))
    }
}

/// Extension trait for settle tokens to convert to tokio.
pub trait TokenTokioExt {
    /// Export to a tokio CancellationToken that is cancelled with this token.
    fn to_tokio(&self) -> CancellationToken;

    /// Wait for cancellation.
    ///
    /// Never resolves for a token that cannot be canceled.
    fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static;
}

impl TokenTokioExt for Token {
    #[inline]
    fn to_tokio(&self) -> CancellationToken {
        bridge::export::<TokioSource>(*self)
    }

    fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        self.to_tokio().cancelled_owned()
    }
}

impl TokenTokioExt for ImportedToken {
    #[inline]
    fn to_tokio(&self) -> CancellationToken {
        self.token().to_tokio()
    }

    fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        // Holding the import keeps the bridged source alive while waiting.
        let import = self.clone();
        let waiting = self.to_tokio().cancelled_owned();
        async move {
            waiting.await;
            drop(import);
        }
    }
}
