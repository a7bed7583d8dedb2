//! Interop with foreign cancellation primitives.
//!
//! Two directions, each described by a trait the foreign side implements:
//!
//! - [`import`] turns a [`ForeignToken`] into a [`Token`]. A bridged source is
//!   created and canceled when the foreign token fires. Foreign tokens that
//!   expose an [`identity`](ForeignToken::identity) share one bridged source
//!   per identity, cached weakly so the cache never keeps either side alive.
//! - [`export`] turns a [`Token`] into a [`ForeignSource::Token`]. The foreign
//!   source is created on first request, stored with the lifecycle (one per
//!   foreign type), and canceled from a regular callback.
//!
//! See the `settle-tokio` crate for a binding to `tokio_util`'s
//! `CancellationToken`.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::diagnostics::{self, Diagnostic};
use crate::source::SourceHandle;
use crate::{CancelSource, Error, Token};

/// A foreign token that can be observed.
pub trait ForeignToken {
    /// Keeps the callback passed to [`hook`](Self::hook) attached; dropping
    /// it detaches the callback.
    type Hook: Send + 'static;

    /// The foreign token was canceled.
    fn is_cancellation_requested(&self) -> bool;

    /// The foreign token can ever be canceled.
    fn can_be_canceled(&self) -> bool;

    /// A weak reference identifying the foreign cancellation state, if it has
    /// one. Imports of tokens with the same identity share a bridged source.
    fn identity(&self) -> Option<Weak<dyn Any + Send + Sync>> {
        None
    }

    /// Arrange for `on_cancel` to run once when the token is canceled.
    ///
    /// `on_cancel` may run synchronously inside this call if the token is
    /// already canceled, or on any thread later.
    fn hook(&self, on_cancel: Box<dyn FnOnce() + Send>) -> Self::Hook;
}

/// The foreign side was disposed out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("foreign cancellation source was disposed")]
pub struct ForeignDisposed;

/// A foreign cancellation source that can be driven from a [`Token`].
pub trait ForeignSource: Send + Sync + 'static {
    /// The token type handed to foreign consumers.
    type Token;

    /// Create a new, uncanceled source.
    fn create() -> Self
    where
        Self: Sized;

    /// A token observing this source.
    fn token(&self) -> Result<Self::Token, ForeignDisposed>;

    /// Cancel this source.
    fn cancel(&self) -> Result<(), ForeignDisposed>;

    /// A token that will never be canceled.
    fn uncancelable_token() -> Self::Token;

    /// A token that is already canceled.
    fn canceled_token() -> Self::Token;
}

/// A source owned by an import. Field order matters: the hook is detached
/// before the source is disposed.
struct BridgedSource {
    hook: Mutex<Option<Box<dyn Send>>>,
    source: CancelSource,
}

impl Drop for BridgedSource {
    fn drop(&mut self) {
        drop(self.hook.get_mut().take());
        self.source.try_dispose();
    }
}

/// A [`Token`] produced by [`import`].
///
/// The token stays valid as long as any clone of this value is alive.
#[derive(Clone)]
pub struct ImportedToken {
    token: Token,
    bridged: Option<Arc<BridgedSource>>,
}

impl ImportedToken {
    fn plain(token: Token) -> Self {
        Self {
            token,
            bridged: None,
        }
    }

    fn bridged(bridged: Arc<BridgedSource>) -> Self {
        Self {
            token: bridged.source.token(),
            bridged: Some(bridged),
        }
    }

    /// The imported token.
    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Cancellation was requested.
    #[inline]
    pub fn is_cancelation_requested(&self) -> bool {
        self.token.is_cancelation_requested()
    }

    /// A bridged source backs this token. `false` for foreign tokens that were
    /// already canceled or can never be canceled.
    #[inline]
    pub fn is_bridged(&self) -> bool {
        self.bridged.is_some()
    }
}

impl fmt::Debug for ImportedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportedToken")
            .field("token", &self.token)
            .field("bridged", &self.is_bridged())
            .finish()
    }
}

struct CacheEntry {
    key: Weak<dyn Any + Send + Sync>,
    bridged: Weak<BridgedSource>,
}

static CACHE: Mutex<Vec<CacheEntry>> = parking_lot::const_mutex(Vec::new());

thread_local! {
    /// `Some` while this thread is hooking a foreign token. A foreign cancel
    /// that fires synchronously in that window is queued here and run once
    /// `hook` has returned, so callbacks never run inside foreign code.
    static DEFERRED: RefCell<Option<Vec<SourceHandle>>> = const { RefCell::new(None) };
}

/// Marks the hookup window on this thread.
struct Hookup {
    outer: Option<Vec<SourceHandle>>,
}

impl Hookup {
    fn begin() -> Self {
        Self {
            outer: DEFERRED.with(|d| d.borrow_mut().replace(Vec::new())),
        }
    }

    /// Ends the window and returns the cancels it deferred.
    fn finish(mut self) -> Vec<SourceHandle> {
        let outer = self.outer.take();
        let deferred = DEFERRED.with(|d| std::mem::replace(&mut *d.borrow_mut(), outer));
        std::mem::forget(self);
        deferred.unwrap_or_default()
    }
}

impl Drop for Hookup {
    fn drop(&mut self) {
        // Unwinding out of a foreign hook; restore the enclosing window.
        let outer = self.outer.take();
        DEFERRED.with(|d| *d.borrow_mut() = outer);
    }
}

fn cancel_bridged(handle: SourceHandle) {
    if let Err(Error::Aggregate(failures)) = handle.try_cancel(None) {
        diagnostics::report(Diagnostic::UnobservedCancelFailure(failures));
    }
}

fn on_foreign_cancel(handle: SourceHandle) {
    let deferred = DEFERRED.with(|d| match d.borrow_mut().as_mut() {
        Some(queue) => {
            queue.push(handle);
            true
        }
        None => false,
    });
    if !deferred {
        cancel_bridged(handle);
    }
}

fn hook<T: ForeignToken>(foreign: &T) -> Arc<BridgedSource> {
    let source = CancelSource::new();
    let handle = source.handle();
    let on_cancel = Box::new(move || on_foreign_cancel(handle));
    let hook: Box<dyn Send> = Box::new(foreign.hook(on_cancel));
    tracing::debug!("foreign token bridged");
    Arc::new(BridgedSource {
        hook: Mutex::new(Some(hook)),
        source,
    })
}

/// Import a foreign token.
///
/// - Already canceled: returns [`Token::canceled()`] without allocating.
/// - Can never be canceled: returns [`Token::none()`].
/// - Otherwise: returns a token of a bridged source that is canceled when the
///   foreign token is.
pub fn import<T: ForeignToken>(foreign: &T) -> ImportedToken {
    if foreign.is_cancellation_requested() {
        return ImportedToken::plain(Token::canceled());
    }
    if !foreign.can_be_canceled() {
        return ImportedToken::plain(Token::none());
    }

    let Some(key) = foreign.identity() else {
        return ImportedToken::bridged(hook_now(foreign));
    };
    if let Some(bridged) = cached(&CACHE.lock(), &key) {
        return ImportedToken::bridged(bridged);
    }

    // Hook without the cache lock: `hook` is foreign code and may import.
    let bridged = hook_now(foreign);
    let mut cache = CACHE.lock();
    cache.retain(|entry| entry.key.strong_count() > 0 && entry.bridged.strong_count() > 0);
    if let Some(winner) = cached(&cache, &key) {
        // Another import of the same identity finished first.
        drop(cache);
        drop(bridged);
        return ImportedToken::bridged(winner);
    }
    cache.push(CacheEntry {
        key,
        bridged: Arc::downgrade(&bridged),
    });
    drop(cache);
    ImportedToken::bridged(bridged)
}

fn cached(
    cache: &[CacheEntry],
    key: &Weak<dyn Any + Send + Sync>,
) -> Option<Arc<BridgedSource>> {
    cache
        .iter()
        .find(|entry| Weak::ptr_eq(&entry.key, key))
        .and_then(|entry| entry.bridged.upgrade())
}

/// Hooks a new bridged source, then runs any cancel the foreign side fired
/// while `hook` was still running.
fn hook_now<T: ForeignToken>(foreign: &T) -> Arc<BridgedSource> {
    let hookup = Hookup::begin();
    let bridged = hook(foreign);
    hookup.finish().into_iter().for_each(cancel_bridged);
    bridged
}

/// Export a token to a foreign cancellation system.
///
/// - [`Token::none()`], or a token whose source was disposed: an uncancelable
///   foreign token.
/// - Canceled: a canceled foreign token.
/// - Pending: a token of a foreign source created on the first export to `F`
///   and reused for later exports of the same lifecycle to `F`. It is
///   canceled from a callback when this token's source is.
///
/// If the foreign source was disposed out of band, the result is derived from
/// this token's state instead.
pub fn export<F: ForeignSource>(token: Token) -> F::Token {
    let Some((slot, token_id)) = token.as_live() else {
        return fallback::<F>(token);
    };
    let mut inner = slot.lock();
    if !slot.token_is_live(&inner, token_id) {
        return F::uncancelable_token();
    }
    if inner.state.is_canceled() {
        return F::canceled_token();
    }

    let existing = inner
        .bridges
        .iter()
        .find_map(|bridge| bridge.downcast_ref::<Arc<F>>())
        .cloned();
    let foreign = match existing {
        Some(foreign) => foreign,
        None => {
            let foreign = Arc::new(F::create());
            let target = Arc::clone(&foreign);
            inner.registry.push(Box::new(move || {
                // Disposed out of band: nobody is listening any more.
                let _ = target.cancel();
            }));
            let stored: Box<dyn Any + Send + Sync> = Box::new(Arc::clone(&foreign));
            inner.bridges.push(stored);
            tracing::debug!(instance = slot.instance, "token exported");
            foreign
        }
    };
    drop(inner);

    foreign.token().unwrap_or_else(|ForeignDisposed| fallback::<F>(token))
}

fn fallback<F: ForeignSource>(token: Token) -> F::Token {
    if token.is_cancelation_requested() {
        F::canceled_token()
    } else {
        F::uncancelable_token()
    }
}
