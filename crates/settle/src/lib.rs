//! # settle
//!
//! Pooled, generation-validated cancellation and completion values for
//! promise-style libraries.
//!
//! This crate provides the concurrency core that asynchronous handles are
//! built on:
//!
//! - [`CancelSource`] - Owns one cancellation lifecycle, cancels or disposes it
//! - [`Token`] - Lightweight, `Copy` observer handle
//! - [`CancelRegistration`] - Removes one registered callback again
//! - [`Container`] - Retain-counted completion value shared by many consumers
//! - [`bridge`] - Interop with foreign cancellation primitives
//!
//! Sources, callback nodes and containers live in process-wide pools and are
//! reused without waiting for anything to be dropped. Every handle carries a
//! generation snapshot, so a handle that outlives its lifecycle becomes inert
//! instead of touching the next one.
//!
//! ## Basic Usage
//!
//! ```rust
//! use settle::{CancelSource, CancelState};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! let source = CancelSource::new();
//! let token = source.token();
//!
//! let stopped = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&stopped);
//! let registration = token
//!     .register(move || flag.store(true, Ordering::SeqCst))
//!     .unwrap();
//! assert!(registration.is_registered());
//!
//! // Runs the callback on this thread before returning.
//! source.cancel().unwrap();
//!
//! assert!(stopped.load(Ordering::SeqCst));
//! assert!(token.check().is_err());
//! assert_eq!(source.state(), CancelState::CanceledComplete);
//! ```
//!
//! ## Disposing
//!
//! ```rust
//! use settle::CancelSource;
//!
//! let source = CancelSource::new();
//! let token = source.token();
//! token.register(|| unreachable!("discarded, never run"));
//!
//! source.dispose().unwrap();
//!
//! // The lifecycle is over: the token cannot register anything new.
//! assert!(!token.can_be_canceled());
//! assert!(token.register(|| unreachable!()).is_none());
//! ```
//!
//! ## Linked Sources
//!
//! ```rust
//! use settle::CancelSource;
//!
//! let request = CancelSource::new();
//! let image_a = CancelSource::new_linked(&[request.token()]);
//! let image_b = CancelSource::new_linked(&[request.token()]);
//!
//! // Cancel image_a only - image_b continues
//! image_a.cancel().unwrap();
//! assert!(!image_b.is_cancelation_requested());
//!
//! // Cancel the request - everything stops
//! request.cancel().unwrap();
//! assert!(image_b.is_cancelation_requested());
//! ```
//!
//! ## Feature Flags
//!
//! - `causal-trace` - Allows capturing a backtrace when a rejection is created,
//!   see [`config::CausalityTrace`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod config;
mod container;
pub mod diagnostics;
mod error;
mod generation;
mod guard;
pub mod pool;
mod registration;
mod registry;
mod retain;
mod source;
mod token;

pub use container::{Completion, Container};
pub use error::{AggregateFailure, CallbackPanic, Canceled, Error};
pub use guard::CancelGuard;
pub use pool::PoolStats;
pub use registration::{CancelRegistration, UnregisterWait};
pub use source::{CancelSource, CancelState};
pub use token::Token;
