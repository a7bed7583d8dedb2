//! Basic tests for cancel sources, tokens and registrations.
#![allow(dead_code)]

use settle::{CancelRegistration, CancelSource, CancelState, Canceled, Error, Token};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Records the order callbacks ran in.
#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<&'static str>>>);

impl Log {
    fn push(&self, name: &'static str) -> impl FnOnce() + Send + 'static {
        let log = self.clone();
        move || log.0.lock().unwrap().push(name)
    }

    fn entries(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }
}

/// Mock decoder that checks for cancellation between chunks.
fn mock_decode(data: &[u8], token: Token) -> Result<Vec<u8>, MockError> {
    let mut output = Vec::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        if i % 4 == 0 {
            token.check()?;
        }
        output.extend_from_slice(chunk);
    }
    Ok(output)
}

#[derive(Debug, PartialEq)]
enum MockError {
    Canceled,
    Other,
}

impl From<Canceled> for MockError {
    fn from(_: Canceled) -> Self {
        MockError::Canceled
    }
}

#[test]
fn scenario_a_reverse_order() {
    let source = CancelSource::new();
    let token = source.token();
    let log = Log::default();

    token.register(log.push("A")).unwrap();
    token.register(log.push("B")).unwrap();

    source.cancel().unwrap();

    assert_eq!(log.entries(), ["B", "A"]);
    assert_eq!(source.state(), CancelState::CanceledComplete);
    assert!(token.is_cancelation_requested());
}

#[test]
fn scenario_b_dispose_while_pending() {
    let source = CancelSource::new();
    let token = source.token();
    let log = Log::default();
    token.register(log.push("discarded")).unwrap();

    assert!(source.try_dispose());

    assert!(token.register(log.push("late")).is_none());
    assert!(!source.try_cancel().unwrap());
    assert!(matches!(source.cancel(), Err(Error::InvalidOperation(_))));
    assert!(!source.try_dispose());
    assert!(log.entries().is_empty());
}

#[test]
fn many_callbacks_run_newest_first() {
    let source = CancelSource::new();
    let token = source.token();
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..32 {
        let order = Arc::clone(&order);
        token.register(move || order.lock().unwrap().push(i)).unwrap();
    }

    source.cancel().unwrap();

    let expected: Vec<i32> = (0..32).rev().collect();
    assert_eq!(*order.lock().unwrap(), expected);
}

#[test]
fn registered_during_cancel_runs_synchronously() {
    let source = CancelSource::new();
    let token = source.token();
    let log = Log::default();

    let inner_log = log.clone();
    token
        .register(move || {
            inner_log.0.lock().unwrap().push("outer start");
            // Runs right here, not as part of the pass.
            let registration = token.register(inner_log.push("nested")).unwrap();
            assert!(!registration.is_registered());
            inner_log.0.lock().unwrap().push("outer end");
        })
        .unwrap();
    token.register(log.push("first")).unwrap();

    source.cancel().unwrap();

    assert_eq!(log.entries(), ["first", "outer start", "nested", "outer end"]);
}

#[test]
fn register_on_canceled_token_runs_once_without_entry() {
    let source = CancelSource::new();
    source.cancel().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    let registration = source
        .token()
        .register(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!registration.is_registered());
    assert!(!registration.try_unregister());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn panics_are_collected_after_all_callbacks_ran() {
    let source = CancelSource::new();
    let token = source.token();
    let hits = Arc::new(AtomicUsize::new(0));

    for i in 0..10 {
        let hits = Arc::clone(&hits);
        token
            .register(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                if i % 3 == 0 {
                    panic!("callback {i} failed");
                }
            })
            .unwrap();
    }

    let err = source.try_cancel().unwrap_err();
    let failures = err.as_aggregate().unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 10);
    assert_eq!(failures.len(), 4);
    let messages: Vec<_> = failures.failures().iter().map(|f| f.message()).collect();
    assert_eq!(
        messages,
        [
            "callback 9 failed",
            "callback 6 failed",
            "callback 3 failed",
            "callback 0 failed"
        ]
    );
    assert_eq!(source.state(), CancelState::CanceledComplete);
}

#[test]
fn unregistered_callback_never_runs() {
    let source = CancelSource::new();
    let token = source.token();
    let log = Log::default();

    token.register(log.push("kept")).unwrap();
    let removed = token.register(log.push("removed")).unwrap();
    assert!(removed.try_unregister());

    source.cancel().unwrap();
    assert_eq!(log.entries(), ["kept"]);
}

#[test]
fn registration_snapshot_survives_recycling() {
    let source = CancelSource::new();
    let registration = source.token().register(|| {}).unwrap();
    drop(source);

    // Whatever reuses the slot, the old registration stays inert.
    let others: Vec<_> = (0..8).map(|_| CancelSource::new()).collect();
    let fresh: Vec<CancelRegistration> = others
        .iter()
        .map(|s| s.token().register(|| {}).unwrap())
        .collect();

    assert!(!registration.is_registered());
    assert!(!registration.try_unregister());
    assert!(fresh.iter().all(CancelRegistration::is_registered));
    for source in &others {
        source.cancel().unwrap();
    }
}

#[test]
fn stale_token_is_inert() {
    let source = CancelSource::new();
    let token = source.token();
    drop(source);

    assert!(!token.is_cancelation_requested());
    assert!(!token.can_be_canceled());
    assert!(token.check().is_ok());
    assert!(token.register(|| unreachable!()).is_none());
    assert!(!token.try_retain().unwrap());
    assert!(token.release().is_err());
}

#[test]
fn retained_token_outlives_source() {
    let source = CancelSource::new();
    let token = source.token();
    assert!(token.try_retain().unwrap());
    assert!(token.try_retain().unwrap());
    source.try_cancel_with(String::from("user abort")).unwrap();
    drop(source);

    assert!(token.is_cancelation_requested());
    assert_eq!(token.reason::<String>().as_deref(), Some("user abort"));
    token.release().unwrap();
    assert!(token.is_cancelation_requested());
    token.release().unwrap();

    assert!(!token.is_cancelation_requested());
    assert_eq!(token.reason::<String>(), None);
}

#[test]
fn decode_with_tokens() {
    let data = vec![0u8; 1024];

    assert_eq!(mock_decode(&data, Token::none()).map(|v| v.len()), Ok(1024));
    assert_eq!(mock_decode(&data, Token::canceled()), Err(MockError::Canceled));

    let source = CancelSource::new();
    assert!(mock_decode(&data, source.token()).is_ok());
    source.cancel().unwrap();
    assert_eq!(mock_decode(&data, source.token()), Err(MockError::Canceled));
}

#[test]
fn reset_reuses_source() {
    let source = CancelSource::new();
    for round in 0..3 {
        let token = source.token();
        let log = Log::default();
        token.register(log.push("discarded")).unwrap();
        assert!(source.try_reset(), "round {round}");
        assert!(log.entries().is_empty());
        assert!(!token.can_be_canceled());
    }
    let token = source.token();
    source.cancel().unwrap();
    assert!(token.is_cancelation_requested());
}

#[test]
fn guard_cancels_on_error_path() {
    fn fallible(source: &CancelSource, fail: bool) -> Result<u32, &'static str> {
        let guard = source.cancel_on_drop();
        if fail {
            return Err("failed");
        }
        guard.disarm();
        Ok(42)
    }

    let ok = CancelSource::new();
    assert_eq!(fallible(&ok, false), Ok(42));
    assert!(!ok.is_cancelation_requested());

    let failed = CancelSource::new();
    assert!(fallible(&failed, true).is_err());
    assert!(failed.is_cancelation_requested());
}

#[test]
fn pool_reuses_slots() {
    // Warm up, then a burst of short lifecycles should not grow the pool by
    // more than the number of threads racing us.
    drop(CancelSource::new());
    let before = CancelSource::pool_stats();
    for _ in 0..1000 {
        let source = CancelSource::new();
        source.token().register(|| {}).unwrap();
        source.cancel().unwrap();
    }
    let after = CancelSource::pool_stats();
    assert!(after.created - before.created < 64);
}
