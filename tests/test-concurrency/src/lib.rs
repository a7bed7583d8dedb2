//! Tests for cancel, dispose, register and unregister racing across threads.
#![allow(dead_code)]

use rayon::prelude::*;
use settle::{CancelRegistration, CancelSource, CancelState, Token};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Duration;

fn counting(hits: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
    let hits = Arc::clone(hits);
    move || {
        hits.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn parallel_observers_see_cancel() {
    let source = CancelSource::new();
    let token = source.token();
    let hits = Arc::new(AtomicUsize::new(0));

    let registered: usize = (0..1000)
        .into_par_iter()
        .map(|_| usize::from(token.register(counting(&hits)).is_some()))
        .sum();
    assert_eq!(registered, 1000);

    source.cancel().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1000);

    let observed = (0..1000)
        .into_par_iter()
        .filter(|_| token.is_cancelation_requested())
        .count();
    assert_eq!(observed, 1000);
}

#[test]
fn register_racing_cancel_runs_each_callback_once() {
    for _ in 0..20 {
        let source = Arc::new(CancelSource::new());
        let token = source.token();
        let hits = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(5));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let hits = Arc::clone(&hits);
            let accepted = Arc::clone(&accepted);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..200 {
                    if token.register(counting(&hits)).is_some() {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }

        barrier.wait();
        source.cancel().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }

        // Registered before the cancel: run by the pass. After: run inline.
        assert_eq!(accepted.load(Ordering::SeqCst), 800);
        assert_eq!(hits.load(Ordering::SeqCst), 800);
    }
}

#[test]
fn cancel_and_dispose_are_exclusive() {
    for _ in 0..200 {
        let source = Arc::new(CancelSource::new());
        let token = source.token();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            token.register(counting(&hits)).unwrap();
        }
        let barrier = Arc::new(Barrier::new(2));

        let canceller = {
            let source = Arc::clone(&source);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                source.try_cancel().unwrap()
            })
        };
        barrier.wait();
        let disposed = source.try_dispose();
        let canceled = canceller.join().unwrap();

        assert!(disposed);
        // Either the cancel ran every callback, or dispose discarded them all.
        let ran = hits.load(Ordering::SeqCst);
        if canceled {
            assert_eq!(ran, 16);
        } else {
            assert_eq!(ran, 0);
        }
        assert_eq!(source.state(), CancelState::Disposed);
    }
}

#[test]
fn unregister_racing_cancel_never_both() {
    for _ in 0..50 {
        let source = Arc::new(CancelSource::new());
        let token = source.token();
        let flags: Vec<Arc<AtomicBool>> = (0..64).map(|_| Arc::new(AtomicBool::new(false))).collect();
        let registrations: Vec<CancelRegistration> = flags
            .iter()
            .map(|flag| {
                let flag = Arc::clone(flag);
                token.register(move || flag.store(true, Ordering::SeqCst)).unwrap()
            })
            .collect();

        let canceller = {
            let source = Arc::clone(&source);
            thread::spawn(move || source.cancel().unwrap())
        };
        let removed: Vec<bool> = registrations
            .par_iter()
            .map(CancelRegistration::unregister_or_wait)
            .collect();
        canceller.join().unwrap();

        for (flag, removed) in flags.iter().zip(removed) {
            // Exactly one of: removed before running, or ran.
            assert_ne!(flag.load(Ordering::SeqCst), removed);
        }
    }
}

#[test]
fn scenario_c_unregister_waits_for_running_callback() {
    let source = Arc::new(CancelSource::new());
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let registration = {
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        source
            .token()
            .register(move || {
                started.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                finished.store(true, Ordering::SeqCst);
            })
            .unwrap()
    };

    let canceller = {
        let source = Arc::clone(&source);
        thread::spawn(move || source.cancel().unwrap())
    };

    while !started.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    assert!(!registration.unregister_or_wait());
    assert!(finished.load(Ordering::SeqCst));
    canceller.join().unwrap();
}

#[test]
fn scenario_c_recursive_unregister_returns_immediately() {
    let source = CancelSource::new();
    let own: Arc<Mutex<Option<CancelRegistration>>> = Arc::default();
    let returned = Arc::new(AtomicBool::new(false));

    let registration = {
        let own = Arc::clone(&own);
        let returned = Arc::clone(&returned);
        source
            .token()
            .register(move || {
                let registration = own.lock().unwrap().take().unwrap();
                // Waiting for ourselves would never finish.
                assert!(!registration.unregister_or_wait());
                returned.store(true, Ordering::SeqCst);
            })
            .unwrap()
    };
    *own.lock().unwrap() = Some(registration);

    source.cancel().unwrap();
    assert!(returned.load(Ordering::SeqCst));
}

#[test]
fn unregister_other_callback_from_inside_cancel() {
    let source = CancelSource::new();
    let token = source.token();
    let hits = Arc::new(AtomicUsize::new(0));

    let victim = token.register(counting(&hits)).unwrap();
    token
        .register(move || {
            // Still linked: the pass has not reached it yet.
            assert!(victim.unregister_or_wait());
        })
        .unwrap();

    source.cancel().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn async_unregister_waits_for_running_callback() {
    let source = Arc::new(CancelSource::new());
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let registration = {
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        source
            .token()
            .register(move || {
                started.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                finished.store(true, Ordering::SeqCst);
            })
            .unwrap()
    };

    let canceller = {
        let source = Arc::clone(&source);
        thread::spawn(move || source.cancel().unwrap())
    };
    while !started.load(Ordering::SeqCst) {
        thread::yield_now();
    }

    let mut wait = registration.unregister_or_wait_async();
    let mut cx = Context::from_waker(Waker::noop());
    let removed = loop {
        match Pin::new(&mut wait).poll(&mut cx) {
            Poll::Ready(removed) => break removed,
            Poll::Pending => thread::yield_now(),
        }
    };
    assert!(!removed);
    assert!(finished.load(Ordering::SeqCst));
    canceller.join().unwrap();
}

#[test]
fn retain_release_interleavings() {
    for _ in 0..50 {
        let source = CancelSource::new();
        let token = source.token();

        // Every worker retains before the source goes away and releases after.
        let retained: Vec<bool> = (0..32)
            .into_par_iter()
            .map(|_| token.try_retain().unwrap())
            .collect();
        assert!(retained.iter().all(|&r| r));

        let canceller = thread::spawn(move || {
            source.cancel().unwrap();
            drop(source);
        });

        (0..32).into_par_iter().for_each(|_| {
            token.release().unwrap();
        });
        canceller.join().unwrap();

        // Both sides let go: the lifecycle is gone and the token is stale.
        assert!(!token.can_be_canceled());
        assert!(!token.try_retain().unwrap());
        assert!(token.release().is_err());
    }
}

#[test]
fn stale_handles_never_touch_new_tenants() {
    let stale: Vec<Token> = (0..256)
        .map(|_| {
            let source = CancelSource::new();
            let token = source.token();
            source.dispose().unwrap();
            token
        })
        .collect();

    let live: Vec<CancelSource> = (0..256).map(|_| CancelSource::new()).collect();
    let hits = Arc::new(AtomicUsize::new(0));
    stale.par_iter().for_each(|token| {
        assert!(token.register(counting(&hits)).is_none());
        assert!(!token.try_retain().unwrap());
    });
    for source in &live {
        source.cancel().unwrap();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(stale.iter().all(|t| !t.is_cancelation_requested()));
}

#[test]
fn many_sources_across_threads() {
    let total = Arc::new(AtomicUsize::new(0));
    (0..2000).into_par_iter().for_each(|i| {
        let source = CancelSource::new();
        let token = source.token();
        token.register(counting(&total)).unwrap();
        if i % 2 == 0 {
            source.cancel().unwrap();
        } else {
            source.dispose().unwrap();
        }
    });
    assert_eq!(total.load(Ordering::SeqCst), 1000);
}
