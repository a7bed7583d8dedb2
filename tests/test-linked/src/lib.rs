//! Tests for linked (hierarchical) cancel sources.
#![allow(dead_code)]

use settle::{CancelSource, CancelState, Token};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn parent_cancels_children() {
    let parent = CancelSource::new();
    let child_a = CancelSource::new_linked(&[parent.token()]);
    let child_b = CancelSource::new_linked(&[parent.token()]);

    assert!(!child_a.is_cancelation_requested());
    parent.cancel().unwrap();

    assert!(child_a.is_cancelation_requested());
    assert!(child_b.is_cancelation_requested());
    assert_eq!(child_a.state(), CancelState::CanceledComplete);
}

#[test]
fn child_cancel_leaves_parent_and_siblings() {
    let parent = CancelSource::new();
    let child_a = CancelSource::new_linked(&[parent.token()]);
    let child_b = CancelSource::new_linked(&[parent.token()]);

    child_a.cancel().unwrap();

    assert!(child_a.is_cancelation_requested());
    assert!(!child_b.is_cancelation_requested());
    assert!(!parent.is_cancelation_requested());
}

#[test]
fn any_of_several_parents() {
    let user = CancelSource::new();
    let deadline = CancelSource::new();
    let work = CancelSource::new_linked(&[user.token(), deadline.token()]);

    deadline.cancel().unwrap();
    assert!(work.is_cancelation_requested());

    // The other parent's registration was removed with the cancel.
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    work.token()
        .register(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    user.cancel().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn already_canceled_parent() {
    let parent = CancelSource::new();
    parent.cancel().unwrap();

    let child = CancelSource::new_linked(&[parent.token()]);
    assert!(child.is_cancelation_requested());

    let child = CancelSource::new_linked(&[Token::canceled()]);
    assert!(child.is_cancelation_requested());
}

#[test]
fn uncancelable_parents() {
    let child = CancelSource::new_linked(&[Token::none(), Token::none()]);
    assert!(!child.is_cancelation_requested());
    child.cancel().unwrap();
    assert!(child.is_cancelation_requested());
}

#[test]
fn disposed_child_is_detached() {
    let parent = CancelSource::new();
    let child = CancelSource::new_linked(&[parent.token()]);
    let child_token = child.token();
    drop(child);

    // The slot may be reused by now; the parent must not cancel it.
    let bystander = CancelSource::new();
    parent.cancel().unwrap();
    assert!(!bystander.is_cancelation_requested());
    assert!(!child_token.is_cancelation_requested());
}

#[test]
fn grandchildren_chain() {
    let root = CancelSource::new();
    let level1 = CancelSource::new_linked(&[root.token()]);
    let level2 = CancelSource::new_linked(&[level1.token()]);
    let level3 = CancelSource::new_linked(&[level2.token()]);

    let order = Arc::new(Mutex::new(Vec::new()));
    for (name, source) in [("l1", &level1), ("l2", &level2), ("l3", &level3)] {
        let order = Arc::clone(&order);
        source
            .token()
            .register(move || order.lock().unwrap().push(name))
            .unwrap();
    }

    root.cancel().unwrap();

    assert!(level3.is_cancelation_requested());
    // Newest first: each level runs its own callback before the older link
    // that cancels the next level.
    assert_eq!(*order.lock().unwrap(), ["l1", "l2", "l3"]);
}

#[test]
fn child_panics_reach_parent_aggregate() {
    let parent = CancelSource::new();
    let child = CancelSource::new_linked(&[parent.token()]);
    child.token().register(|| panic!("child a")).unwrap();
    child.token().register(|| panic!("child b")).unwrap();
    parent.token().register(|| panic!("parent")).unwrap();

    let err = parent.try_cancel().unwrap_err();
    let messages: Vec<_> = err
        .as_aggregate()
        .unwrap()
        .failures()
        .iter()
        .map(|f| f.message().to_owned())
        .collect();

    // Flattened, in invocation order.
    assert_eq!(messages, ["parent", "child b", "child a"]);
    assert!(child.is_cancelation_requested());
}

#[test]
fn parent_dispose_does_not_cancel_children() {
    let parent = CancelSource::new();
    let child = CancelSource::new_linked(&[parent.token()]);
    parent.dispose().unwrap();

    assert!(!child.is_cancelation_requested());
    assert_eq!(child.state(), CancelState::Pending);
}

#[test]
fn child_reset_keeps_link() {
    let parent = CancelSource::new();
    let child = CancelSource::new_linked(&[parent.token()]);
    assert!(child.try_reset());

    let token = child.token();
    parent.cancel().unwrap();
    assert!(token.is_cancelation_requested());
}
