//! The intrusive callback registry of a source.
//!
//! Callbacks live in pooled [`CallbackNode`]s linked into a doubly-linked list
//! that hangs off a per-source sentinel. The sentinel is never removed:
//! `sentinel.prev == sentinel` exactly when the list is empty. New nodes are
//! inserted just before the sentinel, so `sentinel.prev` is always the newest
//! registration and a cancel pass pops from there (LIFO).
//!
//! All list mutation happens while the owning source's lock is held. Each node
//! additionally guards its own fields with a small lock so the list can be
//! expressed without `unsafe`; node locks are always taken after the source
//! lock and never two at a time.

use std::ptr;

use parking_lot::Mutex;

use crate::generation::Generation;
use crate::pool::{Pool, Poolable};

pub(crate) type Callback = Box<dyn FnOnce() + Send>;

/// One registered callback.
#[derive(Default)]
pub(crate) struct CallbackNode {
    /// Bumped when the callback is invoked or discarded.
    pub(crate) id: Generation,
    links: Mutex<NodeLinks>,
}

#[derive(Default)]
struct NodeLinks {
    /// Instance id of the source slot this node is linked into; 0 when free.
    owner: u64,
    prev: Option<&'static CallbackNode>,
    next: Option<&'static CallbackNode>,
    linked: bool,
    callback: Option<Callback>,
}

impl Poolable for CallbackNode {
    fn pool() -> &'static Pool<Self> {
        static POOL: Pool<CallbackNode> = Pool::new();
        &POOL
    }
}

/// What a registration's snapshot says about its node right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeStatus {
    /// Still in the registry; can be unregistered.
    Linked,
    /// Popped by a cancel pass and not yet finished running.
    Invoking,
    /// Already ran, was discarded, or belongs to someone else now.
    Stale,
}

impl CallbackNode {
    /// Draws a node from the pool, stamped for `owner`.
    fn acquire(owner: u64, callback: Callback) -> (&'static CallbackNode, u64) {
        let node = Self::pool().acquire();
        let mut links = node.links.lock();
        debug_assert_eq!(links.owner, 0, "pooled node still owned");
        links.owner = owner;
        links.callback = Some(callback);
        drop(links);
        (node, node.id.current())
    }

    /// A sentinel for a new source slot. Sentinels are never repooled.
    fn sentinel() -> &'static CallbackNode {
        let node: &'static CallbackNode = Box::leak(Box::default());
        let mut links = node.links.lock();
        links.prev = Some(node);
        links.next = Some(node);
        drop(links);
        node
    }

    fn prev(&self) -> Option<&'static CallbackNode> {
        self.links.lock().prev
    }

    fn set_prev(&self, prev: &'static CallbackNode) {
        self.links.lock().prev = Some(prev);
    }

    fn set_next(&self, next: &'static CallbackNode) {
        self.links.lock().next = Some(next);
    }

    pub(crate) fn status(&self, owner: u64, node_id: u64) -> NodeStatus {
        let links = self.links.lock();
        if links.owner != owner || !self.id.matches(node_id) {
            NodeStatus::Stale
        } else if links.linked {
            NodeStatus::Linked
        } else {
            NodeStatus::Invoking
        }
    }

    /// Takes the callback out for invocation or disposal.
    pub(crate) fn take_callback(&self) -> Option<Callback> {
        self.links.lock().callback.take()
    }

    /// Clears the node and returns it to the pool. The caller has already
    /// advanced `id` and taken the callback.
    pub(crate) fn release_to_pool(&'static self) {
        let mut links = self.links.lock();
        debug_assert!(!links.linked, "repooling a linked node");
        *links = NodeLinks::default();
        drop(links);
        Self::pool().repool(self);
    }

    /// Marks a finished invocation and repools the node.
    ///
    /// Advancing `id` is what releases any `unregister_or_wait` spinning on
    /// this node.
    pub(crate) fn retire(&'static self) {
        self.id.advance();
        self.release_to_pool();
    }
}

/// The registry list owned by one source slot.
pub(crate) struct Registry {
    sentinel: &'static CallbackNode,
    owner: u64,
    len: usize,
}

impl Registry {
    pub(crate) fn new(owner: u64) -> Self {
        Self {
            sentinel: CallbackNode::sentinel(),
            owner,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.sentinel
            .prev()
            .is_some_and(|prev| ptr::eq(prev, self.sentinel))
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Appends a callback as the newest entry.
    pub(crate) fn push(&mut self, callback: Callback) -> (&'static CallbackNode, u64) {
        let (node, node_id) = CallbackNode::acquire(self.owner, callback);
        let newest = self.sentinel.prev().unwrap_or(self.sentinel);
        {
            let mut links = node.links.lock();
            links.prev = Some(newest);
            links.next = Some(self.sentinel);
            links.linked = true;
        }
        newest.set_next(node);
        self.sentinel.set_prev(node);
        self.len += 1;
        (node, node_id)
    }

    /// Unlinks and returns the newest node, leaving its id untouched so a
    /// concurrent unregister can tell it is being invoked.
    pub(crate) fn pop_newest(&mut self) -> Option<&'static CallbackNode> {
        let newest = self.sentinel.prev()?;
        if ptr::eq(newest, self.sentinel) {
            return None;
        }
        self.unlink(newest);
        Some(newest)
    }

    /// Removes a linked node from the list.
    pub(crate) fn unlink(&mut self, node: &'static CallbackNode) {
        let (prev, next) = {
            let mut links = node.links.lock();
            debug_assert!(links.linked, "unlinking a node that is not linked");
            links.linked = false;
            (links.prev.take(), links.next.take())
        };
        if let (Some(prev), Some(next)) = (prev, next) {
            prev.set_next(next);
            next.set_prev(prev);
        }
        self.len -= 1;
    }

    /// Unlinks every node, advancing each node's id so no registration can
    /// mistake it for an in-flight invocation. The caller drops the returned
    /// callbacks and repools the nodes after releasing the source lock.
    pub(crate) fn drain(&mut self) -> Vec<(&'static CallbackNode, Option<Callback>)> {
        let mut drained = Vec::with_capacity(self.len);
        while let Some(node) = self.pop_newest() {
            node.id.advance();
            drained.push((node, node.take_callback()));
        }
        drained
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len).finish()
    }
}
