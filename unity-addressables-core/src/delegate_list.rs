//! Ordered multi-subscriber callback list
//!
//! [`DelegateList`] keeps callbacks in insertion order inside a slab of pooled
//! nodes. Removal while the list is being invoked only marks the node; marked
//! nodes are unlinked and returned to the pool once the outermost invocation
//! finishes, so the walk never loses its place. A panicking callback is caught
//! and logged and the remaining callbacks still run.
//!
//! The list is generic over the callback type itself (`F: ?Sized`), which lets
//! the manager store callbacks like `dyn FnMut(&ResourceManager, Handle)`
//! while simple users can use `dyn FnMut(&T)` with [`DelegateList::invoke`].

use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, trace};

/// Identifies one subscription in a [`DelegateList`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId {
    index: u32,
    generation: u32,
}

impl fmt::Debug for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallbackId({}:{})", self.index, self.generation)
    }
}

enum NodeValue<F: ?Sized> {
    /// Pooled node, not linked
    Free,
    /// Linked and callable
    Present(Box<F>),
    /// Checked out by an invocation in progress
    Invoking,
    /// Removed during an invocation; swept afterwards
    Removed,
}

struct Node<F: ?Sized> {
    value: NodeValue<F>,
    generation: u32,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<F: ?Sized> {
    nodes: Vec<Node<F>>,
    pool: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    live: usize,
    invoking: usize,
}

impl<F: ?Sized> Inner<F> {
    fn acquire(&mut self, callback: Box<F>) -> usize {
        match self.pool.pop() {
            Some(index) => {
                let node = &mut self.nodes[index];
                node.value = NodeValue::Present(callback);
                node.prev = None;
                node.next = None;
                index
            }
            None => {
                self.nodes.push(Node {
                    value: NodeValue::Present(callback),
                    generation: 0,
                    prev: None,
                    next: None,
                });
                self.nodes.len() - 1
            }
        }
    }

    fn link_last(&mut self, index: usize) {
        self.nodes[index].prev = self.tail;
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
    }

    /// Unlink a node and return it to the pool, handing back its callback.
    fn release(&mut self, index: usize) -> Option<Box<F>> {
        let (prev, next) = (self.nodes[index].prev, self.nodes[index].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }

        let node = &mut self.nodes[index];
        node.prev = None;
        node.next = None;
        node.generation = node.generation.wrapping_add(1);
        self.pool.push(index);
        match std::mem::replace(&mut node.value, NodeValue::Free) {
            NodeValue::Present(cb) => Some(cb),
            _ => None,
        }
    }

    fn lookup(&self, id: CallbackId) -> Option<usize> {
        let index = id.index as usize;
        let node = self.nodes.get(index)?;
        match node.value {
            NodeValue::Present(_) | NodeValue::Invoking if node.generation == id.generation => {
                Some(index)
            }
            _ => None,
        }
    }

    fn sweep(&mut self) -> Vec<Box<F>> {
        let mut dropped = Vec::new();
        let mut cursor = self.head;
        while let Some(index) = cursor {
            cursor = self.nodes[index].next;
            if matches!(self.nodes[index].value, NodeValue::Removed) {
                dropped.extend(self.release(index));
            }
        }
        dropped
    }
}

/// Ordered callback list that tolerates add/remove while it is being invoked.
pub struct DelegateList<F: ?Sized> {
    label: &'static str,
    inner: RefCell<Inner<F>>,
}

impl<F: ?Sized> DelegateList<F> {
    /// Create an empty list. The label shows up in logs.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            inner: RefCell::new(Inner {
                nodes: Vec::new(),
                pool: Vec::new(),
                head: None,
                tail: None,
                live: 0,
                invoking: 0,
            }),
        }
    }

    /// Number of subscribed callbacks
    pub fn len(&self) -> usize {
        self.inner.borrow().live
    }

    /// True when nothing is subscribed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of detached nodes waiting in the pool for reuse
    pub fn pooled_nodes(&self) -> usize {
        self.inner.borrow().pool.len()
    }

    /// True while [`invoke_with`](Self::invoke_with) is walking the list
    pub fn is_invoking(&self) -> bool {
        self.inner.borrow().invoking > 0
    }

    /// Whether the subscription is still present
    pub fn contains(&self, id: CallbackId) -> bool {
        self.inner.borrow().lookup(id).is_some()
    }

    /// Append a callback. Callbacks added during an invocation are reached by
    /// the same walk.
    pub fn add(&self, callback: Box<F>) -> CallbackId {
        let mut inner = self.inner.borrow_mut();
        let index = inner.acquire(callback);
        inner.link_last(index);
        inner.live += 1;
        CallbackId {
            index: index as u32,
            generation: inner.nodes[index].generation,
        }
    }

    /// Remove a callback. Returns false if it was not subscribed.
    pub fn remove(&self, id: CallbackId) -> bool {
        let dropped = {
            let mut inner = self.inner.borrow_mut();
            let Some(index) = inner.lookup(id) else {
                return false;
            };
            inner.live -= 1;
            if inner.invoking > 0 {
                // Keep the node linked so the walk in progress stays valid.
                match std::mem::replace(&mut inner.nodes[index].value, NodeValue::Removed) {
                    NodeValue::Present(cb) => Some(cb),
                    _ => None,
                }
            } else {
                inner.release(index)
            }
        };
        drop(dropped);
        true
    }

    /// Remove every callback. During an invocation the nodes are only marked
    /// and are pooled when the walk finishes.
    pub fn clear(&self) {
        let dropped = {
            let mut inner = self.inner.borrow_mut();
            let mut dropped = Vec::new();
            if inner.invoking > 0 {
                let mut cursor = inner.head;
                while let Some(index) = cursor {
                    cursor = inner.nodes[index].next;
                    let node = &mut inner.nodes[index];
                    if let NodeValue::Present(cb) =
                        std::mem::replace(&mut node.value, NodeValue::Removed)
                    {
                        dropped.push(cb);
                    }
                }
            } else {
                while let Some(head) = inner.head {
                    dropped.extend(inner.release(head));
                }
            }
            inner.live = 0;
            dropped
        };
        drop(dropped);
    }

    /// Call `call` on each subscribed callback, front to back.
    ///
    /// No borrow of the list is held while a callback runs, so callbacks may
    /// add, remove, clear or even re-invoke this list.
    pub fn invoke_with(&self, mut call: impl FnMut(&mut F)) {
        let mut cursor = {
            let mut inner = self.inner.borrow_mut();
            if inner.head.is_none() {
                return;
            }
            inner.invoking += 1;
            inner.head
        };

        while let Some(index) = cursor {
            let taken = {
                let mut inner = self.inner.borrow_mut();
                let node = &mut inner.nodes[index];
                match std::mem::replace(&mut node.value, NodeValue::Invoking) {
                    NodeValue::Present(cb) => Some(cb),
                    other => {
                        node.value = other;
                        None
                    }
                }
            };

            if let Some(mut cb) = taken {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(&mut *cb)));

                let discarded = {
                    let mut inner = self.inner.borrow_mut();
                    let node = &mut inner.nodes[index];
                    if matches!(node.value, NodeValue::Invoking) {
                        node.value = NodeValue::Present(cb);
                        None
                    } else {
                        Some(cb)
                    }
                };
                drop(discarded);

                if let Err(payload) = outcome {
                    error!(
                        list = self.label,
                        "Exception thrown in callback: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }

            cursor = self.inner.borrow().nodes[index].next;
        }

        let dropped = {
            let mut inner = self.inner.borrow_mut();
            inner.invoking -= 1;
            if inner.invoking == 0 {
                inner.sweep()
            } else {
                Vec::new()
            }
        };
        if !dropped.is_empty() {
            trace!(list = self.label, swept = dropped.len(), "swept removed callbacks");
        }
    }
}

impl<T: ?Sized> DelegateList<dyn FnMut(&T)> {
    /// Invoke every callback with `value`
    pub fn invoke(&self, value: &T) {
        self.invoke_with(|cb| cb(value));
    }
}

impl<F: ?Sized> fmt::Debug for DelegateList<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("DelegateList")
            .field("label", &self.label)
            .field("len", &inner.live)
            .field("pooled", &inner.pool.len())
            .field("invoking", &(inner.invoking > 0))
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
