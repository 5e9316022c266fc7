//! Read-mostly linked list with lock-free readers.
//!
//! Readers walk the list under an epoch [`Guard`] and never take a lock, so a
//! hypercall handler can traverse it from real mode. Writers append and unlink
//! under a [`SpinLock`]; a new node is fully initialized before it is
//! published with a release store, and an unlinked node is only reclaimed
//! once every reader that might still hold it has left its epoch.
//!
//! A reader racing with a writer may or may not observe the concurrent
//! insertion or removal, but every node that stays linked for the whole
//! traversal is visited exactly once.

use core::sync::atomic::Ordering;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use spin_lock::SpinLock;

struct Node<T> {
    value: T,
    next: Atomic<Node<T>>,
}

/// Singly linked list with epoch-protected traversal.
pub struct RcuList<T> {
    head: Atomic<Node<T>>,
    writer: SpinLock<()>,
}

impl<T> Default for RcuList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RcuList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            head: Atomic::null(),
            writer: SpinLock::new(()),
        }
    }

    /// Append `value` at the tail of the list.
    pub fn push(&self, value: T) {
        let _w = self.writer.lock();
        let guard = epoch::pin();
        Self::publish_at_tail(&self.head, value, &guard);
    }

    /// Append `value` unless an existing entry matches `exists`.
    ///
    /// The check and the append happen under the writer lock, so two
    /// concurrent calls cannot both succeed for the same key.
    pub fn push_unless(&self, value: T, exists: impl Fn(&T) -> bool) -> Result<(), T> {
        let _w = self.writer.lock();
        let guard = epoch::pin();
        if self.iter(&guard).any(exists) {
            return Err(value);
        }
        Self::publish_at_tail(&self.head, value, &guard);
        Ok(())
    }

    fn publish_at_tail(head: &Atomic<Node<T>>, value: T, guard: &Guard) {
        let node = Owned::new(Node {
            value,
            next: Atomic::null(),
        });
        let mut link = head;
        loop {
            let cur = link.load(Ordering::Acquire, guard);
            match unsafe { cur.as_ref() } {
                Some(n) => link = &n.next,
                None => {
                    link.store(node, Ordering::Release);
                    return;
                }
            }
        }
    }

    /// Unlink the first entry matching `pred`.
    ///
    /// Returns whether an entry was removed. The node stays readable to
    /// in-flight readers and is freed after their grace period.
    pub fn remove(&self, pred: impl Fn(&T) -> bool) -> bool
    where
        T: Send + 'static,
    {
        let _w = self.writer.lock();
        let guard = epoch::pin();
        let mut link = &self.head;
        loop {
            let cur = link.load(Ordering::Acquire, &guard);
            let node = match unsafe { cur.as_ref() } {
                Some(n) => n,
                None => return false,
            };
            if pred(&node.value) {
                let next = node.next.load(Ordering::Acquire, &guard);
                link.store(next, Ordering::Release);
                unsafe { guard.defer_destroy(cur) };
                return true;
            }
            link = &node.next;
        }
    }

    /// Iterate over the entries visible under `guard`.
    pub fn iter<'g>(&'g self, guard: &'g Guard) -> Iter<'g, T> {
        Iter {
            cur: self.head.load(Ordering::Acquire, guard),
            guard,
        }
    }

    /// Returns whether the list has no entries.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Ordering::Acquire, &guard).is_null()
    }
}

impl<T> Drop for RcuList<T> {
    fn drop(&mut self) {
        // Exclusive access: nobody else can be traversing.
        unsafe {
            let guard = epoch::unprotected();
            let mut cur = self.head.load(Ordering::Relaxed, guard);
            while !cur.is_null() {
                let next = cur.deref().next.load(Ordering::Relaxed, guard);
                drop(cur.into_owned());
                cur = next;
            }
        }
    }
}

/// Iterator over a [`RcuList`].
pub struct Iter<'g, T> {
    cur: Shared<'g, Node<T>>,
    guard: &'g Guard,
}

impl<'g, T> Iterator for Iter<'g, T> {
    type Item = &'g T;

    fn next(&mut self) -> Option<&'g T> {
        let node = unsafe { self.cur.as_ref() }?;
        self.cur = node.next.load(Ordering::Acquire, self.guard);
        Some(&node.value)
    }
}
