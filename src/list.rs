// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intrusive wait list used for timer queues and permit queues.
//!
//! A [`WaitList<K>`][WaitList] tracks `async` processes that are blocked
//! waiting for something -- a deadline to pass, a permit to be released, a
//! block to be freed back into a pool -- without any dynamic memory
//! allocation. Each waiter is a node that lives inside the waiting future
//! itself, and is linked into the list when that future is first polled.
//!
//! Nodes are kept sorted by their key `K`, smallest first:
//!
//! - The [`Clock`][crate::time::Clock] uses `WaitList<TickTime>`, so the head
//!   of the list is always the earliest deadline.
//! - The [`Semaphore`][crate::semaphore::Semaphore] uses `WaitList<()>`. All
//!   keys compare equal, so new waiters go to the back and the list is a
//!   plain FIFO queue.
//!
//! The owner of a list can't get at the nodes directly. The only thing it can
//! do is _wake_ them, which unlinks the node and pokes its waker; the waiting
//! future then observes that it's been detached and resolves. This is what
//! makes the pointer-heavy structure sound without exposing any `unsafe` API.
//!
//! Both lists and waiting futures must be pinned, since nodes point at each
//! other and at the list.

// Implementation safety notes:
//
// The safety comments below refer to the Link Valid Invariant:
//
// Once a WaitList has been pinned, every node reachable from it (through its
// head/tail, or transitively through the prev/next links of reachable nodes)
// is pinned and valid. A node's `list` pointer, if set, points to a pinned and
// valid list.
//
// Nodes only get linked in from the poll of a pinned future, and unlink
// themselves in Drop, which maintains this.

use core::cell::Cell;
use core::future::Future;
use core::marker::PhantomPinned;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll, Waker};

use pin_project::{pin_project, pinned_drop};

/// A list of processes waiting for an event, sorted by key `K`.
///
/// # Operation cost
///
/// - Joining a list with ordered keys scans from the tail, so it's `O(n)` in
///   the worst case, but `O(1)` when keys arrive in ascending order or are all
///   equal (as with `()`).
/// - Waking the head is `O(1)`.
/// - A waiter leaving early (its future being dropped) is `O(1)`.
///
/// # Drop
///
/// A list can't be dropped while anything is waiting on it, since every
/// waiting future borrows the list. In debug builds this is checked anyway.
#[derive(Default)]
pub struct WaitList<K> {
    /// Head and tail nodes, or `None` if nobody's waiting.
    ends: Cell<Option<Ends<K>>>,
    _marker: PhantomPinned,
}

impl<K> WaitList<K> {
    /// Creates an empty list. It needs to be pinned before anyone can wait on
    /// it, so this usually appears as `pin!(WaitList::new())`.
    pub const fn new() -> Self {
        Self {
            ends: Cell::new(None),
            _marker: PhantomPinned,
        }
    }

    /// Checks whether anyone is waiting.
    pub fn is_empty(&self) -> bool {
        self.ends.get().is_none()
    }

    /// Wakes the head waiter if its key satisfies `pred`.
    ///
    /// Returns `true` if a waiter was woken, `false` if the list was empty or
    /// the head failed the predicate.
    pub fn wake_head_if(self: Pin<&Self>, pred: impl FnOnce(&K) -> bool) -> bool {
        let Some(ends) = self.ends.get() else {
            return false;
        };

        let node_ptr = ends.head;
        // Safety: Link Valid Invariant.
        let node = unsafe { Pin::new_unchecked(node_ptr.as_ref()) };

        debug_assert_eq!(node.list.get(), Some(NonNull::from(&*self)));
        debug_assert!(node.prev.get().is_none());

        if !pred(&node.key) {
            return false;
        }

        if node_ptr == ends.tail {
            debug_assert_eq!(node.next.get(), None);
            self.ends.set(None);
        } else {
            let Some(next_ptr) = node.next.take() else {
                panic!()
            };
            // Safety: Link Valid Invariant.
            let next = unsafe { Pin::new_unchecked(next_ptr.as_ref()) };
            next.prev.set(None);
            self.ends.set(Some(Ends {
                head: next_ptr,
                ..ends
            }));
        }

        // Clearing `list` is what tells the waiting future it's been woken.
        node.list.take();
        let Some(waker) = node.waker.take() else {
            panic!()
        };
        waker.wake();

        true
    }

    /// Wakes waiters from the head for as long as their keys satisfy `pred`.
    ///
    /// Returns `true` if anyone was woken.
    pub fn wake_while(self: Pin<&Self>, mut pred: impl FnMut(&K) -> bool) -> bool {
        let mut any = false;
        while self.wake_head_if(&mut pred) {
            any = true;
        }
        any
    }

    /// Wakes the head waiter, whatever its key.
    ///
    /// Returns `true` if the list was non-empty.
    pub fn wake_one(self: Pin<&Self>) -> bool {
        self.wake_head_if(|_| true)
    }

    /// Returns a future that links a waiter with `key` into this list and then
    /// resolves once that waiter has been woken.
    ///
    /// The waiter goes _after_ every existing waiter whose key is `<= key`, so
    /// equal keys are served in arrival order.
    ///
    /// Nothing happens until the future is first polled; polling is our proof
    /// that the future (and the node inside it) has been pinned.
    ///
    /// # Cancellation
    ///
    /// Dropping the future unlinks the waiter. It loses its place in line.
    pub fn join(self: Pin<&Self>, key: K) -> Join<'_, K>
    where
        K: PartialOrd,
    {
        Join {
            list: Some(self),
            node: Node::new(key),
        }
    }

    /// Like [`WaitList::join`], but runs `cleanup` if the future is dropped
    /// after being woken but before being polled to find out.
    ///
    /// Primitives that hand something over to the woken waiter (like a
    /// semaphore permit) need this: if the waiter is cancelled in that window,
    /// the thing it was handed would otherwise be lost. `cleanup` gets the
    /// chance to give it back.
    pub fn join_with_cleanup<F: FnOnce()>(
        self: Pin<&Self>,
        key: K,
        cleanup: F,
    ) -> JoinWithCleanup<'_, K, F>
    where
        K: PartialOrd,
    {
        JoinWithCleanup {
            inner: self.join(key),
            cleanup: Some(cleanup),
        }
    }
}

impl<K> core::fmt::Debug for WaitList<K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitList").field("ends", &self.ends).finish()
    }
}

#[cfg(debug_assertions)]
impl<K> Drop for WaitList<K> {
    fn drop(&mut self) {
        debug_assert!(self.ends.get().is_none());
    }
}

struct Ends<K> {
    head: NonNull<Node<K>>,
    tail: NonNull<Node<K>>,
}

impl<K> Copy for Ends<K> {}
impl<K> Clone for Ends<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> core::fmt::Debug for Ends<K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ends")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}

struct Node<K> {
    /// Towards the head. Neighbors rewrite this through `&`, hence `Cell`.
    prev: Cell<Option<NonNull<Self>>>,
    /// Towards the tail.
    next: Cell<Option<NonNull<Self>>>,
    /// Waker to poke when the list lets go of us.
    waker: Cell<Option<Waker>>,
    /// The list we're linked into. `Some` exactly while attached.
    list: Cell<Option<NonNull<WaitList<K>>>>,
    key: K,
    _marker: PhantomPinned,
}

impl<K> Node<K> {
    fn new(key: K) -> Self {
        Self {
            prev: Cell::new(None),
            next: Cell::new(None),
            waker: Cell::new(None),
            list: Cell::new(None),
            key,
            _marker: PhantomPinned,
        }
    }

    /// Links this node into `list` in key order.
    fn attach(self: Pin<&Self>, list: Pin<&WaitList<K>>)
    where
        K: PartialOrd,
    {
        let node_ptr = NonNull::from(&*self);

        match list.ends.get() {
            None => {
                list.ends.set(Some(Ends {
                    head: node_ptr,
                    tail: node_ptr,
                }));
            }
            Some(mut ends) => {
                // Walk from the tail looking for the last node that sorts
                // before or equal to us; it becomes our `prev`.
                let mut cursor = Some(ends.tail);
                while let Some(cand_ptr) = cursor {
                    // Safety: Link Valid Invariant.
                    let cand = unsafe { Pin::new_unchecked(cand_ptr.as_ref()) };
                    if cand.key <= self.key {
                        break;
                    }
                    cursor = cand.prev.get();
                }

                match cursor {
                    Some(prev_ptr) => {
                        // Safety: Link Valid Invariant.
                        let prev = unsafe { Pin::new_unchecked(prev_ptr.as_ref()) };
                        let old_next = prev.next.replace(Some(node_ptr));
                        if let Some(next_ptr) = old_next {
                            // Safety: Link Valid Invariant.
                            let next = unsafe { Pin::new_unchecked(next_ptr.as_ref()) };
                            next.prev.set(Some(node_ptr));
                        } else {
                            ends.tail = node_ptr;
                        }
                        self.prev.set(Some(prev_ptr));
                        self.next.set(old_next);
                    }
                    None => {
                        // We sort before everyone: new head.
                        // Safety: Link Valid Invariant.
                        let old_head = unsafe { Pin::new_unchecked(ends.head.as_ref()) };
                        old_head.prev.set(Some(node_ptr));
                        self.next.set(Some(ends.head));
                        ends.head = node_ptr;
                    }
                }
                list.ends.set(Some(ends));
            }
        }

        self.list.set(Some(NonNull::from(&*list)));
    }
}

impl<K> Drop for Node<K> {
    fn drop(&mut self) {
        let Some(list_ptr) = self.list.take() else {
            // Never attached, or already woken.
            return;
        };
        // Safety: Link Valid Invariant.
        let list = unsafe { Pin::new_unchecked(list_ptr.as_ref()) };
        let prev = self.prev.get();
        let next = self.next.get();

        if let Some(prev_ptr) = prev {
            // Safety: Link Valid Invariant.
            unsafe { prev_ptr.as_ref() }.next.set(next);
        }
        if let Some(next_ptr) = next {
            // Safety: Link Valid Invariant.
            unsafe { next_ptr.as_ref() }.prev.set(prev);
        }

        let Some(ends) = list.ends.get() else {
            // An attached node implies a non-empty list.
            panic!()
        };
        match (prev, next) {
            (None, None) => list.ends.set(None),
            (Some(prev_ptr), None) => list.ends.set(Some(Ends {
                tail: prev_ptr,
                ..ends
            })),
            (None, Some(next_ptr)) => list.ends.set(Some(Ends {
                head: next_ptr,
                ..ends
            })),
            (Some(_), Some(_)) => (),
        }
    }
}

/// Future returned by [`WaitList::join`].
#[derive(Debug)]
#[pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Join<'list, K> {
    /// The list to attach to on first poll. Taken when we attach.
    list: Option<Pin<&'list WaitList<K>>>,
    #[pin]
    node: Node<K>,
}

impl<K> Join<'_, K> {
    /// Checks whether this waiter has been linked and then woken, i.e. it has
    /// been polled at least once and is no longer in the list.
    fn woken(self: Pin<&mut Self>) -> bool {
        let p = self.project();
        p.list.is_none() && p.node.list.get().is_none()
    }
}

impl<K: PartialOrd> Future for Join<'_, K> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let p = self.project();
        let node = p.node.into_ref();

        if let Some(list) = p.list.take() {
            node.attach(list);
            node.waker.set(Some(cx.waker().clone()));
            Poll::Pending
        } else if node.list.get().is_none() {
            // Woken. Stays ready if polled again.
            Poll::Ready(())
        } else {
            node.waker.set(Some(cx.waker().clone()));
            Poll::Pending
        }
    }
}

impl<K> core::fmt::Debug for Node<K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("prev", &self.prev.get())
            .field("next", &self.next.get())
            .field("list", &self.list.get())
            .finish_non_exhaustive()
    }
}

/// Future returned by [`WaitList::join_with_cleanup`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct JoinWithCleanup<'list, K, F: FnOnce()> {
    #[pin]
    inner: Join<'list, K>,
    cleanup: Option<F>,
}

#[pinned_drop]
impl<K, F: FnOnce()> PinnedDrop for JoinWithCleanup<'_, K, F> {
    fn drop(self: Pin<&mut Self>) {
        let p = self.project();
        if p.inner.woken() {
            if let Some(cleanup) = p.cleanup.take() {
                cleanup();
            }
        }
    }
}

impl<K: PartialOrd, F: FnOnce()> Future for JoinWithCleanup<'_, K, F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let p = self.project();
        if p.inner.poll(cx).is_ready() {
            // Observed the wake; nothing left to clean up.
            p.cleanup.take();
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl<K: core::fmt::Debug, F: FnOnce()> core::fmt::Debug for JoinWithCleanup<'_, K, F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JoinWithCleanup")
            .field("inner", &self.inner)
            .field("armed", &self.cleanup.is_some())
            .finish()
    }
}
