//! Intrusive multi-producer single-consumer queue of closures.
//!
//! The 1024cores.net intrusive MPSC algorithm: producers race on an atomic
//! swap of the push end, the single consumer walks published `next` links
//! from its own end. A node whose predecessor swapped the push end but has
//! not yet published its link makes the queue momentarily unwalkable; `pop`
//! reports that as [`Pop::Inconsistent`] and the caller retries later.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::closure::Closure;

/// Outcome of a [`MpscQueue::pop`].
#[derive(Debug)]
pub(crate) enum Pop {
    /// The node at the front of the queue, in push order.
    Node(Box<Closure>),
    /// Nothing is queued.
    Empty,
    /// A producer has swapped the push end but not yet published its link;
    /// the queue is non-empty but cannot be walked right now.
    Inconsistent,
}

pub(crate) struct MpscQueue {
    /// Push end. Producers swap a new node in from any thread.
    head: CachePadded<AtomicPtr<Closure>>,
    /// Pop end. Owned by the single consumer.
    tail: UnsafeCell<*mut Closure>,
    stub: Box<Closure>,
}

// SAFETY: producers only touch `head` (atomic); `tail` is guarded by the
// caller's single-consumer contract on `pop`.
unsafe impl Send for MpscQueue {}
unsafe impl Sync for MpscQueue {}

impl MpscQueue {
    pub(crate) fn new() -> MpscQueue {
        let stub = Closure::stub();
        let stub_ptr = &*stub as *const Closure as *mut Closure;
        MpscQueue {
            head: CachePadded::new(AtomicPtr::new(stub_ptr)),
            tail: UnsafeCell::new(stub_ptr),
            stub,
        }
    }

    /// Wait-free push, callable from any thread.
    pub(crate) fn push(&self, node: Box<Closure>) {
        self.push_raw(Box::into_raw(node));
    }

    fn push_raw(&self, node: *mut Closure) {
        // SAFETY: `node` is not visible to the consumer until the swap below
        // publishes it.
        unsafe { (*node).next().store(ptr::null_mut(), Ordering::Relaxed) };
        let prev = self.head.swap(node, Ordering::AcqRel);
        // SAFETY: `prev` is the stub or a node the consumer is still short of;
        // either way it stays allocated until its `next` link is consumed.
        unsafe { (*prev).next().store(node, Ordering::Release) };
    }

    /// Pop one node in push order.
    ///
    /// # Safety
    ///
    /// At most one thread may call `pop` at a time. For a combiner the
    /// exclusive caller is the thread currently draining it, as designated
    /// by the combiner's state word.
    pub(crate) unsafe fn pop(&self) -> Pop {
        let mut tail = *self.tail.get();
        let mut next = (*tail).next().load(Ordering::Acquire);

        if tail == self.stub() {
            if next.is_null() {
                return Pop::Empty;
            }
            *self.tail.get() = next;
            tail = next;
            next = (*tail).next().load(Ordering::Acquire);
        }

        if !next.is_null() {
            *self.tail.get() = next;
            return Pop::Node(Box::from_raw(tail));
        }

        if self.head.load(Ordering::Acquire) != tail {
            // A producer swapped the push end but has not published its link.
            return Pop::Inconsistent;
        }

        // `tail` is the last node. Re-insert the stub behind it so the node
        // can be detached without leaving the queue headless.
        self.push_raw(self.stub());

        next = (*tail).next().load(Ordering::Acquire);
        if !next.is_null() {
            *self.tail.get() = next;
            return Pop::Node(Box::from_raw(tail));
        }

        // Another producer slipped in between the head check and the stub
        // re-insert.
        Pop::Inconsistent
    }

    fn stub(&self) -> *mut Closure {
        &*self.stub as *const Closure as *mut Closure
    }
}

impl Drop for MpscQueue {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent producers, so this is the
        // sole consumer and `Inconsistent` cannot persist.
        while let Pop::Node(node) = unsafe { self.pop() } {
            drop(node);
        }
    }
}
