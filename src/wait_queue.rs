//! Wait queue implementation.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomPinned;
use std::ptr::{self, NonNull, null};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
#[cfg(not(feature = "loom"))]
use std::thread::{Thread, current, park, park_timeout};
use std::time::Duration;
#[cfg(not(feature = "loom"))]
use std::time::Instant;

#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicBool;
#[cfg(feature = "loom")]
use loom::thread::{Thread, current, park, yield_now};

use crate::state;
use crate::thread_id::ThreadId;

/// Per-call descriptor of a blocked thread.
///
/// A [`WaitQueueNode`] lives on the stack of the thread that is about to block, and is only ever
/// referenced by the queue it is linked into. Its address is packed into the state word, so it
/// must be at least 8-byte aligned and must not move while linked.
///
/// The owning thread must not let the node go out of scope before it is unlinked and any
/// notification addressed to it has landed, i.e., [`wait`](Self::wait) has returned.
#[repr(align(8))]
pub(crate) struct WaitQueueNode {
    /// Identity of the blocked thread.
    requester: ThreadId,
    /// Cleared by the notifier.
    should_wait: AtomicBool,
    /// Next entry towards the tail; only accessed with the waiter queue locked.
    next: Cell<*const Self>,
    /// Previous entry; `head.prev` is the tail. Only accessed with the waiter queue locked.
    prev: Cell<*const Self>,
    /// Handle used to unpark the blocked thread.
    thread: Thread,
    /// The node cannot be unpinned since it forms an intrusive linked list.
    _pinned: PhantomPinned,
}

/// Intrusive circular doubly-linked list of [`WaitQueueNode`]s.
///
/// A [`WaitQueue`] is a transient view of the queue head stored in a state word; it is obtained
/// from a [`WaitQueueGuard`](crate::sync_primitive::WaitQueueGuard) and written back when the
/// guard is released.
pub(crate) struct WaitQueue {
    head: *const WaitQueueNode,
}

/// A single node unlinked from a [`WaitQueue`] whose thread has not been notified yet.
#[derive(Debug)]
pub(crate) struct Detached {
    node: NonNull<WaitQueueNode>,
}

/// A circular list of nodes split off a [`WaitQueue`] that have not been notified yet.
#[derive(Debug)]
pub(crate) struct DetachedList {
    head: NonNull<WaitQueueNode>,
}

impl WaitQueueNode {
    /// Creates a new node for the calling thread.
    pub(crate) fn new(requester: ThreadId) -> Self {
        Self {
            requester,
            should_wait: AtomicBool::new(false),
            next: Cell::new(null()),
            prev: Cell::new(null()),
            thread: current(),
            _pinned: PhantomPinned,
        }
    }

    /// Marks the node as waiting.
    ///
    /// Called with the waiter queue locked, right before the node is enqueued; the queue lock
    /// release publishes it.
    #[inline]
    pub(crate) fn prepare_wait(&self) {
        debug_assert!(!self.is_linked());
        self.should_wait.store(true, Relaxed);
    }

    /// Blocks the current thread until the node is notified.
    pub(crate) fn wait(&self) {
        while self.should_wait.load(Acquire) {
            park();
        }
    }

    /// Blocks the current thread until the node is notified or the timeout elapses.
    ///
    /// Returns `false` if the timeout elapsed. A `false` return does not imply that the node is
    /// still queued: a notifier may have dequeued it concurrently.
    #[cfg(not(feature = "loom"))]
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        loop {
            if !self.should_wait.load(Acquire) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            park_timeout(deadline - now);
        }
    }

    /// Under `loom` the timeout is left to the scheduler: the wait expires unless the node was
    /// notified by the time this thread is rescheduled.
    #[cfg(feature = "loom")]
    pub(crate) fn wait_for(&self, _timeout: Duration) -> bool {
        if self.should_wait.load(Acquire) {
            yield_now();
        }
        !self.should_wait.load(Acquire)
    }

    /// Wakes up the thread that owns the node.
    fn notify(&self) {
        let thread = self.thread.clone();
        self.next.set(null());
        self.prev.set(null());

        // The owner may return and drop the node as soon as the flag is cleared.
        self.should_wait.store(false, Release);
        thread.unpark();
    }

    /// Returns `true` if the node is part of a queue or a detached list.
    #[inline]
    fn is_linked(&self) -> bool {
        !self.next.get().is_null()
    }
}

impl fmt::Debug for WaitQueueNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueueNode")
            .field("requester", &self.requester)
            .field("should_wait", &self.should_wait.load(Relaxed))
            .field("linked", &self.is_linked())
            .finish_non_exhaustive()
    }
}

impl Drop for WaitQueueNode {
    #[inline]
    fn drop(&mut self) {
        debug_assert!(!self.is_linked(), "{:?} dropped while linked", self.requester);
    }
}

// Links are only accessed under the waiter queue lock.
unsafe impl Sync for WaitQueueNode {}

impl WaitQueue {
    /// Reads the queue out of a state word.
    ///
    /// # Safety
    ///
    /// The caller must hold the waiter queue lock of the word `state` was loaded from, and must
    /// write the queue back via [`install`](Self::install) before releasing it.
    #[inline]
    pub(crate) unsafe fn from_state(state: usize) -> Self {
        Self {
            head: state::head(state),
        }
    }

    /// Returns `state` with this queue installed as its head.
    #[inline]
    pub(crate) fn install(&self, state: usize) -> usize {
        state::with_head(state, self.head)
    }

    /// Returns `true` if the queue has no entries.
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Appends `node` at the tail.
    ///
    /// # Safety
    ///
    /// `node` must stay in place and alive until it is unlinked and notified.
    pub(crate) unsafe fn enqueue(&mut self, node: &WaitQueueNode) {
        debug_assert!(!node.is_linked());

        let new_tail = ptr::from_ref(node);
        if self.head.is_null() {
            node.next.set(new_tail);
            node.prev.set(new_tail);
            self.head = new_tail;
            return;
        }

        unsafe {
            let head = &*self.head;
            let tail = &*head.prev.get();
            tail.next.set(new_tail);
            head.prev.set(new_tail);
            node.next.set(self.head);
            node.prev.set(ptr::from_ref(tail));
        }
    }

    /// Pops the head.
    pub(crate) fn dequeue(&mut self) -> Option<Detached> {
        let node = NonNull::new(self.head.cast_mut())?;
        unsafe {
            self.unlink(node);
        }
        Some(Detached { node })
    }

    /// Unlinks the first node, from head to tail, that satisfies `predicate`.
    pub(crate) fn dequeue_matching<P: FnMut(&WaitQueueNode) -> bool>(
        &mut self,
        mut predicate: P,
    ) -> Option<Detached> {
        let head = self.head;
        if head.is_null() {
            return None;
        }

        let mut current = head;
        loop {
            let node = unsafe { &*current };
            if predicate(node) {
                let node = NonNull::from(node);
                unsafe {
                    self.unlink(node);
                }
                return Some(Detached { node });
            }
            current = node.next.get();
            if ptr::eq(current, head) {
                return None;
            }
        }
    }

    /// Splits off the first `count` nodes, leaving the rest in `self`.
    ///
    /// Takes the whole queue if it has `count` or fewer entries.
    pub(crate) fn split(&mut self, count: usize) -> Option<DetachedList> {
        if count == 0 {
            return None;
        }
        let front_head = NonNull::new(self.head.cast_mut())?;

        let mut back_head = self.head;
        for _ in 0..count {
            back_head = unsafe { (*back_head).next.get() };
            if ptr::eq(back_head, self.head) {
                return self.take_all();
            }
        }

        unsafe {
            let front_tail = (*back_head).prev.get();
            let back_tail = front_head.as_ref().prev.get();

            (*back_head).prev.set(back_tail);
            (*back_tail).next.set(back_head);

            front_head.as_ref().prev.set(front_tail);
            (*front_tail).next.set(front_head.as_ptr().cast_const());
        }
        self.head = back_head;
        Some(DetachedList { head: front_head })
    }

    /// Takes every node.
    pub(crate) fn take_all(&mut self) -> Option<DetachedList> {
        let head = NonNull::new(self.head.cast_mut())?;
        self.head = null();
        Some(DetachedList { head })
    }

    /// Returns the number of entries.
    pub(crate) fn len(&self) -> usize {
        if self.head.is_null() {
            return 0;
        }
        let mut len = 0;
        let mut current = self.head;
        loop {
            len += 1;
            current = unsafe { (*current).next.get() };
            if ptr::eq(current, self.head) {
                return len;
            }
        }
    }

    /// Unlinks `node` from the queue.
    ///
    /// # Safety
    ///
    /// `node` must be an entry of `self`.
    unsafe fn unlink(&mut self, node: NonNull<WaitQueueNode>) {
        let node_ref = unsafe { node.as_ref() };
        let next = node_ref.next.get();
        if ptr::eq(next, node.as_ptr()) {
            // It was the only entry.
            self.head = null();
        } else {
            let prev = node_ref.prev.get();
            unsafe {
                (*prev).next.set(next);
                (*next).prev.set(prev);
            }
            if ptr::eq(self.head, node.as_ptr()) {
                self.head = next;
            }
        }
        node_ref.next.set(null());
        node_ref.prev.set(null());
    }
}

impl Default for WaitQueue {
    #[inline]
    fn default() -> Self {
        Self { head: null() }
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("head", &self.head)
            .field("len", &self.len())
            .finish()
    }
}

impl Detached {
    /// Returns `true` if this is `node`.
    #[cfg(test)]
    pub(crate) fn is(&self, node: &WaitQueueNode) -> bool {
        ptr::eq(self.node.as_ptr(), node)
    }

    /// Notifies the node.
    #[inline]
    pub(crate) fn notify(self) {
        // The owner cannot drop the node before it is notified.
        unsafe { self.node.as_ref() }.notify();
    }
}

impl DetachedList {
    /// Notifies every node in the list, and returns the number of notified nodes.
    pub(crate) fn notify_all(self) -> u32 {
        let head = self.head.as_ptr().cast_const();
        let mut count = 0_u32;
        let mut current = head;
        loop {
            let node = unsafe { &*current };
            // `node` is not accessible after being notified.
            let next = node.next.get();
            node.notify();
            count = count.saturating_add(1);
            if ptr::eq(next, head) {
                return count;
            }
            current = next;
        }
    }

    /// Returns the number of nodes in the list.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        WaitQueue {
            head: self.head.as_ptr().cast_const(),
        }
        .len()
    }

    /// Turns the list back into a queue without notifying any node.
    #[cfg(test)]
    pub(crate) fn into_queue(self) -> WaitQueue {
        WaitQueue {
            head: self.head.as_ptr().cast_const(),
        }
    }
}
