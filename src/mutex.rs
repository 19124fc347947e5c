//! [`Mutex`] is a low-level, non-reentrant adaptive lock.

use std::fmt;
#[cfg(not(feature = "loom"))]
use std::hint::spin_loop;
use std::marker::PhantomData;
use std::pin::pin;
use std::ptr;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::time::{Duration, Instant};

#[cfg(feature = "loom")]
use loom::hint::spin_loop;
#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU64, AtomicUsize};
use tracing::{debug, trace};

use crate::config::{Config, DefaultConfig};
use crate::state::{self, EMPTY, Flag, LOCKED};
use crate::sync_primitive::{SyncPrimitive, WaitQueueGuard};
use crate::thread_id::ThreadId;
use crate::wait_queue::WaitQueueNode;

/// [`Mutex`] is a low-level, non-reentrant adaptive lock.
///
/// An uncontended [`lock`](Self::lock) or [`unlock`](Self::unlock) costs a single atomic
/// operation. A contended thread spins for a while, then enqueues itself into a FIFO wait queue
/// whose head is packed into the same atomic word as the lock bit, and blocks.
///
/// Waking up is a permission to retry, not a hand-off: threads that have not yet entered the
/// wait queue may acquire the lock ahead of a woken waiter.
///
/// [`Mutex`] does not protect any data by itself; see `DataMutex` with the `lock_api` feature.
pub struct Mutex<C: Config = DefaultConfig> {
    /// [`Mutex`] state.
    state: AtomicUsize,
    /// The [`ThreadId`] of the owner, or `0`.
    owner: AtomicU64,
    _config: PhantomData<fn() -> C>,
}

impl Mutex {
    /// Creates a new unlocked [`Mutex`] with the [`DefaultConfig`].
    ///
    /// # Examples
    ///
    /// ```
    /// use waitlock::Mutex;
    ///
    /// let mutex = Mutex::new();
    /// assert!(!mutex.is_locked());
    /// ```
    #[cfg(not(feature = "loom"))]
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self::with_config()
    }

    /// Creates a new unlocked [`Mutex`] with the [`DefaultConfig`].
    #[cfg(feature = "loom")]
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_config()
    }
}

impl<C: Config> Mutex<C> {
    /// Creates a new unlocked [`Mutex`] that spins as configured by `C`.
    ///
    /// # Examples
    ///
    /// ```
    /// use waitlock::{Config, Mutex};
    ///
    /// #[derive(Debug, Default)]
    /// struct NoSpin;
    ///
    /// impl Config for NoSpin {
    ///     fn spin_count() -> usize {
    ///         1
    ///     }
    /// }
    ///
    /// let mutex: Mutex<NoSpin> = Mutex::with_config();
    /// assert!(mutex.try_lock());
    /// ```
    #[cfg(not(feature = "loom"))]
    #[inline]
    #[must_use]
    pub const fn with_config() -> Self {
        Self {
            state: AtomicUsize::new(EMPTY),
            owner: AtomicU64::new(0),
            _config: PhantomData,
        }
    }

    /// Creates a new unlocked [`Mutex`] that spins as configured by `C`.
    #[cfg(feature = "loom")]
    #[inline]
    #[must_use]
    pub fn with_config() -> Self {
        Self {
            state: AtomicUsize::new(EMPTY),
            owner: AtomicU64::new(0),
            _config: PhantomData,
        }
    }

    /// Returns `true` if the mutex is currently locked.
    ///
    /// # Examples
    ///
    /// ```
    /// use waitlock::Mutex;
    ///
    /// let mutex = Mutex::new();
    /// assert!(mutex.try_lock());
    /// assert!(mutex.is_locked());
    /// ```
    #[inline]
    pub fn is_locked(&self) -> bool {
        Flag::Locked.decode(self.state().load(Relaxed))
    }

    /// Returns the current owner.
    ///
    /// The value is racy unless it is the calling thread's own [`ThreadId`].
    #[inline]
    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::from_u64(self.owner.load(Relaxed))
    }

    /// Returns `true` if the lock is held by the thread identified by `thread_id`.
    ///
    /// # Examples
    ///
    /// ```
    /// use waitlock::{Mutex, ThreadId};
    ///
    /// let mutex = Mutex::new();
    /// let me = ThreadId::current();
    ///
    /// mutex.lock(me);
    /// assert!(mutex.is_held_by_current_thread(me));
    ///
    /// mutex.unlock(me);
    /// assert!(!mutex.is_held_by_current_thread(me));
    /// ```
    #[inline]
    pub fn is_held_by_current_thread(&self, thread_id: ThreadId) -> bool {
        self.owner.load(Relaxed) == thread_id.as_u64()
    }

    /// Returns the number of threads blocked in the wait queue.
    ///
    /// Threads that are still spinning are not counted.
    #[inline]
    pub fn num_waiters(&self) -> usize {
        SyncPrimitive::num_waiters(self)
    }

    /// Tries to acquire the lock without blocking.
    ///
    /// Returns `false` if the lock is held.
    ///
    /// # Examples
    ///
    /// ```
    /// use waitlock::Mutex;
    ///
    /// let mutex = Mutex::new();
    ///
    /// assert!(mutex.try_lock());
    /// assert!(!mutex.try_lock());
    /// ```
    #[inline]
    pub fn try_lock(&self) -> bool {
        let state = self.state();
        let mut current = state.load(Relaxed);
        while !Flag::Locked.decode(current) {
            if state::try_lock_bit(state, Flag::Locked, &mut current) {
                self.set_owner(ThreadId::current());
                return true;
            }
        }
        false
    }

    /// Acquires the lock, blocking the current thread until it is able to do so.
    ///
    /// The lock is not reentrant: locking it again on the owning thread deadlocks.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// use waitlock::{Mutex, ThreadId};
    ///
    /// let mutex = Arc::new(Mutex::new());
    /// mutex.lock(ThreadId::current());
    ///
    /// let mutex_clone = mutex.clone();
    /// let thread = thread::spawn(move || {
    ///     let me = ThreadId::current();
    ///     mutex_clone.lock(me);
    ///     mutex_clone.unlock(me);
    /// });
    ///
    /// mutex.unlock(ThreadId::current());
    /// thread.join().unwrap();
    /// ```
    #[inline]
    pub fn lock(&self, thread_id: ThreadId) {
        debug_assert!(
            !self.is_held_by_current_thread(thread_id),
            "{thread_id:?} locked a non-reentrant mutex twice"
        );
        if !self.try_lock_uncontended() {
            self.lock_slow(thread_id, None);
        }
        self.set_owner(thread_id);
    }

    /// Acquires the lock, blocking the current thread for at most `timeout`.
    ///
    /// Returns `false` if the timeout elapsed; the calling thread is not left in the wait queue.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use waitlock::{Mutex, ThreadId};
    ///
    /// let mutex = Mutex::new();
    /// let me = ThreadId::current();
    ///
    /// assert!(mutex.lock_for(me, Duration::from_millis(1)));
    /// assert!(std::thread::scope(|s| {
    ///     s.spawn(|| !mutex.lock_for(ThreadId::current(), Duration::from_millis(1)))
    ///         .join()
    ///         .unwrap()
    /// }));
    /// mutex.unlock(me);
    /// ```
    #[inline]
    pub fn lock_for(&self, thread_id: ThreadId, timeout: Duration) -> bool {
        debug_assert!(
            !self.is_held_by_current_thread(thread_id),
            "{thread_id:?} locked a non-reentrant mutex twice"
        );
        let acquired = self.try_lock_uncontended() || self.lock_slow(thread_id, Some(timeout));
        if acquired {
            self.set_owner(thread_id);
        }
        acquired
    }

    /// Releases the lock, waking up the first queued waiter if any.
    ///
    /// The calling thread must own the lock.
    ///
    /// # Examples
    ///
    /// ```
    /// use waitlock::{Mutex, ThreadId};
    ///
    /// let mutex = Mutex::new();
    /// let me = ThreadId::current();
    ///
    /// mutex.lock(me);
    /// mutex.unlock(me);
    ///
    /// assert!(mutex.try_lock());
    /// ```
    #[inline]
    pub fn unlock(&self, thread_id: ThreadId) {
        debug_assert!(
            self.is_held_by_current_thread(thread_id),
            "{thread_id:?} unlocked a mutex it does not own"
        );
        self.owner.store(0, Relaxed);

        if self
            .state()
            .compare_exchange(LOCKED, EMPTY, Release, Relaxed)
            .is_err()
        {
            self.unlock_slow();
        }
    }

    #[inline]
    fn set_owner(&self, thread_id: ThreadId) {
        self.owner.store(thread_id.as_u64(), Relaxed);
    }

    /// Tries to lock an uncontended mutex.
    #[inline]
    fn try_lock_uncontended(&self) -> bool {
        self.state()
            .compare_exchange(EMPTY, LOCKED, Acquire, Relaxed)
            .is_ok()
    }

    /// Spins with exponential backoff trying to acquire the lock.
    fn spin(&self) -> bool {
        let mut tries = 0;
        let mut backoff = 1;
        let mut current = self.state().load(Relaxed);
        loop {
            if state::try_lock_bit(self.state(), Flag::Locked, &mut current) {
                return true;
            }
            C::backoff(backoff);
            tries += backoff;
            if tries >= C::spin_count() {
                return false;
            }
            backoff = (backoff << 1).min(C::max_backoff());
        }
    }

    /// Locks either the waiter queue if the mutex is held, or the mutex if it is free.
    ///
    /// Returns `None` if the mutex was acquired.
    fn lock_wait_queue_or_mutex<'s>(
        state: &'s AtomicUsize,
        current: &mut usize,
    ) -> Option<WaitQueueGuard<'s>> {
        loop {
            if Flag::Locked.decode(*current)
                && state::try_lock_bit(state, Flag::WaiterQueueLocked, current)
            {
                return Some(WaitQueueGuard::already_locked(state, *current));
            }
            // The mutex may have been released while trying to lock the waiter queue.
            if state::try_lock_bit(state, Flag::Locked, current) {
                return None;
            }
            spin_loop();
        }
    }

    /// Spins, then enqueues the current thread and blocks until woken up, repeatedly.
    ///
    /// Returns `false` if the timeout elapsed.
    #[cold]
    fn lock_slow(&self, thread_id: ThreadId, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        loop {
            if self.spin() {
                return true;
            }

            let node = pin!(WaitQueueNode::new(thread_id));
            {
                let state = self.state();
                let mut current = state.load(Relaxed);
                let Some(mut guard) = Self::lock_wait_queue_or_mutex(state, &mut current) else {
                    return true;
                };
                debug_assert!(Flag::Locked.decode(current));

                trace!(thread = thread_id.as_u64(), "enqueueing contended mutex waiter");
                node.prepare_wait();
                let mut queue = guard.queue();
                unsafe {
                    queue.enqueue(&node);
                }

                // The lock is held, just not by this thread.
                guard.set_new_state(Flag::Locked.update(queue.install(current), true));
            }

            match deadline {
                None => node.wait(),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if !node.wait_for(remaining) {
                        return self.lock_or_dequeue_timed_out(thread_id, &node);
                    }
                }
            }

            // Contention when going to sleep says nothing about contention now, so spin again.
        }
    }

    /// Removes a timed-out waiter from the wait queue.
    ///
    /// If the waiter was dequeued by an unlocking thread in the meantime, the notification it
    /// was sent is lost, so this thread tries to take the lock in its place in order for the next
    /// waiter not to be stranded. Returns `true` if the lock was acquired.
    pub(crate) fn lock_or_dequeue_timed_out(
        &self,
        thread_id: ThreadId,
        node: &WaitQueueNode,
    ) -> bool {
        let state = self.state();
        let mut current = state.load(Relaxed);
        if !Flag::HasWaiters.decode(current) {
            // Dequeued by an unlocking thread that left the queue empty.
            node.wait();
            return false;
        }

        let mut guard = WaitQueueGuard::lock(state, &mut current);
        let mut queue = guard.queue();
        if queue.is_empty() {
            guard.set_new_state_keeping_lock_bit(EMPTY);
            drop(guard);
            node.wait();
            return false;
        }

        if queue
            .dequeue_matching(|waiter| ptr::eq(waiter, node))
            .is_some()
        {
            guard.set_new_state_keeping_lock_bit(queue.install(EMPTY));
            trace!(thread = thread_id.as_u64(), "timed-out mutex waiter dequeued");
            return false;
        }

        // Either this thread or the thread holding the lock will notify the next waiter.
        let acquired = guard.release_and_lock(queue.install(EMPTY));
        drop(guard);
        debug!(
            thread = thread_id.as_u64(),
            acquired, "timed-out mutex waiter was dequeued concurrently"
        );

        // The unlocking thread has yet to finish notifying this node.
        node.wait();
        acquired
    }

    /// Wakes up the head of the wait queue.
    #[cold]
    fn unlock_slow(&self) {
        let state = self.state();
        let mut current = state.load(Relaxed);
        let mut guard = WaitQueueGuard::lock(state, &mut current);
        let mut queue = guard.queue();

        let Some(waiter) = queue.dequeue() else {
            // Every waiter timed out while this thread was locking the wait queue.
            guard.set_new_state(Flag::Locked.update(current, false));
            return;
        };

        guard.set_new_state(Flag::Locked.update(queue.install(current), false));
        drop(guard);
        waiter.notify();
    }
}

impl<C: Config> Default for Mutex<C> {
    #[inline]
    fn default() -> Self {
        Self::with_config()
    }
}

impl<C: Config> fmt::Debug for Mutex<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Relaxed);
        f.debug_struct("Mutex")
            .field("state", &state)
            .field("locked", &Flag::Locked.decode(state))
            .field("owner", &self.owner())
            .field(
                "wait_queue_being_processed",
                &Flag::WaiterQueueLocked.decode(state),
            )
            .field("has_waiters", &Flag::HasWaiters.decode(state))
            .finish()
    }
}

impl<C: Config> SyncPrimitive for Mutex<C> {
    #[inline]
    fn state(&self) -> &AtomicUsize {
        &self.state
    }
}
