//! [`Condvar`] blocks threads until notified, releasing a [`Mutex`] while they wait.

use std::fmt;
use std::pin::pin;
use std::ptr;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicUsize;
use tracing::trace;

use crate::config::Config;
use crate::mutex::Mutex;
use crate::state::{EMPTY, Flag};
use crate::sync_primitive::{SyncPrimitive, WaitQueueGuard};
use crate::thread_id::ThreadId;
use crate::wait_queue::{WaitQueue, WaitQueueNode};

/// [`Condvar`] blocks threads until notified, releasing a [`Mutex`] while they wait.
///
/// Waiters are notified in the order they started waiting. A [`Condvar`] is not bound to a
/// [`Mutex`]; each wait names the mutex to release and reacquire.
#[derive(Default)]
pub struct Condvar {
    /// [`Condvar`] state.
    state: AtomicUsize,
}

impl Condvar {
    /// Passing it to [`notify`](Self::notify) wakes up every waiter.
    pub const ALL_WAITERS: u32 = u32::MAX;

    /// Creates a new [`Condvar`] without waiters.
    ///
    /// # Examples
    ///
    /// ```
    /// use waitlock::Condvar;
    ///
    /// let condvar = Condvar::new();
    /// assert_eq!(condvar.num_waiters(), 0);
    /// ```
    #[cfg(not(feature = "loom"))]
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(EMPTY),
        }
    }

    /// Creates a new [`Condvar`] without waiters.
    #[cfg(feature = "loom")]
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicUsize::new(EMPTY),
        }
    }

    /// Returns the number of waiting threads.
    #[inline]
    pub fn num_waiters(&self) -> usize {
        SyncPrimitive::num_waiters(self)
    }

    /// Releases `mutex` and blocks the current thread until notified, then reacquires `mutex`.
    ///
    /// The calling thread must own `mutex`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::sync::atomic::AtomicBool;
    /// use std::sync::atomic::Ordering::Relaxed;
    /// use std::thread;
    ///
    /// use waitlock::{Condvar, Mutex, ThreadId};
    ///
    /// let pair = Arc::new((Mutex::new(), Condvar::new(), AtomicBool::new(false)));
    /// let pair_clone = pair.clone();
    ///
    /// let thread = thread::spawn(move || {
    ///     let (mutex, condvar, ready) = &*pair_clone;
    ///     let me = ThreadId::current();
    ///     mutex.lock(me);
    ///     ready.store(true, Relaxed);
    ///     mutex.unlock(me);
    ///     condvar.notify(1);
    /// });
    ///
    /// let (mutex, condvar, ready) = &*pair;
    /// let me = ThreadId::current();
    /// mutex.lock(me);
    /// while !ready.load(Relaxed) {
    ///     condvar.wait(mutex, me);
    /// }
    /// assert!(mutex.is_held_by_current_thread(me));
    /// mutex.unlock(me);
    ///
    /// thread.join().unwrap();
    /// ```
    #[inline]
    pub fn wait<C: Config>(&self, mutex: &Mutex<C>, thread_id: ThreadId) {
        self.wait_internal(mutex, thread_id, None);
    }

    /// Releases `mutex` and blocks the current thread until notified or `timeout` elapses, then
    /// reacquires `mutex`.
    ///
    /// Returns `false` if the timeout elapsed. The calling thread owns `mutex` again on return in
    /// either case.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use waitlock::{Condvar, Mutex, ThreadId};
    ///
    /// let mutex = Mutex::new();
    /// let condvar = Condvar::new();
    /// let me = ThreadId::current();
    ///
    /// mutex.lock(me);
    /// assert!(!condvar.wait_for(&mutex, me, Duration::from_millis(1)));
    /// assert!(mutex.is_held_by_current_thread(me));
    /// mutex.unlock(me);
    /// ```
    #[inline]
    pub fn wait_for<C: Config>(
        &self,
        mutex: &Mutex<C>,
        thread_id: ThreadId,
        timeout: Duration,
    ) -> bool {
        self.wait_internal(mutex, thread_id, Some(timeout))
    }

    /// Wakes up at most `count` waiters in the order they started waiting.
    ///
    /// Returns the number of waiters woken up.
    ///
    /// # Examples
    ///
    /// ```
    /// use waitlock::Condvar;
    ///
    /// let condvar = Condvar::new();
    /// assert_eq!(condvar.notify(1), 0);
    /// assert_eq!(condvar.notify(Condvar::ALL_WAITERS), 0);
    /// ```
    pub fn notify(&self, count: u32) -> u32 {
        if count == 0 {
            return 0;
        }

        // Waiters are notified with the waiter queue locked so that a timed-out waiter cannot
        // observe itself dequeued before the notification is delivered.
        let notified = self.dequeue_explicit(|queue| match count {
            1 => queue.dequeue().map_or(0, |waiter| {
                waiter.notify();
                1
            }),
            Self::ALL_WAITERS => queue.take_all().map_or(0, |waiters| waiters.notify_all()),
            _ => {
                let count = usize::try_from(count).unwrap_or(usize::MAX);
                queue.split(count).map_or(0, |waiters| waiters.notify_all())
            }
        });
        if notified != 0 {
            trace!(requested = count, notified, "condvar notified waiters");
        }
        notified
    }

    fn wait_internal<C: Config>(
        &self,
        mutex: &Mutex<C>,
        thread_id: ThreadId,
        timeout: Option<Duration>,
    ) -> bool {
        debug_assert!(mutex.is_held_by_current_thread(thread_id));

        let notified = {
            let node = pin!(WaitQueueNode::new(thread_id));
            {
                let state = self.state();
                let mut current = state.load(Relaxed);
                let mut guard = WaitQueueGuard::lock(state, &mut current);
                node.prepare_wait();
                let mut queue = guard.queue();
                unsafe {
                    queue.enqueue(&node);
                }
                guard.set_new_state(queue.install(current));
            }

            // The node is queued, so a notification sent after this point cannot be missed.
            mutex.unlock(thread_id);

            match timeout {
                None => {
                    node.wait();
                    true
                }
                Some(timeout) => {
                    node.wait_for(timeout) || {
                        let removed = self.dequeue_explicit(|queue| {
                            queue
                                .dequeue_matching(|waiter| ptr::eq(waiter, &*node))
                                .is_some()
                        });
                        if !removed {
                            // Already dequeued by a notifier.
                            node.wait();
                        }
                        !removed
                    }
                }
            }
        };

        mutex.lock(thread_id);
        notified
    }

    /// Locks the waiter queue, runs `action_under_lock` on it, then installs the updated queue.
    ///
    /// Returns the default value without locking if there are no waiters.
    fn dequeue_explicit<R: Default, F: FnOnce(&mut WaitQueue) -> R>(
        &self,
        action_under_lock: F,
    ) -> R {
        let state = self.state();
        let mut current = state.load(Relaxed);
        if !Flag::HasWaiters.decode(current) {
            return R::default();
        }

        let mut guard = WaitQueueGuard::lock(state, &mut current);
        let mut queue = guard.queue();
        if queue.is_empty() {
            guard.set_new_state(EMPTY);
            return R::default();
        }

        let result = action_under_lock(&mut queue);
        guard.set_new_state(queue.install(current));
        result
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Relaxed);
        f.debug_struct("Condvar")
            .field("state", &state)
            .field(
                "wait_queue_being_processed",
                &Flag::WaiterQueueLocked.decode(state),
            )
            .field("has_waiters", &Flag::HasWaiters.decode(state))
            .finish()
    }
}

impl SyncPrimitive for Condvar {
    #[inline]
    fn state(&self) -> &AtomicUsize {
        &self.state
    }
}
