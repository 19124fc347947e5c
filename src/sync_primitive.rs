//! Define base operations for synchronization primitives.

#[cfg(not(feature = "loom"))]
use std::hint::spin_loop;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Relaxed, Release};

#[cfg(feature = "loom")]
use loom::hint::spin_loop;
#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicUsize;

use crate::state::{self, Flag};
use crate::wait_queue::WaitQueue;

/// Define base operations for synchronization primitives.
pub(crate) trait SyncPrimitive {
    /// Resolves the state word.
    ///
    /// The backing storage of the word may be relocated while a thread is blocked, so the
    /// returned reference must not be held across a wait; call this again after every wakeup.
    fn state(&self) -> &AtomicUsize;

    /// Returns the number of queued waiters.
    fn num_waiters(&self) -> usize {
        let state = self.state();
        let mut current = state.load(Relaxed);
        if !Flag::HasWaiters.decode(current) {
            return 0;
        }

        let mut guard = WaitQueueGuard::lock(state, &mut current);
        let queue = guard.queue();
        let len = queue.len();
        guard.set_new_state_keeping_lock_bit(queue.install(current));
        len
    }
}

/// How a [`WaitQueueGuard`] releases the waiter queue lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ReleaseMode {
    /// No replacement state was supplied.
    Unset,
    /// Stores the replacement state as is.
    Store(usize),
    /// Stores the replacement state while keeping the current value of [`Flag::Locked`].
    KeepLockBit(usize),
    /// The queue lock was released by the owner of the guard.
    Released,
}

/// Scoped spinlock over [`Flag::WaiterQueueLocked`].
///
/// No other thread can observe or mutate the queue head while the guard is alive. The owner of
/// the guard must supply the state to install before the guard is dropped.
#[derive(Debug)]
pub(crate) struct WaitQueueGuard<'s> {
    /// The state word whose waiter queue is locked.
    state: &'s AtomicUsize,
    /// The state right before the waiter queue was locked.
    snapshot: usize,
    /// Replacement state.
    release: ReleaseMode,
}

impl<'s> WaitQueueGuard<'s> {
    /// Spins until the waiter queue is locked.
    ///
    /// `current` is updated with the value of the state right before the lock was acquired.
    pub(crate) fn lock(state: &'s AtomicUsize, current: &mut usize) -> Self {
        while !state::try_lock_bit(state, Flag::WaiterQueueLocked, current) {
            spin_loop();
        }
        Self::already_locked(state, *current)
    }

    /// Wraps a waiter queue lock that the current thread has just acquired.
    ///
    /// `snapshot` is the value of the state right before the lock was acquired.
    pub(crate) fn already_locked(state: &'s AtomicUsize, snapshot: usize) -> Self {
        debug_assert!(!Flag::WaiterQueueLocked.decode(snapshot));
        debug_assert!(Flag::WaiterQueueLocked.decode(state.load(Relaxed)));
        Self {
            state,
            snapshot,
            release: ReleaseMode::Unset,
        }
    }

    /// Returns the locked queue.
    #[inline]
    pub(crate) fn queue(&self) -> WaitQueue {
        unsafe { WaitQueue::from_state(self.snapshot) }
    }

    /// Sets the state to install when the guard is dropped.
    #[inline]
    pub(crate) fn set_new_state(&mut self, new_state: usize) {
        self.release = ReleaseMode::Store(new_state);
    }

    /// Sets the state to install when the guard is dropped, except for [`Flag::Locked`] that
    /// retains whatever value it has then.
    ///
    /// Use this when the lock bit may be acquired by another thread while the waiter queue is
    /// locked.
    #[inline]
    pub(crate) fn set_new_state_keeping_lock_bit(&mut self, new_state: usize) {
        self.release = ReleaseMode::KeepLockBit(Flag::Locked.update(new_state, false));
    }

    /// Releases the waiter queue lock and acquires [`Flag::Locked`] in one atomic step.
    ///
    /// Returns `false` if [`Flag::Locked`] is held by another thread, in which case the new state
    /// is installed with [`Flag::Locked`] set when the guard is dropped.
    pub(crate) fn release_and_lock(&mut self, new_state: usize) -> bool {
        // While the waiter queue is locked, only the lock bit can change.
        let expected = Flag::Locked.update(Flag::WaiterQueueLocked.update(self.snapshot, true), false);
        let desired = Flag::Locked.update(Flag::WaiterQueueLocked.update(new_state, false), true);
        if self
            .state
            .compare_exchange(expected, desired, AcqRel, Relaxed)
            .is_ok()
        {
            self.release = ReleaseMode::Released;
            return true;
        }
        debug_assert!(Flag::Locked.decode(self.state.load(Relaxed)));
        self.release = ReleaseMode::Store(desired);
        false
    }
}

impl Drop for WaitQueueGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        debug_assert_ne!(self.release, ReleaseMode::Unset);

        let new_state = match self.release {
            ReleaseMode::Released => return,
            ReleaseMode::Unset => self.snapshot,
            ReleaseMode::Store(new_state) => new_state,
            ReleaseMode::KeepLockBit(new_state) => {
                let new_state = Flag::WaiterQueueLocked.update(new_state, false);
                let mut current = self.state.load(Relaxed);
                loop {
                    debug_assert!(Flag::WaiterQueueLocked.decode(current));
                    let desired = Flag::Locked.update(new_state, Flag::Locked.decode(current));
                    match self
                        .state
                        .compare_exchange_weak(current, desired, Release, Relaxed)
                    {
                        Ok(_) => return,
                        Err(observed) => current = observed,
                    }
                }
            }
        };

        debug_assert!(Flag::WaiterQueueLocked.decode(self.state.load(Relaxed)));
        self.state.store(
            Flag::WaiterQueueLocked.update(new_state, false),
            Release,
        );
    }
}
