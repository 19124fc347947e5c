//! Bit layout of the packed state word shared by [`Mutex`](crate::Mutex) and
//! [`Condvar`](crate::Condvar).
//!
//! ```text
//! | queue head address (61 bits) | HAS_WAITERS | WAITER_QUEUE_LOCKED | LOCKED |
//! ```
//!
//! The head address and `HAS_WAITERS` may only be read or written while holding the
//! `WAITER_QUEUE_LOCKED` bit. The other bits may be observed at any time, but are only ever
//! mutated through compare-and-swap.

use std::ptr::{null, with_exposed_provenance};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Acquire, Relaxed};

#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicUsize;

use crate::wait_queue::WaitQueueNode;

/// The primary lock bit; never set on a [`Condvar`](crate::Condvar).
pub(crate) const LOCKED: usize = 1;

/// The nested spinlock guarding the waiter queue.
pub(crate) const WAITER_QUEUE_LOCKED: usize = 1 << 1;

/// Set iff the queue head address is non-null.
pub(crate) const HAS_WAITERS: usize = 1 << 2;

/// Mask extracting the queue head address.
pub(crate) const HEAD_MASK: usize = !(LOCKED | WAITER_QUEUE_LOCKED | HAS_WAITERS);

/// Unlocked, no waiters, queue unlocked.
pub(crate) const EMPTY: usize = 0;

/// Single-bit fields of the state word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Flag {
    /// See [`LOCKED`].
    Locked,
    /// See [`WAITER_QUEUE_LOCKED`].
    WaiterQueueLocked,
    /// See [`HAS_WAITERS`].
    HasWaiters,
}

impl Flag {
    /// Returns the bit mask of the field.
    #[inline]
    pub(crate) const fn mask(self) -> usize {
        match self {
            Flag::Locked => LOCKED,
            Flag::WaiterQueueLocked => WAITER_QUEUE_LOCKED,
            Flag::HasWaiters => HAS_WAITERS,
        }
    }

    /// Reads the field out of `state`.
    #[inline]
    pub(crate) const fn decode(self, state: usize) -> bool {
        state & self.mask() != 0
    }

    /// Returns `state` with only this field set to `value`.
    #[inline]
    pub(crate) const fn update(self, state: usize, value: bool) -> usize {
        if value {
            state | self.mask()
        } else {
            state & !self.mask()
        }
    }
}

/// Tries to flip `flag` from `false` to `true`.
///
/// `expected` is first forced to have the bit cleared. On failure it is refreshed with the
/// observed value; on success it keeps the value the word held right before the bit was set.
#[inline]
pub(crate) fn try_lock_bit(state: &AtomicUsize, flag: Flag, expected: &mut usize) -> bool {
    *expected = flag.update(*expected, false);
    match state.compare_exchange_weak(*expected, flag.update(*expected, true), Acquire, Relaxed) {
        Ok(_) => true,
        Err(observed) => {
            *expected = observed;
            false
        }
    }
}

/// Extracts the queue head pointer from `state`.
///
/// Only meaningful while the waiter queue lock is held.
#[inline]
pub(crate) fn head(state: usize) -> *const WaitQueueNode {
    let addr = state & HEAD_MASK;
    if addr == 0 {
        return null();
    }
    with_exposed_provenance(addr)
}

/// Returns `state` with the queue head replaced by `head`, keeping `HAS_WAITERS` in sync.
#[inline]
pub(crate) fn with_head(state: usize, head: *const WaitQueueNode) -> usize {
    let addr = head.expose_provenance();
    debug_assert_eq!(addr & !HEAD_MASK, 0);

    let state = state & !(HEAD_MASK | HAS_WAITERS);
    if addr == 0 {
        state
    } else {
        state | addr | HAS_WAITERS
    }
}
