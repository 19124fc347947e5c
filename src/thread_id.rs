//! [`ThreadId`] identifies lock owners and waiters.

use std::num::NonZeroU64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// Stable, comparable identity of an OS thread.
///
/// Unlike [`std::thread::ThreadId`], it can be stored in an atomic integer, which lets a
/// [`Mutex`](crate::Mutex) record its owner without a lock.
///
/// # Examples
///
/// ```
/// use waitlock::ThreadId;
///
/// let id = ThreadId::current();
/// assert_eq!(id, ThreadId::current());
/// assert_ne!(id, std::thread::spawn(ThreadId::current).join().unwrap());
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ThreadId(NonZeroU64);

/// Next identity to hand out.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[cfg(not(feature = "loom"))]
thread_local! {
    static CURRENT: ThreadId = ThreadId::allocate();
}

#[cfg(feature = "loom")]
loom::thread_local! {
    static CURRENT: ThreadId = ThreadId::allocate();
}

impl ThreadId {
    /// Returns the identity of the calling thread.
    #[inline]
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(|id| *id)
    }

    /// Returns the raw representation, which is never `0`.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }

    /// Converts a raw representation back, mapping `0` to `None`.
    #[inline]
    pub(crate) const fn from_u64(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    fn allocate() -> Self {
        let id = NEXT_ID.fetch_add(1, Relaxed);
        Self(NonZeroU64::new(id).unwrap_or(NonZeroU64::MAX))
    }
}
