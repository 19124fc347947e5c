//! Implementations of locking traits from the [`lock_api`](https://crates.io/crates/lock_api) crate.

use std::time::{Duration, Instant};

use crate::config::{Config, DefaultConfig};
use crate::mutex::Mutex;
use crate::thread_id::ThreadId;

/// A mutual exclusion primitive protecting shared data of type `T` with a [`Mutex`].
///
/// # Examples
///
/// ```
/// use waitlock::DataMutex;
///
/// let mutex: DataMutex<usize> = DataMutex::new(0);
/// *mutex.lock() += 1;
/// assert_eq!(*mutex.lock(), 1);
/// ```
pub type DataMutex<T, C = DefaultConfig> = ::lock_api::Mutex<Mutex<C>, T>;

/// An RAII implementation of a scoped [`DataMutex`] lock.
///
/// The guard cannot be sent to another thread since the lock records its owning thread.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use waitlock::{DataMutex, DataMutexGuard};
///
/// let mutex: DataMutex<usize> = DataMutex::new(0);
/// let mut guard: DataMutexGuard<usize> = mutex.try_lock_for(Duration::from_millis(1)).unwrap();
/// *guard += 1;
/// drop(guard);
///
/// assert_eq!(*mutex.try_lock().unwrap(), 1);
/// ```
pub type DataMutexGuard<'a, T, C = DefaultConfig> = ::lock_api::MutexGuard<'a, Mutex<C>, T>;

unsafe impl<C: Config> ::lock_api::RawMutex for Mutex<C> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Mutex::with_config();

    type GuardMarker = ::lock_api::GuardNoSend;

    #[inline]
    fn lock(&self) {
        Mutex::lock(self, ThreadId::current());
    }

    #[inline]
    fn try_lock(&self) -> bool {
        Mutex::try_lock(self)
    }

    #[inline]
    unsafe fn unlock(&self) {
        Mutex::unlock(self, ThreadId::current());
    }

    #[inline]
    fn is_locked(&self) -> bool {
        Mutex::is_locked(self)
    }
}

unsafe impl<C: Config> ::lock_api::RawMutexTimed for Mutex<C> {
    type Duration = Duration;
    type Instant = Instant;

    #[inline]
    fn try_lock_for(&self, timeout: Self::Duration) -> bool {
        self.lock_for(ThreadId::current(), timeout)
    }

    #[inline]
    fn try_lock_until(&self, timeout: Self::Instant) -> bool {
        self.lock_for(
            ThreadId::current(),
            timeout.saturating_duration_since(Instant::now()),
        )
    }
}
