//! [`Config`] defines how long a [`Mutex`](crate::Mutex) spins before blocking.

use std::fmt;
#[cfg(not(feature = "loom"))]
use std::hint::spin_loop;

#[cfg(feature = "loom")]
use loom::hint::spin_loop;

/// [`Config`] defines the spinning policy of a [`Mutex`](crate::Mutex).
///
/// The values only affect performance: any positive values keep the mutex correct, since a
/// thread always falls back to blocking once the spin budget is spent.
pub trait Config: fmt::Debug + Default {
    /// Defines the number of spin-loop hints to issue before entering the wait queue.
    #[inline]
    #[must_use]
    fn spin_count() -> usize {
        if cfg!(feature = "loom") { 1 } else { 64 }
    }

    /// Defines the cap of the exponential backoff between lock attempts.
    #[inline]
    #[must_use]
    fn max_backoff() -> usize {
        16
    }

    /// Defines the backoff function to use when spinning.
    #[inline]
    fn backoff(backoff: usize) {
        for _ in 0..backoff {
            spin_loop();
        }
    }
}

/// Default configuration for [`Mutex`](crate::Mutex).
#[derive(Debug, Default)]
pub struct DefaultConfig;

impl Config for DefaultConfig {}
