#![deny(missing_docs, clippy::all, clippy::pedantic)]
#![doc = include_str!("../README.md")]

mod config;
pub use config::{Config, DefaultConfig};

pub mod condvar;
pub use condvar::Condvar;

pub mod mutex;
pub use mutex::Mutex;

mod thread_id;
pub use thread_id::ThreadId;

#[cfg(all(feature = "lock_api", not(feature = "loom")))]
mod lock_api;
#[cfg(all(feature = "lock_api", not(feature = "loom")))]
pub use self::lock_api::{DataMutex, DataMutexGuard};

mod state;
mod sync_primitive;
mod wait_queue;

#[cfg(test)]
mod tests;
