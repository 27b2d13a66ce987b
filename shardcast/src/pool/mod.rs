//! # Dispatcher Pool
//!
//! Sharded fan-out/fan-in execution of work units.
//!
//! - `shard`: contiguous partition of the unit list
//! - `worker`: one thread per shard running jobs in FIFO order
//! - `tracker`: per-job report collection and blocking waits
//! - `collector`: single thread routing worker reports to trackers
//! - `dispatcher`: the public submit/terminate API
//! - `manager`: per-kind dispatcher registry

mod collector;
pub mod config;
pub mod dispatcher;
pub mod manager;
pub mod shard;
mod tracker;
mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, DispatcherBuilder, DispatcherMetrics, DispatcherState};
pub use manager::{ManagerKind, ManagerSet};
pub use shard::partition;
pub use worker::WorkerState;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
