pub mod configuration;
pub mod controller;
pub mod host;
pub mod repeater;
pub mod scheduler;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use configuration::Configuration;
pub use controller::{Controller, ControllerOptions, DeviceTransport, LoggingTransport};
pub use repeater::CommandRepeater;
pub use scheduler::{Scheduler, SchedulerOptions, SetpointSink};

/// Locks are only held for short, non-panicking sections; a poisoned lock
/// still guards consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
