use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the inner state if a previous holder panicked.
///
/// Every mutex in this crate guards maps, queues or counters that stay
/// structurally valid across a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Mutex poisoned - recovering inner state");
            poisoned.into_inner()
        }
    }
}
