// Cross-session consistency: chat list versioning and per-chat locks.
//
// Lock ordering when more than one is held:
//   aggregate mutex -> chat lock slot -> chat record -> metadata scope

pub mod lock;
pub mod version;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use lock::{ChatLockManager, LockOutcome, LockState, StreamingGuard};
pub use version::{Version, VersionController, Versioned};

// Poisoned std locks still hold consistent data here: every critical section
// either completes its mutation or returns before touching state.

pub(crate) fn lock_guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_guard<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_guard<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
