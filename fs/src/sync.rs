//! Lock primitives, named for the roles they play in the file system.
//!
//! `SpinLock` guards identity fields (cache-slot bookkeeping) and is never
//! held across disk I/O; `SleepLock` guards content (inode data, buffer
//! data) and may be held across I/O. On a host both are backed by
//! `std::sync::Mutex`; the distinction is the discipline, which the
//! lock-ordering rules of the core are written in terms of, not the
//! implementation. Poisoning is treated as fatal: a panic while holding a
//! file-system lock leaves state that must not be trusted.

use std::{
    ops::{Deref, DerefMut},
    sync::{Condvar, Mutex, MutexGuard},
};

/// Short-critical-section lock. Never held across disk I/O or while
/// acquiring a [`SleepLock`].
pub struct SpinLock<T>(Mutex<T>);

pub struct SpinLockGuard<'a, T>(MutexGuard<'a, T>);

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self(Mutex::new(data))
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        SpinLockGuard(self.0.lock().expect("spin lock poisoned"))
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// Long-term content lock; the holder may sleep and perform disk I/O.
pub struct SleepLock<T>(Mutex<T>);

pub struct SleepLockGuard<'a, T>(MutexGuard<'a, T>);

impl<T> SleepLock<T> {
    pub const fn new(data: T) -> Self {
        Self(Mutex::new(data))
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        SleepLockGuard(self.0.lock().expect("sleep lock poisoned"))
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        match self.0.try_lock() {
            Ok(guard) => Some(SleepLockGuard(guard)),
            Err(std::sync::TryLockError::WouldBlock) => None,
            Err(std::sync::TryLockError::Poisoned(_)) => panic!("sleep lock poisoned"),
        }
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// Condition variable paired with a [`SpinLock`]; used by the log to
/// throttle transactions against log capacity.
pub struct CondVar(Condvar);

impl CondVar {
    pub const fn new() -> Self {
        Self(Condvar::new())
    }

    pub fn wait<'a, T>(&self, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        SpinLockGuard(self.0.wait(guard.0).expect("spin lock poisoned"))
    }

    pub fn notify_all(&self) {
        self.0.notify_all();
    }
}
