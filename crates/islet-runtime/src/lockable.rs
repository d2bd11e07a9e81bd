//! Guarded-resource wrappers: a reader/writer lock with pointer-semantics
//! guards, and a waitable variant adding a condition variable for
//! predicate-based parking.

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A value behind a reader/writer lock.
pub struct Lockable<T> {
    inner: RwLock<T>,
}

impl<T> Lockable<T> {
    pub fn new(value: T) -> Self {
        Lockable {
            inner: RwLock::new(value),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }
}

impl<T: Default> Default for Lockable<T> {
    fn default() -> Self {
        Lockable::new(T::default())
    }
}

/// A value behind a mutex with a condition variable, for consumers that need
/// to park until the resource satisfies a predicate.
pub struct Waitable<T> {
    inner: Mutex<T>,
    condvar: Condvar,
}

impl<T> Waitable<T> {
    pub fn new(value: T) -> Self {
        Waitable {
            inner: Mutex::new(value),
            condvar: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Park until `predicate` returns true. The predicate is re-evaluated on
    /// every wakeup under the lock.
    pub fn wait_until<F: FnMut(&mut T) -> bool>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        mut predicate: F,
    ) {
        while !predicate(guard) {
            self.condvar.wait(guard);
        }
    }

    pub fn notify_one(&self) {
        self.condvar.notify_one();
    }

    pub fn notify_all(&self) {
        self.condvar.notify_all();
    }
}

impl<T: Default> Default for Waitable<T> {
    fn default() -> Self {
        Waitable::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn read_write_guards() {
        let lock = Lockable::new(1);
        assert_eq!(*lock.read(), 1);
        *lock.write() += 1;
        assert_eq!(*lock.read(), 2);
    }

    #[test]
    fn waitable_parks_until_predicate() {
        let shared = Arc::new(Waitable::new(false));
        let writer = Arc::clone(&shared);
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            *writer.lock() = true;
            writer.notify_all();
        });
        let mut guard = shared.lock();
        shared.wait_until(&mut guard, |ready| *ready);
        assert!(*guard);
        drop(guard);
        thread.join().unwrap();
    }
}
