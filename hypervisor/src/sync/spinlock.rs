//! A spinlock with exponential backoff.
//!
//! `try_lock` is a single compare-and-swap. `lock` retries the compare-and-swap, spinning on a
//! plain load with a doubling delay between attempts so waiters do not hammer the cache line.

use {
    super::Backoff,
    core::{
        cell::UnsafeCell,
        ops::{Deref, DerefMut},
        sync::atomic::{
            AtomicBool,
            Ordering::{Acquire, Relaxed, Release},
        },
    },
};

pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}
unsafe impl<T> Send for SpinLock<T> where T: Send {}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Attempts to take the lock with exactly one compare-and-swap.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Acquire, Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    /// Spins until the lock is taken.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let mut backoff = Backoff::new();

        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }

            // Wait for the lock to look free before the next compare-and-swap.
            while self.locked.load(Relaxed) {
                backoff.spin();
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard exists only while the lock is held.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard exists only while the lock is held.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Release);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        proptest::prelude::*,
        std::{sync::Arc, thread},
    };

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(0u32);

        let guard = lock.try_lock().expect("uncontended lock");
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());

        drop(guard);
        assert!(!lock.is_locked());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn lock_serializes_increments() {
        let lock = Arc::new(SpinLock::new(0u64));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(*lock.lock(), 80_000);
    }

    proptest! {
        #[test]
        fn guard_sees_last_write(values in proptest::collection::vec(any::<u32>(), 1..32)) {
            let lock = SpinLock::new(0u32);
            for v in &values {
                *lock.lock() = *v;
            }
            prop_assert_eq!(lock.into_inner(), *values.last().unwrap());
        }
    }
}
