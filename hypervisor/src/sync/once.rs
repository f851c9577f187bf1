//! One-time initialization for process-wide, read-only-after-init values.
//!
//! The first caller runs the initializer; every racing caller spins with [`Backoff`] until the
//! value is published. After that, reads are a single acquire load.

use {
    super::Backoff,
    core::{
        cell::UnsafeCell,
        mem::MaybeUninit,
        sync::atomic::{
            AtomicU8,
            Ordering::{Acquire, Relaxed, Release},
        },
    },
};

const UNINITIALIZED: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETE: u8 = 2;

pub struct OnceInit<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send + Sync> Sync for OnceInit<T> {}
unsafe impl<T: Send> Send for OnceInit<T> {}

impl<T> OnceInit<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns the value, running `init` if no caller has done so yet.
    ///
    /// `init` runs exactly once across all callers. It must not call back into the same
    /// `OnceInit`, or the caller spins forever.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        match self.state.compare_exchange(UNINITIALIZED, RUNNING, Acquire, Acquire) {
            Ok(_) => {
                // Safety: only the thread that won the transition to RUNNING writes the slot.
                unsafe { (*self.value.get()).write(init()) };
                self.state.store(COMPLETE, Release);
            }
            Err(COMPLETE) => {}
            Err(_) => {
                let mut backoff = Backoff::new();
                while self.state.load(Acquire) != COMPLETE {
                    backoff.spin();
                }
            }
        }

        // Safety: the state is COMPLETE, so the slot was written and is never written again.
        unsafe { (*self.value.get()).assume_init_ref() }
    }

    pub fn get(&self) -> Option<&T> {
        if self.state.load(Acquire) == COMPLETE {
            // Safety: see `get_or_init`.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.load(Relaxed) == COMPLETE
    }
}

impl<T> Default for OnceInit<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for OnceInit<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == COMPLETE {
            // Safety: the slot holds an initialized value that nobody else can reach anymore.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}
