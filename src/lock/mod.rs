//! Lock primitives (spec.md §4.3).
//!
//! Grounded on `kernel-rs-lib/src/lock.rs`'s `RawLock`/`Lock<R, T>`/`Guard`
//! triad: a raw lock supplies `acquire`/`release`, and `Lock<R, T>` pairs one
//! with an `UnsafeCell<T>` so the guard is the only way to reach `T`. This
//! crate drops the teacher's `Pin`/`StrongPin` machinery (`T: !Unpin`
//! support exists there for self-referential kernel data this crate doesn't
//! have) and always implements plain `Deref`/`DerefMut`.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

mod condition;
mod mutex;
mod spinlock;

pub use condition::Condition;
pub use mutex::{Mutex, MutexGuard};
pub use spinlock::{pop_off, push_off, RawSpinlock, Spinlock, SpinlockGuard};

/// A type that can be acquired and released to provide mutual exclusion.
pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
    /// True iff the current thread holds this lock. Used for assertions and
    /// by [`Condition::wait`] to hand the lock back to its caller.
    fn holding(&self) -> bool;
}

/// Mutual exclusion around `data: T`, generic over the acquire/release
/// strategy `R`.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever granted through a `Guard`, which is
// only constructed while `lock` is held.
unsafe impl<R: RawLock, T: Send> Sync for Lock<R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    pub const fn new(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    pub fn raw(&self) -> &R {
        &self.lock
    }

    /// Returns a mutable reference to the inner data, bypassing the lock.
    ///
    /// # Safety
    /// The caller must ensure no other access to `data` is concurrently in
    /// progress.
    pub unsafe fn get_mut_unchecked(&self) -> *mut T {
        self.data.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// RAII guard: releases the lock on drop, derefs to `&T`/`&mut T`.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
}

impl<'s, R: RawLock, T> Guard<'s, R, T> {
    pub fn lock_ref(&self) -> &'s Lock<R, T> {
        self.lock
    }

    /// Temporarily release the lock, run `f`, then reacquire it.
    ///
    /// Grounded on `kernel-rs-lib/src/lock.rs`'s `Guard::reacquire_after`,
    /// used by [`Condition::wait`] to sleep without holding the condition's
    /// lock.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.lock.lock.release();
        let result = f();
        self.lock.lock.acquire();
        result
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means `lock` is held by us.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means `lock` is held by us.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}
