//! The busy-waiting raw lock.
//!
//! Grounded on `kernel-rs/src/lock/spinlock.rs`'s `RawSpinlock`, simplified
//! for a single hart: the teacher tracks the *owning* `Cpu` pointer because
//! several harts can race to acquire the same lock. On one hart the only
//! concurrent actor is an interrupt handler, so `push_off`/`pop_off` (kept,
//! same names, same nesting discipline) already rules that out by disabling
//! interrupts for the duration of the critical section; `locked` only needs
//! to catch a buggy recursive acquire from the same thread.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{Lock, RawLock};

pub struct RawSpinlock {
    name: &'static str,
    locked: AtomicBool,
}

pub type Spinlock<T> = Lock<RawSpinlock, T>;
pub type SpinlockGuard<'s, T> = super::Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
        }
    }
}

impl RawLock for RawSpinlock {
    fn acquire(&self) {
        // SAFETY: paired with `pop_off` in `release`.
        unsafe { push_off() };
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug_assert!(false, "acquire: {} is already held on this hart", self.name);
            spin_loop();
        }
    }

    fn release(&self) {
        assert!(self.holding(), "release: {} not held", self.name);
        self.locked.store(false, Ordering::Release);
        // SAFETY: paired with `push_off` in `acquire`.
        unsafe { pop_off() };
    }

    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T> Spinlock<T> {
    pub const fn new_named(name: &'static str, data: T) -> Self {
        Lock::new(RawSpinlock::new(name), data)
    }
}

/// Nesting depth of `push_off` calls on this hart.
static NOFF: AtomicUsize = AtomicUsize::new(0);
/// Whether interrupts were enabled before the outermost `push_off`.
static INTENA: AtomicBool = AtomicBool::new(false);

/// Disable interrupts, remembering the previous state the first time this is
/// called while already nested. Must be paired with [`pop_off`].
///
/// # Safety
/// Every `push_off` must be matched by exactly one `pop_off`.
pub unsafe fn push_off() {
    let was_enabled = crate::hal::intr_get();
    // SAFETY: disabling interrupts has no memory-safety precondition.
    unsafe { crate::hal::intr_off() };
    if NOFF.load(Ordering::Relaxed) == 0 {
        INTENA.store(was_enabled, Ordering::Relaxed);
    }
    NOFF.fetch_add(1, Ordering::Relaxed);
}

/// Undo one [`push_off`]. Once the nesting count reaches zero, interrupts
/// are restored to whatever they were before the outermost `push_off`.
///
/// # Safety
/// Must be called exactly once per `push_off`, and interrupts must still be
/// disabled (a `push_off`'d region must not have re-enabled them itself).
pub unsafe fn pop_off() {
    assert!(!crate::hal::intr_get(), "pop_off: interruptible");
    let prev = NOFF.load(Ordering::Relaxed);
    assert!(prev >= 1, "pop_off: not nested");
    NOFF.store(prev - 1, Ordering::Relaxed);
    if prev - 1 == 0 && INTENA.load(Ordering::Relaxed) {
        // SAFETY: restoring a previously-observed enabled state.
        unsafe { crate::hal::intr_on() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_excludes_reentry_detection() {
        let l = Spinlock::new_named("test", 0u32);
        {
            let mut g = l.lock();
            *g += 1;
        }
        let g = l.lock();
        assert_eq!(*g, 1);
    }
}
