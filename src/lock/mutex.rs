//! A recursive, thread-owned lock (spec.md §4.3).
//!
//! None of the teacher's lock types are reentrant: `Sleeplock` and
//! `Spinlock` both assert against a second acquire by the same owner rather
//! than allowing it. This type has no direct teacher counterpart; it is
//! built from the same pieces the teacher uses for its sleep lock
//! (`kernel-rs/src/lock/sleeplock.rs`'s "try to take it, else sleep on a
//! condition and retry" loop) plus this crate's [`super::Condition`], with
//! an explicit owner-thread-id and recursion count standing in for the
//! teacher's `Sleeplock::locked: bool`.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::{Condition, Spinlock};

struct MutexState {
    /// Thread id currently holding the lock, if any.
    owner: Option<usize>,
    /// Number of times `owner` has acquired without a matching release.
    depth: usize,
}

pub struct Mutex<T> {
    state: Spinlock<MutexState>,
    released: Condition,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through a `MutexGuard`, which only exists
// while `state.owner` names the calling thread.
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            state: Spinlock::new_named(
                "mutex",
                MutexState {
                    owner: None,
                    depth: 0,
                },
            ),
            released: Condition::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock. If the calling thread already holds it, increments
    /// the recursion depth instead of deadlocking.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let tid = crate::proc::scheduler::current_tid();
        let mut st = self.state.lock();
        loop {
            match st.owner {
                Some(owner) if owner == tid => {
                    st.depth += 1;
                    break;
                }
                None => {
                    st.owner = Some(tid);
                    st.depth = 1;
                    break;
                }
                Some(_) => self.released.wait(&mut st),
            }
        }
        drop(st);
        MutexGuard { mutex: self }
    }

    /// True iff the calling thread currently holds this lock.
    pub fn held_by_current(&self) -> bool {
        let tid = crate::proc::scheduler::current_tid();
        self.state.lock().owner == Some(tid)
    }

    fn unlock(&self) {
        let mut st = self.state.lock();
        debug_assert_eq!(st.owner, Some(crate::proc::scheduler::current_tid()));
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = None;
            drop(st);
            self.released.signal();
        }
    }
}

pub struct MutexGuard<'s, T> {
    mutex: &'s Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means the current thread is `owner`.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means the current thread is `owner`.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
