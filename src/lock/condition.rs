//! Condition variables (spec.md §4.3).
//!
//! Unlike `kernel-rs/src/proc/wait_channel.rs`'s `WaitChannel`, which wakes
//! threads by scanning every process table slot for a matching waitchannel
//! pointer, this crate keeps an explicit FIFO list of waiting thread ids per
//! `Condition` and hands them to the scheduler's ready queue in wait order.
//! The monitor discipline (release the protecting lock, suspend, reacquire
//! on wakeup) is the same one `WaitChannel::sleep` uses, built here on top of
//! `Guard::reacquire_after` instead of a bespoke `sched()` call.

use arrayvec::ArrayVec;

use super::{Guard, RawLock, Spinlock};
use crate::param::NTHR;

pub struct Condition {
    waiters: Spinlock<ArrayVec<usize, NTHR>>,
}

impl Condition {
    pub const fn new() -> Self {
        Self {
            waiters: Spinlock::new_named("condition", ArrayVec::new()),
        }
    }

    /// Atomically release `guard`'s lock and suspend the calling thread;
    /// reacquires the lock before returning. The caller must re-check its
    /// wait predicate in a loop (spurious wakeups are possible: a thread
    /// woken by [`Condition::broadcast`] competes with others for whatever
    /// state it was waiting on).
    pub fn wait<R: RawLock, T>(&self, guard: &mut Guard<'_, R, T>) {
        let tid = crate::proc::scheduler::current_tid();
        self.waiters
            .lock()
            .try_push(tid)
            .expect("Condition: more waiters than threads exist");
        guard.reacquire_after(|| {
            crate::proc::scheduler::suspend_current();
        });
    }

    /// Wake the longest-waiting thread, if any.
    pub fn signal(&self) {
        let mut w = self.waiters.lock();
        if w.is_empty() {
            return;
        }
        let tid = w.remove(0);
        drop(w);
        crate::proc::scheduler::make_ready(tid);
    }

    /// Wake every waiting thread, in the order they started waiting.
    pub fn broadcast(&self) {
        let mut w = self.waiters.lock();
        let woken: ArrayVec<usize, NTHR> = w.drain(..).collect();
        drop(w);
        for tid in woken {
            crate::proc::scheduler::make_ready(tid);
        }
    }
}
