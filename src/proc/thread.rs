//! The scheduling unit (spec.md §4.3): saved kernel context, run state, and
//! the condition the thread is parked on, if any.
//!
//! Grounded on `kernel-rs/src/proc.rs`'s `Context`/`Procstate`/`Proc`. The
//! teacher folds thread state and process state (open files, address space,
//! pid) into one `Proc`; this crate splits them, matching spec.md's module
//! boundary between the scheduler (§4.3) and the process manager (§4.7) —
//! a `Thread` here is closer to the teacher's `Context` + scheduling fields
//! alone, with `crate::process::Process` playing the role of the rest of
//! `Proc`.

use crate::param::MAXTHREADNAME;

/// Saved callee-saved registers for a kernel context switch.
///
/// Field layout mirrors `kernel-rs/src/proc.rs`'s `Context`; the actual
/// save/restore sequence lives in the trap/context-switch assembly, which
/// spec.md §1 scopes out as an external collaborator reachable only through
/// [`crate::hal`].
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s: [usize; 12],
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ThreadState {
    Unused,
    Ready,
    Running,
    /// Parked on a [`crate::lock::Condition`] or equivalent; never directly
    /// observable on the ready queue.
    Sleeping,
    /// Finished but not yet joined.
    Zombie,
}

pub struct Thread {
    pub id: usize,
    pub state: ThreadState,
    pub context: Context,
    pub name: [u8; MAXTHREADNAME],
    /// Owning process, if this thread belongs to one (the idle thread and
    /// the bootstrap thread do not).
    pub owner: Option<usize>,
    /// Kernel stack page, allocated when the thread is created and held for
    /// its whole lifetime.
    pub kstack: Option<crate::page::Page>,
    /// The thread that `join`-ing this one as a child waits on it, and
    /// which it is reparented away from once it exits. `None` for the
    /// bootstrap thread, which has no parent.
    pub parent: Option<usize>,
    /// Physical address of this thread's address space's root page table, if
    /// it has one distinct from the kernel's own (the idle/bootstrap thread
    /// runs with the MMU still pointed at whatever the boot path installed).
    /// Read by the scheduler loop on every dispatch so a process's threads
    /// always run against the right address space (spec.md §4.3).
    pub mspace_root: Option<crate::addr::PAddr>,
}

impl Thread {
    pub const fn new(id: usize) -> Self {
        Self {
            id,
            state: ThreadState::Unused,
            context: Context {
                ra: 0,
                sp: 0,
                s: [0; 12],
            },
            name: [0; MAXTHREADNAME],
            owner: None,
            kstack: None,
            parent: None,
            mspace_root: None,
        }
    }

    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(MAXTHREADNAME - 1);
        self.name = [0; MAXTHREADNAME];
        self.name[..n].copy_from_slice(&bytes[..n]);
    }
}
