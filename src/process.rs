//! Process manager (spec.md §4.7): per-process descriptor table, fork,
//! exec, exit, wired on top of the scheduler (`crate::proc`), the address
//! space manager (`crate::vm`), and the I/O object table (`crate::io`).
//!
//! Grounded on `examples/original_source/sys/process.c`'s `struct process`/
//! `procmgr_init`/`process_fork`/`process_exec`/`process_exit`/
//! `build_stack`/`fork_func`, translated from its static `proctab[NPROC]`
//! array of heap-allocated `struct process *` (this crate has no heap
//! allocator) to a fixed `[Option<Process>; NPROC]`, and from its
//! `condition`-on-the-stack-of-the-parent idiom to a sidecar wait/ready
//! table (spec.md §9 explicitly asks for a sidecar map over pointer
//! arithmetic when a proof-free Rust translation needs an indirect handle).

use array_macro::array;

use crate::addr::{Addr, VmAddr};
use crate::error::{Error, KResult};
use crate::hal::{self, TrapFrame};
use crate::io::IoObject;
use crate::kernel;
use crate::lock::{Condition, Spinlock};
use crate::param::{MAXARG, NPROC, NTHR, PAGE_SIZE, PROCESS_IOMAX, USTACK_VA};
use crate::proc::scheduler;
use crate::vm::AddrSpace;

/// One user process: its address space and its table of open descriptors
/// (spec.md §4.7's `{idx, tid, mspace, iotab[PROCESS_IOMAX]}`). `idx` is
/// this process's slot in [`PROCTAB`], stable for its lifetime.
pub struct Process {
    idx: usize,
    tid: usize,
    mspace: AddrSpace,
    iotab: [Option<IoObject>; PROCESS_IOMAX],
}

impl Process {
    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn tid(&self) -> usize {
        self.tid
    }

    pub fn mspace(&self) -> &AddrSpace {
        &self.mspace
    }
}

struct ProcTable {
    procs: [Option<Process>; NPROC],
}

static PROCTAB: Spinlock<ProcTable> = Spinlock::new_named(
    "process.table",
    ProcTable {
        procs: array![_ => None; NPROC],
    },
);

/// Build process 0, the boot/main process, wrapping whichever thread calls
/// this (expected to be the bootstrap thread, tid 0) and the address space
/// `boot` has already built (identity-mapped kernel RAM/MMIO plus whatever
/// the init program needs). Call exactly once, before the scheduler loop
/// starts dispatching and before any syscall can run.
pub fn init_main_process(mspace: AddrSpace) -> KResult<()> {
    let tid = scheduler::current_tid();
    let root = mspace.root_addr();
    let mut iotab: [Option<IoObject>; PROCESS_IOMAX] = array![_ => None; PROCESS_IOMAX];
    iotab[0] = Some(IoObject::new_null()?);

    PROCTAB.lock().procs[0] = Some(Process {
        idx: 0,
        tid,
        mspace,
        iotab,
    });

    scheduler::set_owner(tid, Some(0));
    scheduler::set_mspace_root(tid, Some(root));
    Ok(())
}

fn current_idx() -> KResult<usize> {
    scheduler::owner_of(scheduler::current_tid()).ok_or(Error::Inval)
}

/// Run `f` against the caller's address space. `syscall` uses this to
/// validate and translate user pointers before a trap frame's raw
/// addresses ever get dereferenced.
pub fn with_current_mspace<R>(f: impl FnOnce(&AddrSpace) -> R) -> KResult<R> {
    let idx = current_idx()?;
    let table = PROCTAB.lock();
    let proc = table.procs[idx]
        .as_ref()
        .expect("process: current process vanished");
    Ok(f(&proc.mspace))
}

fn fd_slot(fd: isize) -> KResult<usize> {
    if fd < 0 || fd as usize >= PROCESS_IOMAX {
        return Err(Error::BadFd);
    }
    Ok(fd as usize)
}

fn pick_or_validate_fd(proc: &Process, fd: isize) -> KResult<usize> {
    if fd >= PROCESS_IOMAX as isize {
        return Err(Error::BadFd);
    }
    if fd >= 0 {
        return Ok(fd as usize);
    }
    proc.iotab
        .iter()
        .position(|slot| slot.is_none())
        .ok_or(Error::MFile)
}

/// Install `io` into the caller's descriptor table at `fd` (if `fd >= 0`
/// and currently empty) or the lowest-numbered free slot (if `fd < 0`),
/// matching `sysdevopen`/`sysfsopen`'s shared "allocate-or-use" rule.
/// Returns the descriptor actually used.
pub fn install_fd(fd: isize, io: IoObject) -> KResult<usize> {
    let idx = current_idx()?;
    let mut table = PROCTAB.lock();
    let proc = table.procs[idx]
        .as_mut()
        .expect("process: current process vanished");
    let slot = pick_or_validate_fd(proc, fd)?;
    proc.iotab[slot] = Some(io);
    Ok(slot)
}

/// Drop the caller's descriptor `fd`. Closing is implicit: once no
/// [`IoObject`] handle anywhere references the underlying endpoint, its
/// `Drop` impl releases it.
pub fn close_fd(fd: isize) -> KResult<()> {
    let idx = current_idx()?;
    let mut table = PROCTAB.lock();
    let proc = table.procs[idx]
        .as_mut()
        .expect("process: current process vanished");
    let slot = fd_slot(fd)?;
    if proc.iotab[slot].take().is_none() {
        return Err(Error::BadFd);
    }
    Ok(())
}

/// Duplicate descriptor `old` into `new` (or, if `new < 0`, the lowest free
/// slot), giving both descriptors their own handle onto the same
/// underlying endpoint (spec.md §4.7 `iodup`).
pub fn dup_fd(old: isize, new: isize) -> KResult<usize> {
    let handle = fd_handle(old)?;
    install_fd(new, handle)
}

/// Clone the caller's handle for `fd` without consuming the descriptor
/// (used by `read`/`write`/`ioctl`, which must not hold [`PROCTAB`]'s lock
/// across a potentially blocking I/O call — a pipe read/write can suspend
/// the calling thread, and suspending while holding a spinlock is exactly
/// the deadlock `crate::lock::Spinlock`'s `push_off` discipline exists to
/// prevent).
fn fd_handle(fd: isize) -> KResult<IoObject> {
    let idx = current_idx()?;
    let table = PROCTAB.lock();
    let proc = table.procs[idx]
        .as_ref()
        .expect("process: current process vanished");
    let slot = fd_slot(fd)?;
    proc.iotab[slot].clone().ok_or(Error::BadFd)
}

/// The caller's handle for `fd`, for `syscall::sysexec` to hand to
/// [`exec`] without exposing the rest of the descriptor table internals.
pub fn fd_io(fd: isize) -> KResult<IoObject> {
    fd_handle(fd)
}

pub fn read_fd(fd: isize, buf: &mut [u8]) -> KResult<usize> {
    fd_handle(fd)?.read(buf)
}

pub fn write_fd(fd: isize, buf: &[u8]) -> KResult<usize> {
    fd_handle(fd)?.write(buf)
}

pub fn ioctl_fd(fd: isize, cmd: crate::io::IoCtl) -> KResult<u64> {
    fd_handle(fd)?.ctrl(cmd)
}

/// Transfer `len` bytes between descriptor `fd` and the caller's own
/// virtual range `[va, va + len)`. `to_device` selects direction: `true` is
/// a write-type call (the kernel only reads the user buffer, then calls
/// [`IoObject::write`]); `false` is a read-type call (the kernel writes
/// into the user buffer, so the range must be mapped `W`, then calls
/// [`IoObject::read`]). The whole range is validated against the caller's
/// address space up front; then one page at a time, its physical address is
/// looked up under a fresh, short-lived lock acquisition and the actual I/O
/// call happens with no lock held at all, since that call can block (a pipe
/// can suspend the calling thread) and this process's own table lock must
/// never be held across a suspend.
pub fn io_transfer(fd: isize, va: usize, len: usize, to_device: bool) -> KResult<usize> {
    let io = {
        let idx = current_idx()?;
        let table = PROCTAB.lock();
        let proc = table.procs[idx]
            .as_ref()
            .expect("process: current process vanished");
        if len != 0 {
            proc.mspace
                .validate_vptr_len(VmAddr::from(va), len, !to_device)?;
        }
        let slot = fd_slot(fd)?;
        proc.iotab[slot].clone().ok_or(Error::BadFd)?
    };

    let mut done = 0;
    while done < len {
        let cur_va = va + done;
        let page_off = cur_va % PAGE_SIZE;
        let chunk = (PAGE_SIZE - page_off).min(len - done);
        let pa = {
            let idx = current_idx()?;
            let table = PROCTAB.lock();
            let proc = table.procs[idx]
                .as_ref()
                .expect("process: current process vanished");
            proc.mspace
                .translate(VmAddr::from(crate::addr::pgrounddown(cur_va)))
                .ok_or(Error::Inval)?
                .0
        };
        let chunk_pa = pa.into_usize() + page_off;
        // SAFETY: this exact range was validated against the caller's own,
        // currently-active address space above.
        let slice = unsafe { core::slice::from_raw_parts_mut(chunk_pa as *mut u8, chunk) };
        let n = if to_device {
            io.write(slice)
        } else {
            io.read(slice)
        }?;
        done += n;
        if n < chunk {
            break;
        }
    }
    Ok(done)
}

/// Create a pipe, installing its write end at `wfd` (or the lowest free
/// slot if negative) and its read end at `rfd` likewise, rejecting the
/// case where both resolve to the same descriptor (spec.md §4.7 `pipe`).
pub fn pipe_fds(wfd: isize, rfd: isize) -> KResult<(usize, usize)> {
    if wfd >= PROCESS_IOMAX as isize || rfd >= PROCESS_IOMAX as isize {
        return Err(Error::BadFd);
    }
    let idx = current_idx()?;
    let (w, r) = {
        let table = PROCTAB.lock();
        let proc = table.procs[idx]
            .as_ref()
            .expect("process: current process vanished");
        let w = if wfd < 0 {
            proc.iotab
                .iter()
                .position(|slot| slot.is_none())
                .ok_or(Error::MFile)?
        } else {
            wfd as usize
        };
        let r = if rfd < 0 {
            proc.iotab
                .iter()
                .enumerate()
                .position(|(i, slot)| i != w && slot.is_none())
                .ok_or(Error::MFile)?
        } else {
            rfd as usize
        };
        (w, r)
    };
    if w == r {
        return Err(Error::Inval);
    }

    let (read_end, write_end) = IoObject::new_pipe_pair()?;
    let mut table = PROCTAB.lock();
    let proc = table.procs[idx]
        .as_mut()
        .expect("process: current process vanished");
    proc.iotab[w] = Some(write_end);
    proc.iotab[r] = Some(read_end);
    Ok((w, r))
}

// FORK
//

/// One pending child's handed-off trap frame, indexed by the child's tid.
/// The sidecar map spec.md §9 asks for in place of container-of pointer
/// arithmetic: `fork` stashes the frame here before the child thread can
/// possibly run, and `fork_trampoline` (running as the child) takes it back
/// out by its own tid.
static FORK_SLOTS: Spinlock<[Option<TrapFrame>; NTHR]> =
    Spinlock::new_named("process.fork_slots", array![_ => None; NTHR]);

/// Which process slots have finished their post-fork setup and are ready to
/// release their waiting parent, guarded the same way `forked`'s predicate
/// is in the original source (checked under the condition's own lock,
/// looped on to survive spurious wakeups).
static FORK_READY: Spinlock<[bool; NPROC]> = Spinlock::new_named("process.fork_ready", [false; NPROC]);

static FORKED: Condition = Condition::new();

/// Spawn a child process that is a deep copy of the caller's address space
/// and descriptor table, resuming `tf` with `a0 = 0` (spec.md §4.7 `fork`).
/// Returns the child's tid to the parent.
pub fn fork(tf: &TrapFrame) -> KResult<usize> {
    let parent_tid = scheduler::current_tid();
    let parent_idx = current_idx()?;

    let pn = {
        let table = PROCTAB.lock();
        (1..NPROC)
            .find(|&i| table.procs[i].is_none())
            .ok_or(Error::MProc)?
    };

    let kstack = kernel::alloc_page()?;
    // SAFETY: `fork_trampoline` is a valid kernel entry point for a fresh
    // kernel stack; it reads its trap frame back out of `FORK_SLOTS` before
    // touching anything else.
    let child_tid = unsafe { scheduler::spawn(fork_trampoline, kstack, Some(parent_tid)) }
        .ok_or(Error::MThr)?;

    FORK_SLOTS.lock()[child_tid] = Some(*tf);

    let (child_mspace, iotab) = {
        let table = PROCTAB.lock();
        let parent = table.procs[parent_idx]
            .as_ref()
            .expect("fork: caller process vanished");
        let mspace = kernel::with_phys_alloc(|alloc| parent.mspace.clone_deep(alloc))?;
        let mut iotab: [Option<IoObject>; PROCESS_IOMAX] = array![_ => None; PROCESS_IOMAX];
        for (slot, src) in iotab.iter_mut().zip(parent.iotab.iter()) {
            *slot = src.clone();
        }
        (mspace, iotab)
    };
    let root = child_mspace.root_addr();

    PROCTAB.lock().procs[pn] = Some(Process {
        idx: pn,
        tid: child_tid,
        mspace: child_mspace,
        iotab,
    });
    scheduler::set_owner(child_tid, Some(pn));
    scheduler::set_mspace_root(child_tid, Some(root));

    let mut ready = FORK_READY.lock();
    while !ready[pn] {
        FORKED.wait(&mut ready);
    }
    ready[pn] = false;
    Ok(child_tid)
}

/// Entry point for a freshly spawned child thread, installed as its
/// `Context::ra` by [`scheduler::spawn`]. Picks its own stashed trap frame
/// back out of [`FORK_SLOTS`], zeroes its return value, wakes its waiting
/// parent, and jumps into user mode. Never returns.
extern "C" fn fork_trampoline() -> ! {
    let tid = scheduler::current_tid();
    let mut tf = FORK_SLOTS.lock()[tid]
        .take()
        .expect("fork_trampoline: no trap frame was stashed for this child");
    tf.set_return(0);

    let idx = scheduler::owner_of(tid).expect("fork_trampoline: child thread has no process");
    FORK_READY.lock()[idx] = true;
    FORKED.broadcast();

    // SAFETY: `tf` is the frame `fork` built for this child, inside the
    // address space `clone_deep` already installed for it (mapped in by
    // `scheduler::run`'s dispatch before this trampoline ever runs).
    unsafe { hal::jump_to_trap_frame(&tf) }
}

// EXEC
//

/// Pack `argv` onto the top of one stack page the way
/// `examples/original_source/sys/process.c`'s `build_stack` does: the
/// pointer array at the bottom of the used region, the NUL-terminated
/// argument bytes above it, 16-byte aligned per the RISC-V ABI, with every
/// pointer in the array rewritten to the address the user process will see
/// once the page is mapped at `USTACK_VA`. Returns the number of bytes used
/// (from the top of the page downward).
fn build_stack(buf: &mut [u8; PAGE_SIZE], argv: &[&[u8]]) -> KResult<usize> {
    const PTR: usize = core::mem::size_of::<usize>();
    if argv.len() + 1 > PAGE_SIZE / PTR {
        return Err(Error::NoMem);
    }

    let mut stksz = (argv.len() + 1) * PTR;
    for arg in argv {
        let argsz = arg.len() + 1;
        if PAGE_SIZE - stksz < argsz {
            return Err(Error::NoMem);
        }
        stksz += argsz;
    }
    stksz = (stksz + 15) & !15;
    debug_assert!(stksz <= PAGE_SIZE);

    let argv_off = PAGE_SIZE - stksz;
    let mut str_off = argv_off + (argv.len() + 1) * PTR;

    for (i, arg) in argv.iter().enumerate() {
        let user_addr = USTACK_VA + str_off;
        let ptr_off = argv_off + i * PTR;
        buf[ptr_off..ptr_off + PTR].copy_from_slice(&user_addr.to_ne_bytes());

        buf[str_off..str_off + arg.len()].copy_from_slice(arg);
        buf[str_off + arg.len()] = 0;
        str_off += arg.len() + 1;
    }
    let last_ptr_off = argv_off + argv.len() * PTR;
    buf[last_ptr_off..last_ptr_off + PTR].copy_from_slice(&0usize.to_ne_bytes());

    Ok(stksz)
}

/// Replace the calling process's image with the program read from `exeio`,
/// passing `argv` (spec.md §4.7 `exec`). On success, never returns to its
/// caller: the thread resumes in user mode at the new image's entry point
/// via [`hal::jump_to_trap_frame`]. On failure the caller's old address
/// space and descriptor table are untouched, so the syscall dispatcher can
/// just report the error back to the still-running old image — a
/// deliberate departure from the original source's `panic("elf did not
/// read correctly")`, which halted the whole machine on a malformed
/// executable.
pub fn exec(exeio: &IoObject, argv: &[&[u8]]) -> KResult<core::convert::Infallible> {
    if argv.len() > MAXARG {
        return Err(Error::Inval);
    }

    let idx = current_idx()?;

    let mut stack_page = kernel::alloc_page()?;
    stack_page.zero();
    let stksz = build_stack(
        stack_page
            .as_bytes_mut()
            .try_into()
            .expect("a freshly allocated page is exactly PAGE_SIZE bytes"),
        argv,
    )?;
    let stack_pa = stack_page.into_paddr();

    let entry = {
        let mut table = PROCTAB.lock();
        let proc = table.procs[idx]
            .as_mut()
            .expect("exec: caller process vanished");

        kernel::with_phys_alloc(|alloc| proc.mspace.reset(alloc));

        let stack_va = VmAddr::from(USTACK_VA);
        let perm = crate::vm::PteFlags::R | crate::vm::PteFlags::W | crate::vm::PteFlags::U;
        if let Err(e) =
            kernel::with_phys_alloc(|alloc| proc.mspace.map_page(stack_va, stack_pa, perm, alloc))
        {
            // SAFETY: `stack_pa` was just carved out by `into_paddr` above
            // and never published anywhere `map_page` could have retained it.
            kernel::with_phys_alloc(|alloc| unsafe { alloc.free(stack_pa, 1) });
            return Err(e);
        }

        match kernel::with_phys_alloc(|alloc| hal::elf_loader().load(exeio, &mut proc.mspace, alloc))
        {
            Ok(entry) => entry,
            Err(e) => return Err(e),
        }
    };

    let mut tf = TrapFrame::default();
    tf.a[0] = argv.len();
    tf.a[1] = USTACK_VA + PAGE_SIZE - stksz;
    tf.sp = USTACK_VA;
    tf.epc = entry.into_usize();
    tf.status = hal::default_user_status();

    // SAFETY: `tf` describes the image just mapped into the caller's own
    // (just-reset) address space, already installed as the active one.
    unsafe { hal::jump_to_trap_frame(&tf) }
}

// EXIT
//

/// Close every descriptor, flush the filesystem, tear down the address
/// space, then exit the underlying thread (spec.md §4.7 `exit`; never
/// returns). Closing the descriptors is implicit: destructuring `proc`
/// drops its `iotab` array, and each [`IoObject`]'s `Drop` impl releases
/// its reference.
pub fn exit() -> ! {
    let idx = current_idx().expect("process::exit: caller has no process");
    if idx == 0 {
        panic!("process::exit: the main process exited");
    }
    let proc = PROCTAB.lock().procs[idx]
        .take()
        .expect("process::exit: owner points at an empty slot");
    let Process { mspace, .. } = proc;

    crate::fs::flush();
    kernel::with_phys_alloc(|alloc| mspace.destroy(alloc));
    scheduler::exit_current()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_table() {
        let mut alloc = test_alloc();
        let mut table = PROCTAB.lock();
        table.procs = array![_ => None; NPROC];
        table.procs[0] = Some(Process {
            idx: 0,
            tid: 0,
            mspace: AddrSpace::new(&mut alloc).expect("test alloc"),
            iotab: array![_ => None; PROCESS_IOMAX],
        });
        scheduler::set_owner(0, Some(0));
    }

    fn test_alloc() -> crate::phys_alloc::PhysAlloc {
        // Tests only exercise descriptor-table bookkeeping, not paging, so a
        // handful of pages backed by a leaked heap buffer is plenty; nothing
        // in these tests ever calls `destroy`/`exit` to free it back.
        let buf: &'static mut [u8] = std::vec![0u8; 8 * PAGE_SIZE].leak();
        let start = crate::addr::pgroundup(buf.as_ptr() as usize);
        let end = crate::addr::pgrounddown(start + buf.len() - PAGE_SIZE);
        let mut a = crate::phys_alloc::PhysAlloc::new();
        // SAFETY: `buf` was just leaked, so this range is unmanaged and will
        // never be freed or reused by anything else.
        unsafe { a.init(crate::addr::PAddr::from(start), crate::addr::PAddr::from(end)) };
        a
    }

    #[test]
    fn install_fd_picks_lowest_free_slot() {
        reset_table();
        let a = install_fd(-1, IoObject::new_null().unwrap()).unwrap();
        let b = install_fd(-1, IoObject::new_null().unwrap()).unwrap();
        assert_eq!(a, 1); // slot 0 is occupied by the null stdio stream
        assert_eq!(b, 2);
    }

    #[test]
    fn install_fd_at_explicit_slot() {
        reset_table();
        let fd = install_fd(5, IoObject::new_null().unwrap()).unwrap();
        assert_eq!(fd, 5);
    }

    #[test]
    fn install_fd_rejects_out_of_range() {
        reset_table();
        assert_eq!(
            install_fd(PROCESS_IOMAX as isize, IoObject::new_null().unwrap()),
            Err(Error::BadFd)
        );
    }

    #[test]
    fn close_then_reuse_fd() {
        reset_table();
        let fd = install_fd(-1, IoObject::new_null().unwrap()).unwrap();
        close_fd(fd as isize).unwrap();
        assert_eq!(close_fd(fd as isize), Err(Error::BadFd));
        let again = install_fd(-1, IoObject::new_null().unwrap()).unwrap();
        assert_eq!(again, fd);
    }

    #[test]
    fn dup_fd_shares_the_same_endpoint() {
        reset_table();
        let fd = install_fd(-1, IoObject::new_null().unwrap()).unwrap();
        let dup = dup_fd(fd as isize, -1).unwrap();
        assert_ne!(fd, dup);
        read_fd(dup as isize, &mut []).unwrap();
    }

    #[test]
    fn pipe_rejects_matching_fds() {
        reset_table();
        assert_eq!(pipe_fds(3, 3), Err(Error::Inval));
    }
}
