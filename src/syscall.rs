//! Syscall dispatch (spec.md §4.7 / §7): reads a syscall number and
//! arguments out of a trap frame, validates any user pointers it carries,
//! and calls through to `process`/`fs`/`hal`, converting the result to the
//! non-negative-or-error-code convention the trap-return assembly expects.
//!
//! Grounded on `examples/original_source/sys/syscall.c`'s `syscall()`
//! dispatch switch and its `sysXxx` handlers. The numbering itself
//! (`scnum.h` in the original) is an external, userland-fixed ABI contract
//! that spec.md §1 scopes out; [`SyscallNo`]'s discriminants are this
//! crate's own stand-in, not meant to match any specific userland.

use crate::addr::{Addr, VmAddr};
use crate::error::{Error, KResult};
use crate::hal::{self, TrapFrame};
use crate::io::IoCtl;
use crate::param::{MAXARG, MAXPATH, MAXPRINT, MAXTHREADNAME};
use crate::proc::scheduler;
use crate::process;
use crate::vm::AddrSpace;

#[repr(i64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyscallNo {
    Exit = 1,
    Exec = 2,
    Fork = 3,
    Wait = 4,
    Print = 5,
    Usleep = 6,
    DevOpen = 7,
    FsOpen = 8,
    FsCreate = 9,
    FsDelete = 10,
    Close = 11,
    Read = 12,
    Write = 13,
    Ioctl = 14,
    Pipe = 15,
    IoDup = 16,
}

impl SyscallNo {
    fn from_raw(n: usize) -> Option<Self> {
        Some(match n {
            1 => Self::Exit,
            2 => Self::Exec,
            3 => Self::Fork,
            4 => Self::Wait,
            5 => Self::Print,
            6 => Self::Usleep,
            7 => Self::DevOpen,
            8 => Self::FsOpen,
            9 => Self::FsCreate,
            10 => Self::FsDelete,
            11 => Self::Close,
            12 => Self::Read,
            13 => Self::Write,
            14 => Self::Ioctl,
            15 => Self::Pipe,
            16 => Self::IoDup,
            _ => return None,
        })
    }
}

/// Handle one trap into the kernel for a syscall: advance `epc` past the
/// `ecall` instruction, dispatch on `a7`, and write the result back into
/// `a0`. The advance-then-dispatch order matches the original's
/// `handle_syscall`, so a syscall that never returns (`exit`, a successful
/// `exec`) doesn't need its own `epc` bookkeeping.
pub fn handle_syscall(tf: &mut TrapFrame) {
    tf.epc += 4;
    let result = dispatch(tf);
    tf.set_return(result);
}

fn dispatch(tf: &TrapFrame) -> isize {
    let scnum = tf.arg(7);
    let result = match SyscallNo::from_raw(scnum) {
        Some(SyscallNo::Exit) => sys_exit(),
        Some(SyscallNo::Exec) => sys_exec(tf),
        Some(SyscallNo::Fork) => sys_fork(tf),
        Some(SyscallNo::Wait) => sys_wait(tf.arg(0) as isize),
        Some(SyscallNo::Print) => sys_print(tf.arg(0)),
        Some(SyscallNo::Usleep) => sys_usleep(tf.arg(0) as u64),
        Some(SyscallNo::DevOpen) => sys_devopen(tf.arg(0) as isize, tf.arg(1), tf.arg(2)),
        Some(SyscallNo::FsOpen) => sys_fsopen(tf.arg(0) as isize, tf.arg(1)),
        Some(SyscallNo::FsCreate) => sys_fscreate(tf.arg(0)),
        Some(SyscallNo::FsDelete) => sys_fsdelete(tf.arg(0)),
        Some(SyscallNo::Close) => sys_close(tf.arg(0) as isize),
        Some(SyscallNo::Read) => sys_read(tf.arg(0) as isize, tf.arg(1), tf.arg(2)),
        Some(SyscallNo::Write) => sys_write(tf.arg(0) as isize, tf.arg(1), tf.arg(2)),
        Some(SyscallNo::Ioctl) => sys_ioctl(tf.arg(0) as isize, tf.arg(1), tf.arg(2)),
        Some(SyscallNo::Pipe) => sys_pipe(tf.arg(0), tf.arg(1)),
        Some(SyscallNo::IoDup) => sys_iodup(tf.arg(0) as isize, tf.arg(1) as isize),
        None => Err(Error::NotSup),
    };
    match result {
        Ok(n) => n as isize,
        Err(e) => e.to_negative(),
    }
}

// USER-MEMORY ACCESS
//
// Every subsystem this kernel hands a syscall's payload to (`fs`, `hal`,
// `io`) works on plain Rust slices/`&str`, never on raw user virtual
// addresses. These helpers are the one place that bridges the two: they
// validate a range against the caller's address space, then translate and
// dereference it page by page through its physical address (the same
// translate-then-dereference pattern `vm::AddrSpace::validate_vstr` already
// uses), since the kernel's own code is not necessarily mapped at the same
// virtual address the user program sees it at.

fn copy_in_str(space: &AddrSpace, va: usize, buf: &mut [u8; MAXPATH]) -> KResult<usize> {
    let len = space.validate_vstr(VmAddr::from(va), MAXPATH)?;
    for (i, slot) in buf.iter_mut().enumerate().take(len) {
        let (pa, _) = space.translate(VmAddr::from(va) + i).ok_or(Error::Inval)?;
        // SAFETY: `validate_vstr` just confirmed byte `i` is mapped readable.
        *slot = unsafe { *(pa.into_usize() as *const u8) };
    }
    Ok(len)
}

fn copy_in_word(space: &AddrSpace, va: usize) -> KResult<usize> {
    if va % core::mem::size_of::<usize>() != 0 {
        return Err(Error::Inval);
    }
    space.validate_vptr_len(VmAddr::from(va), core::mem::size_of::<usize>(), false)?;
    let (pa, _) = space.translate(VmAddr::from(va)).ok_or(Error::Inval)?;
    // SAFETY: validated above, and 8-byte aligned so it cannot cross a page.
    Ok(unsafe { *(pa.into_usize() as *const usize) })
}

fn copy_out_word(space: &AddrSpace, va: usize, val: usize) -> KResult<()> {
    if va % core::mem::size_of::<usize>() != 0 {
        return Err(Error::Inval);
    }
    space.validate_vptr_len(VmAddr::from(va), core::mem::size_of::<usize>(), true)?;
    let (pa, _) = space.translate(VmAddr::from(va)).ok_or(Error::Inval)?;
    // SAFETY: validated above, and 8-byte aligned so it cannot cross a page.
    unsafe { *(pa.into_usize() as *mut usize) = val };
    Ok(())
}

// HANDLERS
//

fn sys_exit() -> KResult<usize> {
    process::exit()
}

fn sys_exec(tf: &TrapFrame) -> KResult<usize> {
    let fd = tf.arg(0) as isize;
    let argc = tf.arg(1);
    let argv_va = tf.arg(2);

    if argc > MAXARG {
        return Err(Error::Inval);
    }

    let exeio = process::fd_io(fd)?;

    let mut argv_bufs = [[0u8; MAXPATH]; MAXARG];
    let mut argv_lens = [0usize; MAXARG];
    process::with_current_mspace(|space| -> KResult<()> {
        space.validate_vptr_len(
            VmAddr::from(argv_va),
            argc * core::mem::size_of::<usize>(),
            false,
        )?;
        for i in 0..argc {
            let ptr_va = copy_in_word(space, argv_va + i * core::mem::size_of::<usize>())?;
            argv_lens[i] = copy_in_str(space, ptr_va, &mut argv_bufs[i])?;
        }
        Ok(())
    })??;

    let argv: arrayvec::ArrayVec<&[u8], MAXARG> = argv_bufs
        .iter()
        .zip(argv_lens.iter())
        .take(argc)
        .map(|(buf, &len)| &buf[..len])
        .collect();

    match process::exec(&exeio, &argv) {
        Ok(never) => match never {},
        Err(e) => Err(e),
    }
}

fn sys_fork(tf: &TrapFrame) -> KResult<usize> {
    process::fork(tf)
}

fn sys_wait(tid: isize) -> KResult<usize> {
    if tid < 0 {
        return Err(Error::Child);
    }
    scheduler::join(tid as usize)
}

fn sys_print(msg_va: usize) -> KResult<usize> {
    let mut buf = [0u8; MAXPRINT];
    let len = process::with_current_mspace(|space| {
        let n = space.validate_vstr(VmAddr::from(msg_va), MAXPRINT)?;
        for (i, slot) in buf.iter_mut().enumerate().take(n) {
            let (pa, _) = space.translate(VmAddr::from(msg_va) + i).ok_or(Error::Inval)?;
            // SAFETY: just confirmed mapped readable by validate_vstr.
            *slot = unsafe { *(pa.into_usize() as *const u8) };
        }
        KResult::Ok(n)
    })??;
    let msg = core::str::from_utf8(&buf[..len]).map_err(|_| Error::Inval)?;

    let tid = scheduler::current_tid();
    let name_bytes = scheduler::name_of(tid);
    let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(MAXTHREADNAME);
    let name = core::str::from_utf8(&name_bytes[..name_len]).unwrap_or("?");

    println!("Thread <{}:{}> says: {}", name, tid, msg);
    Ok(0)
}

fn sys_usleep(us: u64) -> KResult<usize> {
    hal::sleep_us(us)?;
    Ok(0)
}

fn sys_devopen(fd: isize, name_va: usize, instance: usize) -> KResult<usize> {
    let mut buf = [0u8; MAXPATH];
    let len = process::with_current_mspace(|space| copy_in_str(space, name_va, &mut buf))??;
    let name = core::str::from_utf8(&buf[..len]).map_err(|_| Error::Inval)?;
    let io = hal::open_device(name, instance)?;
    process::install_fd(fd, io)
}

fn sys_fsopen(fd: isize, name_va: usize) -> KResult<usize> {
    let mut buf = [0u8; MAXPATH];
    let len = process::with_current_mspace(|space| copy_in_str(space, name_va, &mut buf))??;
    let name = core::str::from_utf8(&buf[..len]).map_err(|_| Error::Inval)?;
    let handle = crate::fs::open(name)?;
    let io = crate::io::IoObject::new_seekable(crate::io::SeekableIo::new(handle))?;
    process::install_fd(fd, io)
}

fn sys_fscreate(name_va: usize) -> KResult<usize> {
    let mut buf = [0u8; MAXPATH];
    let len = process::with_current_mspace(|space| copy_in_str(space, name_va, &mut buf))??;
    let name = core::str::from_utf8(&buf[..len]).map_err(|_| Error::Inval)?;
    crate::fs::create(name)?;
    Ok(0)
}

fn sys_fsdelete(name_va: usize) -> KResult<usize> {
    let mut buf = [0u8; MAXPATH];
    let len = process::with_current_mspace(|space| copy_in_str(space, name_va, &mut buf))??;
    let name = core::str::from_utf8(&buf[..len]).map_err(|_| Error::Inval)?;
    crate::fs::delete(name)?;
    Ok(0)
}

fn sys_close(fd: isize) -> KResult<usize> {
    process::close_fd(fd)?;
    Ok(0)
}

fn sys_read(fd: isize, buf_va: usize, len: usize) -> KResult<usize> {
    let n = process::io_transfer(fd, buf_va, len, false)?;
    if n < len {
        return Err(Error::Inval);
    }
    Ok(n)
}

fn sys_write(fd: isize, buf_va: usize, len: usize) -> KResult<usize> {
    // A zero-length write is a flush with no buffer to validate (some
    // userland programs write a length-0 buffer purely to force one).
    let n = process::io_transfer(fd, buf_va, len, true)?;
    if n < len {
        return Err(Error::Inval);
    }
    Ok(n)
}

fn sys_ioctl(fd: isize, cmd: usize, arg: usize) -> KResult<usize> {
    let ctl = match cmd {
        0 => IoCtl::GetBlockSize,
        1 => IoCtl::GetEnd,
        2 => IoCtl::SetEnd(arg as u64),
        3 => IoCtl::GetPos,
        4 => IoCtl::SetPos(arg as u64),
        _ => return Err(Error::Inval),
    };
    let result = process::ioctl_fd(fd, ctl)?;
    Ok(result as usize)
}

fn sys_pipe(wfd_ptr_va: usize, rfd_ptr_va: usize) -> KResult<usize> {
    let (wfd, rfd) = process::with_current_mspace(|space| -> KResult<(isize, isize)> {
        let w = copy_in_word(space, wfd_ptr_va)? as isize;
        let r = copy_in_word(space, rfd_ptr_va)? as isize;
        Ok((w, r))
    })??;

    let (w, r) = process::pipe_fds(wfd, rfd)?;

    process::with_current_mspace(|space| -> KResult<()> {
        copy_out_word(space, wfd_ptr_va, w)?;
        copy_out_word(space, rfd_ptr_va, r)?;
        Ok(())
    })??;
    Ok(0)
}

fn sys_iodup(old: isize, new: isize) -> KResult<usize> {
    process::dup_fd(old, new)
}
