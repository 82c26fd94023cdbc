//! Hardware abstraction boundary.
//!
//! spec.md §1 scopes UART, RTC, VirtIO, the PLIC, the ELF loader, and the
//! trap/syscall assembly entry points out as external collaborators,
//! "specified only through their contracts." This module is that contract:
//! a small set of traits the in-scope subsystems call through, plus the one
//! piece of genuinely in-scope hardware interaction every subsystem needs —
//! reading and masking the supervisor interrupt-enable bit, used by the
//! spinlock's `push_off`/`pop_off` discipline.
//!
//! Grounded on `kernel-rs/src/riscv.rs`'s `r_sstatus`/`w_sstatus`/`intr_on`/
//! `intr_off`/`intr_get`, translated from the teacher's `llvm_asm!` (removed
//! from stable Rust) to `core::arch::asm!`.

use core::cell::Cell;

use crate::lock::Spinlock;

const SSTATUS_SIE: usize = 1 << 1;

#[cfg(target_arch = "riscv64")]
#[inline]
fn r_sstatus() -> usize {
    let x: usize;
    // SAFETY: reads a CSR, no side effect beyond the read itself.
    unsafe {
        core::arch::asm!("csrr {}, sstatus", out(reg) x);
    }
    x
}

#[cfg(target_arch = "riscv64")]
#[inline]
fn w_sstatus(x: usize) {
    // SAFETY: caller (this module) only ever sets/clears SSTATUS_SIE.
    unsafe {
        core::arch::asm!("csrw sstatus, {}", in(reg) x);
    }
}

// Host fallback so `#[cfg(test)]` unit tests can run on the development
// machine's (non-riscv64) target; never compiled into a kernel image.
#[cfg(all(test, not(target_arch = "riscv64")))]
#[inline]
fn r_sstatus() -> usize {
    HOST_SSTATUS.with(Cell::get)
}

#[cfg(all(test, not(target_arch = "riscv64")))]
#[inline]
fn w_sstatus(x: usize) {
    HOST_SSTATUS.with(|c| c.set(x));
}

#[cfg(all(test, not(target_arch = "riscv64")))]
std::thread_local! {
    static HOST_SSTATUS: Cell<usize> = Cell::new(SSTATUS_SIE);
}

/// Enable supervisor interrupts.
///
/// # Safety
/// Must only be called with the correct nesting discipline; callers should
/// go through [`crate::lock::push_off`]/[`crate::lock::pop_off`] instead of
/// calling this directly.
pub unsafe fn intr_on() {
    w_sstatus(r_sstatus() | SSTATUS_SIE);
}

/// Disable supervisor interrupts. See [`intr_on`].
///
/// # Safety
/// Same caveat as [`intr_on`].
pub unsafe fn intr_off() {
    w_sstatus(r_sstatus() & !SSTATUS_SIE);
}

/// Are supervisor interrupts currently enabled?
pub fn intr_get() -> bool {
    r_sstatus() & SSTATUS_SIE != 0
}

const SSTATUS_SPIE: usize = 1 << 5;
const SSTATUS_SPP: usize = 1 << 8;

/// The `sstatus` bits a freshly built trap frame should carry: the prior
/// interrupt-enable bit set (interrupts come back on once the thread
/// `sret`s into user mode) and the previous-privilege bit cleared (user,
/// not supervisor). Used by `process::exec`/`process::fork`'s trampoline
/// when building a trap frame from scratch rather than saving one out of a
/// live trap, mirroring `riscv.c`'s `csrr_sstatus() | SPIE, &~ SPP`.
pub fn default_user_status() -> usize {
    (r_sstatus() | SSTATUS_SPIE) & !SSTATUS_SPP
}

/// Sv39 mode bit in `satp` (paging enabled, 3-level tree).
const SATP_SV39: usize = 8 << 60;

#[cfg(target_arch = "riscv64")]
#[inline]
fn w_satp(x: usize) {
    // SAFETY: writing a page-table root the caller has validated.
    unsafe {
        core::arch::asm!("csrw satp, {}", "sfence.vma zero, zero", in(reg) x);
    }
}

#[cfg(all(test, not(target_arch = "riscv64")))]
#[inline]
fn w_satp(x: usize) {
    HOST_SATP.with(|c| c.set(x));
}

#[cfg(all(test, not(target_arch = "riscv64")))]
std::thread_local! {
    static HOST_SATP: Cell<usize> = Cell::new(0);
}

/// Switch the MMU to the page table rooted at physical page number
/// `root_ppn`, and flush the TLB. The assembly doing the actual `csrw`/
/// `sfence.vma` is the only truly architecture-specific part; the decision
/// of *which* root to install per-thread is `vm::switch_mspace`'s.
///
/// # Safety
/// `root_ppn` must be the physical page number of a page table that
/// correctly maps at least the kernel's own code/data (or a trap back to
/// supervisor mode from the very next instruction will fault unrecoverably).
pub unsafe fn switch_pagetable(root_ppn: usize) {
    w_satp(SATP_SV39 | root_ppn);
}

/// A single block-addressed storage device, the only HAL contract the
/// storage stack (`block_cache`, `fs`) depends on. A real boot attaches a
/// VirtIO disk driver; tests attach an in-memory backing array.
pub trait BlockDevice {
    /// Number of `BSIZE`-byte blocks this device exposes.
    fn block_count(&self) -> usize;

    /// Read block `block_no` into `buf`, which must be exactly `BSIZE` bytes.
    fn read_block(&self, block_no: usize, buf: &mut [u8]);

    /// Write `buf` (exactly `BSIZE` bytes) to block `block_no`.
    fn write_block(&mut self, block_no: usize, buf: &[u8]);
}

/// Character output sink for [`crate::console`]. A real boot attaches a UART;
/// tests attach an in-memory buffer.
pub trait CharSink: Send {
    fn put_char(&mut self, c: u8);
}

/// The saved user-mode register file around a syscall/trap, spec.md §4.7's
/// "trap frame". Owned and laid out by the trap/syscall assembly entry
/// points (an external collaborator per spec.md §1); in-scope code only
/// reads syscall arguments out of it and writes back a return value, or
/// (`process::exec`/`process::fork`) builds one from scratch to hand off to
/// [`enter_user_mode`].
#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct TrapFrame {
    /// `a0..a7`, the RISC-V argument/return registers the syscall ABI reads
    /// its arguments from and writes its result into.
    pub a: [usize; 8],
    pub sp: usize,
    /// The user-mode program counter `enter_user_mode` resumes at.
    pub epc: usize,
    /// Saved `sstatus`-equivalent privilege/interrupt-enable bits.
    pub status: usize,
}

impl TrapFrame {
    pub fn arg(&self, n: usize) -> usize {
        self.a[n]
    }

    /// Write a syscall's result back into `a0`, spec.md §7's "non-negative
    /// return = success/byte count; negative = one of the [error] codes".
    pub fn set_return(&mut self, v: isize) {
        self.a[0] = v as usize;
    }
}

#[cfg(not(test))]
extern "C" {
    /// Resume user-mode execution with the register file `tf` (and, for a
    /// freshly-forked or `exec`'d thread, the given kernel stack anchor).
    /// Implemented by the trap-return assembly, an external collaborator
    /// per spec.md §1; never returns to its caller the normal way (the
    /// thread re-enters the kernel only through the next trap).
    ///
    /// # Safety
    /// `tf` must describe a valid entry point and stack within the address
    /// space currently installed via [`switch_pagetable`].
    fn enter_user_mode(tf: *const TrapFrame) -> !;
}

/// Host unit tests have no trap-return assembly to link against and never
/// actually enter user mode; fail loudly rather than link-fail silently.
///
/// # Safety
/// Same contract as the real `enter_user_mode`, never satisfiable on a
/// host test build.
#[cfg(test)]
unsafe fn enter_user_mode(_tf: *const TrapFrame) -> ! {
    panic!("enter_user_mode: a host unit test tried to resume user mode");
}

/// Resume user-mode execution with `tf`. See [`enter_user_mode`] (the
/// `extern "C"` symbol) for the safety contract; this wrapper just gives it
/// a safe-looking call site matching [`switch_pagetable`]'s.
///
/// # Safety
/// `tf` must describe a valid user-mode entry point and stack within
/// whichever address space is currently installed.
pub unsafe fn jump_to_trap_frame(tf: &TrapFrame) -> ! {
    // SAFETY: forwarded to the caller's obligation.
    unsafe { enter_user_mode(tf) }
}

/// The ELF loader: spec.md §1 lists it as a deliberately out-of-scope
/// external collaborator ("program headers map into user VMAs with
/// per-segment R/W/X|U flags"). `process::exec` calls through this trait
/// rather than parsing ELF itself, the same way it calls through
/// [`BlockDevice`] rather than a specific disk driver.
pub trait ElfLoader: Send + Sync {
    /// Parse the ELF image read from `exe` and map every `PT_LOAD` segment
    /// into `space` with the segment's own R/W/X permissions plus `U`,
    /// allocating backing pages from `alloc`. Returns the image's entry
    /// point.
    fn load(
        &self,
        exe: &crate::io::IoObject,
        space: &mut crate::vm::AddrSpace,
        alloc: &mut crate::phys_alloc::PhysAlloc,
    ) -> crate::error::KResult<crate::addr::VmAddr>;
}

static ELF_LOADER: Spinlock<Option<&'static dyn ElfLoader>> =
    Spinlock::new_named("hal.elf_loader", None);

/// Attach the board's ELF loader. Call once during boot, before the first
/// `exec`.
pub fn set_elf_loader(loader: &'static dyn ElfLoader) {
    *ELF_LOADER.lock() = Some(loader);
}

/// The attached ELF loader.
///
/// # Panics
/// If no loader has been attached via [`set_elf_loader`].
pub fn elf_loader() -> &'static dyn ElfLoader {
    ELF_LOADER
        .lock()
        .as_ref()
        .copied()
        .expect("hal: no ELF loader attached")
}

/// Device registry: spec.md §4.7's `devopen(fd, name, instance)` resolves a
/// name/instance pair to an [`crate::io::IoObject`] through whatever the
/// board has attached (UART, RTC, VirtIO block/entropy — all external
/// collaborators per spec.md §1).
pub trait DeviceOpener: Send + Sync {
    fn open(&self, name: &str, instance: usize) -> crate::error::KResult<crate::io::IoObject>;
}

static DEVICE_OPENER: Spinlock<Option<&'static dyn DeviceOpener>> =
    Spinlock::new_named("hal.device_opener", None);

/// Attach the board's device registry. Call once during boot.
pub fn set_device_opener(opener: &'static dyn DeviceOpener) {
    *DEVICE_OPENER.lock() = Some(opener);
}

/// Open `name`/`instance` through the attached device registry.
pub fn open_device(name: &str, instance: usize) -> crate::error::KResult<crate::io::IoObject> {
    let opener = DEVICE_OPENER
        .lock()
        .as_ref()
        .copied()
        .ok_or(crate::error::Error::NotSup)?;
    opener.open(name, instance)
}

/// The timer: spec.md §1 lists the RTC as an external collaborator.
/// `syscall`'s `usleep` calls through this rather than a specific timer
/// peripheral, the same way it calls through [`DeviceOpener`] rather than a
/// specific UART/VirtIO driver.
pub trait SleepSource: Send + Sync {
    /// Block the calling thread for at least `us` microseconds.
    fn sleep_us(&self, us: u64);
}

static SLEEP_SOURCE: Spinlock<Option<&'static dyn SleepSource>> =
    Spinlock::new_named("hal.sleep_source", None);

/// Attach the board's timer. Call once during boot.
pub fn set_sleep_source(source: &'static dyn SleepSource) {
    *SLEEP_SOURCE.lock() = Some(source);
}

/// Sleep for `us` microseconds through the attached timer.
pub fn sleep_us(us: u64) -> crate::error::KResult<()> {
    let source = SLEEP_SOURCE
        .lock()
        .as_ref()
        .copied()
        .ok_or(crate::error::Error::NotSup)?;
    source.sleep_us(us);
    Ok(())
}
