//! The kernel singleton (spec.md §2): the one piece of genuinely global
//! mutable state every other subsystem reaches through a `&'static`
//! accessor, rather than a parameter threaded through every call.
//!
//! Grounded on `kernel-rs/src/kernel.rs`'s `KernelBuilder`/`kernel()`
//! pattern, but without its `Pin`/branded-lifetime machinery: this crate's
//! single-hart, no-SMP model (spec.md §1) needs only one lock-protected
//! singleton (the physical page allocator) rather than a whole struct of
//! per-subsystem fields, since the scheduler (`proc::scheduler`), I/O table
//! (`io`), and filesystem (`fs`) each already keep their own static state
//! the same way the teacher's older flat tree does (`myproc()`-style
//! free functions next to the data they guard, not funneled through one
//! `Kernel` god-object).

use crate::addr::PAddr;
use crate::error::{Error, KResult};
use crate::lock::Spinlock;
use crate::page::Page;
use crate::phys_alloc::PhysAlloc;

static PHYS_ALLOC: Spinlock<PhysAlloc> = Spinlock::new_named("kernel.phys_alloc", PhysAlloc::new());

/// Seed the physical allocator with one span of free RAM. Call exactly once
/// during boot, before any other kernel subsystem that allocates pages.
///
/// # Safety
/// See [`PhysAlloc::init`]: `[start, end)` must be page-aligned, unmanaged,
/// free physical memory.
pub unsafe fn init_phys_alloc(start: PAddr, end: PAddr) {
    // SAFETY: forwarded to the caller's own safety obligation.
    unsafe { PHYS_ALLOC.lock().init(start, end) };
}

/// Allocate one zeroed-on-demand physical page (the caller is responsible
/// for zeroing it if that matters for its use, matching [`PhysAlloc::alloc_page`]).
pub fn alloc_page() -> KResult<Page> {
    PHYS_ALLOC.lock().alloc_page().ok_or(Error::NoMem)
}

/// Return a page obtained from [`alloc_page`] (or from the allocator's
/// `AddrSpace`-internal paths) to the free list.
pub fn free_page(page: Page) {
    let pa = page.into_paddr();
    // SAFETY: `page` uniquely owned this one page by its own invariant, and
    // that ownership is consumed by `into_paddr` above.
    unsafe { PHYS_ALLOC.lock().free(pa, 1) };
}

/// Run `f` with exclusive access to the physical allocator. Used by
/// `vm`/`proc` call sites that need several allocator calls under one lock
/// acquisition (e.g. `AddrSpace::clone_deep`'s page-by-page copy).
pub fn with_phys_alloc<R>(f: impl FnOnce(&mut PhysAlloc) -> R) -> R {
    f(&mut PHYS_ALLOC.lock())
}

/// Total pages still free, for diagnostics.
pub fn free_page_count() -> usize {
    PHYS_ALLOC.lock().free_page_count()
}
