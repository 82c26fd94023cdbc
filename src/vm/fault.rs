//! Lazy page-fault allocation (spec.md §4.2).
//!
//! A store to a `va` within the address space's current `size` but not yet
//! backed by a physical page (e.g. a freshly `sbrk`-grown region) faults;
//! the handler backs it with a zeroed page instead of killing the thread,
//! grounded on the original's demand paging intent referenced in spec.md's
//! MMU module notes.

use super::{AddrSpace, PteFlags};
use crate::addr::{pgrounddown, Addr, VmAddr};
use crate::error::{Error, KResult};
use crate::phys_alloc::PhysAlloc;

/// Handle a page fault at `fault_va`. Returns `Ok(())` if the fault was
/// resolved by lazily backing the page; `Err` if `fault_va` is outside the
/// address space or otherwise not a legal lazy-allocation target.
pub fn handle_page_fault(
    space: &mut AddrSpace,
    fault_va: VmAddr,
    alloc: &mut PhysAlloc,
) -> KResult<()> {
    let page_va = VmAddr::from(pgrounddown(fault_va.into_usize()));
    if page_va.into_usize() >= space.size() {
        return Err(Error::Inval);
    }
    if space.translate(page_va).is_some() {
        // Already mapped: this was a protection fault, not a missing
        // mapping, and is not this handler's job to resolve.
        return Err(Error::Access);
    }
    space.map_new_page(page_va, PteFlags::R | PteFlags::W | PteFlags::U, alloc)
}
