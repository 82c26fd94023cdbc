//! MMU / address space (spec.md §4.2).

mod fault;
mod pagetable;

pub use fault::handle_page_fault;
pub use pagetable::{PageTable, Pte, PteFlags, RawPageTable};

use crate::addr::{Addr, VmAddr, PGSIZE};
use crate::error::{Error, KResult};
use crate::page::Page;
use crate::phys_alloc::PhysAlloc;

/// One process's virtual address space: a page table plus the bookkeeping
/// needed to clone it for `fork` (spec.md §4.2's "eager, non-COW deep copy").
pub struct AddrSpace {
    table: PageTable,
    /// Highest mapped virtual address, rounded up to a page boundary; used
    /// to size `sbrk`/`fork` copies.
    size: usize,
}

impl AddrSpace {
    pub fn new(alloc: &mut PhysAlloc) -> KResult<Self> {
        Ok(Self {
            table: PageTable::new(alloc)?,
            size: 0,
        })
    }

    pub fn root_addr(&self) -> crate::addr::PAddr {
        self.table.root_addr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn translate(&self, va: VmAddr) -> Option<(crate::addr::PAddr, PteFlags)> {
        self.table.translate(va)
    }

    /// Install a leaf mapping from `va` to an already-owned physical page
    /// `pa` (spec.md §4.2's `map_page`): used for identity-mapping kernel
    /// RAM/MMIO at boot and for handing a freshly allocated user stack page
    /// to a specific virtual address, where the physical page already
    /// exists and must not be re-zeroed or freshly allocated the way
    /// [`Self::map_new_page`] does.
    pub fn map_page(
        &mut self,
        va: VmAddr,
        pa: crate::addr::PAddr,
        perm: PteFlags,
        alloc: &mut PhysAlloc,
    ) -> KResult<()> {
        self.table.map(va, pa, perm, alloc)?;
        let top = va.into_usize() + PGSIZE;
        if top > self.size {
            self.size = top;
        }
        Ok(())
    }

    /// Map one freshly allocated, zeroed page at `va`, growing `size` if
    /// `va` extends it.
    pub fn map_new_page(
        &mut self,
        va: VmAddr,
        perm: PteFlags,
        alloc: &mut PhysAlloc,
    ) -> KResult<()> {
        let mut page = alloc.alloc_page().ok_or(Error::NoMem)?;
        page.zero();
        let pa = page.into_paddr();
        self.table.map(va, pa, perm, alloc).map_err(|e| {
            // SAFETY: `pa` was just carved from `alloc` and never published.
            unsafe { alloc.free(pa, 1) };
            e
        })?;
        let top = va.into_usize() + PGSIZE;
        if top > self.size {
            self.size = top;
        }
        Ok(())
    }

    /// Round `size` up to whole pages and map each one contiguously: virtual
    /// page `i` of the range to physical page `i` starting at `pa`
    /// (spec.md §4.2 `map_range`). On failure, whichever pages were already
    /// mapped before the failing one stay mapped — the caller owns cleanup,
    /// matching [`Self::map_page`]'s own all-or-nothing-per-page contract.
    pub fn map_range(
        &mut self,
        va: VmAddr,
        size: usize,
        pa: crate::addr::PAddr,
        perm: PteFlags,
        alloc: &mut PhysAlloc,
    ) -> KResult<()> {
        let pages = crate::addr::pgroundup(size) / PGSIZE;
        for i in 0..pages {
            self.map_page(va + i * PGSIZE, pa + i * PGSIZE, perm, alloc)?;
        }
        Ok(())
    }

    /// Round `size` up to whole pages and map each one to a freshly
    /// allocated, zeroed physical page (spec.md §4.2
    /// `alloc_and_map_range`). Used for growing a process's heap/stack by a
    /// byte count rather than handing it already-owned physical pages.
    pub fn alloc_and_map_range(
        &mut self,
        va: VmAddr,
        size: usize,
        perm: PteFlags,
        alloc: &mut PhysAlloc,
    ) -> KResult<()> {
        let pages = crate::addr::pgroundup(size) / PGSIZE;
        for i in 0..pages {
            self.map_new_page(va + i * PGSIZE, perm, alloc)?;
        }
        Ok(())
    }

    /// Update the permission flags of every already-mapped leaf page in the
    /// rounded-up range `[va, va + size)`, silently skipping pages that are
    /// unmapped or global (spec.md §4.2 `set_range_flags`).
    pub fn set_range_flags(&mut self, va: VmAddr, size: usize, perm: PteFlags) {
        let pages = crate::addr::pgroundup(size) / PGSIZE;
        for i in 0..pages {
            let _ = self.table.set_flags(va + i * PGSIZE, perm);
        }
    }

    /// Unmap and free every leaf-mapped, non-global page in the rounded-up
    /// range `[va, va + size)`, silently skipping pages that are already
    /// unmapped or global (spec.md §4.2 `unmap_and_free_range`).
    pub fn unmap_and_free_range(&mut self, va: VmAddr, size: usize, alloc: &mut PhysAlloc) {
        let pages = crate::addr::pgroundup(size) / PGSIZE;
        for i in 0..pages {
            let page_va = va + i * PGSIZE;
            if let Some((_, perm)) = self.table.translate(page_va) {
                if !perm.contains(PteFlags::G) {
                    if let Ok(pa) = self.table.unmap(page_va) {
                        // SAFETY: a leaf page this address space uniquely owned.
                        unsafe { alloc.free(pa, 1) };
                    }
                }
            }
        }
    }

    /// Deep-copy this address space: every mapped non-global leaf page is
    /// freshly allocated and its contents copied, matching spec.md §4.2's
    /// explicit rejection of copy-on-write sharing for `fork`. Entries
    /// carrying the `G` flag (the shared kernel identity mapping every
    /// address space carries alongside its own user pages) are
    /// shallow-copied instead: both spaces end up pointing at the very same
    /// physical pages, since the kernel image is never private to one
    /// process and must still be mapped for the child to take its first
    /// trap back into supervisor mode.
    pub fn clone_deep(&self, alloc: &mut PhysAlloc) -> KResult<Self> {
        let mut dst = Self::new(alloc)?;
        let mut va = 0usize;
        while va < self.size {
            let vaddr = VmAddr::from(va);
            if let Some((pa, perm)) = self.table.translate(vaddr) {
                if perm.contains(PteFlags::G) {
                    if let Err(e) = dst.table.map(vaddr, pa, perm, alloc) {
                        dst.destroy(alloc);
                        return Err(e);
                    }
                    let top = va + PGSIZE;
                    if top > dst.size {
                        dst.size = top;
                    }
                } else {
                    if let Err(e) = dst.map_new_page(vaddr, perm, alloc) {
                        // Undo the partial copy so a failed fork doesn't leak
                        // the pages already allocated for `dst`.
                        dst.destroy(alloc);
                        return Err(e);
                    }
                    if let Some((new_pa, _)) = dst.table.translate(vaddr) {
                        // SAFETY: `pa`/`new_pa` are each exactly one page,
                        // disjoint, and both owned (one by `self`, one by
                        // `dst`, which nobody else can reach yet).
                        unsafe {
                            core::ptr::copy_nonoverlapping(
                                pa.into_usize() as *const u8,
                                new_pa.into_usize() as *mut u8,
                                PGSIZE,
                            );
                        }
                    }
                }
            }
            va += PGSIZE;
        }
        Ok(dst)
    }

    /// Unmap and free every mapped non-global (user) page, resetting `size`
    /// to 0 but keeping the root table itself so the space can be reused in
    /// place (spec.md §4.2 `reset_active_mspace`). `exec` calls this to
    /// discard the caller's old image before mapping in the new one; the
    /// shared kernel mapping survives untouched.
    pub fn reset(&mut self, alloc: &mut PhysAlloc) {
        let mut va = 0usize;
        while va < self.size {
            let vaddr = VmAddr::from(va);
            if let Some((_, perm)) = self.table.translate(vaddr) {
                if !perm.contains(PteFlags::G) {
                    if let Ok(pa) = self.table.unmap(vaddr) {
                        // SAFETY: a leaf page this address space uniquely owned.
                        unsafe { alloc.free(pa, 1) };
                    }
                }
            }
            va += PGSIZE;
        }
        self.size = 0;
    }

    /// Check that every byte of `[va, va + len)` is mapped with `U` and `R`
    /// (`W` too, if `write`) set, one page at a time. Called before the
    /// syscall dispatcher touches a user-supplied buffer, so a malicious or
    /// buggy trap frame can never make the kernel read or write through an
    /// unmapped or kernel-only page (spec.md §7).
    pub fn validate_vptr_len(&self, va: VmAddr, len: usize, write: bool) -> KResult<()> {
        if len == 0 {
            return Ok(());
        }
        let start = crate::addr::pgrounddown(va.into_usize());
        let end = va.into_usize().checked_add(len).ok_or(Error::Inval)?;
        let mut page = start;
        while page < end {
            let (_, flags) = self
                .table
                .translate(VmAddr::from(page))
                .ok_or(Error::Inval)?;
            if !flags.contains(PteFlags::U) || !flags.contains(PteFlags::R) {
                return Err(Error::Inval);
            }
            if write && !flags.contains(PteFlags::W) {
                return Err(Error::Inval);
            }
            page += PGSIZE;
        }
        Ok(())
    }

    /// Like [`Self::validate_vptr_len`], but for a NUL-terminated string of
    /// unknown length: walks forward one byte at a time (crossing page
    /// boundaries through the same permission check) until it finds the
    /// terminator or exceeds `max_len`.
    pub fn validate_vstr(&self, va: VmAddr, max_len: usize) -> KResult<usize> {
        for i in 0..max_len {
            let byte_va = va + i;
            self.validate_vptr_len(byte_va, 1, false)?;
            let (pa, _) = self.table.translate(byte_va).ok_or(Error::Inval)?;
            // SAFETY: `validate_vptr_len` just confirmed this byte is
            // mapped readable.
            let byte = unsafe { *(pa.into_usize() as *const u8) };
            if byte == 0 {
                return Ok(i);
            }
        }
        Err(Error::Inval)
    }

    /// Tear down the whole tree and free every mapped non-global data page.
    /// Pages shared via the `G` flag (the kernel identity mapping, see
    /// [`Self::clone_deep`]) are left for whichever address space frees them
    /// last to reclaim separately; this crate has exactly one such mapping,
    /// owned by the boot path, which never calls `destroy`.
    pub fn destroy(mut self, alloc: &mut PhysAlloc) {
        let mut va = 0usize;
        while va < self.size {
            let vaddr = VmAddr::from(va);
            if let Some((_, perm)) = self.table.translate(vaddr) {
                if !perm.contains(PteFlags::G) {
                    if let Ok(pa) = self.table.unmap(vaddr) {
                        // SAFETY: a leaf page this address space uniquely owned.
                        unsafe { alloc.free(pa, 1) };
                    }
                }
            }
            va += PGSIZE;
        }
        self.table.destroy(alloc);
    }
}

/// Install `space` as the active address space on this hart. Called by the
/// scheduler loop whenever it dispatches a thread belonging to a different
/// process than whatever last ran (spec.md §4.3's "switch to the next
/// thread's associated process's address space" step).
///
/// # Safety
/// `space` must outlive every user-mode memory access made until the next
/// `switch_mspace` call.
pub unsafe fn switch_mspace(space: &AddrSpace) {
    let ppn = space.root_addr().into_usize() >> crate::addr::PGSHIFT;
    // SAFETY: `ppn` names a page table this address space uniquely owns,
    // which the caller guarantees stays valid.
    unsafe { crate::hal::switch_pagetable(ppn) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_alloc(buf: &mut [u8]) -> PhysAlloc {
        let start = crate::addr::pgroundup(buf.as_ptr() as usize);
        let end = crate::addr::pgrounddown(start + buf.len() - PGSIZE);
        let mut a = PhysAlloc::new();
        unsafe { a.init(PAddr::from(start), PAddr::from(end)) };
        a
    }

    #[test]
    fn map_range_maps_every_page_contiguously() {
        let mut buf = std::vec![0u8; 64 * PGSIZE];
        let mut alloc = setup_alloc(&mut buf);
        let mut space = AddrSpace::new(&mut alloc).unwrap();
        let pa = alloc.alloc(3).unwrap();
        let va = VmAddr::from(0x10_0000);
        space
            .map_range(va, 3 * PGSIZE, pa, PteFlags::R | PteFlags::W, &mut alloc)
            .unwrap();
        for i in 0..3 {
            let (got_pa, flags) = space.translate(va + i * PGSIZE).unwrap();
            assert_eq!(got_pa, pa + i * PGSIZE);
            assert!(flags.contains(PteFlags::R | PteFlags::W));
        }
        assert_eq!(space.size(), 0x10_0000 + 3 * PGSIZE);
    }

    #[test]
    fn alloc_and_map_range_rounds_size_up_to_whole_pages() {
        let mut buf = std::vec![0u8; 64 * PGSIZE];
        let mut alloc = setup_alloc(&mut buf);
        let mut space = AddrSpace::new(&mut alloc).unwrap();
        let va = VmAddr::from(0x20_0000);
        space
            .alloc_and_map_range(va, PGSIZE + 1, PteFlags::R | PteFlags::W | PteFlags::U, &mut alloc)
            .unwrap();
        assert!(space.translate(va).is_some());
        assert!(space.translate(va + PGSIZE).is_some());
        assert_eq!(space.size(), 2 * PGSIZE);
    }

    #[test]
    fn set_range_flags_updates_every_mapped_page_and_skips_unmapped() {
        let mut buf = std::vec![0u8; 64 * PGSIZE];
        let mut alloc = setup_alloc(&mut buf);
        let mut space = AddrSpace::new(&mut alloc).unwrap();
        let va = VmAddr::from(0x30_0000);
        space
            .alloc_and_map_range(va, 2 * PGSIZE, PteFlags::R | PteFlags::W | PteFlags::U, &mut alloc)
            .unwrap();
        space.set_range_flags(va, 2 * PGSIZE, PteFlags::R | PteFlags::U);
        for i in 0..2 {
            let (_, flags) = space.translate(va + i * PGSIZE).unwrap();
            assert!(flags.contains(PteFlags::R | PteFlags::U));
            assert!(!flags.contains(PteFlags::W));
        }
    }

    #[test]
    fn unmap_and_free_range_frees_pages_and_ignores_the_global_mapping() {
        let mut buf = std::vec![0u8; 64 * PGSIZE];
        let mut alloc = setup_alloc(&mut buf);
        let before = alloc.free_page_count();
        let mut space = AddrSpace::new(&mut alloc).unwrap();
        let kernel_pa = alloc.alloc_page().unwrap().into_paddr();
        space
            .map_page(VmAddr::from(0), kernel_pa, PteFlags::R | PteFlags::X | PteFlags::G, &mut alloc)
            .unwrap();
        let va = VmAddr::from(PGSIZE);
        space
            .alloc_and_map_range(va, 2 * PGSIZE, PteFlags::R | PteFlags::W | PteFlags::U, &mut alloc)
            .unwrap();

        space.unmap_and_free_range(va, 2 * PGSIZE, &mut alloc);

        assert!(space.translate(va).is_none());
        assert!(space.translate(va + PGSIZE).is_none());
        assert!(space.translate(VmAddr::from(0)).is_some());

        space.destroy(&mut alloc);
        // SAFETY: the kernel-identity page was mapped `G` and is never
        // freed by `destroy`/`unmap_and_free_range`; reclaim it here so the
        // page count balances.
        unsafe { alloc.free(kernel_pa, 1) };
        assert_eq!(alloc.free_page_count(), before);
    }
}
