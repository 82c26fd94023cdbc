//! Boot control flow (spec.md §2): wires every subsystem's `init`/`set_*`
//! entry point into the one sequence a real board (and a test harness
//! standing in for one) must run in.
//!
//! Grounded on `kernel-rs/src/kernel_main.rs`'s `main_0` (`kinit` then
//! `kvminit`/`kvminithart` then `procinit` then `binit`/`iinit`/`fileinit`
//! then `virtio_disk_init` then `userinit` then `scheduler()`), translated
//! from its per-hart `cpuid() == 0` branch (this crate is single-hart, so
//! that branch is simply not needed) and from its hard-coded driver calls
//! to this crate's `hal` trait attachment points, since spec.md §1 scopes
//! UART/RTC/VirtIO/PLIC/the ELF loader out as external collaborators this
//! module only ever reaches through a trait object.
//!
//! `boot` itself owns none of the arch-specific work (identity-mapping
//! addresses, trapping into user mode) beyond calling through `vm`/`hal`;
//! the actual `satp`/`sstatus` csrs and the trap-return trampoline are
//! `hal`'s.

use core::convert::Infallible;

use crate::addr::{pgrounddown, pgroundup, Addr, PAddr, VmAddr};
use crate::error::KResult;
use crate::hal;
use crate::hal::{BlockDevice, CharSink, DeviceOpener, ElfLoader, SleepSource};
use crate::io::{IoObject, SeekableIo};
use crate::kernel;
use crate::proc::scheduler;
use crate::process;
use crate::vm::{AddrSpace, PteFlags};

/// Everything a board must hand `boot` before the kernel can dispatch its
/// first user instruction: the one span of free RAM this image doesn't
/// already occupy, the MMIO windows the kernel itself needs mapped (the
/// UART/PLIC/VirtIO register windows — the drivers behind them are
/// `hal`'s, but *mapping* their registers into the kernel's own address
/// space is this crate's job), and the four HAL collaborators spec.md §1
/// treats as given.
pub struct BootConfig<'a> {
    /// `[start, end)` of free, page-aligned physical RAM this image does
    /// not occupy, handed to [`kernel::init_phys_alloc`] and also
    /// identity-mapped (kernel code/data/stack live somewhere in the image,
    /// outside this range, and are mapped separately by the linker-script
    /// side of a real boot; this span is purely the allocator's pool).
    pub free_ram: (PAddr, PAddr),
    /// Kernel image ranges (code, data, the allocator's own pool) to
    /// identity-map `R|W|X|G` so the kernel keeps executing once paging is
    /// live. A real boot passes its linker-script `[_start, _end)`.
    pub kernel_image: (PAddr, PAddr),
    /// MMIO windows (UART, PLIC, VirtIO) to identity-map `R|W|G`, no `X`.
    pub mmio: &'a [(PAddr, usize)],
    pub console: &'static mut dyn CharSink,
    pub elf_loader: &'static dyn ElfLoader,
    pub device_opener: &'static dyn DeviceOpener,
    pub sleep_source: &'static dyn SleepSource,
    pub block_device: &'static mut dyn BlockDevice,
}

/// Identity-map `[start, end)` (rounded out to whole pages) at `perm`,
/// allocating whatever intermediate page-table levels `vm` needs along the
/// way. Used for both the kernel image range and each MMIO window: in both
/// cases the physical and virtual addresses are the same number, only the
/// permission bits differ.
fn identity_map(
    space: &mut AddrSpace,
    alloc: &mut crate::phys_alloc::PhysAlloc,
    start: PAddr,
    end: PAddr,
    perm: PteFlags,
) -> KResult<()> {
    let mut pa = pgrounddown(start.into_usize());
    let end = pgroundup(end.into_usize());
    while pa < end {
        space.map_page(VmAddr::from(pa), PAddr::from(pa), perm, alloc)?;
        pa += crate::addr::PGSIZE;
    }
    Ok(())
}

/// Bring the kernel up: physical allocator, the boot thread's address
/// space (identity-mapped kernel image and MMIO), the scheduler's thread
/// 0, the HAL attachment points, the main process, the KTFS mount, and
/// finally `exec` of the init program. Never returns on success — the
/// last step hands control to user mode; on any failure before that, the
/// board's own `panic_handler` is the only thing left to report it to,
/// since there is no supervisor left to unwind into.
///
/// # Safety
/// `config.free_ram` must describe free, page-aligned, currently unmanaged
/// physical memory (see [`kernel::init_phys_alloc`]), and `boot` must be
/// called exactly once, before any other kernel entry point runs.
pub unsafe fn boot(config: BootConfig<'_>, init_program: &str) -> KResult<Infallible> {
    crate::console::set_sink(config.console);
    println!("kernel is booting");

    // SAFETY: forwarded to the caller's obligation on `config.free_ram`.
    unsafe { kernel::init_phys_alloc(config.free_ram.0, config.free_ram.1) };

    let mspace = kernel::with_phys_alloc(|alloc| -> KResult<AddrSpace> {
        let mut space = AddrSpace::new(alloc)?;
        identity_map(
            &mut space,
            alloc,
            config.kernel_image.0,
            config.kernel_image.1,
            PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::G,
        )?;
        for &(base, len) in config.mmio {
            identity_map(
                &mut space,
                alloc,
                base,
                base + len,
                PteFlags::R | PteFlags::W | PteFlags::G,
            )?;
        }
        Ok(space)
    })?;

    scheduler::init_boot_thread("main");

    hal::set_elf_loader(config.elf_loader);
    hal::set_device_opener(config.device_opener);
    hal::set_sleep_source(config.sleep_source);

    process::init_main_process(mspace)?;

    crate::fs::mount(config.block_device)?;

    println!("ktfs mounted, starting {}", init_program);
    let handle = crate::fs::open(init_program)?;
    let io = IoObject::new_seekable(SeekableIo::new(handle))?;

    process::exec(&io, &[init_program.as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::PAGE_SIZE;
    use crate::phys_alloc::PhysAlloc;

    // Mirrors `process::tests::test_alloc`: a handful of pages backed by a
    // leaked heap buffer, never freed, standing in for a board's real RAM
    // span so these tests never touch the crate-wide `kernel::PHYS_ALLOC`
    // singleton other tests may also be exercising.
    fn test_alloc() -> PhysAlloc {
        let buf: &'static mut [u8] = std::vec![0u8; 8 * PAGE_SIZE].leak();
        let start = pgroundup(buf.as_ptr() as usize);
        let end = pgrounddown(start + buf.len() - PAGE_SIZE);
        let mut a = PhysAlloc::new();
        // SAFETY: `buf` was just leaked, so this range is unmanaged and will
        // never be freed or reused by anything else.
        unsafe { a.init(PAddr::from(start), PAddr::from(end)) };
        a
    }

    #[test]
    fn identity_map_rounds_partial_pages_out() {
        // A 1-byte range still maps exactly one page.
        let mut alloc = test_alloc();
        let mut space = AddrSpace::new(&mut alloc).expect("new addrspace");
        let pa = PAddr::from(0x1000);
        identity_map(&mut space, &mut alloc, pa, pa + 1, PteFlags::R).expect("map one byte");
        assert_eq!(space.size(), 0x1000 + PAGE_SIZE);
        let (mapped_pa, flags) = space.translate(VmAddr::from(0x1000)).expect("mapped");
        assert_eq!(mapped_pa, pa);
        assert!(flags.contains(PteFlags::R));
    }

    #[test]
    fn identity_map_spanning_page_boundary_maps_exactly_two_pages() {
        let mut alloc = test_alloc();
        let mut space = AddrSpace::new(&mut alloc).expect("new addrspace");
        let pa = PAddr::from(0x1000 + PAGE_SIZE - 1);
        identity_map(&mut space, &mut alloc, pa, pa + 2, PteFlags::R | PteFlags::W)
            .expect("map across boundary");
        assert_eq!(space.size(), 0x1000 + 2 * PAGE_SIZE);
        assert!(space.translate(VmAddr::from(0x1000)).is_some());
        assert!(space
            .translate(VmAddr::from(0x1000 + PAGE_SIZE))
            .is_some());
    }
}
