//! Compile-time kernel capacities.

/// Maximum number of threads (including the main thread at id 0 and the
/// idle thread at id NTHR-1).
pub const NTHR: usize = 64;

/// Maximum number of processes.
pub const NPROC: usize = 32;

/// Open I/O descriptors per process.
pub const PROCESS_IOMAX: usize = 16;

/// Open I/O objects system-wide.
pub const NFILE: usize = 128;

/// Block size used throughout the storage stack (cache slots, KTFS blocks).
pub const BSIZE: usize = 512;

/// Block cache capacity, in slots.
pub const CACHE_CAPACITY: usize = 64;

/// Bytes per physical page / virtual page.
pub const PAGE_SIZE: usize = 4096;

/// Maximum length of a thread name, including the null terminator.
pub const MAXTHREADNAME: usize = 16;

/// Maximum number of entries in the KTFS root directory.
pub const KTFS_MAX_FILENAME_LEN: usize = 13;

/// Size of one pipe's ring buffer (one page).
pub const PIPE_SIZE: usize = PAGE_SIZE;

/// Max number of blocks a single KTFS operation may touch (create/delete),
/// used only to size scratch buffers; KTFS itself is not journaled.
pub const MAXOPBLOCKS: usize = 10;

/// Largest inode id the in-memory inode bitmap can track. A real on-disk
/// volume's `inode_block_count * (BSIZE/32)` must not exceed this; `mount`
/// rejects a superblock that would overflow it rather than the source's
/// unchecked `kcalloc`-sized bitmap (spec.md §9).
pub const KTFS_MAX_INODE_COUNT: usize = 4096;

/// Bytes needed to hold one bit per [`KTFS_MAX_INODE_COUNT`] inode, plus the
/// source's `+ 1` slack byte.
pub const KTFS_INODE_BITMAP_BYTES: usize = KTFS_MAX_INODE_COUNT / 8 + 1;

/// Data-block pointers per indirect/double-indirect block (`BSIZE / 4`).
pub const KTFS_PTRS_PER_BLOCK: usize = BSIZE / 4;

/// Maximum argv entries `exec` accepts, used to size the stack-build
/// pointer array.
pub const MAXARG: usize = 16;

/// Longest device/file name (including the nul terminator) the syscall
/// layer will copy in from user memory before handing it to `hal`/`fs`.
/// `fs`'s own `KTFS_MAX_FILENAME_LEN` is the tighter, authoritative bound
/// for KTFS names; this is just big enough to also fit device names.
pub const MAXPATH: usize = 64;

/// Longest message `print` will copy in from user memory in one call.
pub const MAXPRINT: usize = 256;

/// Virtual address one page below the top of user memory: where `exec`
/// maps the single user stack page (stack grows down from the top of the
/// space; nothing is mapped above it).
pub const USTACK_VA: usize = 0x0000_003f_ffff_f000;
