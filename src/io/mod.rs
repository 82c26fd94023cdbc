//! The I/O object contract (spec.md §4.4): a single polymorphic endpoint
//! type, refcounted, with read/write/readat/writeat/ctrl/close all optional.
//!
//! Grounded on `kernel-rs/src/file.rs`'s `File`/`FileType` closed-enum
//! dispatch (spec.md §9 explicitly asks for this over a vtable: "a small,
//! fixed set of endpoint kinds does not need dynamic dispatch") and
//! `kernel-rs/src/rcpool.rs`'s ref-counted pool idea, simplified from its
//! `PoolRef`/`TaggedBox` zero-sized-reference machinery down to a single
//! global table of slots addressed by index, since this crate has exactly
//! one such table (`kernel-rs` supports several pools of different object
//! types through that generality; this crate does not need to).

mod memory;
mod null;
mod pipe;
mod seekable;

pub use memory::MemoryIo;
pub use null::NullIo;
pub use pipe::Pipe;
pub use seekable::SeekableIo;

use crate::error::{Error, KResult};
use crate::lock::Spinlock;
use crate::param::NFILE;

/// Control commands an endpoint may answer via [`IoObject::ctrl`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IoCtl {
    /// The endpoint's natural transfer granularity, in bytes.
    GetBlockSize,
    /// Current size in bytes, for endpoints that have one.
    GetEnd,
    /// Grow the endpoint to the given size in bytes. KTFS-backed endpoints
    /// only ever allocate to reach the new size; shrinking is a no-op
    /// (spec.md §6: "never shrinks").
    SetEnd(u64),
    /// The implicit cursor's current byte offset.
    GetPos,
    /// Move the implicit cursor to the given byte offset.
    SetPos(u64),
}

/// The closed set of endpoint kinds. Adding a new kind means adding a new
/// variant and a new arm in each dispatch below, not a new trait impl site
/// scattered across the crate — deliberate, per spec.md §9.
enum IoKind {
    Null(NullIo),
    Memory(MemoryIo),
    Seekable(SeekableIo),
    Pipe(Pipe),
}

struct Slot {
    refcnt: usize,
    kind: Option<IoKind>,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            refcnt: 0,
            kind: None,
        }
    }
}

static TABLE: Spinlock<[Slot; NFILE]> = Spinlock::new_named("io_table", {
    const EMPTY: Slot = Slot::empty();
    [EMPTY; NFILE]
});

/// A refcounted handle to one I/O endpoint. Cloning increments the
/// reference count; dropping the last handle closes the endpoint.
pub struct IoObject {
    index: usize,
}

fn alloc_slot(kind: IoKind) -> KResult<usize> {
    let mut table = TABLE.lock();
    let slot = table
        .iter()
        .position(|s| s.refcnt == 0)
        .ok_or(Error::MFile)?;
    table[slot] = Slot {
        refcnt: 1,
        kind: Some(kind),
    };
    Ok(slot)
}

impl IoObject {
    fn new(kind: IoKind) -> KResult<Self> {
        Ok(Self {
            index: alloc_slot(kind)?,
        })
    }

    pub fn new_null() -> KResult<Self> {
        Self::new(IoKind::Null(NullIo))
    }

    pub fn new_memory(mem: MemoryIo) -> KResult<Self> {
        Self::new(IoKind::Memory(mem))
    }

    pub fn new_seekable(s: SeekableIo) -> KResult<Self> {
        Self::new(IoKind::Seekable(s))
    }

    pub fn new_pipe_pair() -> KResult<(Self, Self)> {
        let (read_end, write_end) = pipe::Pipe::new_pair();
        let r = Self::new(IoKind::Pipe(read_end))?;
        let w = Self::new(IoKind::Pipe(write_end))?;
        Ok((r, w))
    }

    fn with_kind<R>(&self, f: impl FnOnce(&IoKind) -> R) -> R {
        let table = TABLE.lock();
        f(table[self.index].kind.as_ref().expect("IoObject: empty slot"))
    }

    fn with_kind_mut<R>(&self, f: impl FnOnce(&mut IoKind) -> R) -> R {
        let mut table = TABLE.lock();
        f(table[self.index].kind.as_mut().expect("IoObject: empty slot"))
    }

    pub fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        self.with_kind_mut(|k| match k {
            IoKind::Null(n) => n.read(buf),
            IoKind::Memory(m) => m.read(buf),
            IoKind::Seekable(s) => s.read(buf),
            IoKind::Pipe(p) => p.read(buf),
        })
    }

    pub fn write(&self, buf: &[u8]) -> KResult<usize> {
        self.with_kind_mut(|k| match k {
            IoKind::Null(n) => n.write(buf),
            IoKind::Memory(m) => m.write(buf),
            IoKind::Seekable(s) => s.write(buf),
            IoKind::Pipe(p) => p.write(buf),
        })
    }

    pub fn readat(&self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        self.with_kind_mut(|k| match k {
            IoKind::Memory(m) => m.readat(pos, buf),
            IoKind::Seekable(s) => s.readat(pos, buf),
            _ => Err(Error::NotSup),
        })
    }

    pub fn writeat(&self, pos: u64, buf: &[u8]) -> KResult<usize> {
        self.with_kind_mut(|k| match k {
            IoKind::Memory(m) => m.writeat(pos, buf),
            IoKind::Seekable(s) => s.writeat(pos, buf),
            _ => Err(Error::NotSup),
        })
    }

    pub fn ctrl(&self, cmd: IoCtl) -> KResult<u64> {
        self.with_kind_mut(|k| match k {
            IoKind::Null(_) => match cmd {
                IoCtl::GetBlockSize => Ok(1),
                IoCtl::GetEnd => Ok(0),
                IoCtl::SetEnd(_) | IoCtl::GetPos | IoCtl::SetPos(_) => Err(Error::NotSup),
            },
            IoKind::Memory(m) => m.ctrl(cmd),
            IoKind::Seekable(s) => s.ctrl(cmd),
            IoKind::Pipe(_) => match cmd {
                IoCtl::GetBlockSize => Ok(1),
                IoCtl::GetEnd | IoCtl::SetEnd(_) | IoCtl::GetPos | IoCtl::SetPos(_) => {
                    Err(Error::NotSup)
                }
            },
        })
    }
}

impl Clone for IoObject {
    fn clone(&self) -> Self {
        let mut table = TABLE.lock();
        table[self.index].refcnt += 1;
        Self { index: self.index }
    }
}

impl Drop for IoObject {
    fn drop(&mut self) {
        let mut table = TABLE.lock();
        let slot = &mut table[self.index];
        slot.refcnt -= 1;
        if slot.refcnt == 0 {
            slot.kind = None;
        }
    }
}
