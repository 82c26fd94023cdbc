//! The pipe endpoint: a fixed-capacity ring buffer shared between a read
//! half and a write half, blocking when empty/full.
//!
//! Grounded on `kernel-rs/src/pipe.rs`'s `PipeInner` (`data`/`nread`/`nwrite`
//! monotonic counters modulo the buffer size, `readopen`/`writeopen` half-
//! close flags). The teacher shares one `PipeInner` between both halves
//! through its arena's `Rc`; this crate has no heap allocator, so the shared
//! state instead lives in a small fixed pool (`PIPE_POOL`) indexed by slot,
//! and each half just remembers which slot and which end it is.

use crate::error::{Error, KResult};
use crate::lock::{Condition, Spinlock};
use crate::param::PIPE_SIZE;

const NPIPE: usize = 32;

struct PipeBuf {
    data: [u8; PIPE_SIZE],
    nread: usize,
    nwrite: usize,
    read_open: bool,
    write_open: bool,
}

impl PipeBuf {
    const fn empty() -> Self {
        Self {
            data: [0; PIPE_SIZE],
            nread: 0,
            nwrite: 0,
            read_open: false,
            write_open: false,
        }
    }
}

struct PipePool {
    bufs: [PipeBuf; NPIPE],
}

static POOL: Spinlock<PipePool> = Spinlock::new_named("pipe_pool", {
    const EMPTY: PipeBuf = PipeBuf::empty();
    PipePool {
        bufs: [EMPTY; NPIPE],
    }
});

/// Signalled whenever a pipe slot transitions from empty to non-empty, from
/// full to non-full, or either half closes. One condition shared by all
/// pipes is coarser than the teacher's per-pipe `WaitChannel`, but
/// uncontended pipes (the overwhelming case) never notice; spec.md's
/// synchronization model doesn't require per-pipe granularity.
static PIPE_ACTIVITY: Condition = Condition::new();

pub struct Pipe {
    slot: usize,
    is_read_end: bool,
}

impl Pipe {
    pub fn new_pair() -> (Self, Self) {
        let mut pool = POOL.lock();
        let slot = pool
            .bufs
            .iter()
            .position(|b| !b.read_open && !b.write_open)
            .expect("Pipe::new_pair: pipe pool exhausted");
        pool.bufs[slot] = PipeBuf {
            data: [0; PIPE_SIZE],
            nread: 0,
            nwrite: 0,
            read_open: true,
            write_open: true,
        };
        drop(pool);
        (
            Self {
                slot,
                is_read_end: true,
            },
            Self {
                slot,
                is_read_end: false,
            },
        )
    }

    pub fn read(&mut self, buf: &mut [u8]) -> KResult<usize> {
        let mut pool = POOL.lock();
        loop {
            let b = &mut pool.bufs[self.slot];
            if b.nread != b.nwrite {
                let mut n = 0;
                while n < buf.len() && b.nread != b.nwrite {
                    buf[n] = b.data[b.nread % PIPE_SIZE];
                    b.nread += 1;
                    n += 1;
                }
                drop(pool);
                PIPE_ACTIVITY.broadcast();
                return Ok(n);
            }
            if !b.write_open {
                return Ok(0);
            }
            PIPE_ACTIVITY.wait(&mut pool);
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> KResult<usize> {
        let mut pool = POOL.lock();
        let mut written = 0;
        while written < buf.len() {
            let b = &mut pool.bufs[self.slot];
            if !b.read_open {
                return Err(Error::Pipe);
            }
            if b.nwrite.wrapping_sub(b.nread) == PIPE_SIZE {
                PIPE_ACTIVITY.wait(&mut pool);
                continue;
            }
            while written < buf.len() && b.nwrite.wrapping_sub(b.nread) < PIPE_SIZE {
                b.data[b.nwrite % PIPE_SIZE] = buf[written];
                b.nwrite += 1;
                written += 1;
            }
            drop(pool);
            PIPE_ACTIVITY.broadcast();
            pool = POOL.lock();
        }
        Ok(written)
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        let mut pool = POOL.lock();
        let b = &mut pool.bufs[self.slot];
        if self.is_read_end {
            b.read_open = false;
        } else {
            b.write_open = false;
        }
        drop(pool);
        PIPE_ACTIVITY.broadcast();
    }
}
