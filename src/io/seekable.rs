//! The seekable wrapper: turns a positionless `readat`/`writeat` backing
//! (a KTFS file) into a stateful stream endpoint with an implicit cursor.
//!
//! Grounded on `kernel-rs/src/file.rs`'s `FileType::Inode { ip, off }`,
//! which pairs an inode reference with a `UnsafeCell<u32>` cursor the same
//! way.

use crate::error::KResult;
use crate::fs::InodeHandle;
use crate::io::IoCtl;

pub struct SeekableIo {
    inode: InodeHandle,
    pos: u64,
}

impl SeekableIo {
    pub fn new(inode: InodeHandle) -> Self {
        Self { inode, pos: 0 }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> KResult<usize> {
        let n = self.inode.readat(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> KResult<usize> {
        let n = self.inode.writeat(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    pub fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        self.inode.readat(pos, buf)
    }

    pub fn writeat(&mut self, pos: u64, buf: &[u8]) -> KResult<usize> {
        self.inode.writeat(pos, buf)
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn ctrl(&mut self, cmd: IoCtl) -> KResult<u64> {
        match cmd {
            IoCtl::GetBlockSize => Ok(crate::param::BSIZE as u64),
            IoCtl::GetEnd => Ok(self.inode.size()),
            IoCtl::SetEnd(new_len) => {
                self.inode.extend(new_len)?;
                Ok(self.inode.size())
            }
            IoCtl::GetPos => Ok(self.pos),
            IoCtl::SetPos(pos) => {
                self.pos = pos;
                Ok(self.pos)
            }
        }
    }
}
