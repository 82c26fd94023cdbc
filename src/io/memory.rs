//! A fixed-capacity, page-backed memory endpoint.
//!
//! Grounded on spec.md §4.4's "memory-backed" derived endpoint: a handful of
//! whole pages presented through the same `readat`/`writeat` contract as a
//! file, used for things like anonymous scratch buffers passed between
//! kernel subsystems without going through the KTFS.

use core::convert::TryFrom;

use crate::error::{Error, KResult};
use crate::io::IoCtl;
use crate::page::Page;
use crate::param::PAGE_SIZE;

const MAX_PAGES: usize = 4;

pub struct MemoryIo {
    pages: arrayvec::ArrayVec<Page, MAX_PAGES>,
    len: usize,
    pos: u64,
}

impl MemoryIo {
    pub fn new(pages: arrayvec::ArrayVec<Page, MAX_PAGES>) -> Self {
        let len = pages.len() * PAGE_SIZE;
        Self {
            pages,
            len,
            pos: 0,
        }
    }

    fn byte_at(&self, offset: usize) -> Option<*mut u8> {
        if offset >= self.len {
            return None;
        }
        let page = &self.pages[offset / PAGE_SIZE];
        let within = offset % PAGE_SIZE;
        Some(page.addr().into_usize() as *mut u8).map(|base| {
            // SAFETY: `within < PAGE_SIZE`, `base` is a valid page.
            unsafe { base.add(within) }
        })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> KResult<usize> {
        let n = self.readat(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> KResult<usize> {
        let n = self.writeat(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    pub fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        let start = usize::try_from(pos).map_err(|_| Error::Inval)?;
        if start >= self.len {
            return Ok(0);
        }
        let n = buf.len().min(self.len - start);
        for (i, b) in buf.iter_mut().take(n).enumerate() {
            let p = self.byte_at(start + i).ok_or(Error::Inval)?;
            // SAFETY: `byte_at` returned a pointer into an owned page.
            *b = unsafe { *p };
        }
        Ok(n)
    }

    pub fn writeat(&mut self, pos: u64, buf: &[u8]) -> KResult<usize> {
        let start = usize::try_from(pos).map_err(|_| Error::Inval)?;
        if start >= self.len {
            return Ok(0);
        }
        let n = buf.len().min(self.len - start);
        for (i, b) in buf.iter().take(n).enumerate() {
            let p = self.byte_at(start + i).ok_or(Error::Inval)?;
            // SAFETY: `byte_at` returned a pointer into an owned page.
            unsafe { *p = *b };
        }
        Ok(n)
    }

    pub fn ctrl(&mut self, cmd: IoCtl) -> KResult<u64> {
        match cmd {
            IoCtl::GetBlockSize => Ok(1),
            IoCtl::GetEnd => Ok(self.len as u64),
            IoCtl::SetEnd(new_len) => {
                let new_len = usize::try_from(new_len).map_err(|_| Error::Inval)?;
                if new_len > self.pages.len() * PAGE_SIZE {
                    return Err(Error::Inval);
                }
                self.len = new_len;
                Ok(self.len as u64)
            }
            IoCtl::GetPos => Ok(self.pos),
            IoCtl::SetPos(pos) => {
                self.pos = pos;
                Ok(self.pos)
            }
        }
    }
}
