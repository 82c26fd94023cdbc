//! The null endpoint: reads report EOF, writes are discarded.
//!
//! Grounded on the original's `/dev/null`-style device, the simplest
//! possible endpoint and a useful default for an unopened descriptor slot.

use crate::error::KResult;

pub struct NullIo;

impl NullIo {
    pub fn read(&mut self, _buf: &mut [u8]) -> KResult<usize> {
        Ok(0)
    }

    pub fn write(&mut self, buf: &[u8]) -> KResult<usize> {
        Ok(buf.len())
    }
}
