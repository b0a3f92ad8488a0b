//! The byte-range read capability the VM layer consumes.
//!
//! Lazily loaded pages record an open file plus an offset and length; the
//! filesystem behind the handle is not this subsystem's business, so the
//! seam is a trait. `MemFile` is the tempfs-flavored implementation used by
//! the loader stubs and the test suite.

use alloc::vec::Vec;

pub trait FileSource: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning how
    /// many were read. A return shorter than requested means the file ends
    /// inside the range.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize;
}

/// An in-memory file.
pub struct MemFile {
    data: Vec<u8>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> MemFile {
        MemFile { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl FileSource for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return 0;
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        n
    }
}
