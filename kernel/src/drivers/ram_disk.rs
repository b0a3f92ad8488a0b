use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use alloc::{vec, vec::Vec};

/// A memory-backed block driver.
///
/// Stands in for a real disk wherever one is not available; the swap device
/// in the simulated environment and in the test suite is a `RamDisk`.
pub struct RamDisk {
    sectors: Vec<[u8; BLOCK_SECTOR_SIZE]>,
}

impl RamDisk {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: vec![[0; BLOCK_SECTOR_SIZE]; sector_count],
        }
    }

    pub fn sector_count(&self) -> BlockSector {
        self.sectors.len() as BlockSector
    }
}

impl BlockOp for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) {
        buf.copy_from_slice(&self.sectors[sector as usize]);
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) {
        self.sectors[sector as usize].copy_from_slice(buf);
    }
}
