use crate::drivers::ram_disk::RamDisk;
use alloc::{string::String, vec::Vec};
use core::fmt;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = 512;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// The role a block device plays in the system.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum BlockType {
    /// Backing store for evicted page frames
    Swap,
    /// Scratch
    Scratch,
    /// "Raw" device with unidentified contents
    Raw,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Raw => write!(f, "Raw"),
        }
    }
}

/// Lower-level interface to block device drivers.
///
/// Callers go through [`Block`], which bounds-checks the sector and buffer
/// before the driver sees them.
pub trait BlockOp {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]);
    fn write(&mut self, sector: BlockSector, buf: &[u8]);
}

/// Supported block drivers
pub enum BlockDriver {
    Ram(RamDisk),
}

impl BlockDriver {
    fn as_op(&mut self) -> &mut dyn BlockOp {
        match self {
            BlockDriver::Ram(driver) => driver,
        }
    }
}

/// A block device: a driver plus its identity, size and I/O accounting.
pub struct Block {
    block_name: String,
    block_type: BlockType,
    driver: BlockDriver,

    /// The size of the device in sectors
    block_size: BlockSector,

    read_count: u32,
    write_count: u32,
}

impl Block {
    pub fn new(block_type: BlockType, block_name: &str, driver: BlockDriver) -> Block {
        let block_size = match &driver {
            BlockDriver::Ram(ram) => ram.sector_count(),
        };
        Block {
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: 0,
            write_count: 0,
        }
    }

    /// Panics unless `buf` has room for exactly one sector.
    fn verify_buffer(&self, buf: &[u8]) {
        if buf.len() != BLOCK_SECTOR_SIZE {
            panic!("{}: invalid buffer size {}", self.block_name, buf.len());
        }
    }

    /// Panics if `sector` is past the end of the device.
    fn check_sector(&self, sector: BlockSector) {
        if sector >= self.block_size {
            panic!(
                "{}: invalid sector {} (block size: {})",
                self.block_name, sector, self.block_size
            );
        }
    }

    /// Reads sector `sector` into `buf`, which must hold `BLOCK_SECTOR_SIZE`
    /// bytes.
    pub fn read(&mut self, sector: BlockSector, buf: &mut [u8]) {
        self.check_sector(sector);
        self.verify_buffer(buf);

        self.driver.as_op().read(sector, buf);
        self.read_count += 1;
    }

    /// Writes `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes, to sector
    /// `sector`. Returns after the device has acknowledged the data.
    pub fn write(&mut self, sector: BlockSector, buf: &[u8]) {
        self.check_sector(sector);
        self.verify_buffer(buf);

        self.driver.as_op().write(sector, buf);
        self.write_count += 1;
    }

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn sector_count(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.block_name, self.block_type, self.block_size, self.read_count, self.write_count
        )
    }
}

/// Registry of the block devices discovered at boot.
#[derive(Default)]
pub struct BlockManager {
    all_blocks: Vec<Block>,
}

impl BlockManager {
    pub fn new() -> Self {
        BlockManager::default()
    }

    pub fn register_block(&mut self, block: Block) {
        log::info!(
            "registered block device \"{}\" ({} type) with {} sectors",
            block.block_name,
            block.block_type,
            block.block_size,
        );
        self.all_blocks.push(block);
    }

    /// Removes and returns the first device registered with `block_type`,
    /// handing its ownership to the subsystem that plays that role.
    pub fn take_by_role(&mut self, block_type: BlockType) -> Option<Block> {
        let at = self
            .all_blocks
            .iter()
            .position(|b| b.block_type == block_type)?;
        Some(self.all_blocks.remove(at))
    }
}

impl fmt::Display for BlockManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Block Devices:")?;
        for block in &self.all_blocks {
            writeln!(f, "    {}", block)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_block(sectors: usize) -> Block {
        Block::new(
            BlockType::Scratch,
            "scratch0",
            BlockDriver::Ram(RamDisk::new(sectors)),
        )
    }

    #[test]
    fn sector_round_trip() {
        let mut block = scratch_block(4);
        let data = [0xabu8; BLOCK_SECTOR_SIZE];
        block.write(2, &data);

        let mut back = [0u8; BLOCK_SECTOR_SIZE];
        block.read(2, &mut back);
        assert_eq!(back, data);

        // untouched sectors read as zero
        block.read(3, &mut back);
        assert_eq!(back, [0u8; BLOCK_SECTOR_SIZE]);
    }

    #[test]
    #[should_panic(expected = "invalid sector")]
    fn out_of_bounds_sector_panics() {
        let mut block = scratch_block(4);
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        block.read(4, &mut buf);
    }

    #[test]
    #[should_panic(expected = "invalid buffer size")]
    fn short_buffer_panics() {
        let mut block = scratch_block(4);
        let mut buf = [0u8; 100];
        block.read(0, &mut buf);
    }

    #[test]
    fn take_by_role() {
        let mut manager = BlockManager::new();
        manager.register_block(scratch_block(2));
        manager.register_block(Block::new(
            BlockType::Swap,
            "swap0",
            BlockDriver::Ram(RamDisk::new(8)),
        ));

        let swap = manager.take_by_role(BlockType::Swap).unwrap();
        assert_eq!(swap.get_name(), "swap0");
        assert!(manager.take_by_role(BlockType::Swap).is_none());
    }
}
