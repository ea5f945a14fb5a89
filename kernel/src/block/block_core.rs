use crate::block::block_error::BlockError;
use crate::drivers::ram_disk::RamDisk;
use alloc::string::String;
use core::fmt;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = 512;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// What a block device is used for.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// OS kernel image
    Kernel,
    /// File system
    FileSystem,
    /// Swap area
    Swap,
    /// "Raw" device with unidentified contents
    Raw,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockType::Kernel => write!(f, "Kernel"),
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Raw => write!(f, "Raw"),
        }
    }
}

/// Lower-level interface to block device drivers.
pub trait BlockOp {
    /// Read one sector into `buf`.
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write one sector from `buf`.
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// Supported block drivers.
#[derive(Clone, PartialEq, Eq)]
pub enum BlockDriver {
    // TODO: add the IDE driver here once it is ported.
    Ram(RamDisk),
}

impl BlockDriver {
    fn unwrap(&mut self) -> &mut dyn BlockOp {
        match self {
            BlockDriver::Ram(driver) => driver,
        }
    }
}

/// A block device: a fixed-size array of sectors addressed by [`BlockSector`].
pub struct Block {
    block_name: String,
    block_type: BlockType,
    driver: BlockDriver,

    /// The size of the block device in sectors.
    block_size: BlockSector,

    read_count: u32,
    write_count: u32,
}

impl Block {
    pub fn new(
        block_type: BlockType,
        block_name: &str,
        block_size: BlockSector,
        driver: BlockDriver,
    ) -> Self {
        log::debug!(
            "registered block device \"{}\" ({} type) with {} sectors",
            block_name,
            block_type,
            block_size
        );
        Self {
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: 0,
            write_count: 0,
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing one sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must
    /// have room for `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.unwrap().read(sector, buf)?;
        self.read_count += 1;
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain
    /// `BLOCK_SECTOR_SIZE` bytes. Returns after the block device has
    /// acknowledged receiving the data.
    pub fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.unwrap().write(sector, buf)?;
        self.write_count += 1;
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.block_name, self.block_type, self.block_size, self.read_count, self.write_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram_block(sectors: BlockSector) -> Block {
        Block::new(
            BlockType::Raw,
            "ram0",
            sectors,
            BlockDriver::Ram(RamDisk::new(sectors)),
        )
    }

    #[test]
    fn sector_round_trip() {
        let mut block = ram_block(4);
        let data = [0xa5u8; BLOCK_SECTOR_SIZE];
        block.write(2, &data).unwrap();
        let mut back = [0u8; BLOCK_SECTOR_SIZE];
        block.read(2, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn rejects_bad_sector_and_buffer() {
        let mut block = ram_block(4);
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        assert_eq!(block.read(4, &mut buf), Err(BlockError::SectorOutOfBounds));
        let mut short = [0u8; 8];
        assert_eq!(block.read(0, &mut short), Err(BlockError::BufferInvalid));
    }
}
