pub mod block_core;
pub mod block_error;

pub use block_core::{Block, BlockDriver, BlockOp, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
pub use block_error::BlockError;
