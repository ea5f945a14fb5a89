//! Slot pool over the swap block device.
//!
//! The device is partitioned at boot into page-sized slots. Evicting an
//! anonymous page claims one slot; swapping it back in releases the slot
//! again. Transfers are split into sector-sized chunks internally.

use super::VmError;
use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use alloc::vec::Vec;
use tadpole_shared::mem::PAGE_FRAME_SIZE;

pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// Index of a page-sized slot in the swap area.
///
/// Slot `i` starts at device sector `i * SECTORS_PER_PAGE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(pub u32);

pub struct SwapStore {
    block: Block,
    /// One bit per slot, set while the slot is free.
    free_map: Vec<u64>,
    slot_count: usize,
}

impl SwapStore {
    pub fn new(block: Block) -> Self {
        let slot_count = block.get_size() as usize / SECTORS_PER_PAGE;
        let group_count = slot_count.div_ceil(64);
        let mut free_map = alloc::vec![u64::MAX; group_count];
        // Mask off the bits past the last real slot.
        if slot_count % 64 != 0 {
            free_map[group_count - 1] = (1u64 << (slot_count % 64)) - 1;
        }
        log::debug!(
            "swap store on \"{}\": {} slots of {} bytes",
            block.get_name(),
            slot_count,
            PAGE_FRAME_SIZE
        );
        Self {
            block,
            free_map,
            slot_count,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn is_free(&self, slot: SwapSlot) -> bool {
        let index = slot.0 as usize;
        self.free_map[index / 64] & (1 << (index % 64)) != 0
    }

    /// Reserve the first free slot.
    ///
    /// The scan is deterministic: the lowest-numbered free slot is always
    /// chosen, and the scan stops as soon as one is found.
    pub fn allocate(&mut self) -> Result<SwapSlot, VmError> {
        for (group_index, group) in self.free_map.iter_mut().enumerate() {
            if *group != 0 {
                let index_in_group = group.trailing_zeros();
                *group &= !(1 << index_in_group);
                let slot = group_index as u32 * 64 + index_in_group;
                return Ok(SwapSlot(slot));
            }
        }
        Err(VmError::OutOfSwap)
    }

    /// Return `slot` to the pool.
    pub fn free(&mut self, slot: SwapSlot) {
        debug_assert!(!self.is_free(slot), "freeing a slot that is not in use");
        let index = slot.0 as usize;
        self.free_map[index / 64] |= 1 << (index % 64);
    }

    fn start_sector(slot: SwapSlot) -> BlockSector {
        slot.0 * SECTORS_PER_PAGE as BlockSector
    }

    /// Write one page of bytes into `slot`.
    pub fn write(&mut self, slot: SwapSlot, page: &[u8]) -> Result<(), VmError> {
        debug_assert_eq!(page.len(), PAGE_FRAME_SIZE);
        debug_assert!(!self.is_free(slot), "writing to an unallocated slot");
        let start = Self::start_sector(slot);
        for i in 0..SECTORS_PER_PAGE {
            let chunk = &page[i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE];
            self.block.write(start + i as BlockSector, chunk)?;
        }
        Ok(())
    }

    /// Read one page of bytes back out of `slot`.
    pub fn read(&mut self, slot: SwapSlot, page: &mut [u8]) -> Result<(), VmError> {
        debug_assert_eq!(page.len(), PAGE_FRAME_SIZE);
        debug_assert!(!self.is_free(slot), "reading from an unallocated slot");
        let start = Self::start_sector(slot);
        for i in 0..SECTORS_PER_PAGE {
            let chunk = &mut page[i * BLOCK_SECTOR_SIZE..(i + 1) * BLOCK_SECTOR_SIZE];
            self.block.read(start + i as BlockSector, chunk)?;
        }
        Ok(())
    }
}
