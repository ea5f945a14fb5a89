//! Anonymous (swap-backed) pages: stacks, heaps, and fork-fresh copies.

use super::swap::{SwapSlot, SwapStore};
use super::VmError;

/// Backing state for one anonymous page.
///
/// `slot` is `Some` exactly while the page is evicted; a resident or
/// never-touched page holds no slot.
#[derive(Debug, Default)]
pub struct AnonPage {
    pub(crate) slot: Option<SwapSlot>,
}

impl AnonPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.slot
    }
}

/// Fill `frame` with the page's contents.
///
/// A page coming back from swap is read out of its slot, which is then
/// released. A first-touch page has no slot and is simply zero-filled
/// (the pool already zeroed the frame).
pub(crate) fn swap_in(
    anon: &mut AnonPage,
    swap: &mut SwapStore,
    frame: &mut [u8],
) -> Result<(), VmError> {
    if let Some(slot) = anon.slot.take() {
        swap.read(slot, frame)?;
        swap.free(slot);
    }
    Ok(())
}

/// Write `frame` out to a fresh swap slot.
///
/// Fails with [`VmError::OutOfSwap`] when the swap area is full; the
/// caller surfaces that as an eviction failure. A slot reserved for a
/// write that then fails goes back to the pool.
pub(crate) fn swap_out(
    anon: &mut AnonPage,
    swap: &mut SwapStore,
    frame: &[u8],
) -> Result<(), VmError> {
    debug_assert!(anon.slot.is_none(), "resident anonymous page owns a slot");
    let slot = swap.allocate()?;
    if let Err(err) = swap.write(slot, frame) {
        swap.free(slot);
        return Err(err);
    }
    anon.slot = Some(slot);
    Ok(())
}

/// Release whatever the page still owns in the swap area.
pub(crate) fn destroy(anon: &mut AnonPage, swap: &mut SwapStore) {
    if let Some(slot) = anon.slot.take() {
        swap.free(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_core::{Block, BlockDriver, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use crate::vm::swap::{SwapSlot, SECTORS_PER_PAGE};
    use tadpole_shared::mem::PAGE_FRAME_SIZE;

    fn swap_store(slots: u32) -> SwapStore {
        let sectors = slots * SECTORS_PER_PAGE as u32;
        let block = Block::new(
            BlockType::Swap,
            "swap",
            sectors,
            BlockDriver::Ram(RamDisk::new(sectors)),
        );
        SwapStore::new(block)
    }

    #[test]
    fn round_trip_restores_bytes() {
        let mut swap = swap_store(2);
        let mut anon = AnonPage::new();
        let mut frame = [0u8; PAGE_FRAME_SIZE];
        frame.fill(0x42);

        swap_out(&mut anon, &mut swap, &frame).unwrap();
        assert!(anon.swap_slot().is_some());

        let mut restored = [0u8; PAGE_FRAME_SIZE];
        swap_in(&mut anon, &mut swap, &mut restored).unwrap();
        assert!(anon.swap_slot().is_none());
        assert_eq!(frame[..], restored[..]);
    }

    #[test]
    fn swap_in_frees_the_slot() {
        let mut swap = swap_store(1);
        let mut anon = AnonPage::new();
        let frame = [7u8; PAGE_FRAME_SIZE];
        swap_out(&mut anon, &mut swap, &frame).unwrap();
        assert_eq!(swap_out(&mut AnonPage::new(), &mut swap, &frame), Err(VmError::OutOfSwap));

        let mut buf = [0u8; PAGE_FRAME_SIZE];
        swap_in(&mut anon, &mut swap, &mut buf).unwrap();
        // The slot is reusable again.
        swap_out(&mut anon, &mut swap, &frame).unwrap();
    }

    #[test]
    fn destroy_releases_evicted_slot() {
        let mut swap = swap_store(1);
        let mut anon = AnonPage::new();
        let frame = [1u8; PAGE_FRAME_SIZE];
        swap_out(&mut anon, &mut swap, &frame).unwrap();
        destroy(&mut anon, &mut swap);
        assert!(anon.swap_slot().is_none());
        assert!(swap.allocate().is_ok());
    }

    #[test]
    fn failed_swap_out_releases_the_slot() {
        // The device claims a full slot's worth of sectors but the disk
        // behind it is shorter, so the write fails part-way through.
        let sectors = SECTORS_PER_PAGE as u32;
        let block = Block::new(
            BlockType::Swap,
            "swap",
            sectors,
            BlockDriver::Ram(RamDisk::new(sectors / 2)),
        );
        let mut swap = SwapStore::new(block);
        let mut anon = AnonPage::new();
        let frame = [5u8; PAGE_FRAME_SIZE];
        assert!(swap_out(&mut anon, &mut swap, &frame).is_err());
        assert!(anon.swap_slot().is_none());
        // The reserved slot went back to the pool.
        assert_eq!(swap.allocate().unwrap(), SwapSlot(0));
    }

    #[test]
    fn first_touch_zero_fills() {
        let mut swap = swap_store(1);
        let mut anon = AnonPage::new();
        let mut frame = [0u8; PAGE_FRAME_SIZE];
        swap_in(&mut anon, &mut swap, &mut frame).unwrap();
        assert!(frame.iter().all(|&b| b == 0));
    }
}
