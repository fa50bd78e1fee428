// Slots index a device whose size is a `BlockSector`, so sector numbers
// computed from them always fit.
#![allow(clippy::cast_possible_truncation)]

use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::mem::Page;
use crate::sync::mutex::Mutex;
use alloc::boxed::Box;
use alloc::vec;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, info};
use zerocopy::AsBytes;

pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// A page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(pub usize);

impl SwapSlot {
    fn first_sector(self) -> BlockSector {
        (self.0 * SECTORS_PER_PAGE) as BlockSector
    }
}

/// Page-granular allocator over the swap partition.
///
/// The bitmap lock is never held while talking to the device. Device errors
/// leave the system in an unrecoverable state and panic.
pub struct SwapTable {
    device: Option<Block>,
    used: Mutex<Box<[bool]>>,
}

impl SwapTable {
    /// Without a device the table has no slots and any attempt to swap out
    /// panics.
    pub fn new(device: Option<Block>) -> Self {
        let slots = device
            .as_ref()
            .map_or(0, |block| block.get_size() as usize / SECTORS_PER_PAGE);
        match &device {
            Some(block) => info!("swap: using {} with {} slots", block.get_name(), slots),
            None => info!("swap: no swap device"),
        }
        SwapTable {
            device,
            used: Mutex::new(vec![false; slots].into_boxed_slice()),
        }
    }

    /// Reserves a free slot.
    ///
    /// # Panics
    ///
    /// Panics if every slot is in use.
    pub fn allocate_slot(&self) -> SwapSlot {
        let mut used = self.used.lock();
        let Some(index) = used.iter().position(|&u| !u) else {
            panic!("swap partition is full");
        };
        used[index] = true;
        debug!("swap: allocated slot {index}");
        SwapSlot(index)
    }

    pub fn write(&self, slot: SwapSlot, page: &Page) {
        let device = self.device();
        for (i, sector) in page.as_bytes().chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            let at = slot.first_sector() + i as BlockSector;
            if let Err(err) = device.write(at, sector) {
                panic!("swap: writing slot {} failed: {err}", slot.0);
            }
        }
    }

    /// # Panics
    ///
    /// Panics if `slot` is not in use.
    pub fn read(&self, slot: SwapSlot, page: &mut Page) {
        assert!(self.is_used(slot), "read of free swap slot {}", slot.0);
        let device = self.device();
        for (i, sector) in page
            .as_bytes_mut()
            .chunks_exact_mut(BLOCK_SECTOR_SIZE)
            .enumerate()
        {
            let at = slot.first_sector() + i as BlockSector;
            if let Err(err) = device.read(at, sector) {
                panic!("swap: reading slot {} failed: {err}", slot.0);
            }
        }
    }

    /// Releases `slot`. Freeing a free slot does nothing.
    pub fn free(&self, slot: SwapSlot) {
        if let Some(used) = self.used.lock().get_mut(slot.0) {
            *used = false;
        }
    }

    /// Copies `page` into a freshly reserved slot.
    pub fn swap_out(&self, page: &Page) -> SwapSlot {
        let slot = self.allocate_slot();
        self.write(slot, page);
        slot
    }

    pub fn is_used(&self, slot: SwapSlot) -> bool {
        self.used.lock().get(slot.0).copied().unwrap_or(false)
    }

    pub fn capacity(&self) -> usize {
        self.used.lock().len()
    }

    pub fn used(&self) -> usize {
        self.used.lock().iter().filter(|&&u| u).count()
    }

    fn device(&self) -> &Block {
        match &self.device {
            Some(device) => device,
            None => panic!("swap: no swap device"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_core::test::manager_with_swap;
    use crate::block::block_core::BlockType;
    use zerocopy::FromZeroes;

    fn table(slots: usize) -> SwapTable {
        let manager = manager_with_swap((slots * SECTORS_PER_PAGE) as BlockSector);
        SwapTable::new(manager.by_role(BlockType::Swap))
    }

    #[test]
    fn round_trip() {
        let swap = table(2);
        assert_eq!(swap.capacity(), 2);

        let mut page = Page::new_box_zeroed();
        for (i, b) in page.as_bytes_mut().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let first = swap.swap_out(&Page::new_box_zeroed());
        let second = swap.swap_out(&page);
        assert_ne!(first, second);
        assert_eq!(swap.used(), 2);

        let mut back = Page::new_box_zeroed();
        swap.read(second, &mut back);
        assert_eq!(back.as_bytes(), page.as_bytes());

        swap.free(second);
        swap.free(second);
        assert!(!swap.is_used(second));
        assert_eq!(swap.used(), 1);
        assert_eq!(swap.allocate_slot(), second);
    }

    #[test]
    #[should_panic(expected = "swap partition is full")]
    fn full_partition_panics() {
        let swap = table(1);
        swap.allocate_slot();
        swap.allocate_slot();
    }

    #[test]
    #[should_panic(expected = "swap partition is full")]
    fn missing_device_has_no_slots() {
        let swap = SwapTable::new(None);
        assert_eq!(swap.capacity(), 0);
        swap.allocate_slot();
    }

    #[test]
    #[should_panic(expected = "read of free swap slot")]
    fn reading_free_slot_panics() {
        let swap = table(1);
        let mut page = Page::new_box_zeroed();
        swap.read(SwapSlot(0), &mut page);
    }
}
