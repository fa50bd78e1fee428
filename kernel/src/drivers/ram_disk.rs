use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use crate::sync::mutex::Mutex;
use alloc::vec;
use alloc::vec::Vec;

/// A block device backed by kernel memory.
///
/// Used as the swap device when no disk is attached and by the unit tests.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    sectors: BlockSector,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: Mutex::new(vec![0; sectors as usize * BLOCK_SECTOR_SIZE]),
            sectors,
        }
    }

    pub fn sectors(&self) -> BlockSector {
        self.sectors
    }

    fn range(&self, sector: BlockSector) -> Result<core::ops::Range<usize>, BlockError> {
        if sector >= self.sectors {
            return Err(BlockError::SectorOutOfBounds {
                sector,
                size: self.sectors,
            });
        }
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        Ok(start..start + BLOCK_SECTOR_SIZE)
    }
}

impl BlockOp for RamDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        buf.copy_from_slice(&self.data.lock()[range]);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        self.data.lock()[range].copy_from_slice(buf);
        Ok(())
    }
}
