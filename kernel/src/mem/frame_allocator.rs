mod placement_algorithms;

use crate::config::Placement;
use crate::mem::Page;
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::boxed::Box;
use alloc::vec::Vec;
use bitbybit::bitfield;
use kidneyos_shared::mem::{PAGE_FRAME_SIZE, UPPER_MEMORY_START};
use placement_algorithms::{BestFit, FirstFit, NextFit, PlacementAlgorithm};
use zerocopy::FromZeroes;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    // Frame is known to hold only zeroes.
    #[bit(1, rw)]
    zeroed: bool,
}

/// Hands out single physical frames, identified by their kernel virtual
/// address.
pub trait FrameAllocator: Send + Sync {
    /// Takes a free frame, clearing it first if `zero` is set. Returns
    /// [`None`] when every frame is in use.
    fn alloc(&self, zero: bool) -> Option<usize>;

    /// Returns a frame to the pool.
    ///
    /// # Panics
    ///
    /// Panics if `kpage` is not currently allocated.
    fn dealloc(&self, kpage: usize);

    /// Locks the contents of the frame at `kpage`.
    fn page(&self, kpage: usize) -> MutexGuard<'_, Box<Page>>;

    fn free_frames(&self) -> usize;

    fn total_frames(&self) -> usize;
}

struct CoreMap {
    entries: Box<[CoreMapEntry]>,
    placement: Box<dyn PlacementAlgorithm>,
    allocated: usize,
}

/// The user frame pool. Frames start at [`UPPER_MEMORY_START`] and are backed
/// by heap pages.
pub struct UserPool {
    frames: Box<[Mutex<Box<Page>>]>,
    core_map: Mutex<CoreMap>,
}

impl UserPool {
    pub fn new(frames: usize, placement: Placement) -> Self {
        let placement: Box<dyn PlacementAlgorithm> = match placement {
            Placement::NextFit => Box::new(NextFit::default()),
            Placement::FirstFit => Box::new(FirstFit),
            Placement::BestFit => Box::new(BestFit),
        };
        UserPool {
            frames: (0..frames)
                .map(|_| Mutex::new(Page::new_box_zeroed()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            core_map: Mutex::new(CoreMap {
                entries: alloc::vec![CoreMapEntry::DEFAULT.with_zeroed(true); frames]
                    .into_boxed_slice(),
                placement,
                allocated: 0,
            }),
        }
    }

    fn index(&self, kpage: usize) -> usize {
        let index = kpage.wrapping_sub(UPPER_MEMORY_START) / PAGE_FRAME_SIZE;
        assert!(
            kpage % PAGE_FRAME_SIZE == 0 && index < self.frames.len(),
            "{kpage:#x} is not a user frame"
        );
        index
    }

    fn kpage(index: usize) -> usize {
        UPPER_MEMORY_START + index * PAGE_FRAME_SIZE
    }
}

impl FrameAllocator for UserPool {
    fn alloc(&self, zero: bool) -> Option<usize> {
        let (index, needs_clearing) = {
            let mut core_map = self.core_map.lock();
            let CoreMap {
                entries, placement, ..
            } = &mut *core_map;
            let index = placement.place(&entries[..], 1)?.start;
            let entry = entries[index];
            debug_assert!(!entry.allocated());
            entries[index] = entry.with_allocated(true).with_zeroed(false);
            core_map.allocated += 1;
            (index, zero && !entry.zeroed())
        };

        if needs_clearing {
            self.frames[index].lock().zero();
        }
        Some(Self::kpage(index))
    }

    fn dealloc(&self, kpage: usize) {
        let index = self.index(kpage);
        let mut core_map = self.core_map.lock();
        let entry = core_map.entries[index];
        assert!(entry.allocated(), "double free of frame {kpage:#x}");
        core_map.entries[index] = entry.with_allocated(false);
        core_map.allocated -= 1;
    }

    fn page(&self, kpage: usize) -> MutexGuard<'_, Box<Page>> {
        self.frames[self.index(kpage)].lock()
    }

    fn free_frames(&self) -> usize {
        self.frames.len() - self.core_map.lock().allocated
    }

    fn total_frames(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::AsBytes;

    #[test]
    fn alloc_until_empty() {
        let pool = UserPool::new(3, Placement::NextFit);
        let frames: Vec<_> = (0..3).map(|_| pool.alloc(false).unwrap()).collect();
        assert_eq!(
            frames,
            [
                UPPER_MEMORY_START,
                UPPER_MEMORY_START + PAGE_FRAME_SIZE,
                UPPER_MEMORY_START + 2 * PAGE_FRAME_SIZE
            ]
        );
        assert_eq!(pool.alloc(false), None);
        assert_eq!(pool.free_frames(), 0);

        pool.dealloc(frames[1]);
        assert_eq!(pool.free_frames(), 1);
        assert_eq!(pool.alloc(false), Some(frames[1]));
    }

    #[test]
    fn zeroed_allocation_clears_reused_frame() {
        let pool = UserPool::new(1, Placement::FirstFit);
        let kpage = pool.alloc(true).unwrap();
        pool.page(kpage).as_bytes_mut().fill(0xab);
        pool.dealloc(kpage);

        let kpage = pool.alloc(false).unwrap();
        assert_eq!(pool.page(kpage).0[0], 0xab);
        pool.dealloc(kpage);

        let kpage = pool.alloc(true).unwrap();
        assert!(pool.page(kpage).as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let pool = UserPool::new(2, Placement::NextFit);
        let kpage = pool.alloc(false).unwrap();
        pool.dealloc(kpage);
        pool.dealloc(kpage);
    }
}
