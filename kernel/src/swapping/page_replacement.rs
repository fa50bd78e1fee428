use crate::mem::frame_table::FrameEntry;
use alloc::collections::BTreeMap;

pub trait PageReplacementPolicy: Send {
    /// Chooses a frame to evict from `frames`, keyed by kernel page address.
    /// Pinned frames are never chosen. Returns [`None`] if nothing can be
    /// evicted.
    fn select_victim(&mut self, frames: &BTreeMap<usize, FrameEntry>) -> Option<usize>;
}

/// Second-chance clock over the frame table.
#[derive(Default)]
pub struct Clock {
    /// Frames at or above this kernel address are examined first.
    hand: usize,
}

impl PageReplacementPolicy for Clock {
    fn select_victim(&mut self, frames: &BTreeMap<usize, FrameEntry>) -> Option<usize> {
        // Two sweeps: the first may only clear accessed bits.
        for _ in 0..2 * frames.len() {
            let (&kpage, entry) = frames
                .range(self.hand..)
                .next()
                .or_else(|| frames.iter().next())?;
            self.hand = kpage + 1;

            if entry.pins > 0 {
                continue;
            }
            let Some(owner) = entry.owner.upgrade() else {
                return Some(kpage);
            };
            let page_dir = owner.page_dir();
            if page_dir.is_accessed(entry.upage) {
                page_dir.set_accessed(entry.upage, false);
                continue;
            }
            return Some(kpage);
        }
        None
    }
}
