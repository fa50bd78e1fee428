//! The global table of user frames currently holding a process page.
//!
//! Lock order: a process's supplemental page table lock may be held while
//! taking the frame table lock, never the other way round. The frame table
//! lock is never held across device or file I/O; the owner of an evicted frame
//! is told to persist it only after the lock is dropped.

use crate::mem::frame_allocator::FrameAllocator;
use crate::mem::Page;
use crate::paging::PageDirectory;
use crate::swapping::page_replacement::{Clock, PageReplacementPolicy};
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::user_program::process::Pid;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{debug, warn};

/// A frame that was taken away from its owner. The page has already been
/// unmapped from the owner's page directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictRequest {
    pub upage: usize,
    pub kpage: usize,
    /// Whether the page was written since it was loaded.
    pub dirty: bool,
}

/// Something that maps user pages onto frames, i.e. a process's supplemental
/// page table.
pub trait FrameOwner: Send + Sync {
    fn pid(&self) -> Pid;

    fn page_dir(&self) -> &dyn PageDirectory;

    /// Saves the contents of `req.kpage` wherever the page must be restored
    /// from. The frame is handed to someone else as soon as this returns.
    fn evict(&self, req: EvictRequest);
}

pub struct FrameEntry {
    pub(crate) owner: Weak<dyn FrameOwner>,
    pub(crate) pid: Pid,
    pub(crate) upage: usize,
    /// Outstanding pins; the frame is only evictable at zero.
    pub(crate) pins: usize,
}

struct Frames {
    entries: BTreeMap<usize, FrameEntry>,
    policy: Box<dyn PageReplacementPolicy>,
}

pub struct FrameTable {
    pool: Box<dyn FrameAllocator>,
    frames: Mutex<Frames>,
    evictions: AtomicUsize,
}

impl FrameTable {
    pub fn new(pool: Box<dyn FrameAllocator>) -> Self {
        FrameTable {
            pool,
            frames: Mutex::new(Frames {
                entries: BTreeMap::new(),
                policy: Box::new(Clock::default()),
            }),
            evictions: AtomicUsize::new(0),
        }
    }

    /// Obtains a frame for `upage` of `owner`, evicting another page if the
    /// pool is exhausted. The frame comes back pinned; the caller unpins it
    /// once the page is installed.
    ///
    /// # Panics
    ///
    /// Panics if the pool is exhausted and every frame is pinned.
    pub fn allocate(&self, owner: Arc<dyn FrameOwner>, upage: usize, zero: bool) -> usize {
        let kpage = match self.pool.alloc(zero) {
            Some(kpage) => kpage,
            None => {
                let kpage = self.evict_one();
                if zero {
                    self.pool.page(kpage).0.fill(0);
                }
                kpage
            }
        };

        let entry = FrameEntry {
            pid: owner.pid(),
            owner: Arc::downgrade(&owner),
            upage,
            pins: 1,
        };
        let previous = self.frames.lock().entries.insert(kpage, entry);
        debug_assert!(previous.is_none(), "frame {kpage:#x} handed out twice");
        kpage
    }

    /// Takes a frame from its owner and returns it, no longer registered.
    fn evict_one(&self) -> usize {
        let (owner, req) = {
            let mut frames = self.frames.lock();
            let Frames { entries, policy } = &mut *frames;
            let Some(kpage) = policy.select_victim(entries) else {
                panic!("out of frames: every user frame is pinned");
            };
            let Some(entry) = entries.remove(&kpage) else {
                panic!("replacement policy chose unregistered frame {kpage:#x}");
            };
            let owner = entry.owner.upgrade();
            let dirty = owner.as_ref().is_some_and(|owner| {
                let page_dir = owner.page_dir();
                let dirty = page_dir.is_dirty(entry.upage);
                page_dir.clear(entry.upage);
                dirty
            });
            debug!(
                "evicting {:#x} of process {} from frame {kpage:#x}{}",
                entry.upage,
                entry.pid,
                if dirty { " (dirty)" } else { "" }
            );
            let req = EvictRequest {
                upage: entry.upage,
                kpage,
                dirty,
            };
            (owner, req)
        };

        self.evictions.fetch_add(1, Ordering::Relaxed);
        if let Some(owner) = owner {
            owner.evict(req);
        }
        req.kpage
    }

    /// Returns `kpage` to the pool. Returns false, doing nothing, if the frame
    /// is no longer registered, e.g. because it was evicted in the meantime.
    pub fn free(&self, kpage: usize) -> bool {
        let removed = self.frames.lock().entries.remove(&kpage);
        if removed.is_none() {
            warn!("frame {kpage:#x} was already reclaimed");
            return false;
        }
        self.pool.dealloc(kpage);
        true
    }

    /// Protects `kpage` from eviction until a matching [`FrameTable::unpin`].
    /// Returns false if the frame is not registered.
    pub fn pin(&self, kpage: usize) -> bool {
        self.adjust_pins(kpage, |_| true, true)
    }

    /// Like [`FrameTable::pin`], but only if the frame still holds `upage` of
    /// process `pid`.
    pub fn pin_owned(&self, kpage: usize, pid: Pid, upage: usize) -> bool {
        self.adjust_pins(kpage, |entry| entry.pid == pid && entry.upage == upage, true)
    }

    pub fn unpin(&self, kpage: usize) {
        self.adjust_pins(kpage, |_| true, false);
    }

    fn adjust_pins(
        &self,
        kpage: usize,
        matches: impl FnOnce(&FrameEntry) -> bool,
        pin: bool,
    ) -> bool {
        match self.frames.lock().entries.get_mut(&kpage) {
            Some(entry) if matches(entry) => {
                if pin {
                    entry.pins += 1;
                } else {
                    entry.pins = entry.pins.saturating_sub(1);
                }
                true
            }
            _ => false,
        }
    }

    pub fn is_pinned(&self, kpage: usize) -> bool {
        self.frames
            .lock()
            .entries
            .get(&kpage)
            .is_some_and(|entry| entry.pins > 0)
    }

    /// Process and user page held by `kpage`, if it is registered.
    pub fn owner_of(&self, kpage: usize) -> Option<(Pid, usize)> {
        self.frames
            .lock()
            .entries
            .get(&kpage)
            .map(|entry| (entry.pid, entry.upage))
    }

    /// Locks the contents of `kpage`.
    pub fn page(&self, kpage: usize) -> MutexGuard<'_, Box<Page>> {
        self.pool.page(kpage)
    }

    /// Number of registered frames.
    pub fn resident(&self) -> usize {
        self.frames.lock().entries.len()
    }

    pub fn free_frames(&self) -> usize {
        self.pool.free_frames()
    }

    pub fn total_frames(&self) -> usize {
        self.pool.total_frames()
    }

    /// Frames taken from their owners since boot.
    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Placement;
    use crate::mem::frame_allocator::UserPool;
    use crate::paging::SoftPageDirectory;
    use alloc::vec::Vec;

    /// Records evictions instead of persisting anything.
    struct Recorder {
        pid: Pid,
        page_dir: SoftPageDirectory,
        evicted: Mutex<Vec<EvictRequest>>,
    }

    impl Recorder {
        fn new(pid: Pid) -> Arc<Self> {
            Arc::new(Recorder {
                pid,
                page_dir: SoftPageDirectory::new(),
                evicted: Mutex::new(Vec::new()),
            })
        }
    }

    impl FrameOwner for Recorder {
        fn pid(&self) -> Pid {
            self.pid
        }

        fn page_dir(&self) -> &dyn PageDirectory {
            &self.page_dir
        }

        fn evict(&self, req: EvictRequest) {
            self.evicted.lock().push(req);
        }
    }

    fn table(frames: usize) -> FrameTable {
        FrameTable::new(Box::new(UserPool::new(frames, Placement::FirstFit)))
    }

    /// Allocates, maps and unpins a frame for `upage`.
    fn resident(table: &FrameTable, owner: &Arc<Recorder>, upage: usize) -> usize {
        let kpage = table.allocate(owner.clone(), upage, true);
        assert!(owner.page_dir.install(upage, kpage, true));
        table.unpin(kpage);
        kpage
    }

    #[test]
    fn allocate_registers_pinned_frame() {
        let table = table(2);
        let owner = Recorder::new(1);
        let kpage = table.allocate(owner.clone(), 0x1000, false);
        assert!(table.is_pinned(kpage));
        assert_eq!(table.owner_of(kpage), Some((1, 0x1000)));
        assert_eq!(table.free_frames(), 1);

        assert!(table.free(kpage));
        assert!(!table.free(kpage));
        assert_eq!(table.free_frames(), 2);
        assert_eq!(table.resident(), 0);
    }

    #[test]
    fn clock_gives_second_chance() {
        let table = table(2);
        let owner = Recorder::new(1);
        let first = resident(&table, &owner, 0x1000);
        let second = resident(&table, &owner, 0x2000);
        owner.page_dir.access(0x1000, false);
        owner.page_dir.access(0x2000, true);
        owner.page_dir.set_accessed(0x2000, false);

        // 0x1000 was accessed, so 0x2000 goes first.
        let kpage = table.allocate(owner.clone(), 0x3000, true);
        assert_eq!(kpage, second);
        assert_eq!(
            owner.evicted.lock().as_slice(),
            [EvictRequest {
                upage: 0x2000,
                kpage: second,
                dirty: true
            }]
        );
        assert_eq!(owner.page_dir.query(0x2000), None);
        assert!(!owner.page_dir.is_accessed(0x1000));
        assert_eq!(table.owner_of(first), Some((1, 0x1000)));
        assert_eq!(table.owner_of(kpage), Some((1, 0x3000)));
        assert_eq!(table.evictions(), 1);
        assert!(table.page(kpage).0.iter().all(|&b| b == 0));
    }

    #[test]
    fn pinned_frames_are_skipped() {
        let table = table(2);
        let owner = Recorder::new(1);
        let first = resident(&table, &owner, 0x1000);
        let second = resident(&table, &owner, 0x2000);
        assert!(table.pin(first));

        assert_eq!(table.allocate(owner.clone(), 0x3000, false), second);
        assert_eq!(table.owner_of(first), Some((1, 0x1000)));
    }

    #[test]
    #[should_panic(expected = "every user frame is pinned")]
    fn all_pinned_panics() {
        let table = table(1);
        let owner = Recorder::new(1);
        table.allocate(owner.clone(), 0x1000, false);
        table.allocate(owner, 0x2000, false);
    }

    #[test]
    fn dead_owner_frame_is_reclaimed() {
        let table = table(1);
        let owner = Recorder::new(1);
        let kpage = resident(&table, &owner, 0x1000);
        drop(owner);

        let other = Recorder::new(2);
        assert_eq!(table.allocate(other.clone(), 0x5000, false), kpage);
        assert_eq!(table.owner_of(kpage), Some((2, 0x5000)));
    }

    #[test]
    fn pin_owned_checks_owner() {
        let table = table(1);
        let owner = Recorder::new(3);
        let kpage = resident(&table, &owner, 0x4000);
        assert!(!table.pin_owned(kpage, 4, 0x4000));
        assert!(!table.pin_owned(kpage, 3, 0x5000));
        assert!(table.pin_owned(kpage, 3, 0x4000));
        assert!(table.pin(kpage));
        table.unpin(kpage);
        assert!(table.is_pinned(kpage));
        table.unpin(kpage);
        assert!(!table.is_pinned(kpage));
        assert!(!table.pin(kpage + 0x1000));
    }
}
