//! Per-process supplemental page table: for every user page a process may
//! touch, where its contents come from and whether it is resident.

use crate::fs::FileRef;
use crate::mem::frame_table::{EvictRequest, FrameOwner, FrameTable};
use crate::mem::mmap::MapId;
use crate::mem::{Result, VmError};
use crate::paging::PageDirectory;
use crate::swapping::{SwapSlot, SwapTable};
use crate::sync::mutex::Mutex;
use crate::user_program::process::Pid;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hint::spin_loop;
use kidneyos_shared::mem::{is_page_aligned, is_user_vaddr, page_round_down, PAGE_FRAME_SIZE};
use log::{trace, warn};

/// A byte range of a file backing one page. Everything past `read_bytes` is
/// zero when the page is loaded.
#[derive(Clone)]
pub struct FileSpan {
    pub file: FileRef,
    pub offset: u64,
    pub read_bytes: usize,
}

#[derive(Clone)]
pub enum Backing {
    /// Part of an executable; never written back.
    File(FileSpan),
    /// Anonymous memory, starts out zeroed.
    Zero,
    /// Part of a memory-mapped file; dirty pages are written back to it.
    Mmap { span: FileSpan, mapping: MapId },
}

/// Where a page's contents currently come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    File,
    Zero,
    Swap(SwapSlot),
    Mmap(MapId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    Unloaded,
    /// A frame is being filled for the page.
    Loading,
    Loaded(usize),
    /// The page's frame has been taken and its contents are being saved.
    Evicting,
}

struct PageDescriptor {
    backing: Backing,
    writable: bool,
    /// Set while the page's contents live on the swap device instead.
    swap_slot: Option<SwapSlot>,
    state: PageState,
}

impl PageDescriptor {
    fn kind(&self) -> PageKind {
        match (&self.backing, self.swap_slot) {
            (_, Some(slot)) => PageKind::Swap(slot),
            (Backing::File(_), None) => PageKind::File,
            (Backing::Zero, None) => PageKind::Zero,
            (Backing::Mmap { mapping, .. }, None) => PageKind::Mmap(*mapping),
        }
    }
}

/// Snapshot of one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub upage: usize,
    pub kind: PageKind,
    pub writable: bool,
    /// Frame holding the page, if it is resident.
    pub resident: Option<usize>,
}

/// What an eviction has to do with the frame's contents.
enum Writeback {
    File(FileSpan),
    Swap,
    Discard,
}

pub struct SupplementalPageTable {
    pid: Pid,
    pages: Mutex<BTreeMap<usize, PageDescriptor>>,
    page_dir: Arc<dyn PageDirectory>,
    frames: Arc<FrameTable>,
    swap: Arc<SwapTable>,
}

impl SupplementalPageTable {
    pub fn new(
        pid: Pid,
        page_dir: Arc<dyn PageDirectory>,
        frames: Arc<FrameTable>,
        swap: Arc<SwapTable>,
    ) -> Self {
        SupplementalPageTable {
            pid,
            pages: Mutex::new(BTreeMap::new()),
            page_dir,
            frames,
            swap,
        }
    }

    /// Describes a page holding `read_bytes` bytes of `file` from `offset`,
    /// zero-filled to the end of the page.
    pub fn register_file(
        &self,
        upage: usize,
        file: FileRef,
        offset: u64,
        read_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        let span = Self::span(file, offset, read_bytes)?;
        self.register(upage, Backing::File(span), writable)
    }

    pub fn register_zero(&self, upage: usize, writable: bool) -> Result<()> {
        self.register(upage, Backing::Zero, writable)
    }

    /// Mapped pages are always writable.
    pub fn register_mapped(
        &self,
        upage: usize,
        file: FileRef,
        offset: u64,
        read_bytes: usize,
        mapping: MapId,
    ) -> Result<()> {
        let span = Self::span(file, offset, read_bytes)?;
        self.register(upage, Backing::Mmap { span, mapping }, true)
    }

    fn span(file: FileRef, offset: u64, read_bytes: usize) -> Result<FileSpan> {
        if read_bytes > PAGE_FRAME_SIZE {
            return Err(VmError::BadSpan { read_bytes });
        }
        Ok(FileSpan {
            file,
            offset,
            read_bytes,
        })
    }

    fn register(&self, upage: usize, backing: Backing, writable: bool) -> Result<()> {
        if !is_page_aligned(upage) || !is_user_vaddr(upage) {
            return Err(VmError::BadAddress(upage));
        }
        let mut pages = self.pages.lock();
        if pages.contains_key(&upage) {
            return Err(VmError::AlreadyRegistered(upage));
        }
        pages.insert(
            upage,
            PageDescriptor {
                backing,
                writable,
                swap_slot: None,
                state: PageState::Unloaded,
            },
        );
        Ok(())
    }

    /// Describes the page containing `addr`.
    pub fn lookup(&self, addr: usize) -> Option<PageInfo> {
        let upage = page_round_down(addr);
        self.pages.lock().get(&upage).map(|desc| PageInfo {
            upage,
            kind: desc.kind(),
            writable: desc.writable,
            resident: match desc.state {
                PageState::Loaded(kpage) => Some(kpage),
                _ => None,
            },
        })
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.pages.lock().contains_key(&page_round_down(addr))
    }

    /// Brings the page containing `addr` into a frame and maps it.
    ///
    /// Fails with [`VmError::AlreadyLoaded`] if the page is resident or
    /// another thread is loading it. If the page is being evicted, waits for
    /// the eviction to finish and then loads it again.
    pub fn load(self: &Arc<Self>, addr: usize) -> Result<()> {
        let upage = page_round_down(addr);
        let (backing, writable, swap_slot) = loop {
            let mut pages = self.pages.lock();
            let desc = pages.get_mut(&upage).ok_or(VmError::NotMapped(upage))?;
            let state = desc.state;
            match state {
                PageState::Unloaded => {
                    desc.state = PageState::Loading;
                    break (desc.backing.clone(), desc.writable, desc.swap_slot);
                }
                PageState::Loading => return Err(VmError::AlreadyLoaded(upage)),
                PageState::Loaded(kpage) if self.page_dir.query(upage) == Some(kpage) => {
                    return Err(VmError::AlreadyLoaded(upage));
                }
                // A resident page whose mapping is gone has just been picked
                // for eviction and is about to become `Evicting`.
                PageState::Loaded(_) | PageState::Evicting => {}
            }
            drop(pages);
            spin_loop();
        };

        let zero = matches!(backing, Backing::Zero) && swap_slot.is_none();
        let owner: Arc<dyn FrameOwner> = self.clone();
        let kpage = self.frames.allocate(owner, upage, zero);

        let result = self.fill(kpage, &backing, swap_slot).and_then(|()| {
            if self.page_dir.install(upage, kpage, writable) {
                Ok(())
            } else {
                Err(VmError::InstallFailed(upage))
            }
        });

        let mut pages = self.pages.lock();
        let Some(desc) = pages.get_mut(&upage) else {
            // Only a loader moves a descriptor out of `Loading`.
            panic!("descriptor for {upage:#x} vanished while loading");
        };
        match result {
            Ok(()) => {
                desc.state = PageState::Loaded(kpage);
                if let Some(slot) = desc.swap_slot.take() {
                    self.swap.free(slot);
                }
                trace!(
                    "process {}: loaded {upage:#x} into {kpage:#x} from {:?}",
                    self.pid,
                    swap_slot.map_or_else(|| desc.kind(), PageKind::Swap)
                );
                drop(pages);
                self.frames.unpin(kpage);
                Ok(())
            }
            Err(err) => {
                desc.state = PageState::Unloaded;
                drop(pages);
                self.frames.free(kpage);
                Err(err)
            }
        }
    }

    fn fill(&self, kpage: usize, backing: &Backing, swap_slot: Option<SwapSlot>) -> Result<()> {
        let mut page = self.frames.page(kpage);
        if let Some(slot) = swap_slot {
            self.swap.read(slot, &mut page);
            return Ok(());
        }
        match backing {
            Backing::Zero => {}
            Backing::File(span) | Backing::Mmap { span, .. } => {
                span.file
                    .read_exact_at(&mut page.0[..span.read_bytes], span.offset)?;
                page.0[span.read_bytes..].fill(0);
            }
        }
        Ok(())
    }

    /// Writes a mapped page back to its file.
    fn write_back(&self, upage: usize, span: &FileSpan, kpage: usize) {
        let page = self.frames.page(kpage);
        if let Err(err) = span
            .file
            .write_all_at(&page.0[..span.read_bytes], span.offset)
        {
            warn!("process {}: write-back of {upage:#x} failed: {err}", self.pid);
        }
    }

    /// Removes the descriptor for `upage`, releasing its frame and swap slot.
    /// A dirty mapped page is written back first. Returns false if there was
    /// no descriptor.
    pub fn remove(&self, upage: usize) -> bool {
        match self.take(page_round_down(upage)) {
            Some((desc, kpage)) => {
                self.discard(page_round_down(upage), desc, kpage);
                true
            }
            None => false,
        }
    }

    /// Removes every descriptor, as [`SupplementalPageTable::remove`] does.
    pub fn destroy_all(&self) {
        let upages: Vec<usize> = self.pages.lock().keys().copied().collect();
        for upage in upages {
            self.remove(upage);
        }
    }

    /// Detaches the descriptor for `upage`, pinning its frame if it is
    /// resident. Waits out any load or eviction in progress.
    fn take(&self, upage: usize) -> Option<(PageDescriptor, Option<usize>)> {
        loop {
            let mut pages = self.pages.lock();
            let state = pages.get(&upage)?.state;
            let kpage = match state {
                PageState::Unloaded => None,
                PageState::Loaded(kpage) if self.frames.pin_owned(kpage, self.pid, upage) => {
                    Some(kpage)
                }
                _ => {
                    drop(pages);
                    spin_loop();
                    continue;
                }
            };
            return pages.remove(&upage).map(|desc| (desc, kpage));
        }
    }

    fn discard(&self, upage: usize, desc: PageDescriptor, kpage: Option<usize>) {
        if let Some(kpage) = kpage {
            if let Backing::Mmap { span, .. } = &desc.backing {
                if self.page_dir.is_dirty(upage) {
                    self.write_back(upage, span, kpage);
                }
            }
            self.page_dir.clear(upage);
            self.frames.free(kpage);
        }
        if let Some(slot) = desc.swap_slot {
            self.swap.free(slot);
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }
}

impl FrameOwner for SupplementalPageTable {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn page_dir(&self) -> &dyn PageDirectory {
        &*self.page_dir
    }

    fn evict(&self, req: EvictRequest) {
        let writeback = {
            let mut pages = self.pages.lock();
            let Some(desc) = pages
                .get_mut(&req.upage)
                .filter(|desc| desc.state == PageState::Loaded(req.kpage))
            else {
                warn!(
                    "process {}: evicted {:#x} has no matching descriptor",
                    self.pid, req.upage
                );
                return;
            };
            desc.state = PageState::Evicting;
            match &desc.backing {
                Backing::Mmap { span, .. } if req.dirty => Writeback::File(span.clone()),
                Backing::Mmap { .. } => Writeback::Discard,
                _ if req.dirty || desc.writable => Writeback::Swap,
                _ => Writeback::Discard,
            }
        };

        let swap_slot = match writeback {
            Writeback::File(span) => {
                self.write_back(req.upage, &span, req.kpage);
                None
            }
            Writeback::Swap => Some(self.swap.swap_out(&self.frames.page(req.kpage))),
            Writeback::Discard => None,
        };

        let mut pages = self.pages.lock();
        match pages.get_mut(&req.upage) {
            Some(desc) => {
                desc.swap_slot = swap_slot;
                desc.state = PageState::Unloaded;
            }
            None => {
                if let Some(slot) = swap_slot {
                    self.swap.free(slot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tempfs::TempFile;
    use crate::fs::File;
    use crate::mem::user::{user_read, user_write};
    use crate::system::test::system;
    use crate::user_program::process::ProcessVm;
    use core::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn write_byte(vm: &ProcessVm, upage: usize, value: u8) {
        let kpage = vm.page_dir().query(upage).unwrap();
        assert_eq!(vm.page_dir().access(upage, true), Some(kpage));
        vm.frames().page(kpage).0[0] = value;
    }

    #[test]
    fn demand_paging_fills_and_zeroes() {
        let system = system(4, 4);
        let vm = system.create_process();
        let contents: Vec<u8> = (0..100).map(|i| i as u8 + 1).collect();
        let file = TempFile::create(&contents);
        vm.spt()
            .register_file(0x0804_8000, file, 0, 100, false)
            .unwrap();

        let info = vm.spt().lookup(0x0804_8123).unwrap();
        assert_eq!(info.kind, PageKind::File);
        assert_eq!(info.resident, None);

        vm.spt().load(0x0804_8000).unwrap();
        let kpage = vm.page_dir().query(0x0804_8000).unwrap();
        assert_eq!(vm.spt().lookup(0x0804_8000).unwrap().resident, Some(kpage));
        assert!(!system.frames().is_pinned(kpage));

        let page = system.frames().page(kpage);
        assert_eq!(&page.0[..100], contents.as_slice());
        assert!(page.0[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn registration_errors() {
        let system = system(2, 2);
        let vm = system.create_process();
        vm.spt().register_zero(0x1000, true).unwrap();
        assert_eq!(
            vm.spt().register_zero(0x1000, false),
            Err(VmError::AlreadyRegistered(0x1000))
        );
        assert_eq!(
            vm.spt().register_zero(0x1800, true),
            Err(VmError::BadAddress(0x1800))
        );
        assert_eq!(
            vm.spt().register_zero(0x8000_0000, true),
            Err(VmError::BadAddress(0x8000_0000))
        );
        let file = TempFile::create(b"x");
        assert_eq!(
            vm.spt()
                .register_file(0x2000, file, 0, PAGE_FRAME_SIZE + 1, false),
            Err(VmError::BadSpan {
                read_bytes: PAGE_FRAME_SIZE + 1
            })
        );
        assert_eq!(vm.spt().len(), 1);
    }

    #[test]
    fn load_errors() {
        let system = system(2, 2);
        let vm = system.create_process();
        assert_eq!(vm.spt().load(0x5000), Err(VmError::NotMapped(0x5000)));

        vm.spt().register_zero(0x5000, true).unwrap();
        vm.spt().load(0x5000).unwrap();
        assert_eq!(vm.spt().load(0x5010), Err(VmError::AlreadyLoaded(0x5000)));

        // A short file fails the load and releases the frame.
        let file = TempFile::create(&[1; 10]);
        vm.spt()
            .register_file(0x6000, file, 0, 20, false)
            .unwrap();
        assert!(matches!(vm.spt().load(0x6000), Err(VmError::File(_))));
        assert_eq!(system.frames().resident(), 1);
        assert_eq!(vm.spt().lookup(0x6000).unwrap().resident, None);
    }

    #[test]
    fn eviction_under_pressure_swaps_out() {
        const N: usize = 3;
        let system = system(N, 4);
        let a = system.create_process();
        let b = system.create_process();

        for i in 0..N {
            let vm = if i % 2 == 0 { &a } else { &b };
            let upage = 0x1000 * (i + 1);
            vm.spt().register_zero(upage, true).unwrap();
            vm.spt().load(upage).unwrap();
        }
        assert_eq!(system.frames().free_frames(), 0);
        assert_eq!(system.frames().evictions(), 0);

        b.spt().register_zero(0x9000, true).unwrap();
        b.spt().load(0x9000).unwrap();
        assert_eq!(system.frames().evictions(), 1);
        assert_eq!(system.swap().used(), 1);

        let swapped: Vec<PageInfo> = [(&a, 0x1000), (&b, 0x2000), (&a, 0x3000)]
            .into_iter()
            .filter_map(|(vm, upage)| vm.spt().lookup(upage))
            .filter(|info| matches!(info.kind, PageKind::Swap(_)))
            .collect();
        assert_eq!(swapped.len(), 1);
        let PageKind::Swap(slot) = swapped[0].kind else {
            unreachable!()
        };
        assert!(system.swap().is_used(slot));
        assert_eq!(swapped[0].resident, None);
    }

    #[test]
    fn swapped_page_round_trips() {
        let system = system(1, 2);
        let vm = system.create_process();
        vm.spt().register_zero(0x1000, true).unwrap();
        vm.spt().register_zero(0x2000, true).unwrap();

        vm.spt().load(0x1000).unwrap();
        write_byte(&vm, 0x1000, 0x5a);

        vm.spt().load(0x2000).unwrap();
        assert!(matches!(
            vm.spt().lookup(0x1000).unwrap().kind,
            PageKind::Swap(_)
        ));
        assert_eq!(vm.page_dir().query(0x1000), None);

        vm.spt().load(0x1000).unwrap();
        let kpage = vm.page_dir().query(0x1000).unwrap();
        assert_eq!(system.frames().page(kpage).0[0], 0x5a);
        // The slot is released once the page is back in memory.
        assert_eq!(vm.spt().lookup(0x1000).unwrap().kind, PageKind::Zero);
        assert_eq!(system.swap().used(), 1);
    }

    #[test]
    fn clean_read_only_page_is_discarded() {
        let system = system(1, 1);
        let vm = system.create_process();
        let file = TempFile::create(&[7; PAGE_FRAME_SIZE]);
        vm.spt()
            .register_file(0x1000, file, 0, PAGE_FRAME_SIZE, false)
            .unwrap();
        vm.spt().register_zero(0x2000, false).unwrap();

        vm.spt().load(0x1000).unwrap();
        vm.spt().load(0x2000).unwrap();
        assert_eq!(vm.spt().lookup(0x1000).unwrap().kind, PageKind::File);
        assert_eq!(system.swap().used(), 0);

        vm.spt().load(0x1000).unwrap();
        let kpage = vm.page_dir().query(0x1000).unwrap();
        assert!(system.frames().page(kpage).0.iter().all(|&b| b == 7));
    }

    #[test]
    fn concurrent_loads_have_one_winner() {
        let system = system(8, 8);
        let vm = system.create_process();
        vm.spt().register_zero(0x4000, true).unwrap();

        let results: Vec<Result<()>> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| vm.spt().load(0x4000)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Ok(()) | Err(VmError::AlreadyLoaded(0x4000)))));
        assert_eq!(system.frames().resident(), 1);
    }

    #[test]
    fn remove_releases_frame_and_slot() {
        let system = system(1, 2);
        let vm = system.create_process();
        vm.spt().register_zero(0x1000, true).unwrap();
        vm.spt().register_zero(0x2000, true).unwrap();
        vm.spt().load(0x1000).unwrap();
        vm.spt().load(0x2000).unwrap();
        assert_eq!(system.swap().used(), 1);

        assert!(vm.spt().remove(0x1000));
        assert_eq!(system.swap().used(), 0);
        assert!(vm.spt().remove(0x2000));
        assert_eq!(system.frames().free_frames(), 1);
        assert_eq!(vm.page_dir().query(0x2000), None);
        assert!(!vm.spt().remove(0x2000));
        assert!(vm.spt().is_empty());
    }

    #[test]
    fn destroy_all_writes_back_dirty_mapped_pages() {
        let system = system(2, 2);
        let vm = system.create_process();
        let file = TempFile::create(&[0; 8]);
        vm.spt()
            .register_mapped(0x1000, file.reopen().unwrap(), 0, 8, MapId(1))
            .unwrap();
        vm.spt().load(0x1000).unwrap();
        write_byte(&vm, 0x1000, 9);

        vm.spt().destroy_all();
        assert!(vm.spt().is_empty());
        assert_eq!(file.contents(), [9, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(system.frames().free_frames(), 2);
    }

    #[test]
    fn pages_survive_eviction_by_another_process() {
        const PAGES: usize = 4;
        const ROUNDS: usize = 200;
        let system = system(3, 2 * PAGES + 4);
        let vms = [system.create_process(), system.create_process()];
        for vm in &vms {
            for i in 0..PAGES {
                vm.spt().register_zero(0x1000 * (i + 1), true).unwrap();
            }
        }

        thread::scope(|s| {
            for (id, vm) in vms.iter().enumerate() {
                s.spawn(move || {
                    let value = |round: usize, i: usize| (round * 7 + i * 3 + id * 101) as u8;
                    for round in 0..ROUNDS {
                        for i in 0..PAGES {
                            user_write(vm, 0x1000 * (i + 1) + i, value(round, i)).unwrap();
                        }
                        for i in 0..PAGES {
                            assert_eq!(
                                user_read(vm, 0x1000 * (i + 1) + i).unwrap(),
                                value(round, i)
                            );
                        }
                    }
                });
            }
        });

        assert!(system.frames().evictions() > 0);
        for vm in &vms {
            vm.spt().destroy_all();
        }
        assert_eq!(system.swap().used(), 0);
        assert_eq!(system.frames().free_frames(), 3);
    }

    #[test]
    fn unmap_racing_eviction_writes_back_once() {
        const ROUNDS: usize = 100;
        let system = system(2, 8);
        let mapper = system.create_process();
        let hog = system.create_process();
        for i in 0..4 {
            hog.spt().register_zero(0x1000 * (i + 1), true).unwrap();
        }
        let file = TempFile::create(&[0; PAGE_FRAME_SIZE]);
        let handle: FileRef = file.clone();
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                let mut i = 0;
                while !done.load(Ordering::Relaxed) {
                    user_write(&hog, 0x1000 * (i % 4 + 1), 1).unwrap();
                    i += 1;
                }
            });

            for round in 0..ROUNDS {
                let id = mapper
                    .mmaps()
                    .map(0x2000_0000, &handle, 0, PAGE_FRAME_SIZE)
                    .unwrap();
                user_write(&mapper, 0x2000_0000, round as u8).unwrap();
                mapper.mmaps().unmap(id);
                assert_eq!(file.contents()[0], round as u8);
                assert_eq!(file.write_count(), round + 1);
            }
            done.store(true, Ordering::Relaxed);
        });

        assert!(mapper.spt().is_empty());
        assert_eq!(file.open_handles(), 1);
    }
}
